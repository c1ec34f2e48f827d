//! Transfer Pipeline - demo runner
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────┐    ┌──────────┐
//! │ Config / │───▶│ Validator │───▶│  Intent  │───▶│ Consumer │───▶ Ledger
//! │ Bulk CSV │    │ Publisher │    │  Queue   │    │ workers  │
//! └──────────┘    └───────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage:
//!
//! ```text
//! transfer_pipeline [--env dev] [--bulk batch.csv] [--interval SECS]
//! ```
//!
//! With `--bulk`, the batch is scheduled, the runner waits for every item to
//! settle and prints the source statement. Without it, the pipeline runs
//! until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use transfer_pipeline::bulk::{BulkIntentSource, CsvBulkSource};
use transfer_pipeline::config::AppConfig;
use transfer_pipeline::transfer::{InMemoryRecordStore, PageRequest};
use transfer_pipeline::{
    Account, AccountDirectory, BulkTransferScheduler, InMemoryAccountDirectory, InMemoryLedger,
    IntentConsumer, IntentPublisher, MemoryQueue, ScheduleStore, TransferService,
    TransferValidator,
};

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = transfer_pipeline::logging::init_logging(&app_config);

    tracing::info!(
        git = env!("GIT_HASH"),
        env = %env,
        "Starting transfer pipeline"
    );

    // Collaborators
    let directory = Arc::new(InMemoryAccountDirectory::new());
    let ledger = Arc::new(InMemoryLedger::new(app_config.policy));
    for seed in &app_config.accounts {
        directory.register(seed.account_number.clone(), seed.id);
        ledger.open_account(Account::new(
            seed.id,
            seed.account_number.clone(),
            seed.balance,
            seed.role,
        ))?;
    }

    let records = Arc::new(InMemoryRecordStore::new());
    let queue = Arc::new(match &app_config.queue.journal_path {
        Some(path) => MemoryQueue::durable(path, app_config.queue.partitions)?,
        None => MemoryQueue::new(app_config.queue.partitions),
    });

    let validator = TransferValidator::new(
        directory.clone(),
        ledger.clone(),
        app_config.policy,
        app_config.validator.call_timeout(),
    );
    let publisher = IntentPublisher::new(records.clone(), queue.clone());
    let service = Arc::new(TransferService::new(validator, publisher, records.clone()));

    let shutdown = CancellationToken::new();
    let consumer = Arc::new(IntentConsumer::new(
        directory.clone(),
        ledger.clone(),
        records.clone(),
        queue.clone(),
        app_config.consumer.to_consumer_config(),
    ));
    consumer.start(shutdown.child_token())?;

    let store = Arc::new(match &app_config.scheduler.journal_path {
        Some(path) => ScheduleStore::open(path)?,
        None => ScheduleStore::in_memory(),
    });
    let interval = match get_arg(&["--interval"]) {
        Some(secs) => Duration::from_secs(secs.parse().context("Invalid --interval")?),
        None => app_config.scheduler.stagger_interval(),
    };
    let scheduler = Arc::new(BulkTransferScheduler::new(
        service.clone(),
        store,
        interval,
    ));
    scheduler.start(shutdown.child_token())?;

    match get_arg(&["--bulk"]) {
        Some(path) => {
            let batch = CsvBulkSource::new(&path).load()?;
            let source = match batch.source_account_number {
                Some(source) => source,
                None => match app_config.accounts.first() {
                    Some(seed) => seed.account_number.clone(),
                    None => bail!("Bulk file names no source and no accounts are configured"),
                },
            };
            let actor = directory
                .resolve(&source)
                .await?
                .with_context(|| format!("Unknown source account {}", source))?;

            let handle = scheduler.schedule(actor, &source, batch.lines)?;
            println!(
                "Scheduled {} transfers from {} every {}s (batch {})",
                handle.items.len(),
                source,
                interval.as_secs(),
                handle.batch_id
            );

            while scheduler.pending() > 0 || queue.unacked() > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let statement = service
                .statement(actor, actor, PageRequest::new(1, PageRequest::MAX_PAGE_SIZE))
                .await?;
            println!("\n=== Statement for {} ===", source);
            for record in statement.items.iter().rev() {
                println!("{}", record);
            }
            if let Some(balance) = ledger.balance(actor) {
                println!("Final balance: {}", balance);
            }
        }
        None => {
            tracing::info!("Pipeline running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    shutdown.cancel();
    scheduler.stop().await;
    consumer.stop().await;
    tracing::info!(stats = ?consumer.stats(), "Transfer pipeline stopped");
    Ok(())
}
