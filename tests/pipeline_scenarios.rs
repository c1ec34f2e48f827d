//! End-to-end pipeline scenarios against the public API
//!
//! Consumer workers and the bulk scheduler run as background tasks, the
//! way the binary wires them.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use transfer_pipeline::scheduler::ItemOutcome;
use transfer_pipeline::transfer::{
    ConsumerConfig, InMemoryRecordStore, PageRequest, TransactionRecordStore,
};
use transfer_pipeline::{
    Account, AccountId, BulkTransferScheduler, InMemoryAccountDirectory, InMemoryLedger,
    IntentConsumer, IntentPublisher, LimitPolicy, MemoryQueue, Role, ScheduleStore,
    TransactionStatus, TransferError, TransferLine, TransferRequest, TransferService,
    TransferValidator,
};

fn dec(v: i64) -> Decimal {
    Decimal::from(v)
}

struct Pipeline {
    directory: Arc<InMemoryAccountDirectory>,
    ledger: Arc<InMemoryLedger>,
    records: Arc<InMemoryRecordStore>,
    queue: Arc<MemoryQueue>,
    service: Arc<TransferService>,
    consumer: Arc<IntentConsumer>,
    shutdown: CancellationToken,
}

impl Pipeline {
    fn new(accounts: &[(AccountId, i64, Role)]) -> Self {
        let directory = Arc::new(InMemoryAccountDirectory::new());
        let ledger = Arc::new(InMemoryLedger::new(LimitPolicy::default()));
        for (id, balance, role) in accounts {
            let number = format!("10000000{:02}", id);
            directory.register(number.clone(), *id);
            ledger
                .open_account(Account::new(*id, number, dec(*balance), *role))
                .unwrap();
        }
        Self::wire(
            directory,
            ledger,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(MemoryQueue::new(4)),
        )
    }

    fn wire(
        directory: Arc<InMemoryAccountDirectory>,
        ledger: Arc<InMemoryLedger>,
        records: Arc<InMemoryRecordStore>,
        queue: Arc<MemoryQueue>,
    ) -> Self {
        let validator = TransferValidator::new(
            directory.clone(),
            ledger.clone(),
            LimitPolicy::default(),
            Duration::from_secs(1),
        );
        let publisher = IntentPublisher::new(records.clone(), queue.clone());
        let service = Arc::new(TransferService::new(validator, publisher, records.clone()));
        let consumer = Arc::new(IntentConsumer::new(
            directory.clone(),
            ledger.clone(),
            records.clone(),
            queue.clone(),
            ConsumerConfig::default(),
        ));
        let shutdown = CancellationToken::new();
        consumer.start(shutdown.child_token()).unwrap();
        Self {
            directory,
            ledger,
            records,
            queue,
            service,
            consumer,
            shutdown,
        }
    }

    async fn settle(&self) {
        for _ in 0..1000 {
            if self.queue.unacked() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.consumer.stop().await;
    }
}

fn number(id: AccountId) -> String {
    format!("10000000{:02}", id)
}

/// Source 1000 (User), bulk [300, 300, 300, 300] staggered 20s apart.
/// Three apply (700 → 400 → 100); the fourth is refused by the daily limit
/// at validation, which takes precedence over insufficient funds.
#[tokio::test(start_paused = true)]
async fn scheduled_bulk_fourth_transfer_refused_by_daily_limit() {
    let pipeline = Pipeline::new(&[(1, 1000, Role::User), (2, 0, Role::User), (3, 0, Role::User)]);
    let scheduler = Arc::new(BulkTransferScheduler::new(
        pipeline.service.clone(),
        Arc::new(ScheduleStore::in_memory()),
        Duration::from_secs(20),
    ));
    scheduler.start(pipeline.shutdown.child_token()).unwrap();

    let lines = vec![
        TransferLine::new(number(2), dec(300)),
        TransferLine::new(number(3), dec(300)),
        TransferLine::new(number(2), dec(300)),
        TransferLine::new(number(3), dec(300)),
    ];
    let batch = scheduler.schedule(1, &number(1), lines).unwrap();

    let mut balances = Vec::new();
    for id in &batch.items {
        while scheduler.item(id).and_then(|item| item.outcome).is_none() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        pipeline.settle().await;
        balances.push(pipeline.ledger.balance(1).unwrap());
    }

    assert_eq!(balances, vec![dec(700), dec(400), dec(100), dec(100)]);
    assert_eq!(pipeline.ledger.balance(1), Some(dec(100)));
    assert_eq!(pipeline.ledger.total_balance(), dec(1000));

    let fourth = scheduler.item(&batch.items[3]).unwrap();
    assert!(matches!(
        fourth.outcome,
        Some(ItemOutcome::Rejected { ref code, .. }) if code == "LIMIT_EXCEEDED"
    ));

    let statement = pipeline
        .service
        .statement(1, 1, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(statement.total, 3);
    assert!(statement
        .items
        .iter()
        .all(|r| r.status == TransactionStatus::Success));

    scheduler.stop().await;
    pipeline.shutdown().await;
}

/// Merchant source with no count limit: concurrent submissions totalling
/// more than the balance never overdraw it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_never_overdraw() {
    let pipeline = Pipeline::new(&[(1, 1000, Role::Merchant), (2, 0, Role::User)]);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = pipeline.service.clone();
        handles.push(tokio::spawn(async move {
            service
                .transfer(
                    1,
                    &TransferRequest::single(number(1), TransferLine::new(number(2), dec(125))),
                )
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(TransferError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected {:?}", other),
        }
    }
    pipeline.settle().await;

    let statement = pipeline
        .service
        .statement(1, 1, PageRequest::new(1, 100))
        .await
        .unwrap();
    let applied = statement
        .items
        .iter()
        .filter(|r| r.status == TransactionStatus::Success)
        .count();

    assert_eq!(statement.total, accepted);
    assert_eq!(applied, 8);
    assert_eq!(pipeline.ledger.balance(1), Some(dec(0)));
    assert_eq!(pipeline.ledger.balance(2), Some(dec(1000)));
    pipeline.shutdown().await;
}

/// Destination closed after queuing: the transfer fails permanently with
/// no ledger mutation.
#[tokio::test]
async fn destination_closed_while_queued() {
    let pipeline = Pipeline::new(&[(1, 1000, Role::User), (2, 0, Role::User)]);
    pipeline.shutdown().await;

    let receipts = pipeline
        .service
        .transfer(
            1,
            &TransferRequest::single(number(1), TransferLine::new(number(2), dec(100))),
        )
        .await
        .unwrap();
    pipeline.directory.remove(&number(2));

    let consumer = Arc::new(IntentConsumer::new(
        pipeline.directory.clone(),
        pipeline.ledger.clone(),
        pipeline.records.clone(),
        pipeline.queue.clone(),
        ConsumerConfig::default(),
    ));
    let shutdown = CancellationToken::new();
    consumer.start(shutdown.clone()).unwrap();
    pipeline.settle().await;
    consumer.stop().await;

    let record = pipeline
        .records
        .get(&receipts[0].correlation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransactionStatus::Failed);
    assert_eq!(record.remark, "Invalid account");
    assert_eq!(pipeline.ledger.balance(1), Some(dec(1000)));
}

/// The broker restarts with intents still un-acked: the journal replays
/// them and every one is applied exactly once.
#[tokio::test]
async fn queue_restart_replays_unacked_intents() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("intents.journal");

    let directory = Arc::new(InMemoryAccountDirectory::new());
    let ledger = Arc::new(InMemoryLedger::default());
    for (id, balance) in [(1, 1000), (2, 0)] {
        directory.register(number(id), id);
        ledger
            .open_account(Account::new(id, number(id), dec(balance), Role::Merchant))
            .unwrap();
    }
    let records = Arc::new(InMemoryRecordStore::new());

    {
        let queue = Arc::new(MemoryQueue::durable(&journal, 2).unwrap());
        let validator = TransferValidator::new(
            directory.clone(),
            ledger.clone(),
            LimitPolicy::default(),
            Duration::from_secs(1),
        );
        let service = TransferService::new(
            validator,
            IntentPublisher::new(records.clone(), queue.clone()),
            records.clone(),
        );
        for amount in [100, 200, 300] {
            service
                .transfer(
                    1,
                    &TransferRequest::single(number(1), TransferLine::new(number(2), dec(amount))),
                )
                .await
                .unwrap();
        }
        // Broker goes down before any consumer ran
    }

    let queue = Arc::new(MemoryQueue::durable(&journal, 2).unwrap());
    assert_eq!(queue.unacked(), 3);
    let pipeline = Pipeline::wire(directory, ledger, records, queue);
    pipeline.settle().await;
    pipeline.shutdown().await;

    assert_eq!(pipeline.ledger.balance(2), Some(dec(600)));
    assert_eq!(pipeline.consumer.stats().applied, 3);

    // A second restart has nothing left to deliver
    let queue = MemoryQueue::durable(&journal, 2).unwrap();
    assert_eq!(queue.unacked(), 0);
}
