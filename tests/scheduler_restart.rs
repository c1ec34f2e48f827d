//! Bulk scheduler durability across restarts
//!
//! Paused tokio time drives the dispatcher; due dates persist as wall-clock
//! times in the schedule journal and are re-armed relative to the restart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use transfer_pipeline::scheduler::{ItemOutcome, ItemState};
use transfer_pipeline::transfer::{CorrelationId, PublishReceipt, TransferLine, TransferRequest};
use transfer_pipeline::{
    AccountId, BulkTransferScheduler, ScheduleStore, TransactionStatus, TransferError,
    TransferSubmitter,
};

const INTERVAL: Duration = Duration::from_secs(20);

/// Accepts everything and remembers when each destination was submitted
struct Recorder {
    start: Instant,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, u64)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(to, at)| (to.clone(), at.as_secs_f64().round() as u64))
            .collect()
    }
}

#[async_trait]
impl TransferSubmitter for Recorder {
    async fn submit(
        &self,
        _actor: AccountId,
        request: TransferRequest,
    ) -> Result<Vec<PublishReceipt>, TransferError> {
        let mut calls = self.calls.lock().unwrap();
        Ok(request
            .transfers
            .into_iter()
            .map(|line| {
                calls.push((line.destination_account_number.clone(), self.start.elapsed()));
                PublishReceipt {
                    correlation_id: CorrelationId::new(),
                    destination_account_number: line.destination_account_number,
                    amount: line.amount,
                    status: TransactionStatus::Queued,
                    remark: "Transaction queued for processing".to_string(),
                }
            })
            .collect())
    }
}

fn lines(n: usize) -> Vec<TransferLine> {
    (0..n)
        .map(|i| TransferLine::new(format!("DEST-{}", i), Decimal::from(10)))
        .collect()
}

async fn wait_for(recorder: &Recorder, count: usize) {
    while recorder.calls().len() < count {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn pending_items_survive_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("schedule.journal");

    let batch = {
        let store = Arc::new(ScheduleStore::open(&journal).unwrap());
        let scheduler = BulkTransferScheduler::new(Recorder::new(), store, INTERVAL);
        let batch = scheduler.schedule(1, "SRC", lines(5)).unwrap();
        assert!(scheduler.cancel(&batch.items[2]).unwrap());
        batch
        // Process stops before the dispatcher ever ran
    };

    let store = Arc::new(ScheduleStore::open(&journal).unwrap());
    assert_eq!(store.pending().len(), 4);
    assert_eq!(store.get(&batch.items[2]).unwrap().state, ItemState::Cancelled);

    let recorder = Recorder::new();
    let scheduler = Arc::new(BulkTransferScheduler::new(recorder.clone(), store, INTERVAL));
    assert_eq!(scheduler.pending(), 4);
    let cancel = CancellationToken::new();
    scheduler.start(cancel.clone()).unwrap();

    wait_for(&recorder, 4).await;
    tokio::time::sleep(INTERVAL * 2).await;
    scheduler.stop().await;

    assert_eq!(
        recorder.calls(),
        vec![
            ("DEST-0".to_string(), 0),
            ("DEST-1".to_string(), 20),
            ("DEST-3".to_string(), 60),
            ("DEST-4".to_string(), 80),
        ]
    );
    for id in &batch.items {
        let item = scheduler.item(id).unwrap();
        if item.index == 2 {
            assert_eq!(item.state, ItemState::Cancelled);
            assert!(item.outcome.is_none());
        } else {
            assert_eq!(item.state, ItemState::Fired);
            assert!(matches!(item.outcome, Some(ItemOutcome::Submitted { .. })));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn fired_items_are_not_fired_again_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("schedule.journal");

    let first = Recorder::new();
    let batch = {
        let store = Arc::new(ScheduleStore::open(&journal).unwrap());
        let scheduler = Arc::new(BulkTransferScheduler::new(first.clone(), store, INTERVAL));
        scheduler.start(CancellationToken::new()).unwrap();
        let batch = scheduler.schedule(1, "SRC", lines(4)).unwrap();
        wait_for(&first, 2).await;
        scheduler.stop().await;
        batch
    };
    let fired: Vec<String> = first.calls().into_iter().map(|(to, _)| to).collect();
    assert_eq!(fired, vec!["DEST-0", "DEST-1"]);

    let store = Arc::new(ScheduleStore::open(&journal).unwrap());
    assert_eq!(store.get(&batch.items[0]).unwrap().state, ItemState::Fired);
    assert_eq!(store.pending().len(), 2);

    let second = Recorder::new();
    let scheduler = Arc::new(BulkTransferScheduler::new(second.clone(), store, INTERVAL));
    scheduler.start(CancellationToken::new()).unwrap();
    wait_for(&second, 2).await;
    tokio::time::sleep(INTERVAL * 4).await;
    scheduler.stop().await;

    let refired: Vec<String> = second.calls().into_iter().map(|(to, _)| to).collect();
    assert_eq!(refired, vec!["DEST-2", "DEST-3"]);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_batch_leaves_nothing_to_recover() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("schedule.journal");

    {
        let store = Arc::new(ScheduleStore::open(&journal).unwrap());
        let scheduler = BulkTransferScheduler::new(Recorder::new(), store, INTERVAL);
        let batch = scheduler.schedule(1, "SRC", lines(3)).unwrap();
        assert_eq!(scheduler.cancel_batch(&batch.batch_id).unwrap(), 3);
    }

    let store = Arc::new(ScheduleStore::open(&journal).unwrap());
    let recorder = Recorder::new();
    let scheduler = Arc::new(BulkTransferScheduler::new(recorder.clone(), store, INTERVAL));
    scheduler.start(CancellationToken::new()).unwrap();
    tokio::time::sleep(INTERVAL * 4).await;
    scheduler.stop().await;

    assert!(recorder.calls().is_empty());
}
