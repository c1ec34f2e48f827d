//! Schedule store
//!
//! Durable state of scheduled bulk items. With a journal attached, every
//! state change is fsynced before the call returns; reopening the journal
//! rebuilds the item table.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core_types::AccountId;
use crate::journal::{Journal, JournalEntryType};
use crate::transfer::error::TransferError;
use crate::transfer::types::{CorrelationId, TransferLine};

/// Scheduled item id (ULID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(ulid::Ulid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScheduleId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    /// Waiting for its due time
    Pending,
    /// Handed to the submitter (terminal)
    Fired,
    /// Cancelled before firing (terminal)
    Cancelled,
}

/// What happened when an item fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Submitted { correlation_ids: Vec<CorrelationId> },
    Rejected { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledItem {
    pub id: ScheduleId,
    pub batch_id: ScheduleId,
    /// Position in the input batch
    pub index: usize,
    /// Store-assigned insertion sequence; tie-breaker for equal due times
    pub seq: u64,
    pub actor: AccountId,
    pub source_account_number: String,
    pub line: TransferLine,
    pub due_at: DateTime<Utc>,
    pub state: ItemState,
    #[serde(default)]
    pub outcome: Option<ItemOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemRef {
    id: ScheduleId,
}

#[derive(Default)]
struct Items {
    by_id: HashMap<ScheduleId, ScheduledItem>,
    next_seq: u64,
}

pub struct ScheduleStore {
    items: Mutex<Items>,
    journal: Option<Journal>,
}

impl ScheduleStore {
    /// Volatile store (tests, demos)
    pub fn in_memory() -> Self {
        Self {
            items: Mutex::new(Items::default()),
            journal: None,
        }
    }

    /// Journal-backed store; replays existing entries
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let (journal, entries) = Journal::open(path)?;
        let mut items = Items::default();

        for entry in &entries {
            match entry.entry_type()? {
                JournalEntryType::ItemScheduled => {
                    let item: ScheduledItem = entry.decode()?;
                    items.next_seq = items.next_seq.max(item.seq + 1);
                    items.by_id.insert(item.id, item);
                }
                JournalEntryType::ItemFired => {
                    let item_ref: ItemRef = entry.decode()?;
                    if let Some(item) = items.by_id.get_mut(&item_ref.id) {
                        item.state = ItemState::Fired;
                    }
                }
                JournalEntryType::ItemCancelled => {
                    let item_ref: ItemRef = entry.decode()?;
                    if let Some(item) = items.by_id.get_mut(&item_ref.id) {
                        item.state = ItemState::Cancelled;
                    }
                }
                other => warn!(entry_type = ?other, "Foreign entry in schedule journal ignored"),
            }
        }

        let pending = items
            .by_id
            .values()
            .filter(|i| i.state == ItemState::Pending)
            .count();
        info!(
            path = %journal.path().display(),
            items = items.by_id.len(),
            pending,
            "Schedule store opened"
        );

        Ok(Self {
            items: Mutex::new(items),
            journal: Some(journal),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Items>, TransferError> {
        self.items
            .lock()
            .map_err(|_| TransferError::SystemError("schedule store poisoned".to_string()))
    }

    /// Persist a new pending item; assigns `seq`
    pub fn insert(&self, mut item: ScheduledItem) -> Result<ScheduledItem, TransferError> {
        let mut items = self.lock()?;
        item.seq = items.next_seq;
        if let Some(journal) = &self.journal {
            journal.append_json(JournalEntryType::ItemScheduled, &item)?;
        }
        items.next_seq += 1;
        items.by_id.insert(item.id, item.clone());
        Ok(item)
    }

    /// PENDING → FIRED. `false` if the item is no longer pending.
    pub fn mark_fired(&self, id: &ScheduleId) -> Result<bool, TransferError> {
        self.transition(id, ItemState::Fired, JournalEntryType::ItemFired)
    }

    /// PENDING → CANCELLED. `false` if the item already fired or was cancelled.
    pub fn cancel(&self, id: &ScheduleId) -> Result<bool, TransferError> {
        self.transition(id, ItemState::Cancelled, JournalEntryType::ItemCancelled)
    }

    fn transition(
        &self,
        id: &ScheduleId,
        state: ItemState,
        entry_type: JournalEntryType,
    ) -> Result<bool, TransferError> {
        let mut items = self.lock()?;
        let Some(item) = items.by_id.get_mut(id) else {
            return Err(TransferError::RecordNotFound(id.to_string()));
        };
        if item.state != ItemState::Pending {
            debug!(schedule_id = %id, state = ?item.state, "Item no longer pending");
            return Ok(false);
        }
        if let Some(journal) = &self.journal {
            journal.append_json(entry_type, &ItemRef { id: *id })?;
        }
        item.state = state;
        Ok(true)
    }

    /// Attach the submission outcome (not journaled)
    pub fn record_outcome(&self, id: &ScheduleId, outcome: ItemOutcome) -> Result<(), TransferError> {
        let mut items = self.lock()?;
        if let Some(item) = items.by_id.get_mut(id) {
            item.outcome = Some(outcome);
        }
        Ok(())
    }

    pub fn get(&self, id: &ScheduleId) -> Option<ScheduledItem> {
        self.lock().ok()?.by_id.get(id).cloned()
    }

    /// Pending items in firing order
    pub fn pending(&self) -> Vec<ScheduledItem> {
        let Ok(items) = self.lock() else {
            return Vec::new();
        };
        let mut pending: Vec<ScheduledItem> = items
            .by_id
            .values()
            .filter(|i| i.state == ItemState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.seq.cmp(&b.seq)));
        pending
    }

    /// Items of one batch in input order
    pub fn batch(&self, batch_id: &ScheduleId) -> Vec<ScheduledItem> {
        let Ok(items) = self.lock() else {
            return Vec::new();
        };
        let mut batch: Vec<ScheduledItem> = items
            .by_id
            .values()
            .filter(|i| i.batch_id == *batch_id)
            .cloned()
            .collect();
        batch.sort_by_key(|i| i.index);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn item(batch_id: ScheduleId, index: usize) -> ScheduledItem {
        ScheduledItem {
            id: ScheduleId::new(),
            batch_id,
            index,
            seq: 0,
            actor: 1,
            source_account_number: "ACC-1".to_string(),
            line: TransferLine::new("ACC-2", Decimal::from(10 + index as i64)),
            due_at: Utc::now() + chrono::Duration::seconds(20 * index as i64),
            state: ItemState::Pending,
            outcome: None,
        }
    }

    #[test]
    fn test_fire_and_cancel_are_exclusive() {
        let store = ScheduleStore::in_memory();
        let batch = ScheduleId::new();
        let a = store.insert(item(batch, 0)).unwrap();
        let b = store.insert(item(batch, 1)).unwrap();

        assert!(store.mark_fired(&a.id).unwrap());
        assert!(!store.cancel(&a.id).unwrap());
        assert!(store.cancel(&b.id).unwrap());
        assert!(!store.mark_fired(&b.id).unwrap());
        assert!(store.pending().is_empty());
        assert!(matches!(
            store.cancel(&ScheduleId::new()),
            Err(TransferError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_restores_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.journal");
        let batch = ScheduleId::new();
        let ids: Vec<ScheduleId>;
        {
            let store = ScheduleStore::open(&path).unwrap();
            ids = (0..4)
                .map(|i| store.insert(item(batch, i)).unwrap().id)
                .collect();
            store.mark_fired(&ids[0]).unwrap();
            store.cancel(&ids[2]).unwrap();
        }

        let store = ScheduleStore::open(&path).unwrap();
        let items = store.batch(&batch);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].state, ItemState::Fired);
        assert_eq!(items[1].state, ItemState::Pending);
        assert_eq!(items[2].state, ItemState::Cancelled);
        assert_eq!(items[3].state, ItemState::Pending);

        let pending: Vec<usize> = store.pending().iter().map(|i| i.index).collect();
        assert_eq!(pending, vec![1, 3]);

        // Sequence continues past replayed items
        let next = store.insert(item(batch, 4)).unwrap();
        assert_eq!(next.seq, 4);
    }
}
