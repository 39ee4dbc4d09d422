use crate::core::{BatchItem, Record, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutator applied to a single record inside the engine's critical section.
pub type RecordMutator<'a> = &'a mut dyn FnMut(&mut Record) -> Result<()>;

/// Full engine state, used for snapshots and recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub records: Vec<Record>,
    pub items: Vec<BatchItem>,
    pub next_sequence: u64,
}

/// Storage engine trait - allows pluggable storage backends
///
/// Every method runs under the caller's exclusive or shared borrow, so each
/// call is atomic with respect to every other call on the same engine.
pub trait StorageEngine: Send + Sync {
    /// Insert the record, or overwrite the one stored under the same key
    fn upsert(&mut self, record: Record) -> Result<()>;

    /// Get a record by key
    fn get(&self, key: &str) -> Option<Record>;

    /// Remove a record, returning it when it existed
    fn remove(&mut self, key: &str) -> Option<Record>;

    /// Remove every record, returning how many were removed
    fn clear_records(&mut self) -> usize;

    /// Records with `expired == false && due_at <= now`, earliest first
    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Record>>;

    /// All records ordered by key
    fn scan(&self) -> Vec<Record>;

    /// All keys, sorted
    fn keys(&self) -> Vec<String>;

    /// Read-modify-write of one record. The mutator runs on a copy; if it
    /// fails nothing is stored.
    fn update(&mut self, key: &str, mutator: RecordMutator<'_>) -> Result<Record>;

    /// Append a batch item with the next sequence number
    fn append_item(&mut self, batch_key: &str, payload: String) -> BatchItem;

    /// Apply `mutator` to every batch item matching `predicate`; returns the updated items
    fn update_items(
        &mut self,
        predicate: &dyn Fn(&BatchItem) -> bool,
        mutator: &mut dyn FnMut(&mut BatchItem),
    ) -> Vec<BatchItem>;

    /// Batch items matching `predicate`, in sequence order
    fn items_where(&self, predicate: &dyn Fn(&BatchItem) -> bool) -> Vec<BatchItem>;

    /// Store items verbatim (recovery path); keeps the sequence counter ahead of them
    fn put_items(&mut self, items: Vec<BatchItem>);

    /// Number of stored records
    fn record_count(&self) -> usize;

    /// Number of stored batch items
    fn item_count(&self) -> usize;

    /// Copy of the full engine state
    fn export(&self) -> StorageSnapshot;

    /// Replace the full engine state
    fn restore(&mut self, snapshot: StorageSnapshot);
}
