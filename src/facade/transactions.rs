use crate::core::{BatchItem, Record, Result};
use crate::storage::{StorageEngine, WalEntry};

/// Exclusive access to the engine for one critical section.
///
/// Every mutation goes through here so it is recorded for the WAL; the
/// pending entries are written when the owning `KronDB::transact` call ends.
pub struct WriteTxn<'a> {
    engine: &'a mut dyn StorageEngine,
    pending: Vec<WalEntry>,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(engine: &'a mut dyn StorageEngine) -> Self {
        Self {
            engine,
            pending: Vec::new(),
        }
    }

    pub(crate) fn into_pending(self) -> Vec<WalEntry> {
        self.pending
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.engine.get(key)
    }

    pub fn upsert(&mut self, record: Record) -> Result<()> {
        self.engine.upsert(record.clone())?;
        self.pending.push(WalEntry::PutRecord(record));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        let removed = self.engine.remove(key);
        if removed.is_some() {
            self.pending.push(WalEntry::DeleteRecord(key.to_string()));
        }
        removed
    }

    pub fn clear_records(&mut self) -> usize {
        let removed = self.engine.clear_records();
        self.pending.push(WalEntry::ClearRecords);
        removed
    }

    pub fn update<F>(&mut self, key: &str, mut mutator: F) -> Result<Record>
    where
        F: FnMut(&mut Record) -> Result<()>,
    {
        let updated = self.engine.update(key, &mut mutator)?;
        self.pending.push(WalEntry::PutRecord(updated.clone()));
        Ok(updated)
    }

    pub fn append_item(&mut self, batch_key: &str, payload: String) -> BatchItem {
        let item = self.engine.append_item(batch_key, payload);
        self.pending.push(WalEntry::PutItems(vec![item.clone()]));
        item
    }

    pub fn update_items<P, M>(&mut self, predicate: P, mut mutator: M) -> Vec<BatchItem>
    where
        P: Fn(&BatchItem) -> bool,
        M: FnMut(&mut BatchItem),
    {
        let updated = self.engine.update_items(&predicate, &mut mutator);
        if !updated.is_empty() {
            self.pending.push(WalEntry::PutItems(updated.clone()));
        }
        updated
    }
}
