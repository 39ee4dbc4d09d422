use super::engine::{RecordMutator, StorageEngine, StorageSnapshot};
use crate::core::{BatchItem, KronError, Record, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// In-memory engine.
///
/// `due_index` holds `(due_at, key)` for exactly the non-expired records, so the
/// due query walks the index in deadline order and stops at the first future entry.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: HashMap<String, Record>,
    due_index: BTreeSet<(DateTime<Utc>, String)>,
    items: BTreeMap<u64, BatchItem>,
    next_sequence: u64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&mut self, record: &Record) {
        if !record.expired {
            self.due_index.insert((record.due_at, record.key.clone()));
        }
    }

    fn unindex(&mut self, record: &Record) {
        self.due_index.remove(&(record.due_at, record.key.clone()));
    }

    fn insert_record(&mut self, record: Record) {
        if let Some(previous) = self.records.remove(&record.key) {
            self.unindex(&previous);
        }
        self.index(&record);
        self.records.insert(record.key.clone(), record);
    }
}

impl StorageEngine for InMemoryStorage {
    fn upsert(&mut self, record: Record) -> Result<()> {
        if record.key.is_empty() {
            return Err(KronError::empty_key());
        }
        self.insert_record(record);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Record> {
        self.records.get(key).cloned()
    }

    fn remove(&mut self, key: &str) -> Option<Record> {
        let record = self.records.remove(key)?;
        self.unindex(&record);
        Some(record)
    }

    fn clear_records(&mut self) -> usize {
        let removed = self.records.len();
        self.records.clear();
        self.due_index.clear();
        removed
    }

    fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Record>> {
        Ok(self
            .due_index
            .iter()
            .take_while(|(due_at, _)| *due_at <= now)
            .filter_map(|(_, key)| self.records.get(key))
            .filter(|record| record.is_due(now))
            .cloned()
            .collect())
    }

    fn scan(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn update(&mut self, key: &str, mutator: RecordMutator<'_>) -> Result<Record> {
        let current = self
            .records
            .get(key)
            .ok_or_else(|| KronError::NotFound(key.to_string()))?;

        let mut updated = current.clone();
        mutator(&mut updated)?;
        // The key is the identity of the slot being updated.
        updated.key = key.to_string();

        self.insert_record(updated.clone());
        Ok(updated)
    }

    fn append_item(&mut self, batch_key: &str, payload: String) -> BatchItem {
        self.next_sequence += 1;
        let item = BatchItem {
            sequence: self.next_sequence,
            batch_key: batch_key.to_string(),
            payload,
            flushed: false,
            flush_group: None,
        };
        self.items.insert(item.sequence, item.clone());
        item
    }

    fn update_items(
        &mut self,
        predicate: &dyn Fn(&BatchItem) -> bool,
        mutator: &mut dyn FnMut(&mut BatchItem),
    ) -> Vec<BatchItem> {
        let mut updated = Vec::new();
        for item in self.items.values_mut().filter(|item| predicate(item)) {
            mutator(item);
            updated.push(item.clone());
        }
        updated
    }

    fn items_where(&self, predicate: &dyn Fn(&BatchItem) -> bool) -> Vec<BatchItem> {
        self.items
            .values()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    fn put_items(&mut self, items: Vec<BatchItem>) {
        for item in items {
            self.next_sequence = self.next_sequence.max(item.sequence);
            self.items.insert(item.sequence, item);
        }
    }

    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn item_count(&self) -> usize {
        self.items.len()
    }

    fn export(&self) -> StorageSnapshot {
        StorageSnapshot {
            records: self.scan(),
            items: self.items.values().cloned().collect(),
            next_sequence: self.next_sequence,
        }
    }

    fn restore(&mut self, snapshot: StorageSnapshot) {
        self.records.clear();
        self.due_index.clear();
        self.items.clear();
        self.next_sequence = snapshot.next_sequence;

        for record in snapshot.records {
            self.insert_record(record);
        }
        self.put_items(snapshot.items);
    }
}
