//! Record Store
//!
//! Keyed operations over [`KronDB`] with the record-level rules: upsert
//! semantics, schedule resolution on write and numeric updates.

use crate::core::{KronError, Record, RecordKind, Result, far_future};
use crate::facade::KronDB;
use crate::schedule::RecurringSchedule;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

/// Input of [`RecordStore::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRecord {
    pub key: String,
    pub payload: String,
    /// Absolute deadline; ignored when `schedule` is set. `None` never becomes due.
    pub due_at: Option<DateTime<Utc>>,
    pub ack_hold: bool,
    pub schedule: Option<String>,
    pub kind: RecordKind,
}

impl NewRecord {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn ack_hold(mut self, ack_hold: bool) -> Self {
        self.ack_hold = ack_hold;
        self
    }

    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Clone)]
pub struct RecordStore {
    db: KronDB,
}

impl RecordStore {
    pub fn new(db: KronDB) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &KronDB {
        &self.db
    }

    pub async fn set(&self, new: NewRecord) -> Result<Record> {
        self.set_at(new, Utc::now()).await
    }

    /// Upsert evaluated at `now`. A schedule is parsed before anything is
    /// written and its next fire time after `now` becomes the deadline.
    pub async fn set_at(&self, new: NewRecord, now: DateTime<Utc>) -> Result<Record> {
        if new.key.is_empty() {
            return Err(KronError::empty_key());
        }

        let schedule = new.schedule.filter(|s| !s.trim().is_empty());
        let due_at = match schedule.as_deref() {
            Some(spec) => RecurringSchedule::next_fire(spec, now)?,
            None => new.due_at.unwrap_or_else(far_future),
        };

        let record = Record {
            key: new.key,
            due_at,
            payload: new.payload,
            expired: false,
            ack_hold: new.ack_hold,
            schedule,
            kind: new.kind,
        };

        let stored = record.clone();
        self.db.transact(move |txn| txn.upsert(stored)).await?;
        debug!(key = %record.key, due_at = %record.due_at, kind = ?record.kind, "Record stored");
        Ok(record)
    }

    pub async fn get(&self, key: &str) -> Result<Record> {
        if key.is_empty() {
            return Err(KronError::empty_key());
        }
        self.db
            .get(key)
            .await
            .ok_or_else(|| KronError::NotFound(key.to_string()))
    }

    /// Deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(KronError::empty_key());
        }
        let key = key.to_string();
        self.db
            .transact(move |txn| {
                txn.remove(&key);
                Ok(())
            })
            .await
    }

    /// Removes every record and returns how many were removed.
    pub async fn delete_all(&self) -> Result<usize> {
        self.db.transact(|txn| Ok(txn.clear_records())).await
    }

    pub async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Record>> {
        self.db.find_due(now).await
    }

    /// Payloads of every record whose key matches `pattern`, ordered by key.
    pub async fn find_by_key_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = Regex::new(pattern)
            .map_err(|e| KronError::Validation(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(self
            .db
            .scan()
            .await
            .into_iter()
            .filter(|record| regex.is_match(&record.key))
            .map(|record| record.payload)
            .collect())
    }

    pub async fn list_keys(&self) -> Vec<String> {
        self.db.keys().await
    }

    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.add(key, delta).await
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Result<i64> {
        let negated = delta
            .checked_neg()
            .ok_or_else(|| KronError::NumericParse(format!("cannot negate {delta}")))?;
        self.add(key, negated).await
    }

    /// Read-modify-write inside one engine critical section, so concurrent
    /// updates of the same key never lose an increment.
    async fn add(&self, key: &str, delta: i64) -> Result<i64> {
        if key.is_empty() {
            return Err(KronError::empty_key());
        }

        let key = key.to_string();
        let updated = self
            .db
            .transact(move |txn| {
                txn.update(&key, |record| {
                    let current: i64 = record.payload.trim().parse().map_err(|_| {
                        KronError::NumericParse(format!("'{}' holds '{}'", record.key, record.payload))
                    })?;
                    let next = current.checked_add(delta).ok_or_else(|| {
                        KronError::NumericParse(format!("'{}' would overflow", record.key))
                    })?;
                    record.payload = next.to_string();
                    Ok(())
                })
            })
            .await?;

        updated
            .payload
            .parse()
            .map_err(|_| KronError::NumericParse(updated.payload.clone()))
    }
}
