//! Batch Accumulator
//!
//! Values appended under a batch key wait, unflushed, until the key's
//! schedule fires. A flush claims every waiting item in one step and hands
//! back exactly that cohort.

use crate::core::{BatchItem, KronError, Result};
use crate::facade::KronDB;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone)]
pub struct BatchAccumulator {
    db: KronDB,
    /// Serialises appends and flushes against each other.
    flush_lock: Arc<Mutex<()>>,
}

impl BatchAccumulator {
    pub fn new(db: KronDB) -> Self {
        Self {
            db,
            flush_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn append(&self, batch_key: &str, payload: impl Into<String>) -> Result<BatchItem> {
        if batch_key.is_empty() {
            return Err(KronError::empty_key());
        }

        let payload = payload.into();
        let _guard = self.flush_lock.lock().await;
        let batch_key = batch_key.to_string();
        self.db
            .transact(move |txn| Ok(txn.append_item(&batch_key, payload)))
            .await
    }

    /// Marks every unflushed item of `batch_key` with `flush_group = now` and
    /// returns their payloads in append order.
    ///
    /// The mark and the read happen in one engine critical section under the
    /// flush lock, so an item is claimed by at most one flush and items
    /// appended afterwards wait for the next one. The cohort is the set of
    /// items this call flipped, so two flushes sharing a timestamp still
    /// cannot return each other's items.
    pub async fn claim_and_flush(&self, batch_key: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        if batch_key.is_empty() {
            return Err(KronError::empty_key());
        }

        let _guard = self.flush_lock.lock().await;
        let key = batch_key.to_string();
        let cohort = self
            .db
            .transact(move |txn| {
                Ok(txn.update_items(
                    |item| !item.flushed && item.batch_key == key,
                    |item| {
                        item.flushed = true;
                        item.flush_group = Some(now);
                    },
                ))
            })
            .await?;

        debug!(batch_key, items = cohort.len(), "Batch flushed");
        Ok(cohort.into_iter().map(|item| item.payload).collect())
    }

    /// Items of `batch_key` still waiting for a flush.
    pub async fn pending(&self, batch_key: &str) -> Vec<BatchItem> {
        self.db
            .read(|engine| engine.items_where(&|item: &BatchItem| !item.flushed && item.batch_key == batch_key))
            .await
    }

    /// Items claimed by the flush stamped `group`.
    pub async fn flushed_in(&self, batch_key: &str, group: DateTime<Utc>) -> Vec<BatchItem> {
        self.db
            .read(|engine| {
                engine.items_where(&|item: &BatchItem| {
                    item.batch_key == batch_key && item.flush_group == Some(group)
                })
            })
            .await
    }
}
