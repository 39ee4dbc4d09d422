use super::transactions::WriteTxn;
use crate::core::{KronError, Record, Result};
use crate::storage::{DurabilityMode, InMemoryStorage, PersistenceManager, StorageEngine};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct DbState {
    storage: Box<dyn StorageEngine>,
    /// WAL and snapshots (optional, memory-only when absent)
    persistence: Option<PersistenceManager>,
}

/// Shared handle over the storage engine.
///
/// Cloning is cheap; every clone sees the same state. Reads share the lock,
/// writes go through [`KronDB::transact`] which holds it exclusively and
/// appends the resulting WAL entries before releasing it.
#[derive(Clone)]
pub struct KronDB {
    state: Arc<RwLock<DbState>>,
}

impl KronDB {
    /// Memory-only database
    pub fn new() -> Self {
        Self::with_engine(Box::new(InMemoryStorage::new()))
    }

    pub fn with_engine(storage: Box<dyn StorageEngine>) -> Self {
        Self {
            state: Arc::new(RwLock::new(DbState {
                storage,
                persistence: None,
            })),
        }
    }

    /// Open a durable database in `data_dir`, recovering snapshot and WAL if present.
    ///
    /// ```no_run
    /// use kroncache::{KronDB, DurabilityMode};
    ///
    /// # tokio_test::block_on(async {
    /// let db = KronDB::open("./data", DurabilityMode::Async).unwrap();
    /// db.checkpoint().await.unwrap();
    /// # });
    /// ```
    pub fn open<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let mut persistence = PersistenceManager::new(&data_dir, durability_mode)?;
        let mut storage: Box<dyn StorageEngine> = Box::new(InMemoryStorage::new());
        if !persistence.recover(storage.as_mut())? {
            info!(dir = %data_dir.as_ref().display(), "Starting with an empty data directory");
        }

        Ok(Self {
            state: Arc::new(RwLock::new(DbState {
                storage,
                persistence: Some(persistence),
            })),
        })
    }

    pub async fn set_checkpoint_threshold(&self, threshold: usize) {
        let mut state = self.state.write().await;
        if let Some(persistence) = state.persistence.as_mut() {
            persistence.wal_mut().set_checkpoint_threshold(threshold);
        }
    }

    pub async fn is_persistence_enabled(&self) -> bool {
        self.state.read().await.persistence.is_some()
    }

    /// Run `f` with exclusive access to the engine.
    ///
    /// Mutations made through the transaction are logged even when `f` fails
    /// part way, so the WAL never lags behind memory.
    pub async fn transact<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<R>,
    {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let mut txn = WriteTxn::new(state.storage.as_mut());
        let outcome = f(&mut txn);
        let pending = txn.into_pending();

        if let Some(persistence) = state.persistence.as_mut()
            && !pending.is_empty()
        {
            for entry in &pending {
                persistence.log(entry)?;
            }
            if persistence.needs_checkpoint()
                && let Err(e) = persistence.checkpoint(state.storage.export())
            {
                warn!(error = %e, "Automatic checkpoint failed");
            }
        }

        outcome
    }

    /// Run `f` with shared access to the engine.
    pub async fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&dyn StorageEngine) -> R,
    {
        let state = self.state.read().await;
        f(state.storage.as_ref())
    }

    pub async fn get(&self, key: &str) -> Option<Record> {
        self.read(|engine| engine.get(key)).await
    }

    pub async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Record>> {
        self.read(|engine| engine.find_due(now)).await
    }

    pub async fn scan(&self) -> Vec<Record> {
        self.read(|engine| engine.scan()).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.read(|engine| engine.keys()).await
    }

    pub async fn record_count(&self) -> usize {
        self.read(|engine| engine.record_count()).await
    }

    /// Write a snapshot and truncate the WAL. No-op without persistence.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(persistence) = state.persistence.as_mut() {
            persistence
                .checkpoint(state.storage.export())
                .map_err(|e| KronError::Storage(format!("checkpoint failed: {e}")))?;
        }
        Ok(())
    }
}

impl Default for KronDB {
    fn default() -> Self {
        Self::new()
    }
}
