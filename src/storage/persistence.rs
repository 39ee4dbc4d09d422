//! Write-Ahead Logging (WAL) and persistence layer for kroncache

use super::engine::{StorageEngine, StorageSnapshot};
use crate::core::{BatchItem, KronError, Record, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const WAL_FILE: &str = "kroncache.wal";
const SNAPSHOT_FILE: &str = "kroncache.snapshot";

/// A length prefix above this is treated as corruption, not allocated.
const MAX_WAL_ENTRY_LEN: usize = 64 * 1024 * 1024;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn storage_err(context: &str, err: impl std::fmt::Display) -> KronError {
    KronError::Storage(format!("{context}: {err}"))
}

// ============================================================================
// WAL Entry Types
// ============================================================================

/// Write-Ahead Log entry types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    PutRecord(Record),
    DeleteRecord(String),
    ClearRecords,
    PutItems(Vec<BatchItem>),
}

impl WalEntry {
    /// Re-applies the entry to an engine during recovery.
    pub fn apply(self, engine: &mut dyn StorageEngine) -> Result<()> {
        match self {
            WalEntry::PutRecord(record) => engine.upsert(record)?,
            WalEntry::DeleteRecord(key) => {
                engine.remove(&key);
            }
            WalEntry::ClearRecords => {
                engine.clear_records();
            }
            WalEntry::PutItems(items) => engine.put_items(items),
        }
        Ok(())
    }
}

// ============================================================================
// Database Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: u32,
    pub state: StorageSnapshot,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: u64,
    pub record_count: usize,
    pub item_count: usize,
}

impl DatabaseSnapshot {
    pub fn new(state: StorageSnapshot) -> Self {
        let metadata = SnapshotMetadata {
            created_at: now_millis(),
            record_count: state.records.len(),
            item_count: state.items.len(),
        };

        Self {
            version: 1,
            state,
            metadata,
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every WAL append
    Sync,
    /// flush to the OS, no fsync
    #[default]
    Async,
    /// nothing is written
    None,
}

impl std::str::FromStr for DurabilityMode {
    type Err = KronError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "none" => Ok(Self::None),
            other => Err(KronError::Validation(format!(
                "unknown durability mode '{other}', expected sync, async or none"
            ))),
        }
    }
}

// ============================================================================
// WAL Manager
// ============================================================================

/// Result of scanning the WAL file.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub entries: Vec<WalEntry>,
    /// Bytes covered by complete entries
    pub valid_len: u64,
    pub file_len: u64,
}

impl WalReplay {
    pub fn is_torn(&self) -> bool {
        self.file_len > self.valid_len
    }
}

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_err("Failed to create WAL directory", e))?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| storage_err("Failed to open WAL file", e))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| KronError::Storage("WAL file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(entry).map_err(|e| storage_err("Failed to serialize WAL entry", e))?;
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes()).map_err(|e| storage_err("Failed to write WAL", e))?;
        file.write_all(&serialized).map_err(|e| storage_err("Failed to write WAL", e))?;
        file.flush().map_err(|e| storage_err("Failed to flush WAL", e))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut().sync_all().map_err(|e| storage_err("Failed to sync WAL", e))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Reads every complete entry. A torn or corrupt tail stops the scan;
    /// `valid_len` is the byte offset just past the last complete entry.
    pub fn read_all(&self) -> Result<WalReplay> {
        if !self.wal_path.exists() {
            return Ok(WalReplay::default());
        }
        let file = File::open(&self.wal_path).map_err(|e| storage_err("Failed to open WAL for reading", e))?;
        let file_len = file
            .metadata()
            .map_err(|e| storage_err("Failed to stat WAL", e))?
            .len();
        let mut reader = BufReader::new(file);
        let mut replay = WalReplay {
            file_len,
            ..WalReplay::default()
        };
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(storage_err("Failed to read WAL entry length", e)),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_WAL_ENTRY_LEN || len as u64 > file_len - replay.valid_len - 4 {
                break;
            }
            let mut data = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut data) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(storage_err("Failed to read WAL entry", e));
            }
            let entry: WalEntry =
                rmp_serde::from_slice(&data).map_err(|e| storage_err("Failed to deserialize WAL entry", e))?;
            replay.entries.push(entry);
            replay.valid_len += 4 + len as u64;
        }
        if replay.is_torn() {
            warn!(
                "Ignoring {} bytes of truncated WAL tail in {}",
                replay.file_len - replay.valid_len,
                self.wal_path.display()
            );
        }
        Ok(replay)
    }

    /// Cuts the file back to `len` bytes so later appends follow the last
    /// complete entry.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        let Some(file) = self.wal_file.as_mut() else {
            return Ok(());
        };
        file.flush().map_err(|e| storage_err("Failed to flush WAL", e))?;
        file.get_ref()
            .set_len(len)
            .map_err(|e| storage_err("Failed to truncate WAL tail", e))?;
        file.get_ref()
            .sync_all()
            .map_err(|e| storage_err("Failed to sync WAL", e))?;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| storage_err("Failed to truncate WAL", e))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes to a temp file in the same directory and renames it over the old snapshot.
    pub fn save(&self, snapshot: &DatabaseSnapshot) -> Result<()> {
        let dir = self
            .snapshot_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| storage_err("Failed to create snapshot directory", e))?;

        let serialized = rmp_serde::to_vec(snapshot).map_err(|e| storage_err("Failed to serialize snapshot", e))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| storage_err("Failed to create temp file", e))?;
        temp.write_all(&serialized).map_err(|e| storage_err("Failed to write snapshot", e))?;
        temp.flush().map_err(|e| storage_err("Failed to flush snapshot", e))?;
        temp.as_file().sync_all().map_err(|e| storage_err("Failed to sync snapshot", e))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| storage_err("Failed to rename snapshot", e.error))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<DatabaseSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path).map_err(|e| storage_err("Failed to open snapshot", e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| storage_err("Failed to read snapshot", e))?;
        let snapshot: DatabaseSnapshot =
            rmp_serde::from_slice(&data).map_err(|e| storage_err("Failed to deserialize snapshot", e))?;
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn checkpoint(&mut self, state: StorageSnapshot) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let snapshot = DatabaseSnapshot::new(state);
        debug!(
            "Writing snapshot with {} records and {} batch items",
            snapshot.metadata.record_count, snapshot.metadata.item_count
        );
        self.snapshot.save(&snapshot)?;
        self.wal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    /// Loads the last snapshot and replays the WAL on top of it into `engine`.
    /// Returns `false` when there was nothing on disk.
    /// A torn WAL tail is cut off before anything new is appended.
    pub fn recover(&mut self, engine: &mut dyn StorageEngine) -> Result<bool> {
        let snapshot = self.snapshot.load()?;
        let replay = self.wal.read_all()?;
        if replay.is_torn() {
            self.wal.truncate_to(replay.valid_len)?;
        }
        let wal_entries = replay.entries;
        if snapshot.is_none() && wal_entries.is_empty() {
            return Ok(false);
        }

        if let Some(snapshot) = snapshot {
            engine.restore(snapshot.state);
        }
        let replayed = wal_entries.len();
        for entry in wal_entries {
            entry.apply(engine)?;
        }
        info!(
            "Recovered {} records and {} batch items ({} WAL entries replayed)",
            engine.record_count(),
            engine.item_count(),
            replayed
        );
        Ok(true)
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }
    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }
    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }
    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(key: &str, payload: &str) -> Record {
        Record::new(key, payload, Utc::now())
    }

    #[test]
    fn test_wal_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("test.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::PutRecord(record("a", "1"))).unwrap();
        wal.append(&WalEntry::DeleteRecord("a".to_string())).unwrap();
        wal.append(&WalEntry::ClearRecords).unwrap();
        let replay = wal.read_all().unwrap();
        assert!(!replay.is_torn());
        let entries = replay.entries;
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[1], WalEntry::DeleteRecord(ref key) if key == "a"));
    }

    #[test]
    fn test_wal_ignores_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("torn.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::PutRecord(record("a", "1"))).unwrap();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        let replay = wal.read_all().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert!(replay.is_torn());
        assert_eq!(replay.file_len - replay.valid_len, 7);

        wal.truncate_to(replay.valid_len).unwrap();
        wal.append(&WalEntry::DeleteRecord("a".to_string())).unwrap();
        let replay = wal.read_all().unwrap();
        assert!(!replay.is_torn());
        assert_eq!(replay.entries.len(), 2);
    }

    #[test]
    fn test_wal_rejects_oversized_length_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("huge.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::ClearRecords).unwrap();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.write_all(&[0xff; 16]).unwrap();

        let wal = WalManager::new(&wal_path, DurabilityMode::Sync).unwrap();
        let replay = wal.read_all().unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert!(replay.is_torn());
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join(WAL_FILE);
        {
            let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Sync).unwrap();
            persistence.log(&WalEntry::PutRecord(record("a", "1"))).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Sync).unwrap();
        let mut storage = InMemoryStorage::new();
        assert!(persistence.recover(&mut storage).unwrap());
        assert!(!persistence.wal().read_all().unwrap().is_torn());

        persistence.log(&WalEntry::PutRecord(record("b", "2"))).unwrap();
        let mut recovered = InMemoryStorage::new();
        assert!(persistence.recover(&mut recovered).unwrap());
        assert_eq!(recovered.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_durability_none_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("none.wal");
        let mut wal = WalManager::new(&wal_path, DurabilityMode::None).unwrap();
        wal.append(&WalEntry::ClearRecords).unwrap();
        assert!(!wal_path.exists());
        assert_eq!(wal.entries_since_checkpoint(), 0);
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot_mgr = SnapshotManager::new(temp_dir.path().join("test.snapshot"));
        let mut storage = InMemoryStorage::new();
        storage.upsert(record("users", "alice")).unwrap();
        storage.append_item("users", "x".into());

        snapshot_mgr.save(&DatabaseSnapshot::new(storage.export())).unwrap();
        assert!(snapshot_mgr.exists());
        let loaded = snapshot_mgr.load().unwrap().unwrap();
        assert_eq!(loaded.metadata.record_count, 1);
        assert_eq!(loaded.metadata.item_count, 1);
        assert_eq!(loaded.state.records[0].payload, "alice");
    }

    #[test]
    fn test_checkpoint_clears_wal() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Sync).unwrap();
        persistence.log(&WalEntry::PutRecord(record("a", "1"))).unwrap();
        persistence.log(&WalEntry::DeleteRecord("a".into())).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 2);
        persistence.checkpoint(StorageSnapshot::default()).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 0);
        assert!(persistence.snapshot().exists());
    }

    #[test]
    fn test_recovery_replays_wal_over_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Sync).unwrap();

        let mut storage = InMemoryStorage::new();
        storage.upsert(record("kept", "1")).unwrap();
        storage.upsert(record("dropped", "2")).unwrap();
        persistence.checkpoint(storage.export()).unwrap();

        persistence.log(&WalEntry::DeleteRecord("dropped".into())).unwrap();
        persistence.log(&WalEntry::PutRecord(record("added", "3"))).unwrap();
        let item = BatchItem {
            sequence: 7,
            batch_key: "kept".into(),
            payload: "x".into(),
            flushed: false,
            flush_group: None,
        };
        persistence.log(&WalEntry::PutItems(vec![item])).unwrap();

        let mut recovered = InMemoryStorage::new();
        assert!(persistence.recover(&mut recovered).unwrap());
        assert_eq!(recovered.keys(), vec!["added".to_string(), "kept".to_string()]);
        assert_eq!(recovered.item_count(), 1);
        assert_eq!(recovered.append_item("kept", "y".into()).sequence, 8);
    }

    #[test]
    fn test_recovery_of_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::new(temp_dir.path(), DurabilityMode::Async).unwrap();
        let mut storage = InMemoryStorage::new();
        assert!(!persistence.recover(&mut storage).unwrap());
    }

    #[test]
    fn test_durability_mode_from_str() {
        assert_eq!("SYNC".parse::<DurabilityMode>().unwrap(), DurabilityMode::Sync);
        assert_eq!("none".parse::<DurabilityMode>().unwrap(), DurabilityMode::None);
        assert!("fast".parse::<DurabilityMode>().is_err());
    }
}
