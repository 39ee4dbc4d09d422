pub mod engine;
pub mod memory;
pub mod persistence;

pub use engine::{RecordMutator, StorageEngine, StorageSnapshot};
pub use memory::InMemoryStorage;
pub use persistence::{DurabilityMode, PersistenceManager, WalEntry, WalReplay};
