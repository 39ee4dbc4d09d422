// ============================================================================
// KronCache Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod facade;
pub mod schedule;
pub mod store;
pub mod batch;
pub mod events;
pub mod protocol;
pub mod dispatcher;
pub mod scheduler;
pub mod connection;
pub mod server;

// Re-export main types for convenience
pub use core::{BatchItem, KronError, Record, RecordKind, Result};
pub use facade::KronDB;
pub use storage::DurabilityMode;
pub use schedule::RecurringSchedule;
pub use store::{NewRecord, RecordStore};
pub use batch::BatchAccumulator;
pub use events::{EventBus, OverflowPolicy};
pub use protocol::{Action, Command, Envelope};
pub use dispatcher::CommandDispatcher;
pub use scheduler::{LifecycleScheduler, TickReport};
pub use connection::ServerConfig;
pub use server::KronServer;
