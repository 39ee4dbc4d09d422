pub mod error;
pub mod types;

pub use error::{KronError, Result};
pub use types::{BatchItem, Record, RecordKind, far_future};
