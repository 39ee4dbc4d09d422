// ============================================================================
// Client-facing connection layer
// ============================================================================

pub mod config;
pub mod session;

pub use config::ServerConfig;
pub use session::{Session, SessionEnd};
