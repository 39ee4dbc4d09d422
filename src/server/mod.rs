pub mod ws_server;

pub use ws_server::{KronServer, shutdown_signal};
