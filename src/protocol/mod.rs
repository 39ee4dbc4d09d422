//! JSON wire protocol: one envelope per message.

pub mod command;
pub mod envelope;

pub use command::Command;
pub use envelope::{Action, Envelope};
