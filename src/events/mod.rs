//! In-process publish/subscribe for scheduler notifications.

pub mod bus;
mod queue;

pub use bus::{BusStats, EventBus, Subscription};
pub use queue::OverflowPolicy;
