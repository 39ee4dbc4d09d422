use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// What a full queue does with the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Close the queue; the subscriber's connection is torn down.
    Disconnect,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = crate::core::KronError;

    fn from_str(s: &str) -> crate::core::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(crate::core::KronError::Validation(format!(
                "unknown overflow policy '{other}', expected drop-oldest or disconnect"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Queued,
    DroppedOldest,
    Overflowed,
    Closed,
}

struct QueueState<E> {
    items: VecDeque<E>,
    closed: bool,
}

/// Bounded single-consumer queue behind one subscription.
pub(crate) struct EventQueue<E> {
    state: Mutex<QueueState<E>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<E> EventQueue<E> {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never waits: a full queue applies the overflow policy instead.
    pub(crate) fn push(&self, event: E) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(event);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(event);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => {
                        state.closed = true;
                        PushOutcome::Overflowed
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn try_pop(&self) -> Option<E> {
        self.lock().items.pop_front()
    }

    /// Next event; `None` once the queue is closed and drained.
    pub(crate) async fn pop(&self) -> Option<E> {
        loop {
            {
                let mut state = self.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }
}
