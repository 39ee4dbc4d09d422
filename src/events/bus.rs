use super::queue::{EventQueue, OverflowPolicy, PushOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Publish/subscribe fan-out with one bounded queue per live connection.
///
/// `publish` snapshots the subscriber map under the read lock, releases it
/// and pushes into each queue without waiting, so a stuck subscriber can
/// neither hold the map lock nor stall the publisher. A subscriber removed
/// while a publish is in flight may still receive that one event.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

struct BusInner<E> {
    subscribers: RwLock<HashMap<u64, Arc<EventQueue<E>>>>,
    /// Connection id counter; ids start at 1 and are never reused.
    next_id: Mutex<u64>,
    capacity: usize,
    policy: OverflowPolicy,
    published: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Counters reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
    pub disconnected: u64,
}

impl<E: Clone + Send> EventBus<E> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: Mutex::new(0),
                capacity,
                policy,
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                disconnected: AtomicU64::new(0),
            }),
        }
    }

    /// Allocates the next connection id.
    pub fn next_connection_id(&self) -> u64 {
        let mut next = self.inner.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        *next
    }

    /// Allocates an id and subscribes it in one step.
    pub fn register(&self) -> Subscription<E> {
        let id = self.next_connection_id();
        self.subscribe(id)
    }

    /// Subscribes `id`, replacing (and closing) any earlier queue under it.
    pub fn subscribe(&self, id: u64) -> Subscription<E> {
        let queue = Arc::new(EventQueue::new(self.inner.capacity, self.inner.policy));
        let previous = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&queue));
        if let Some(previous) = previous {
            previous.close();
        }
        debug!(conn_id = id, "Subscribed");
        Subscription { id, queue }
    }

    /// Removes `id` and closes its queue. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(queue) => {
                queue.close();
                debug!(conn_id = id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Fans `event` out to every current subscriber. Returns the number of
    /// queues that accepted it.
    pub fn publish(&self, event: E) -> usize {
        let snapshot: Vec<(u64, Arc<EventQueue<E>>)> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .map(|(id, queue)| (*id, Arc::clone(queue)))
                .collect()
        };

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        for (id, queue) in snapshot {
            match queue.push(event.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(conn_id = id, "Subscriber queue full, dropped oldest event");
                }
                PushOutcome::Overflowed => overflowed.push(id),
                PushOutcome::Closed => {}
            }
        }

        for id in overflowed {
            warn!(conn_id = id, "Subscriber queue overflowed, disconnecting");
            self.inner.disconnected.fetch_add(1, Ordering::Relaxed);
            self.unsubscribe(id);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.subscriber_count(),
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            disconnected: self.inner.disconnected.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of one subscriber's queue.
pub struct Subscription<E> {
    id: u64,
    queue: Arc<EventQueue<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event; `None` once unsubscribed (or disconnected
    /// for overflowing) and drained.
    pub async fn recv(&self) -> Option<E> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<E> {
        self.queue.try_pop()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bus(capacity: usize, policy: OverflowPolicy) -> EventBus<String> {
        EventBus::new(capacity, policy)
    }

    #[test]
    fn test_connection_ids_are_monotonic() {
        let bus = bus(8, OverflowPolicy::DropOldest);
        let ids: Vec<u64> = (0..4).map(|_| bus.next_connection_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        let sub = bus.register();
        assert_eq!(sub.id(), 5);
        bus.unsubscribe(5);
        assert_eq!(bus.register().id(), 6);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_every_subscriber() {
        let bus = bus(8, OverflowPolicy::DropOldest);
        let a = bus.register();
        let b = bus.register();

        assert_eq!(bus.publish("hello".to_string()), 2);
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus(8, OverflowPolicy::DropOldest);
        let a = bus.register();
        assert!(bus.unsubscribe(a.id()));
        assert!(!bus.unsubscribe(a.id()));

        assert_eq!(bus.publish("late".to_string()), 0);
        assert_eq!(a.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = bus(8, OverflowPolicy::DropOldest);
        let sub = bus.register();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("wake".to_string());
        });

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert_eq!(event.as_deref(), Some("wake"));
    }

    #[test]
    fn test_drop_oldest_keeps_latest_events() {
        let bus = bus(2, OverflowPolicy::DropOldest);
        let slow = bus.register();
        for n in 1..=4 {
            bus.publish(n.to_string());
        }

        assert_eq!(slow.pending(), 2);
        assert_eq!(slow.try_recv().as_deref(), Some("3"));
        assert_eq!(slow.try_recv().as_deref(), Some("4"));
        assert_eq!(bus.stats().dropped, 2);
    }

    #[test]
    fn test_disconnect_policy_removes_slow_subscriber() {
        let bus = bus(1, OverflowPolicy::Disconnect);
        let slow = bus.register();
        let fast = bus.register();

        bus.publish("1".to_string());
        assert_eq!(fast.try_recv().as_deref(), Some("1"));
        bus.publish("2".to_string());

        assert!(slow.is_closed());
        assert!(!fast.is_closed());
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.stats().disconnected, 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        assert_eq!(bus.publish("nobody".to_string()), 0);
        assert_eq!(bus.stats().published, 1);
    }

    #[test]
    fn test_overflow_policy_from_str() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropOldest);
        assert_eq!("Disconnect".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Disconnect);
        assert!("block".parse::<OverflowPolicy>().is_err());
    }
}
