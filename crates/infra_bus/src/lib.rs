use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Conflating latest-value-per-key mailbox.
///
/// Producers overwrite, never queue: a slow consumer sees the newest value
/// for each key and nothing in between. Built for single-consumer use: the
/// wakeup uses `Notify::notify_one`, which stores a permit when the consumer
/// is not parked, so a publish between `drain` and `wait` is never lost.
pub struct Mailbox<K, V> {
    slots: Mutex<HashMap<K, V>>,
    notify: Notify,
    published: AtomicU64,
    conflated: AtomicU64,
}

impl<K: Eq + Hash, V> Default for Mailbox<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            published: AtomicU64::new(0),
            conflated: AtomicU64::new(0),
        }
    }
}

impl<K: Eq + Hash, V> Mailbox<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot for `key` and wake the consumer. Returns false when
    /// an undelivered value was replaced (conflation happened).
    pub fn publish(&self, key: K, value: V) -> bool {
        let fresh = {
            let mut slots = self.slots.lock();
            slots.insert(key, value).is_none()
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        if !fresh {
            self.conflated.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        fresh
    }

    /// Take every pending value. Key order is unspecified.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut slots = self.slots.lock();
        slots.drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Park until the next publish (or return immediately if a permit is
    /// already stored).
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn conflated(&self) -> u64 {
        self.conflated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn publish_overwrites_per_key() {
        let mailbox = Mailbox::new();
        assert!(mailbox.publish("a", 1));
        assert!(!mailbox.publish("a", 2));
        assert!(mailbox.publish("b", 3));

        let mut drained = mailbox.drain();
        drained.sort();
        assert_eq!(drained, vec![("a", 2), ("b", 3)]);
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.published(), 3);
        assert_eq!(mailbox.conflated(), 1);
    }

    #[tokio::test]
    async fn wait_wakes_on_publish() {
        let mailbox = Arc::new(Mailbox::new());
        let consumer = mailbox.clone();
        let handle = tokio::spawn(async move {
            consumer.wait().await;
            consumer.drain()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.publish("tick", 42);
        let drained = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer woke")
            .expect("join");
        assert_eq!(drained, vec![("tick", 42)]);
    }

    #[tokio::test]
    async fn publish_before_wait_is_not_lost() {
        let mailbox: Mailbox<&str, i32> = Mailbox::new();
        mailbox.publish("tick", 7);
        // The stored permit must let a later wait return immediately.
        tokio::time::timeout(Duration::from_millis(100), mailbox.wait())
            .await
            .expect("permit was stored");
        assert_eq!(mailbox.drain(), vec![("tick", 7)]);
    }
}
