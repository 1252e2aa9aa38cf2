//! Delivery dedupe window
//!
//! Providers redeliver on timeouts, so the same `event_id` can arrive more
//! than once. Ids are remembered for a bounded time and count; a failed
//! delivery is forgotten so a redelivery gets another chance.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PersistenceError;

/// Result of recording a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// First sighting; the caller owns processing
    New,
    /// Another delivery is being processed right now
    InProgress,
    /// Already processed successfully
    Completed,
}

/// Remembers which deliveries were seen
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Record `event_id`, reporting whether it was already known
    async fn check_and_record(&self, event_id: &str) -> Result<DeliveryStatus, PersistenceError>;

    /// Processing finished; later deliveries are duplicates
    async fn mark_completed(&self, event_id: &str) -> Result<(), PersistenceError>;

    /// Processing failed; forget the id so a redelivery is processed
    async fn mark_failed(&self, event_id: &str, reason: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug)]
struct Entry {
    recorded_at: Instant,
    completed: bool,
}

#[derive(Debug, Default)]
struct Window {
    entries: HashMap<String, Entry>,
    /// Insertion order; a slot whose timestamp no longer matches its entry is stale
    order: VecDeque<(String, Instant)>,
}

/// In-process dedupe window with TTL and capacity bounds
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Window>,
}

impl InMemoryIdempotencyStore {
    /// Remember ids for `ttl`, at most `capacity` at a time
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Window::default()),
        }
    }

    /// Ids currently remembered
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, window: &mut Window, now: Instant) {
        while let Some((oldest, recorded_at)) = window.order.front() {
            let live = window
                .entries
                .get(oldest)
                .is_some_and(|entry| entry.recorded_at == *recorded_at);
            let expired = now.duration_since(*recorded_at) >= self.ttl;
            if live && !expired && window.entries.len() < self.capacity {
                break;
            }
            if let Some((id, _)) = window.order.pop_front() {
                if live {
                    window.entries.remove(&id);
                }
            }
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), 10_000)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_record(&self, event_id: &str) -> Result<DeliveryStatus, PersistenceError> {
        let now = Instant::now();
        let mut window = self.inner.lock();

        if let Some(entry) = window.entries.get(event_id) {
            if now.duration_since(entry.recorded_at) < self.ttl {
                return Ok(if entry.completed {
                    DeliveryStatus::Completed
                } else {
                    DeliveryStatus::InProgress
                });
            }
            window.entries.remove(event_id);
        }

        self.evict(&mut window, now);
        window.entries.insert(
            event_id.to_string(),
            Entry {
                recorded_at: now,
                completed: false,
            },
        );
        window.order.push_back((event_id.to_string(), now));
        Ok(DeliveryStatus::New)
    }

    async fn mark_completed(&self, event_id: &str) -> Result<(), PersistenceError> {
        if let Some(entry) = self.inner.lock().entries.get_mut(event_id) {
            entry.completed = true;
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, reason: &str) -> Result<(), PersistenceError> {
        tracing::debug!(event_id, reason, "Forgetting failed delivery");
        self.inner.lock().entries.remove(event_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_detection() {
        let store = InMemoryIdempotencyStore::default();

        assert_eq!(store.check_and_record("evt-1").await.unwrap(), DeliveryStatus::New);
        assert_eq!(
            store.check_and_record("evt-1").await.unwrap(),
            DeliveryStatus::InProgress
        );

        store.mark_completed("evt-1").await.unwrap();
        assert_eq!(
            store.check_and_record("evt-1").await.unwrap(),
            DeliveryStatus::Completed
        );
        assert_eq!(store.check_and_record("evt-2").await.unwrap(), DeliveryStatus::New);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_forgotten() {
        let store = InMemoryIdempotencyStore::default();
        store.check_and_record("evt-1").await.unwrap();
        store.mark_failed("evt-1", "store down").await.unwrap();

        assert_eq!(store.check_and_record("evt-1").await.unwrap(), DeliveryStatus::New);
    }

    #[tokio::test]
    async fn test_expired_ids_are_new_again() {
        let store = InMemoryIdempotencyStore::new(Duration::from_millis(20), 100);
        store.check_and_record("evt-1").await.unwrap();
        store.mark_completed("evt-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.check_and_record("evt-1").await.unwrap(), DeliveryStatus::New);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(60), 2);
        for id in ["a", "b", "c"] {
            store.check_and_record(id).await.unwrap();
        }

        assert_eq!(store.len(), 2);
        assert_eq!(store.check_and_record("a").await.unwrap(), DeliveryStatus::New);
        assert_eq!(
            store.check_and_record("c").await.unwrap(),
            DeliveryStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_admit_one() {
        let store = std::sync::Arc::new(InMemoryIdempotencyStore::default());
        let checks = (0..16).map(|_| {
            let store = store.clone();
            async move { store.check_and_record("evt-race").await.unwrap() }
        });

        let statuses = futures::future::join_all(checks).await;

        let admitted = statuses
            .iter()
            .filter(|s| **s == DeliveryStatus::New)
            .count();
        assert_eq!(admitted, 1);
    }
}
