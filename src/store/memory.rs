use async_trait::async_trait;
use moka::{future::Cache, notification::RemovalCause, Expiry};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::warn;

use super::CacheStore;
use crate::{error::Result, metrics::Metrics};

/// A stored value and the instant it stops being valid
#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Instant,
}

/// Expiry follows the deadline carried by the value, so an increment that
/// keeps the old deadline never extends or shortens the entry's life.
struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot, created_at: Instant) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// Process-local store on `moka` caches.
///
/// Counters live in a cache bounded by `max_capacity`; increments go through
/// `and_upsert_with`, which runs exclusively per key, so concurrent increments
/// on one key never lose updates. Values set with `write` (ban records) live in
/// a separate cache with no capacity bound, so counter churn can never evict a
/// live ban. They still expire with their TTL.
#[derive(Clone)]
pub struct MemoryStore {
    counters: Cache<String, Slot>,
    records: Cache<String, Slot>,
    evicted: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new(max_capacity: u64) -> Self {
        Self::build(max_capacity, None)
    }

    /// Like `new`, also counting capacity evictions in `metrics`
    pub fn with_metrics(max_capacity: u64, metrics: Arc<Metrics>) -> Self {
        Self::build(max_capacity, Some(metrics))
    }

    fn build(max_capacity: u64, metrics: Option<Arc<Metrics>>) -> Self {
        let evicted = Arc::new(AtomicU64::new(0));
        let on_evict = evicted.clone();

        let counters = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(SlotExpiry)
            .eviction_listener(move |key: Arc<String>, _slot: Slot, cause: RemovalCause| {
                if cause != RemovalCause::Size {
                    return;
                }
                on_evict.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, max_capacity, "memory store evicted a live counter");
                if let Some(metrics) = &metrics {
                    metrics.record_store_eviction();
                }
            })
            .build();

        let records = Cache::builder().expire_after(SlotExpiry).build();

        Self {
            counters,
            records,
            evicted,
        }
    }

    /// Live counters dropped because the store was full
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn live(slot: Option<Slot>, now: Instant) -> Option<i64> {
    slot.filter(|slot| slot.expires_at > now).map(|slot| slot.value)
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn increment(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64> {
        let amount = amount as i64;
        let entry = self
            .counters
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let now = Instant::now();
                let slot = match existing {
                    Some(entry) if entry.value().expires_at > now => {
                        let current = entry.into_value();
                        Slot {
                            value: current.value + amount,
                            expires_at: current.expires_at,
                        }
                    }
                    _ => Slot {
                        value: amount,
                        expires_at: now + ttl,
                    },
                };
                std::future::ready(slot)
            })
            .await;

        Ok(entry.into_value().value.max(0) as u64)
    }

    async fn read(&self, key: &str) -> Result<Option<i64>> {
        let now = Instant::now();
        if let Some(value) = live(self.records.get(key).await, now) {
            return Ok(Some(value));
        }
        Ok(live(self.counters.get(key).await, now))
    }

    async fn write(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let slot = Slot {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.records.insert(key.to_string(), slot).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.invalidate(key).await;
        self.counters.invalidate(key).await;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_initializes_then_accumulates() {
        let store = MemoryStore::default();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", 1, ttl).await.unwrap(), 2);
        assert_eq!(store.increment("k", 5, ttl).await.unwrap(), 7);
        assert_eq!(store.read("k").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_first_increment_sets_expiry() {
        let store = MemoryStore::default();

        store.increment("short", 1, Duration::from_millis(50)).await.unwrap();
        // a later increment with a long TTL must not extend the window
        store.increment("short", 1, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.read("short").await.unwrap(), None);
        assert_eq!(store.increment("short", 1, Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let store = Arc::new(MemoryStore::default());
        let mut handles = Vec::new();

        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("shared", 1, Duration::from_secs(60)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.read("shared").await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = MemoryStore::default();

        store.write("ban", 1_700_000_000, Duration::from_secs(300)).await.unwrap();
        assert_eq!(store.read("ban").await.unwrap(), Some(1_700_000_000));

        store.delete("ban").await.unwrap();
        assert_eq!(store.read("ban").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_churn_never_evicts_a_live_ban() {
        let store = MemoryStore::new(50);
        store.write("ban", 4_000_000_000, Duration::from_secs(3600)).await.unwrap();

        for i in 0..5_000 {
            let key = format!("counter:{}", i % 200);
            store.increment(&key, 1, Duration::from_secs(60)).await.unwrap();
        }
        store.counters.run_pending_tasks().await;
        store.records.run_pending_tasks().await;

        assert_eq!(store.read("ban").await.unwrap(), Some(4_000_000_000));
        assert!(store.counters.entry_count() <= 50);
    }

    #[tokio::test]
    async fn test_ban_record_still_expires() {
        let store = MemoryStore::new(10);
        store.write("ban", 1, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.read("ban").await.unwrap(), None);
    }
}
