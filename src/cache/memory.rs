//! In-process TTL cache

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::TtlCache;
use crate::clock::SharedClock;
use crate::error::AuthResult;
use crate::tasks::PeriodicTask;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Single-instance cache. Expired entries read as absent even before the
/// sweeper removes them.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    clock: SharedClock,
}

impl MemoryCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the periodic expiry sweep
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: std::time::Duration,
        parent: &CancellationToken,
    ) -> PeriodicTask {
        let cache = Arc::clone(self);
        PeriodicTask::spawn("cache-sweeper", interval, parent, move || {
            let cache = cache.clone();
            async move {
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl TtlCache for MemoryCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> AuthResult<()> {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        // Shard guard is released here; only drop the entry if it is still expired
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> AuthResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> AuthResult<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(_, entry)| entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(clock: &ManualClock) -> MemoryCache {
        MemoryCache::new(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        cache
            .put("k", "v".to_string(), Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        cache
            .put("k", "v".to_string(), Duration::seconds(30))
            .await
            .unwrap();
        clock.advance(Duration::seconds(31));

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_take_after_expiry_returns_none() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        cache
            .put("k", "v".to_string(), Duration::seconds(30))
            .await
            .unwrap();
        clock.advance(Duration::minutes(5));
        assert_eq!(cache.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_take_yields_one_winner() {
        let clock = ManualClock::default();
        let cache = Arc::new(cache(&clock));
        cache
            .put("nonce", "payload".to_string(), Duration::minutes(1))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.take("nonce").await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        cache
            .put("short", "a".to_string(), Duration::seconds(10))
            .await
            .unwrap();
        cache
            .put("long", "b".to_string(), Duration::minutes(10))
            .await
            .unwrap();
        clock.advance(Duration::seconds(11));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long").await.unwrap(), Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_lifecycle() {
        let clock = ManualClock::default();
        let cache = Arc::new(cache(&clock));
        cache
            .put("k", "v".to_string(), Duration::seconds(1))
            .await
            .unwrap();
        clock.advance(Duration::seconds(2));

        let root = CancellationToken::new();
        let sweeper = cache.start_sweeper(std::time::Duration::from_secs(60), &root);

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        assert!(cache.is_empty());

        sweeper.stop().await;
    }
}
