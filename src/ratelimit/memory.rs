//! In-process rate limiter

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{limit_key, Limit, LimitTable, RateLimiter};
use crate::clock::SharedClock;
use crate::error::AuthResult;

/// Recent admitted events for one `(bucket, key)`
#[derive(Debug)]
struct Window {
    events: VecDeque<i64>,
    window_ms: i64,
}

impl Window {
    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while matches!(self.events.front(), Some(ts) if *ts < cutoff) {
            self.events.pop_front();
        }
    }
}

/// Single-instance limiter keeping timestamps in memory
pub struct MemoryRateLimiter {
    limits: LimitTable,
    clock: SharedClock,
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryRateLimiter {
    pub fn new(limits: LimitTable, clock: SharedClock) -> Self {
        Self {
            limits,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(&self, bucket: &str, key: &str) -> AuthResult<bool> {
        let storage_key = limit_key(bucket, key)?;
        let limit = self.limits.resolve(bucket);
        let now_ms = self.clock.now().timestamp_millis();

        let mut windows = self.lock();
        let window = windows.entry(storage_key.clone()).or_insert_with(|| Window {
            events: VecDeque::new(),
            window_ms: limit.window_millis(),
        });
        window.window_ms = limit.window_millis();
        window.prune(now_ms);

        let admitted = window.events.len() < limit.limit as usize;
        if admitted {
            window.events.push_back(now_ms);
        } else if window.events.is_empty() {
            windows.remove(&storage_key);
        }

        Ok(admitted)
    }

    /// Events still available in the current window
    pub fn remaining(&self, bucket: &str, key: &str) -> AuthResult<u32> {
        let storage_key = limit_key(bucket, key)?;
        let limit: Limit = self.limits.resolve(bucket);
        let now_ms = self.clock.now().timestamp_millis();

        let mut windows = self.lock();
        let used = match windows.get_mut(&storage_key) {
            Some(window) => {
                window.prune(now_ms);
                window.events.len() as u32
            }
            None => 0,
        };

        Ok(limit.limit.saturating_sub(used))
    }

    /// Drop buckets whose events have all aged out
    pub fn purge_idle(&self) -> usize {
        let now_ms = self.clock.now().timestamp_millis();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            window.prune(now_ms);
            !window.events.is_empty()
        });
        before - windows.len()
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, bucket: &str, key: &str) -> AuthResult<bool> {
        let admitted = self.check(bucket, key)?;
        if !admitted {
            tracing::warn!(bucket = %bucket, key = %key, "Rate limit exceeded");
        }
        Ok(admitted)
    }
}
