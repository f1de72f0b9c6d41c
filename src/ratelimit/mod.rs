//! Sliding-window rate limiting
//!
//! Admission is counted per `(bucket, key)`. Each check prunes events older
//! than the window, admits while the remaining count is below the limit and
//! records the event only when it is admitted.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AuthError, AuthResult};

pub use memory::MemoryRateLimiter;
pub use self::redis::RedisRateLimiter;

/// Bucket consulted when a bucket has no explicit entry
pub const DEFAULT_BUCKET: &str = "default";

/// Fallback when neither the bucket nor `default` is configured
pub const FALLBACK_LIMIT: Limit = Limit {
    limit: 100,
    window_seconds: 60,
};

/// Admission ceiling for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub limit: u32,
    pub window_seconds: i64,
}

impl Limit {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_seconds: window.num_seconds(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    pub(crate) fn window_millis(&self) -> i64 {
        self.window_seconds.saturating_mul(1000)
    }
}

/// Bucket name to limit lookup
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    limits: HashMap<String, Limit>,
}

impl LimitTable {
    pub fn new(limits: HashMap<String, Limit>) -> Self {
        Self { limits }
    }

    pub fn with(mut self, bucket: impl Into<String>, limit: Limit) -> Self {
        self.limits.insert(bucket.into(), limit);
        self
    }

    /// Limit for a bucket, falling back to `default` and then 100 per minute
    pub fn resolve(&self, bucket: &str) -> Limit {
        self.limits
            .get(bucket)
            .or_else(|| self.limits.get(DEFAULT_BUCKET))
            .copied()
            .unwrap_or(FALLBACK_LIMIT)
    }
}

/// Admission control capability shared by every backend
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit or deny one event for `key` in `bucket`
    async fn allow(&self, bucket: &str, key: &str) -> AuthResult<bool>;
}

/// Storage key for a `(bucket, key)` pair
pub(crate) fn limit_key(bucket: &str, key: &str) -> AuthResult<String> {
    if bucket.is_empty() {
        return Err(AuthError::InvalidInput(
            "rate limit bucket is empty".to_string(),
        ));
    }
    if key.is_empty() {
        return Err(AuthError::InvalidInput("rate limit key is empty".to_string()));
    }
    Ok(format!("{}:{}", key, bucket))
}

/// Named buckets guarding the credential operations
pub mod buckets {
    pub const WALLET_CHALLENGE: &str = "auth:wallet:challenge";
    pub const WALLET_VERIFY: &str = "auth:wallet:verify";
    pub const OIDC_BEGIN: &str = "auth:oidc:begin";
    pub const OIDC_COMPLETE: &str = "auth:oidc:complete";
    pub const TOKEN_REFRESH: &str = "auth:token:refresh";
    pub const PASSWORD_VERIFY: &str = "auth:password:verify";
}
