//! Shared rate limiter backed by a Redis sorted set
//!
//! The add, trim, count and expire steps run as one server-side script so
//! concurrent instances observe a single consistent window.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use super::{limit_key, LimitTable, RateLimiter};
use crate::clock::SharedClock;
use crate::error::AuthResult;

const KEY_PREFIX: &str = "ratelimit:";

// Returns 1 when admitted. A denied event is removed again so it never
// counts against later checks.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
redis.call('ZADD', key, now, member)
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
redis.call('PEXPIRE', key, window + 1000)
if count > limit then
  redis.call('ZREM', key, member)
  return 0
end
return 1
"#;

/// Multi-instance limiter
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    limits: LimitTable,
    clock: SharedClock,
    script: Script,
}

impl RedisRateLimiter {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str, limits: LimitTable, clock: SharedClock) -> AuthResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, limits, clock))
    }

    pub fn with_connection(conn: ConnectionManager, limits: LimitTable, clock: SharedClock) -> Self {
        Self {
            conn,
            limits,
            clock,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, bucket: &str, key: &str) -> AuthResult<bool> {
        let redis_key = format!("{}{}", KEY_PREFIX, limit_key(bucket, key)?);
        let limit = self.limits.resolve(bucket);
        let now_ms = self.clock.now().timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&redis_key)
            .arg(now_ms)
            .arg(limit.window_millis())
            .arg(limit.limit)
            .arg(&member);

        let mut conn = self.conn.clone();
        let admitted: i64 = invocation.invoke_async(&mut conn).await?;

        if admitted == 0 {
            tracing::warn!(bucket = %bucket, key = %key, "Rate limit exceeded");
        }
        Ok(admitted == 1)
    }
}
