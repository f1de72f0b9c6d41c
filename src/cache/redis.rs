//! Shared TTL cache on Redis

use async_trait::async_trait;
use chrono::Duration;
use redis::aio::ConnectionManager;

use super::TtlCache;
use crate::error::{AuthError, AuthResult};

/// Cache shared by every instance pointing at the same Redis
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str) -> AuthResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TtlCache for RedisCache {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> AuthResult<()> {
        let ttl_ms = ttl.num_milliseconds();
        if ttl_ms <= 0 {
            return Err(AuthError::InvalidInput("cache ttl must be positive".to_string()));
        }

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> AuthResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn take(&self, key: &str) -> AuthResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }
}
