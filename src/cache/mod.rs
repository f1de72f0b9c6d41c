//! Short-lived challenge storage
//!
//! Wallet nonces and OIDC authorization state live here between issuance and
//! verification. Backends are interchangeable behind [`TtlCache`]; `take`
//! is the single-use primitive both verifiers rely on.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::AuthResult;

pub use memory::MemoryCache;
pub use self::redis::RedisCache;

/// Key prefix for wallet sign-in nonces
pub const WALLET_NONCE_PREFIX: &str = "auth:siws:nonce:";

/// Key prefix for OIDC authorization state
pub const OIDC_STATE_PREFIX: &str = "auth:oidc:state:";

/// Put/get/delete with expiry
#[async_trait]
pub trait TtlCache: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> AuthResult<()>;

    async fn get(&self, key: &str) -> AuthResult<Option<String>>;

    async fn delete(&self, key: &str) -> AuthResult<()>;

    /// Atomically read and remove an entry
    async fn take(&self, key: &str) -> AuthResult<Option<String>>;
}

/// JSON-typed view over a [`TtlCache`] under a fixed key prefix
pub struct TypedCache<T> {
    inner: Arc<dyn TtlCache>,
    prefix: &'static str,
    ttl: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            prefix: self.prefix,
            ttl: self.ttl,
            _marker: PhantomData,
        }
    }
}

impl<T> TypedCache<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub fn new(inner: Arc<dyn TtlCache>, prefix: &'static str, ttl: Duration) -> Self {
        Self {
            inner,
            prefix,
            ttl,
            _marker: PhantomData,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn put(&self, id: &str, value: &T) -> AuthResult<()> {
        let encoded = serde_json::to_string(value)?;
        self.inner.put(&self.key(id), encoded, self.ttl).await
    }

    pub async fn get(&self, id: &str) -> AuthResult<Option<T>> {
        match self.inner.get(&self.key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn take(&self, id: &str) -> AuthResult<Option<T>> {
        match self.inner.take(&self.key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, id: &str) -> AuthResult<()> {
        self.inner.delete(&self.key(id)).await
    }
}
