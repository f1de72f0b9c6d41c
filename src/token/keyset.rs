//! Remote key-set cache
//!
//! Key sets fetched from trusted issuers are cached per URL. A fresh entry is
//! served without touching the network; a stale-but-usable entry is served
//! while a single background refresh runs. Only a missing or unusable entry
//! makes the caller wait, and that wait is bounded by the caller's deadline.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use reqwest::{header, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::error::{AuthError, AuthResult};
use crate::tasks::PeriodicTask;

/// Forced refreshes (unknown `kid`) are skipped when the set is younger than this
const MIN_FORCED_REFRESH_SECONDS: i64 = 10;

#[derive(Clone)]
struct CachedKeySet {
    keys: Arc<JwkSet>,
    etag: Option<String>,
    fetched_at: DateTime<Utc>,
}

/// Per-URL key-set cache with conditional revalidation
pub struct KeySetCache {
    http: reqwest::Client,
    entries: DashMap<String, CachedKeySet>,
    in_flight: DashMap<String, ()>,
    ttl: Duration,
    max_stale: Duration,
    timeout: std::time::Duration,
    clock: SharedClock,
}

impl KeySetCache {
    pub fn new(
        http: reqwest::Client,
        ttl: Duration,
        max_stale: Duration,
        timeout: std::time::Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            http,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            ttl,
            max_stale,
            timeout,
            clock,
        }
    }

    /// Key set for `url`, fetching only when nothing usable is cached
    pub async fn get(
        self: &Arc<Self>,
        url: &str,
        deadline: std::time::Duration,
    ) -> AuthResult<Arc<JwkSet>> {
        let cached = self.entries.get(url).map(|entry| entry.clone());

        if let Some(cached) = cached {
            let age = self.clock.now() - cached.fetched_at;
            if age <= self.ttl {
                return Ok(cached.keys);
            }
            if age <= self.ttl + self.max_stale {
                self.spawn_refresh(url);
                return Ok(cached.keys);
            }
        }

        self.refresh(url, deadline).await
    }

    /// Refresh after a `kid` miss, unless the set was fetched moments ago
    pub async fn force_refresh(
        &self,
        url: &str,
        deadline: std::time::Duration,
    ) -> AuthResult<Arc<JwkSet>> {
        if let Some(cached) = self.entries.get(url).map(|entry| entry.clone()) {
            if self.clock.now() - cached.fetched_at < Duration::seconds(MIN_FORCED_REFRESH_SECONDS)
            {
                return Ok(cached.keys);
            }
        }
        self.refresh(url, deadline).await
    }

    /// Fetch `url`, revalidating with the cached ETag when there is one
    pub async fn refresh(&self, url: &str, deadline: std::time::Duration) -> AuthResult<Arc<JwkSet>> {
        let previous = self.entries.get(url).map(|entry| entry.clone());

        let mut request = self.http.get(url);
        if let Some(etag) = previous.as_ref().and_then(|p| p.etag.as_deref()) {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let fetch = async {
            let response = request.send().await?;

            if response.status() == StatusCode::NOT_MODIFIED {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(AuthError::UpstreamUnavailable(format!(
                    "key set fetch returned {}",
                    response.status()
                )));
            }

            let etag = response
                .headers()
                .get(header::ETAG)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let keys: JwkSet = response.json().await?;
            Ok(Some((keys, etag)))
        };

        let outcome = match tokio::time::timeout(deadline, fetch).await {
            Ok(result) => result,
            Err(elapsed) => Err(AuthError::from(elapsed)),
        };

        let now = self.clock.now();
        match outcome {
            Ok(Some((keys, etag))) => {
                let keys = Arc::new(keys);
                tracing::debug!(url = %url, keys = keys.keys.len(), "Key set fetched");
                self.entries.insert(
                    url.to_string(),
                    CachedKeySet {
                        keys: keys.clone(),
                        etag,
                        fetched_at: now,
                    },
                );
                Ok(keys)
            }
            Ok(None) => match previous {
                Some(mut cached) => {
                    tracing::debug!(url = %url, "Key set not modified");
                    cached.fetched_at = now;
                    let keys = cached.keys.clone();
                    self.entries.insert(url.to_string(), cached);
                    Ok(keys)
                }
                None => Err(AuthError::UpstreamUnavailable(
                    "unexpected 304 without a cached key set".to_string(),
                )),
            },
            Err(e) => {
                tracing::warn!(url = %url, error = ?e, "Key set fetch failed");
                Err(e)
            }
        }
    }

    fn spawn_refresh(self: &Arc<Self>, url: &str) {
        if self.in_flight.insert(url.to_string(), ()).is_some() {
            return;
        }

        let cache = Arc::clone(self);
        let url = url.to_string();
        tokio::spawn(async move {
            let _ = cache.refresh(&url, cache.timeout).await;
            cache.in_flight.remove(&url);
        });
    }

    /// When `url` last answered successfully
    pub fn last_success(&self, url: &str) -> Option<DateTime<Utc>> {
        self.entries.get(url).map(|entry| entry.fetched_at)
    }

    /// Start periodic refreshes of `urls`
    pub fn start_refresher(
        self: &Arc<Self>,
        urls: Vec<String>,
        interval: std::time::Duration,
        parent: &CancellationToken,
    ) -> PeriodicTask {
        let cache = Arc::clone(self);
        let urls = Arc::new(urls);
        PeriodicTask::spawn("key-set-refresher", interval, parent, move || {
            let cache = cache.clone();
            let urls = urls.clone();
            async move {
                for url in urls.iter() {
                    let _ = cache.refresh(url, cache.timeout).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const JWKS: &str = r#"{"keys":[{"kty":"OKP","crv":"Ed25519","x":"WabLolwicCk-Y154kj1PiZhXLQi0E7GNu0std_mIA9Q","kid":"k1","alg":"EdDSA","use":"sig"}]}"#;

    async fn serve(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/jwks",
            get(move |headers: HeaderMap| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if headers.get("if-none-match").map(|v| v == "\"v1\"").unwrap_or(false) {
                        return AxumStatus::NOT_MODIFIED.into_response();
                    }
                    ([("etag", "\"v1\"")], JWKS).into_response()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/jwks", addr)
    }

    fn cache(clock: &ManualClock) -> Arc<KeySetCache> {
        Arc::new(KeySetCache::new(
            reqwest::Client::new(),
            Duration::minutes(5),
            Duration::hours(1),
            std::time::Duration::from_secs(2),
            Arc::new(clock.clone()),
        ))
    }

    #[tokio::test]
    async fn test_fresh_entry_is_not_refetched() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve(hits.clone()).await;
        let clock = ManualClock::default();
        let cache = cache(&clock);

        let first = cache.get(&url, std::time::Duration::from_secs(2)).await.unwrap();
        assert!(first.find("k1").is_some());

        clock.advance(Duration::minutes(4));
        cache.get(&url, std::time::Duration::from_secs(2)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_while_revalidating() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve(hits.clone()).await;
        let clock = ManualClock::default();
        let cache = cache(&clock);

        cache.get(&url, std::time::Duration::from_secs(2)).await.unwrap();
        let first_fetch = cache.last_success(&url).unwrap();

        clock.advance(Duration::minutes(6));
        let stale = cache.get(&url, std::time::Duration::from_secs(2)).await.unwrap();
        assert!(stale.find("k1").is_some());

        // Background revalidation answers 304 and bumps freshness
        for _ in 0..50 {
            if cache.last_success(&url).unwrap() > first_fetch {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(cache.last_success(&url).unwrap() > first_fetch);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forced_refresh_is_throttled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve(hits.clone()).await;
        let clock = ManualClock::default();
        let cache = cache(&clock);

        cache.get(&url, std::time::Duration::from_secs(2)).await.unwrap();
        cache
            .force_refresh(&url, std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(11));
        cache
            .force_refresh(&url, std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_url_is_upstream_error() {
        let clock = ManualClock::default();
        let cache = cache(&clock);

        let result = cache
            .get("http://127.0.0.1:1/jwks", std::time::Duration::from_secs(2))
            .await;
        assert!(matches!(
            result,
            Err(AuthError::UpstreamUnavailable(_)) | Err(AuthError::Timeout(_))
        ));
    }
}
