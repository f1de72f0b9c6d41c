//! OpenID Provider discovery
//!
//! Metadata documents are cached per issuer. The issuer a document reports
//! must equal the configured one; anything else fails the flow.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::{AuthError, AuthResult};

pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Endpoints the relying party needs
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub jwks_uri: String,
}

#[derive(Clone)]
struct CachedDiscovery {
    document: Arc<DiscoveryDocument>,
    fetched_at: DateTime<Utc>,
}

pub struct DiscoveryClient {
    http: reqwest::Client,
    cache: DashMap<String, CachedDiscovery>,
    ttl: Duration,
    clock: SharedClock,
}

pub(crate) fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim_end_matches('/')
}

impl DiscoveryClient {
    pub fn new(http: reqwest::Client, ttl: Duration, clock: SharedClock) -> Self {
        Self {
            http,
            cache: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Metadata for `issuer`, from cache while fresh
    pub async fn discover(
        &self,
        issuer: &str,
        deadline: std::time::Duration,
    ) -> AuthResult<Arc<DiscoveryDocument>> {
        let issuer = normalize_issuer(issuer);
        if issuer.is_empty() {
            return Err(AuthError::InvalidInput("issuer is empty".to_string()));
        }

        if let Some(cached) = self.cache.get(issuer).map(|entry| entry.clone()) {
            if self.clock.now() - cached.fetched_at <= self.ttl {
                return Ok(cached.document);
            }
        }

        let document = Arc::new(tokio::time::timeout(deadline, self.fetch(issuer)).await??);
        self.cache.insert(
            issuer.to_string(),
            CachedDiscovery {
                document: document.clone(),
                fetched_at: self.clock.now(),
            },
        );
        Ok(document)
    }

    async fn fetch(&self, issuer: &str) -> AuthResult<DiscoveryDocument> {
        let url = format!("{}{}", issuer, DISCOVERY_PATH);
        tracing::debug!(url = %url, "Fetching discovery document");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::UpstreamUnavailable(format!(
                "discovery for {} returned {}",
                issuer,
                response.status()
            )));
        }
        let mut document: DiscoveryDocument = response.json().await?;

        let reported = normalize_issuer(&document.issuer);
        if !reported.is_empty() && reported != issuer {
            tracing::error!(
                configured = %issuer,
                reported = %document.issuer,
                "Discovery issuer mismatch"
            );
            return Err(AuthError::Unauthenticated);
        }
        if document.issuer.is_empty() {
            document.issuer = issuer.to_string();
        }

        if document.authorization_endpoint.is_empty()
            || document.token_endpoint.is_empty()
            || document.jwks_uri.is_empty()
        {
            return Err(AuthError::UpstreamUnavailable(format!(
                "discovery for {} is missing endpoints",
                issuer
            )));
        }

        Ok(document)
    }
}
