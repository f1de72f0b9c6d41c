//! Configuration for stello-auth
//!
//! Configuration is built explicitly by the host (or deserialized from any
//! serde source) and validated once before the components are wired.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use validator::Validate;

use crate::ratelimit::Limit;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue(format!(
                "Invalid environment: '{}'. Expected: dev, staging, or prod",
                s
            ))),
        }
    }
}

impl Environment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    /// Get the environment name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// Toolkit configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AuthConfig {
    /// Issuer (`iss`) stamped into locally minted tokens
    #[validate(length(min = 1))]
    pub issuer: String,

    /// Audiences stamped into access tokens
    #[validate(length(min = 1))]
    pub audiences: Vec<String>,

    pub environment: Environment,

    /// Access token TTL in seconds (default: 900 = 15 minutes)
    #[validate(range(min = 1))]
    pub access_token_ttl_seconds: i64,

    /// Absolute refresh session lifetime in seconds (default: 7 days)
    #[validate(range(min = 1))]
    pub refresh_token_ttl_seconds: i64,

    /// How long a just-superseded refresh token is honoured once (default: 30)
    #[validate(range(min = 0))]
    pub refresh_grace_seconds: i64,

    /// Tolerated clock skew for exp/nbf/iat checks (default: 60)
    #[validate(range(min = 0, max = 600))]
    pub clock_skew_seconds: i64,

    /// Wallet challenge lifetime in seconds (default: 900)
    #[validate(range(min = 1))]
    pub wallet_nonce_ttl_seconds: i64,

    /// OIDC authorization state lifetime in seconds (default: 600)
    #[validate(range(min = 1))]
    pub oidc_state_ttl_seconds: i64,

    /// How long retired signing keys stay published (default: 7 days)
    #[validate(range(min = 0))]
    pub key_retention_seconds: i64,

    /// Deadline for key-set, discovery and token-exchange calls (default: 10)
    #[validate(range(min = 1))]
    pub http_timeout_seconds: i64,

    /// Freshness of cached key sets and discovery documents (default: 300)
    #[validate(range(min = 1))]
    pub key_set_cache_ttl_seconds: i64,

    /// How long stale key material may still be used (default: 3600)
    #[validate(range(min = 0))]
    pub key_set_max_stale_seconds: i64,

    /// In-process cache sweep period (default: 60)
    #[validate(range(min = 1))]
    pub cache_sweep_interval_seconds: i64,

    /// Per-bucket admission limits; the `default` entry covers unknown buckets
    pub rate_limits: HashMap<String, Limit>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "https://auth.stellovault.local".to_string(),
            audiences: vec!["stellovault-api".to_string()],
            environment: Environment::Development,
            access_token_ttl_seconds: 900,
            refresh_token_ttl_seconds: 7 * 24 * 60 * 60,
            refresh_grace_seconds: 30,
            clock_skew_seconds: 60,
            wallet_nonce_ttl_seconds: 900,
            oidc_state_ttl_seconds: 600,
            key_retention_seconds: 7 * 24 * 60 * 60,
            http_timeout_seconds: 10,
            key_set_cache_ttl_seconds: 300,
            key_set_max_stale_seconds: 3600,
            cache_sweep_interval_seconds: 60,
            rate_limits: HashMap::new(),
        }
    }
}

impl AuthConfig {
    /// Run field validation plus the cross-field checks
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.refresh_grace_seconds >= self.refresh_token_ttl_seconds {
            return Err(ConfigError::InvalidValue(
                "refresh_grace_seconds must be shorter than refresh_token_ttl_seconds".to_string(),
            ));
        }

        for (bucket, limit) in &self.rate_limits {
            if bucket.is_empty() || limit.limit == 0 || limit.window_seconds <= 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "Invalid rate limit for bucket '{}'",
                    bucket
                )));
            }
        }

        Ok(())
    }

    pub fn access_token_ttl(&self) -> Duration {
        Duration::seconds(self.access_token_ttl_seconds)
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::seconds(self.refresh_token_ttl_seconds)
    }

    pub fn refresh_grace(&self) -> Duration {
        Duration::seconds(self.refresh_grace_seconds)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(self.clock_skew_seconds)
    }

    pub fn wallet_nonce_ttl(&self) -> Duration {
        Duration::seconds(self.wallet_nonce_ttl_seconds)
    }

    pub fn oidc_state_ttl(&self) -> Duration {
        Duration::seconds(self.oidc_state_ttl_seconds)
    }

    pub fn key_retention(&self) -> Duration {
        Duration::seconds(self.key_retention_seconds)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_seconds.max(1) as u64)
    }

    pub fn key_set_cache_ttl(&self) -> Duration {
        Duration::seconds(self.key_set_cache_ttl_seconds)
    }

    pub fn key_set_max_stale(&self) -> Duration {
        Duration::seconds(self.key_set_max_stale_seconds)
    }

    pub fn cache_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_sweep_interval_seconds.max(1) as u64)
    }
}
