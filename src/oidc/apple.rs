//! Sign in with Apple client secrets
//!
//! Apple expects `client_secret` to be an ES256 JWT signed with the team's
//! developer key. One is minted per code exchange.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::error::{AuthError, AuthResult};

pub const APPLE_AUDIENCE: &str = "https://appleid.apple.com";

const DEFAULT_TTL_MINUTES: i64 = 5;

/// Developer key details
#[derive(Debug, Clone)]
pub struct AppleSecretConfig {
    /// Team ID (`iss`)
    pub team_id: String,
    /// Key ID (`kid` header)
    pub key_id: String,
    /// Service or app ID (`sub`)
    pub client_id: String,
    /// PKCS#8 PEM contents of the `.p8` key
    pub private_key_pem: String,
    /// Defaults to 5 minutes when `None`
    pub ttl: Option<Duration>,
}

#[derive(Serialize)]
struct AppleSecretClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Mints Apple `client_secret` JWTs
pub struct AppleClientSecret {
    team_id: String,
    key_id: String,
    client_id: String,
    key: EncodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for AppleClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppleClientSecret")
            .field("team_id", &self.team_id)
            .field("key_id", &self.key_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl AppleClientSecret {
    pub fn new(config: AppleSecretConfig) -> AuthResult<Self> {
        if config.team_id.is_empty()
            || config.key_id.is_empty()
            || config.client_id.is_empty()
            || config.private_key_pem.is_empty()
        {
            return Err(AuthError::InvalidInput(
                "apple: team id, key id, client id and private key are required".to_string(),
            ));
        }

        let key = EncodingKey::from_ec_pem(config.private_key_pem.as_bytes())
            .map_err(|e| AuthError::InvalidInput(format!("apple: invalid private key: {}", e)))?;

        Ok(Self {
            team_id: config.team_id,
            key_id: config.key_id,
            client_id: config.client_id,
            key,
            ttl: config
                .ttl
                .filter(|ttl| *ttl > Duration::zero())
                .unwrap_or_else(|| Duration::minutes(DEFAULT_TTL_MINUTES)),
        })
    }

    pub fn mint(&self, now: DateTime<Utc>) -> AuthResult<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());

        let claims = AppleSecretClaims {
            iss: &self.team_id,
            sub: &self.client_id,
            aud: APPLE_AUDIENCE,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        encode(&header, &claims, &self.key)
            .map_err(|e| AuthError::Internal(format!("apple client secret: {}", e)))
    }
}
