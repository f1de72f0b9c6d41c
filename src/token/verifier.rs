//! Bearer token verification
//!
//! Tokens are accepted only from the local issuer or an issuer on the trust
//! list, signed with an allow-listed asymmetric algorithm, under a `kid` the
//! issuer currently publishes. Claims are checked against the injected clock
//! after the signature, so an `Expired` answer is only ever given for an
//! authentic token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::jwk::{Jwk, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use super::claims::{Claims, TokenType};
use super::keys::KeyRing;
use super::keyset::KeySetCache;
use crate::clock::SharedClock;
use crate::error::{AuthError, AuthResult};

/// Algorithms accepted unless configured otherwise
pub const DEFAULT_ALGORITHMS: [Algorithm; 3] = [Algorithm::EdDSA, Algorithm::ES256, Algorithm::RS256];

/// Public key used when an issuer's key set cannot be fetched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedKey {
    pub algorithm: Algorithm,
    /// SPKI PEM public key
    pub pem: String,
}

/// A third-party issuer whose tokens are accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerTrust {
    pub issuer: String,
    pub jwks_url: String,
    #[serde(default)]
    pub pinned_key: Option<PinnedKey>,
    /// Overrides the verifier-wide max-stale for this issuer
    #[serde(default)]
    pub max_stale_seconds: Option<i64>,
}

/// Why a token was rejected. Logged, never returned to callers.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("algorithm {0:?} not allowed")]
    AlgorithmNotAllowed(Algorithm),

    #[error("missing kid")]
    MissingKeyId,

    #[error("issuer not trusted: {0}")]
    UntrustedIssuer(String),

    #[error("no key for kid {0}")]
    UnknownKey(String),

    #[error("signature rejected: {0}")]
    BadSignature(String),

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("wrong token type")]
    WrongTokenType,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("token issued in the future")]
    IssuedInFuture,

    #[error("key set unavailable")]
    KeySetUnavailable(#[source] AuthError),
}

impl From<VerifyError> for AuthError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Expired => AuthError::Expired,
            VerifyError::KeySetUnavailable(AuthError::Timeout(detail)) => AuthError::Timeout(detail),
            VerifyError::KeySetUnavailable(inner) => {
                AuthError::UpstreamUnavailable(format!("key set: {}", inner))
            }
            _ => AuthError::Unauthenticated,
        }
    }
}

/// Check `exp`, `nbf` and `iat` against `now` with `skew` tolerance
pub(crate) fn check_time_claims(
    exp: i64,
    nbf: Option<i64>,
    iat: Option<i64>,
    now: DateTime<Utc>,
    skew: Duration,
) -> Result<(), VerifyError> {
    let now = now.timestamp();
    let skew = skew.num_seconds();

    if now > exp + skew {
        return Err(VerifyError::Expired);
    }
    if let Some(nbf) = nbf {
        if now + skew < nbf {
            return Err(VerifyError::NotYetValid);
        }
    }
    if let Some(iat) = iat {
        if iat > now + skew {
            return Err(VerifyError::IssuedInFuture);
        }
    }
    Ok(())
}

/// Signature-only validation; claims are checked by hand against the clock
pub(crate) fn signature_validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    validation
}

/// Read `iss` before the signature is checked, to pick the trust entry
fn unverified_issuer(token: &str) -> Result<String, VerifyError> {
    #[derive(Deserialize)]
    struct IssuerOnly {
        iss: Option<String>,
    }

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| VerifyError::Malformed("missing payload".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| VerifyError::Malformed(format!("payload encoding: {}", e)))?;
    let claims: IssuerOnly = serde_json::from_slice(&bytes)
        .map_err(|e| VerifyError::Malformed(format!("payload json: {}", e)))?;

    claims
        .iss
        .ok_or_else(|| VerifyError::Malformed("missing iss".to_string()))
}

pub(crate) fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

pub(crate) fn jwk_matches_algorithm(jwk: &Jwk, alg: Algorithm) -> bool {
    match &jwk.common.key_algorithm {
        None => true,
        Some(declared) => matches!(
            (declared, alg),
            (KeyAlgorithm::EdDSA, Algorithm::EdDSA)
                | (KeyAlgorithm::ES256, Algorithm::ES256)
                | (KeyAlgorithm::ES384, Algorithm::ES384)
                | (KeyAlgorithm::RS256, Algorithm::RS256)
                | (KeyAlgorithm::RS384, Algorithm::RS384)
                | (KeyAlgorithm::RS512, Algorithm::RS512)
                | (KeyAlgorithm::PS256, Algorithm::PS256)
                | (KeyAlgorithm::PS384, Algorithm::PS384)
                | (KeyAlgorithm::PS512, Algorithm::PS512)
        ),
    }
}

fn pinned_decoding_key(pinned: &PinnedKey) -> Result<DecodingKey, VerifyError> {
    let pem = pinned.pem.as_bytes();
    let key = match pinned.algorithm {
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
        other => return Err(VerifyError::AlgorithmNotAllowed(other)),
    };
    key.map_err(|e| VerifyError::Malformed(format!("pinned key: {}", e)))
}

struct LocalIssuer {
    issuer: String,
    keys: Arc<KeyRing>,
}

/// Verifies bearer tokens against the local key ring and trusted issuers
pub struct BearerVerifier {
    local: Option<LocalIssuer>,
    trusted: HashMap<String, IssuerTrust>,
    key_sets: Arc<KeySetCache>,
    allowed_algorithms: Vec<Algorithm>,
    skew: Duration,
    max_stale: Duration,
    timeout: std::time::Duration,
    clock: SharedClock,
    started_at: DateTime<Utc>,
}

impl BearerVerifier {
    pub fn new(
        key_sets: Arc<KeySetCache>,
        skew: Duration,
        max_stale: Duration,
        timeout: std::time::Duration,
        clock: SharedClock,
    ) -> Self {
        let started_at = clock.now();
        Self {
            local: None,
            trusted: HashMap::new(),
            key_sets,
            allowed_algorithms: DEFAULT_ALGORITHMS.to_vec(),
            skew,
            max_stale,
            timeout,
            clock,
            started_at,
        }
    }

    /// Accept tokens minted by this process's own key ring
    pub fn with_local_issuer(mut self, issuer: impl Into<String>, keys: Arc<KeyRing>) -> Self {
        self.local = Some(LocalIssuer {
            issuer: issuer.into(),
            keys,
        });
        self
    }

    pub fn trust(mut self, trust: IssuerTrust) -> Self {
        self.trusted.insert(trust.issuer.clone(), trust);
        self
    }

    /// Replace the algorithm allow-list. HMAC algorithms are always dropped.
    pub fn with_allowed_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.allowed_algorithms = algorithms.into_iter().filter(|alg| !is_hmac(*alg)).collect();
        self
    }

    /// Key-set URLs of every trusted issuer
    pub fn key_set_urls(&self) -> Vec<String> {
        self.trusted.values().map(|t| t.jwks_url.clone()).collect()
    }

    pub fn key_sets(&self) -> &Arc<KeySetCache> {
        &self.key_sets
    }

    /// Verify `token` for `expected_audience`
    pub async fn verify(&self, token: &str, expected_audience: &str) -> AuthResult<Claims> {
        self.verify_with_deadline(token, expected_audience, self.timeout)
            .await
    }

    /// Verify with an explicit deadline for any key-set fetch
    pub async fn verify_with_deadline(
        &self,
        token: &str,
        expected_audience: &str,
        deadline: std::time::Duration,
    ) -> AuthResult<Claims> {
        match self.verify_inner(token, expected_audience, deadline).await {
            Ok(claims) => Ok(claims),
            Err(e) => {
                tracing::debug!(reason = %e, "Bearer token rejected");
                Err(e.into())
            }
        }
    }

    async fn verify_inner(
        &self,
        token: &str,
        expected_audience: &str,
        deadline: std::time::Duration,
    ) -> Result<Claims, VerifyError> {
        let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if is_hmac(header.alg) || !self.allowed_algorithms.contains(&header.alg) {
            return Err(VerifyError::AlgorithmNotAllowed(header.alg));
        }
        let kid = header.kid.as_deref().ok_or(VerifyError::MissingKeyId)?;

        let issuer = unverified_issuer(token)?;
        let decoding_key = match &self.local {
            Some(local) if local.issuer == issuer => {
                if header.alg != Algorithm::EdDSA {
                    return Err(VerifyError::AlgorithmNotAllowed(header.alg));
                }
                local
                    .keys
                    .decoding_key(kid)
                    .ok_or_else(|| VerifyError::UnknownKey(kid.to_string()))?
            }
            _ => {
                let trust = self
                    .trusted
                    .get(&issuer)
                    .ok_or_else(|| VerifyError::UntrustedIssuer(issuer.clone()))?;
                self.remote_key(trust, kid, header.alg, deadline).await?
            }
        };

        let data = decode::<Claims>(token, &decoding_key, &signature_validation(header.alg))
            .map_err(|e| VerifyError::BadSignature(e.to_string()))?;
        let claims = data.claims;

        if claims.iss != issuer {
            return Err(VerifyError::UntrustedIssuer(claims.iss));
        }
        if !claims
            .aud
            .as_ref()
            .map(|aud| aud.contains(expected_audience))
            .unwrap_or(false)
        {
            return Err(VerifyError::AudienceMismatch);
        }
        if claims.is_token_type(TokenType::Refresh) {
            return Err(VerifyError::WrongTokenType);
        }
        check_time_claims(
            claims.exp,
            claims.nbf,
            Some(claims.iat),
            self.clock.now(),
            self.skew,
        )?;

        Ok(claims)
    }

    async fn remote_key(
        &self,
        trust: &IssuerTrust,
        kid: &str,
        alg: Algorithm,
        deadline: std::time::Duration,
    ) -> Result<DecodingKey, VerifyError> {
        let set = match self.key_sets.get(&trust.jwks_url, deadline).await {
            Ok(set) => set,
            Err(e) => return self.pinned_fallback(trust, alg, e),
        };

        let jwk = match set.find(kid) {
            Some(jwk) => jwk.clone(),
            None => {
                let refreshed = self
                    .key_sets
                    .force_refresh(&trust.jwks_url, deadline)
                    .await
                    .map_err(VerifyError::KeySetUnavailable)?;
                refreshed
                    .find(kid)
                    .cloned()
                    .ok_or_else(|| VerifyError::UnknownKey(kid.to_string()))?
            }
        };

        if !jwk_matches_algorithm(&jwk, alg) {
            return Err(VerifyError::AlgorithmNotAllowed(alg));
        }
        DecodingKey::from_jwk(&jwk).map_err(|e| VerifyError::Malformed(format!("jwk: {}", e)))
    }

    /// Pinned key, usable only while the last good fetch is within max-stale
    fn pinned_fallback(
        &self,
        trust: &IssuerTrust,
        alg: Algorithm,
        cause: AuthError,
    ) -> Result<DecodingKey, VerifyError> {
        let Some(pinned) = &trust.pinned_key else {
            return Err(VerifyError::KeySetUnavailable(cause));
        };

        let max_stale = trust
            .max_stale_seconds
            .map(Duration::seconds)
            .unwrap_or(self.max_stale);
        let last_good = self
            .key_sets
            .last_success(&trust.jwks_url)
            .unwrap_or(self.started_at);

        if self.clock.now() - last_good > max_stale {
            tracing::error!(
                issuer = %trust.issuer,
                last_good = %last_good,
                "Key set unavailable beyond max-stale, failing closed"
            );
            return Err(VerifyError::KeySetUnavailable(cause));
        }
        if pinned.algorithm != alg {
            return Err(VerifyError::AlgorithmNotAllowed(alg));
        }

        tracing::warn!(issuer = %trust.issuer, error = ?cause, "Using pinned key fallback");
        pinned_decoding_key(pinned)
    }
}
