//! OIDC relying party
//!
//! Authorization-code flow with PKCE and nonce. The ID token returned by the
//! token endpoint is verified against the provider's published key set
//! before any identity is returned.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::discovery::{normalize_issuer, DiscoveryClient, DiscoveryDocument};
use super::pkce::{generate_nonce, generate_state, PkcePair, CHALLENGE_METHOD};
use super::provider::{ProviderConfig, ProviderRegistry};
use crate::cache::{TtlCache, TypedCache, OIDC_STATE_PREFIX};
use crate::clock::SharedClock;
use crate::error::{AuthError, AuthResult};
use crate::token::claims::Audience;
use crate::token::keyset::KeySetCache;
use crate::token::verifier::{
    check_time_claims, is_hmac, jwk_matches_algorithm, signature_validation, VerifyError,
    DEFAULT_ALGORITHMS,
};

/// Redirect target plus the state value the callback must echo
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Verified identity from an ID token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OidcIdentity {
    pub provider: String,
    pub issuer: String,
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    pub preferred_username: Option<String>,
    #[serde(skip_serializing)]
    pub raw_id_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingAuthorization {
    provider: String,
    nonce: String,
    code_verifier: Option<String>,
    redirect_uri: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    aud: Audience,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

#[derive(Debug, Error)]
enum IdTokenError {
    #[error(transparent)]
    Token(#[from] VerifyError),

    #[error("nonce mismatch")]
    NonceMismatch,

    #[error("missing subject")]
    MissingSubject,
}

impl From<IdTokenError> for AuthError {
    fn from(err: IdTokenError) -> Self {
        match err {
            IdTokenError::Token(inner) => inner.into(),
            _ => AuthError::Unauthenticated,
        }
    }
}

/// `email_verified` arrives as a bool or, from some providers, a string
fn parse_email_verified(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(verified) => Some(*verified),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub struct RelyingParty {
    registry: Arc<ProviderRegistry>,
    discovery: DiscoveryClient,
    key_sets: Arc<KeySetCache>,
    states: TypedCache<PendingAuthorization>,
    http: reqwest::Client,
    clock: SharedClock,
    skew: Duration,
    timeout: std::time::Duration,
}

impl RelyingParty {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        http: reqwest::Client,
        key_sets: Arc<KeySetCache>,
        state_cache: Arc<dyn TtlCache>,
        state_ttl: Duration,
        discovery_ttl: Duration,
        skew: Duration,
        timeout: std::time::Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            discovery: DiscoveryClient::new(http.clone(), discovery_ttl, clock.clone()),
            key_sets,
            states: TypedCache::new(state_cache, OIDC_STATE_PREFIX, state_ttl),
            http,
            clock,
            skew,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub async fn begin_flow(&self, provider: &str) -> AuthResult<AuthorizationRequest> {
        self.begin_flow_with_deadline(provider, self.timeout).await
    }

    /// Build the authorization redirect for `provider`.
    ///
    /// Discovery runs first so a misconfigured or spoofed provider fails
    /// before any state is stored.
    pub async fn begin_flow_with_deadline(
        &self,
        provider: &str,
        deadline: std::time::Duration,
    ) -> AuthResult<AuthorizationRequest> {
        let config = self.registry.get(provider)?;
        let document = self.discovery.discover(&config.issuer, deadline).await?;

        let state = generate_state();
        let nonce = generate_nonce();
        let pkce = PkcePair::generate();

        let url = authorization_url(config, &document, &state, &nonce, &pkce)?;

        self.states
            .put(
                &state,
                &PendingAuthorization {
                    provider: config.name.clone(),
                    nonce,
                    code_verifier: config.use_pkce.then_some(pkce.verifier),
                    redirect_uri: config.redirect_uri.clone(),
                    created_at: self.clock.now(),
                },
            )
            .await?;

        debug!(provider = %config.name, "Started authorization flow");
        Ok(AuthorizationRequest { url, state })
    }

    pub async fn complete_flow(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> AuthResult<OidcIdentity> {
        self.complete_flow_with_deadline(provider, code, state, self.timeout)
            .await
    }

    /// Redeem `code` and verify the returned ID token
    pub async fn complete_flow_with_deadline(
        &self,
        provider: &str,
        code: &str,
        state: &str,
        deadline: std::time::Duration,
    ) -> AuthResult<OidcIdentity> {
        if code.is_empty() || state.is_empty() {
            return Err(AuthError::InvalidInput("code and state are required".to_string()));
        }

        let pending = self.states.take(state).await?.ok_or_else(|| {
            debug!(provider = %provider, "Unknown or used authorization state");
            AuthError::Unauthenticated
        })?;
        if pending.provider != provider {
            warn!(
                expected = %pending.provider,
                presented = %provider,
                "Authorization state bound to another provider"
            );
            return Err(AuthError::Unauthenticated);
        }

        let config = self.registry.get(provider)?;
        let document = self.discovery.discover(&config.issuer, deadline).await?;

        let id_token = tokio::time::timeout(
            deadline,
            self.exchange_code(config, &document, code, &pending),
        )
        .await??;

        let identity = self
            .verify_id_token(config, &document, &id_token, &pending.nonce, deadline)
            .await
            .map_err(|e| {
                debug!(provider = %provider, reason = %e, "ID token rejected");
                AuthError::from(e)
            })?;

        info!(provider = %provider, "OIDC sign-in verified");
        Ok(identity)
    }

    async fn exchange_code(
        &self,
        config: &ProviderConfig,
        document: &DiscoveryDocument,
        code: &str,
        pending: &PendingAuthorization,
    ) -> AuthResult<String> {
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", pending.redirect_uri.clone()),
            ("client_id", config.client_id.clone()),
        ];
        if let Some(verifier) = &pending.code_verifier {
            form.push(("code_verifier", verifier.clone()));
        }
        if let Some(secret) = config.client_secret.resolve(self.clock.now())? {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&document.token_endpoint)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            debug!(provider = %config.name, status = %status, "Code exchange refused");
            return Err(AuthError::Unauthenticated);
        }
        if !status.is_success() {
            return Err(AuthError::UpstreamUnavailable(format!(
                "token endpoint for {} returned {}",
                config.name, status
            )));
        }

        let body: TokenResponse = response.json().await?;
        body.id_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            warn!(provider = %config.name, "Token response without id_token");
            AuthError::Unauthenticated
        })
    }

    async fn verify_id_token(
        &self,
        config: &ProviderConfig,
        document: &DiscoveryDocument,
        token: &str,
        expected_nonce: &str,
        deadline: std::time::Duration,
    ) -> Result<OidcIdentity, IdTokenError> {
        let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if is_hmac(header.alg) || !DEFAULT_ALGORITHMS.contains(&header.alg) {
            return Err(VerifyError::AlgorithmNotAllowed(header.alg).into());
        }
        let kid = header.kid.as_deref().ok_or(VerifyError::MissingKeyId)?;
        let key = self
            .provider_key(&document.jwks_uri, kid, header.alg, deadline)
            .await?;

        let claims = decode::<IdTokenClaims>(token, &key, &signature_validation(header.alg))
            .map_err(|e| VerifyError::BadSignature(e.to_string()))?
            .claims;

        if normalize_issuer(&claims.iss) != normalize_issuer(&document.issuer) {
            return Err(VerifyError::UntrustedIssuer(claims.iss).into());
        }
        if !claims.aud.contains(&config.client_id) {
            return Err(VerifyError::AudienceMismatch.into());
        }
        check_time_claims(claims.exp, claims.nbf, claims.iat, self.clock.now(), self.skew)?;
        if claims.nonce.as_deref() != Some(expected_nonce) {
            return Err(IdTokenError::NonceMismatch);
        }
        if claims.sub.is_empty() {
            return Err(IdTokenError::MissingSubject);
        }

        Ok(OidcIdentity {
            provider: config.name.clone(),
            issuer: claims.iss,
            subject: claims.sub,
            email: non_empty(claims.email),
            email_verified: parse_email_verified(claims.email_verified.as_ref()),
            name: non_empty(claims.name),
            preferred_username: non_empty(claims.preferred_username),
            raw_id_token: token.to_string(),
        })
    }

    async fn provider_key(
        &self,
        jwks_uri: &str,
        kid: &str,
        alg: Algorithm,
        deadline: std::time::Duration,
    ) -> Result<DecodingKey, VerifyError> {
        let set = self
            .key_sets
            .get(jwks_uri, deadline)
            .await
            .map_err(VerifyError::KeySetUnavailable)?;

        let jwk = match set.find(kid) {
            Some(jwk) => jwk.clone(),
            None => self
                .key_sets
                .force_refresh(jwks_uri, deadline)
                .await
                .map_err(VerifyError::KeySetUnavailable)?
                .find(kid)
                .cloned()
                .ok_or_else(|| VerifyError::UnknownKey(kid.to_string()))?,
        };

        if !jwk_matches_algorithm(&jwk, alg) {
            return Err(VerifyError::AlgorithmNotAllowed(alg));
        }
        DecodingKey::from_jwk(&jwk).map_err(|e| VerifyError::Malformed(format!("jwk: {}", e)))
    }
}

fn authorization_url(
    config: &ProviderConfig,
    document: &DiscoveryDocument,
    state: &str,
    nonce: &str,
    pkce: &PkcePair,
) -> AuthResult<String> {
    let mut url = Url::parse(&document.authorization_endpoint).map_err(|e| {
        AuthError::UpstreamUnavailable(format!("invalid authorization endpoint: {}", e))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("scope", &config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("nonce", nonce)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", CHALLENGE_METHOD);
        for (name, value) in &config.extra_auth_params {
            query.append_pair(name, value);
        }
    }

    Ok(url.to_string())
}
