//! Key-set publication
//!
//! Public keys are served as an RFC 7517 document with a content-hash ETag
//! so verifiers can revalidate cheaply with `If-None-Match`.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::keys::{KeyRing, SIGNING_ALGORITHM};
use crate::error::{AuthError, AuthResult};

/// Well-known path the key set is served from
pub const KEY_SET_PATH: &str = "/.well-known/jwks.json";

/// Short public cache lifetime for the key-set document
pub const KEY_SET_CACHE_CONTROL: &str = "public, max-age=300, must-revalidate";

/// A single Ed25519 JWK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedJwkSet {
    pub keys: Vec<PublishedJwk>,
}

/// Serialized key set with its ETag
#[derive(Debug, Clone)]
pub struct KeySetDocument {
    body: String,
    etag: String,
}

impl KeySetDocument {
    pub fn from_key_ring(keys: &KeyRing) -> AuthResult<Self> {
        let set = PublishedJwkSet {
            keys: keys
                .verification_keys()
                .iter()
                .map(|key| PublishedJwk {
                    kty: "OKP".to_string(),
                    crv: "Ed25519".to_string(),
                    x: key.x().to_string(),
                    kid: key.kid().to_string(),
                    alg: SIGNING_ALGORITHM.to_string(),
                    use_field: "sig".to_string(),
                })
                .collect(),
        };

        let body = serde_json::to_string(&set)
            .map_err(|e| AuthError::Internal(format!("key set encoding: {}", e)))?;
        let etag = format!("\"{}\"", hex::encode(Sha256::digest(body.as_bytes())));

        Ok(Self { body, etag })
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Whether an `If-None-Match` header value matches this document
    pub fn matches(&self, if_none_match: &str) -> bool {
        if_none_match.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || candidate.trim_start_matches("W/") == self.etag
        })
    }
}

/// `GET` handler for the key-set document
pub async fn serve_key_set(State(keys): State<Arc<KeyRing>>, headers: HeaderMap) -> Response {
    let document = match KeySetDocument::from_key_ring(&keys) {
        Ok(document) => document,
        Err(e) => return e.into_response(),
    };

    let etag = match HeaderValue::from_str(document.etag()) {
        Ok(value) => value,
        Err(e) => return AuthError::Internal(format!("etag header: {}", e)).into_response(),
    };
    let cache_control = HeaderValue::from_static(KEY_SET_CACHE_CONTROL);

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|value| document.matches(value))
        .unwrap_or(false);

    if not_modified {
        return (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag), (header::CACHE_CONTROL, cache_control)],
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (header::ETAG, etag),
            (header::CACHE_CONTROL, cache_control),
        ],
        document.body,
    )
        .into_response()
}

/// Router exposing the key set at its well-known path
pub fn key_set_router(keys: Arc<KeyRing>) -> Router {
    Router::new()
        .route(KEY_SET_PATH, get(serve_key_set))
        .with_state(keys)
}
