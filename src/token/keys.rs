//! Signing key material
//!
//! Tokens are signed with Ed25519 (`EdDSA`). One key is active at a time;
//! rotated-out public keys stay verifiable until the retention window ends.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};

use crate::clock::SharedClock;
use crate::config::Environment;
use crate::error::{AuthError, AuthResult};

/// Algorithm tag carried by every locally minted token
pub const SIGNING_ALGORITHM: &str = "EdDSA";

/// Private half of the active key
pub struct SigningKeyMaterial {
    kid: String,
    encoding_key: EncodingKey,
    public: PublicKeyMaterial,
}

impl SigningKeyMaterial {
    /// Generate a fresh key pair
    pub fn generate() -> AuthResult<Self> {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Load a PKCS#8 PEM encoded Ed25519 private key
    pub fn from_pkcs8_pem(pem: &str) -> AuthResult<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| AuthError::InvalidInput(format!("invalid Ed25519 key: {}", e)))?;
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> AuthResult<Self> {
        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| AuthError::Internal(format!("encode Ed25519 key: {}", e)))?;
        let encoding_key = EncodingKey::from_ed_der(der.as_bytes());
        let public = PublicKeyMaterial::new(signing_key.verifying_key().to_bytes())?;

        Ok(Self {
            kid: public.kid.clone(),
            encoding_key,
            public,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn public_key(&self) -> &PublicKeyMaterial {
        &self.public
    }
}

/// Verification half of a key
#[derive(Clone)]
pub struct PublicKeyMaterial {
    kid: String,
    x: String,
    decoding_key: DecodingKey,
    retired_at: Option<DateTime<Utc>>,
}

impl PublicKeyMaterial {
    fn new(public_key: [u8; 32]) -> AuthResult<Self> {
        let x = URL_SAFE_NO_PAD.encode(public_key);
        let decoding_key = DecodingKey::from_ed_components(&x)
            .map_err(|e| AuthError::Internal(format!("decode Ed25519 key: {}", e)))?;

        Ok(Self {
            kid: key_id(&public_key),
            x,
            decoding_key,
            retired_at: None,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Base64url public key, as published in the `x` member of a JWK
    pub fn x(&self) -> &str {
        &self.x
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    pub fn retired_at(&self) -> Option<DateTime<Utc>> {
        self.retired_at
    }
}

/// Key id derived from the public key so it is stable across restarts
fn key_id(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

struct KeyRingState {
    active: Arc<SigningKeyMaterial>,
    retired: Vec<PublicKeyMaterial>,
}

/// Active signer plus retained verification keys.
///
/// Keys are never mutated in place; rotation swaps the active key and keeps
/// the previous public key until `retired_at + retention`.
pub struct KeyRing {
    state: RwLock<KeyRingState>,
    retention: Duration,
    clock: SharedClock,
}

impl KeyRing {
    pub fn new(active: SigningKeyMaterial, retention: Duration, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(KeyRingState {
                active: Arc::new(active),
                retired: Vec::new(),
            }),
            retention,
            clock,
        }
    }

    /// Load the configured key, or generate one outside production
    pub fn bootstrap(
        environment: Environment,
        pem: Option<&str>,
        retention: Duration,
        clock: SharedClock,
    ) -> AuthResult<Self> {
        let active = match pem {
            Some(pem) => SigningKeyMaterial::from_pkcs8_pem(pem)?,
            None if environment.is_production() => {
                return Err(AuthError::InvalidInput(
                    "a signing key must be configured in production".to_string(),
                ));
            }
            None => {
                tracing::warn!(
                    environment = environment.as_str(),
                    "No signing key configured, generating an ephemeral key"
                );
                SigningKeyMaterial::generate()?
            }
        };

        tracing::info!(kid = %active.kid(), "Signing key loaded");
        Ok(Self::new(active, retention, clock))
    }

    /// Current signer
    pub fn active(&self) -> Arc<SigningKeyMaterial> {
        match self.state.read() {
            Ok(state) => state.active.clone(),
            Err(poisoned) => poisoned.into_inner().active.clone(),
        }
    }

    /// Make `next` the active key and retire the current one
    pub fn rotate(&self, next: SigningKeyMaterial) {
        let now = self.clock.now();
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut previous = state.active.public_key().clone();
        previous.retired_at = Some(now);
        tracing::info!(
            retired_kid = %previous.kid(),
            active_kid = %next.kid(),
            "Signing key rotated"
        );

        state.active = Arc::new(next);
        state.retired.insert(0, previous);

        let retention = self.retention;
        state
            .retired
            .retain(|key| key.retired_at.map_or(true, |at| at + retention > now));
    }

    /// Verification key for `kid`, if it is active or still retained
    pub fn decoding_key(&self, kid: &str) -> Option<DecodingKey> {
        self.verification_keys()
            .into_iter()
            .find(|key| key.kid() == kid)
            .map(|key| key.decoding_key.clone())
    }

    /// Active public key first, then retained keys newest first
    pub fn verification_keys(&self) -> Vec<PublicKeyMaterial> {
        let now = self.clock.now();
        let state = match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut keys = vec![state.active.public_key().clone()];
        keys.extend(
            state
                .retired
                .iter()
                .filter(|key| {
                    key.retired_at
                        .map_or(true, |at| at + self.retention > now)
                })
                .cloned(),
        );
        keys
    }
}
