//! Token signing

use jsonwebtoken::{encode, Algorithm, Header};
use serde::Serialize;
use std::sync::Arc;

use super::keys::KeyRing;
use crate::error::{AuthError, AuthResult};

/// Signs tokens with the key ring's active key
#[derive(Clone)]
pub struct TokenSigner {
    keys: Arc<KeyRing>,
}

impl TokenSigner {
    pub fn new(keys: Arc<KeyRing>) -> Self {
        Self { keys }
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// Sign `claims`, embedding the active `kid` in the header
    pub fn sign<T: Serialize>(&self, claims: &T) -> AuthResult<String> {
        let active = self.keys.active();

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(active.kid().to_string());

        encode(&header, claims, active.encoding_key())
            .map_err(|e| AuthError::Internal(format!("token encoding failed: {}", e)))
    }
}
