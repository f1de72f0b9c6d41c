//! Password hashing
//!
//! New digests are Argon2id PHC strings. Legacy bcrypt digests still verify
//! so accounts migrated from older stores keep working until they rehash.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::error::{AuthError, AuthResult};

/// Minimum accepted password length
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// 64 MiB
const MEMORY_COST_KIB: u32 = 64 * 1024;
const TIME_COST: u32 = 1;
const PARALLELISM: u32 = 1;
const OUTPUT_LEN: usize = 32;

/// Argon2id hasher with fixed parameters
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new() -> AuthResult<Self> {
        let params = Params::new(MEMORY_COST_KIB, TIME_COST, PARALLELISM, Some(OUTPUT_LEN))
            .map_err(|e| AuthError::Internal(format!("argon2 params: {}", e)))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a password into a PHC string
    pub fn hash_password(&self, plaintext: &str) -> AuthResult<String> {
        if plaintext.is_empty() {
            return Err(AuthError::InvalidInput("password is empty".to_string()));
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(format!("password hashing failed: {}", e)))?;

        Ok(hash.to_string())
    }

    /// Verify a password against an encoded digest.
    ///
    /// A mismatch is `Ok(false)`; an unrecognised encoding is `InvalidInput`.
    pub fn verify_password(&self, encoded: &str, plaintext: &str) -> AuthResult<bool> {
        if is_bcrypt(encoded) {
            return bcrypt::verify(plaintext, encoded).map_err(|e| {
                tracing::debug!(error = %e, "Malformed bcrypt digest");
                AuthError::InvalidInput("unsupported password hash".to_string())
            });
        }

        let parsed = PasswordHash::new(encoded).map_err(|e| {
            tracing::debug!(error = %e, "Malformed PHC digest");
            AuthError::InvalidInput("unsupported password hash".to_string())
        })?;

        if parsed.algorithm.as_str() != "argon2id" {
            return Err(AuthError::InvalidInput(
                "unsupported password hash".to_string(),
            ));
        }

        Ok(self
            .argon2
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok())
    }

    /// Whether a stored digest should be replaced on next successful login
    pub fn needs_rehash(&self, encoded: &str) -> bool {
        if is_bcrypt(encoded) {
            return true;
        }

        let Ok(parsed) = PasswordHash::new(encoded) else {
            return true;
        };
        if parsed.algorithm.as_str() != "argon2id" {
            return true;
        }

        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() < MEMORY_COST_KIB
                    || params.t_cost() < TIME_COST
                    || params.p_cost() < PARALLELISM
            }
            Err(_) => true,
        }
    }
}

/// Enforce the minimum password policy
pub fn validate_password_policy(plaintext: &str) -> AuthResult<()> {
    if plaintext.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::InvalidInput(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn is_bcrypt(encoded: &str) -> bool {
    ["$2a$", "$2b$", "$2y$"]
        .iter()
        .any(|prefix| encoded.starts_with(prefix))
}
