//! Wallet sign-in
//!
//! Challenge-response over a [`SignInInput`] message. The issued message is
//! stored under its nonce; verification consumes the nonce before checking
//! anything else, so a challenge can be attempted exactly once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{TtlCache, TypedCache, WALLET_NONCE_PREFIX};
use crate::clock::SharedClock;
use crate::error::{AuthError, AuthResult};
use crate::telemetry::redact;

use super::address::{decode_account_id, verify_signature};
use super::message::{MessageError, SignInInput};

/// Issued challenge handed to the wallet
#[derive(Debug, Clone, Serialize)]
pub struct WalletChallenge {
    pub message: String,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Verified wallet sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletIdentity {
    pub address: String,
    pub domain: String,
    pub chain_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub request_id: Option<String>,
    pub resources: Vec<String>,
}

/// Public detail for any message that fails to parse or validate
const MALFORMED_MESSAGE: &str = "malformed sign-in message";

#[derive(Debug, Serialize, Deserialize)]
struct PendingChallenge {
    message: String,
}

/// Issues and verifies wallet sign-in challenges
#[derive(Clone)]
pub struct WalletVerifier {
    challenges: TypedCache<PendingChallenge>,
    clock: SharedClock,
    skew: Duration,
    ttl: Duration,
}

impl From<MessageError> for AuthError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Expired => AuthError::Expired,
            MessageError::NotYetValid
            | MessageError::IssuedInFuture
            | MessageError::DomainMismatch => AuthError::Unauthenticated,
            other => {
                debug!(error = %other, "Sign-in message rejected");
                AuthError::InvalidInput(MALFORMED_MESSAGE.to_string())
            }
        }
    }
}

impl WalletVerifier {
    pub fn new(cache: Arc<dyn TtlCache>, clock: SharedClock, ttl: Duration, skew: Duration) -> Self {
        Self {
            challenges: TypedCache::new(cache, WALLET_NONCE_PREFIX, ttl),
            clock,
            skew,
            ttl,
        }
    }

    /// Issue a challenge for `address` signing in to `domain`
    pub async fn begin_challenge(&self, domain: &str, address: &str) -> AuthResult<WalletChallenge> {
        let input = SignInInput::new(domain, address, self.clock.now());
        self.begin_challenge_with(input).await
    }

    /// Issue a challenge from a caller-built request.
    ///
    /// The expiry is clamped to the nonce lifetime so the message never
    /// outlives its stored challenge.
    pub async fn begin_challenge_with(&self, mut input: SignInInput) -> AuthResult<WalletChallenge> {
        decode_account_id(&input.address)
            .map_err(|e| AuthError::InvalidInput(e.to_string()))?;
        input.validate()?;

        let nonce_expiry = input.issued_at + self.ttl;
        let expires_at = match input.expiration_time {
            Some(at) if at < nonce_expiry => at,
            _ => nonce_expiry,
        };
        input = input.with_expiration(expires_at);

        let message = input.to_message();
        self.challenges
            .put(
                &input.nonce,
                &PendingChallenge {
                    message: message.clone(),
                },
            )
            .await?;

        debug!(
            address = %redact(&input.address),
            domain = %input.domain,
            "Issued wallet challenge"
        );

        Ok(WalletChallenge {
            message,
            nonce: input.nonce,
            expires_at,
        })
    }

    /// Verify a signed challenge message.
    ///
    /// `signature` is the base64 ed25519 signature over the exact message
    /// bytes.
    pub async fn verify_sign_in(&self, message: &str, signature: &str) -> AuthResult<WalletIdentity> {
        let input = SignInInput::parse(message)?;

        // Consumed up front: a failed attempt burns the nonce
        let pending = self
            .challenges
            .take(&input.nonce)
            .await?
            .ok_or_else(|| {
                debug!(nonce = %redact(&input.nonce), "Unknown or used wallet nonce");
                AuthError::Unauthenticated
            })?;

        if pending.message != message {
            warn!(
                address = %redact(&input.address),
                "Wallet message does not match issued challenge"
            );
            return Err(AuthError::Unauthenticated);
        }

        verify_signature(&input.address, message.as_bytes(), signature).map_err(|e| {
            debug!(address = %redact(&input.address), error = %e, "Wallet signature rejected");
            AuthError::Unauthenticated
        })?;

        input.validate_timestamps(self.clock.now(), self.skew)?;

        info!(address = %redact(&input.address), domain = %input.domain, "Wallet sign-in verified");

        Ok(WalletIdentity {
            address: input.address,
            domain: input.domain,
            chain_id: input.chain_id,
            issued_at: input.issued_at,
            request_id: input.request_id,
            resources: input.resources,
        })
    }
}
