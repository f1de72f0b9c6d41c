//! Refresh session manager
//!
//! Issues, rotates and revokes refresh-token families. Each session tracks
//! its current refresh-token fingerprint and, for a short grace window after
//! a rotation, the one it replaced. A retry with the replaced token gets the
//! current refresh token back once, without advancing the session. Presenting
//! any other token that names a live session is treated as theft: the whole
//! family is revoked.
//!
//! Refresh tokens minted by a rotation are a pure function of the session,
//! the replaced fingerprint and the rotation second, so the current token
//! can be reproduced for a retry without being stored.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::model::{fingerprint, ClientMeta, FingerprintSlots, RefreshSession, SlotMatch};
use super::store::SessionStore;
use crate::clock::SharedClock;
use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::events::{AuthEvent, EventDispatcher, LoginMethod};
use crate::telemetry::redact;
use crate::token::claims::{Claims, TokenType};
use crate::token::keys::KeyRing;
use crate::token::signer::TokenSigner;
use crate::token::verifier::{check_time_claims, signature_validation, VerifyError};

/// Claim naming the session family in refresh tokens
const FAMILY_CLAIM: &str = "fam";

/// Claim carrying the authority that authenticated the subject
const IDP_CLAIM: &str = "idp";

/// Tokens handed back on issue and rotation
#[derive(Debug, Clone, Serialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Uuid,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Session lifetimes
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub issuer: String,
    pub audiences: Vec<String>,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub grace: Duration,
    pub skew: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audiences: config.audiences.clone(),
            access_ttl: config.access_token_ttl(),
            refresh_ttl: config.refresh_token_ttl(),
            grace: config.refresh_grace(),
            skew: config.clock_skew(),
        }
    }
}

/// Authentic contents of a presented refresh token
struct PresentedRefresh {
    session_id: Uuid,
    fingerprint: String,
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    signer: TokenSigner,
    events: EventDispatcher,
    clock: SharedClock,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        keys: Arc<KeyRing>,
        events: EventDispatcher,
        clock: SharedClock,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            signer: TokenSigner::new(keys),
            events,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Start a new session family for `subject`
    pub async fn issue(
        &self,
        subject: &str,
        issuer: &str,
        method: LoginMethod,
        client: ClientMeta,
    ) -> AuthResult<SessionTokens> {
        if subject.is_empty() || issuer.is_empty() {
            return Err(AuthError::InvalidInput(
                "subject and issuer are required".to_string(),
            ));
        }
        client.validate()?;

        let now = self.clock.now();
        let mut session = RefreshSession {
            id: Uuid::new_v4(),
            family_id: Uuid::new_v4(),
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            slots: FingerprintSlots::Active {
                current: String::new(),
            },
            created_at: now,
            last_used_at: now,
            expires_at: Some(now + self.settings.refresh_ttl),
            revoked_at: None,
            client,
        };

        let (tokens, refresh_fingerprint) =
            self.mint(&session, now, now, Uuid::new_v4().to_string())?;
        session.slots = FingerprintSlots::Active {
            current: refresh_fingerprint,
        };
        self.store.insert(&session).await?;

        info!(
            subject = %redact(subject),
            session_id = %session.id,
            method = method.as_str(),
            "Session issued"
        );
        self.events.emit(AuthEvent::Login {
            subject: session.subject.clone(),
            issuer: session.issuer.clone(),
            method,
            session_id: session.id,
            ip_address: session.client.ip_address.clone(),
            user_agent: session.client.user_agent.clone(),
            at: now,
        });

        Ok(tokens)
    }

    /// Exchange a refresh token for a fresh token pair
    pub async fn rotate(&self, refresh_token: &str) -> AuthResult<SessionTokens> {
        let now = self.clock.now();
        let presented = self.verify_refresh_token(refresh_token, now)?;

        let located = self.store.find_by_fingerprint(&presented.fingerprint).await?;
        let session = match located {
            Some(session) if session.id == presented.session_id => session,
            Some(session) => {
                warn!(
                    session_id = %session.id,
                    claimed = %presented.session_id,
                    "Refresh fingerprint held by a different session"
                );
                return Err(AuthError::Unauthenticated);
            }
            None => return self.untracked_token(presented.session_id, now).await,
        };

        if session.is_expired(now) {
            return Err(AuthError::Expired);
        }

        match session.slots.matches(&presented.fingerprint) {
            SlotMatch::Current => {
                let rotated_at = now.trunc_subsecs(0);
                let (tokens, next_fingerprint) = self.mint(
                    &session,
                    now,
                    rotated_at,
                    rotation_jti(&presented.fingerprint, session.id),
                )?;
                let next = FingerprintSlots::Rotated {
                    current: next_fingerprint,
                    previous: presented.fingerprint.clone(),
                    rotated_at,
                };
                self.commit(&session, &presented.fingerprint, next, now, tokens)
                    .await
            }
            SlotMatch::Previous { rotated_at } if now - rotated_at <= self.settings.grace => {
                self.replay_rotation(&session, &presented.fingerprint, rotated_at, now)
                    .await
            }
            SlotMatch::Previous { .. } | SlotMatch::None => {
                self.reuse_detected(&session, now).await
            }
        }
    }

    /// Revoke one session. Idempotent.
    pub async fn revoke(&self, session_id: Uuid) -> AuthResult<()> {
        let now = self.clock.now();
        let Some(session) = self.store.get(session_id).await? else {
            return Ok(());
        };

        if self.store.revoke(session_id, now).await? {
            info!(session_id = %session_id, "Session revoked");
            self.events.emit(AuthEvent::SessionRevoked {
                subject: session.subject,
                session_id: Some(session_id),
                revoked: 1,
                at: now,
            });
        }
        Ok(())
    }

    /// Revoke every session of `subject`. Idempotent.
    pub async fn revoke_all(&self, subject: &str) -> AuthResult<u64> {
        let now = self.clock.now();
        let revoked = self.store.revoke_subject(subject, now).await?;

        if revoked > 0 {
            info!(subject = %redact(subject), revoked, "All sessions revoked");
            self.events.emit(AuthEvent::SessionRevoked {
                subject: subject.to_string(),
                session_id: None,
                revoked,
                at: now,
            });
        }
        Ok(revoked)
    }

    pub async fn list_sessions(&self, subject: &str) -> AuthResult<Vec<RefreshSession>> {
        self.store.list_active(subject, self.clock.now()).await
    }

    /// Delete sessions that ended more than `retention` ago
    pub async fn purge_expired(&self, retention: Duration) -> AuthResult<u64> {
        let purged = self.store.purge(self.clock.now() - retention).await?;
        if purged > 0 {
            info!(purged, "Purged ended sessions");
        }
        Ok(purged)
    }

    async fn commit(
        &self,
        session: &RefreshSession,
        expected_current: &str,
        next: FingerprintSlots,
        now: DateTime<Utc>,
        tokens: SessionTokens,
    ) -> AuthResult<SessionTokens> {
        if self
            .store
            .swap_fingerprints(session.id, expected_current, &next, now)
            .await?
        {
            debug!(session_id = %session.id, "Session rotated");
            Ok(tokens)
        } else {
            debug!(session_id = %session.id, "Lost rotation race");
            Err(AuthError::StaleRefreshToken)
        }
    }

    /// Answer a retried rotation with the refresh token it already produced.
    /// The replaced token is consumed; the current one stays valid.
    async fn replay_rotation(
        &self,
        session: &RefreshSession,
        previous: &str,
        rotated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AuthResult<SessionTokens> {
        let (tokens, reminted) =
            self.mint(session, now, rotated_at, rotation_jti(previous, session.id))?;
        let current = session.slots.current();
        if reminted != current {
            // Signing key changed since the rotation
            debug!(session_id = %session.id, "Rotated token cannot be reproduced");
            return Err(AuthError::StaleRefreshToken);
        }

        if self
            .store
            .consume_previous(session.id, current, previous, now)
            .await?
        {
            debug!(session_id = %session.id, "Refresh retried within grace window");
            Ok(tokens)
        } else {
            debug!(session_id = %session.id, "Grace retry already answered");
            Err(AuthError::StaleRefreshToken)
        }
    }

    /// Token is authentic but no longer tracked by any live slot
    async fn untracked_token(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> AuthResult<SessionTokens> {
        match self.store.get(session_id).await? {
            Some(session) if session.is_revoked() => Err(AuthError::Unauthenticated),
            Some(session) if session.is_expired(now) => Err(AuthError::Expired),
            Some(session) => self.reuse_detected(&session, now).await,
            None => Err(AuthError::Unauthenticated),
        }
    }

    async fn reuse_detected(
        &self,
        session: &RefreshSession,
        now: DateTime<Utc>,
    ) -> AuthResult<SessionTokens> {
        let revoked = self.store.revoke_family(session.family_id, now).await?;

        warn!(
            subject = %redact(&session.subject),
            family_id = %session.family_id,
            session_id = %session.id,
            revoked,
            "Refresh token reuse detected, family revoked"
        );
        self.events.emit(AuthEvent::RefreshReuse {
            subject: session.subject.clone(),
            family_id: session.family_id,
            session_id: session.id,
            revoked,
            at: now,
        });

        Err(AuthError::ReuseDetected)
    }

    /// Sign an access token at `now` and a refresh token at `refresh_issued_at`;
    /// returns the refresh fingerprint
    fn mint(
        &self,
        session: &RefreshSession,
        now: DateTime<Utc>,
        refresh_issued_at: DateTime<Utc>,
        jti: String,
    ) -> AuthResult<(SessionTokens, String)> {
        let settings = &self.settings;

        let access_claims = Claims::access(
            &settings.issuer,
            &session.subject,
            &settings.audiences,
            now,
            settings.access_ttl,
        )
        .with_session(session.id.to_string())
        .with_claim(IDP_CLAIM, Value::String(session.issuer.clone()));
        let access_token = self.signer.sign(&access_claims)?;

        let refresh_expires_at = match session.expires_at {
            Some(at) => at.min(refresh_issued_at + settings.refresh_ttl),
            None => refresh_issued_at + settings.refresh_ttl,
        };
        let refresh_claims = Claims {
            iss: settings.issuer.clone(),
            sub: session.subject.clone(),
            aud: None,
            iat: refresh_issued_at.timestamp(),
            nbf: None,
            exp: refresh_expires_at.timestamp(),
            jti: Some(jti),
            sid: Some(session.id.to_string()),
            token_type: Some(TokenType::Refresh.as_str().to_string()),
            extra: Default::default(),
        }
        .with_claim(FAMILY_CLAIM, Value::String(session.family_id.to_string()));
        let refresh_token = self.signer.sign(&refresh_claims)?;
        let refresh_fingerprint = fingerprint(&refresh_token);

        Ok((
            SessionTokens {
                access_token,
                refresh_token,
                session_id: session.id,
                access_expires_at: now + settings.access_ttl,
                refresh_expires_at,
            },
            refresh_fingerprint,
        ))
    }

    fn verify_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<PresentedRefresh> {
        let result = self.decode_refresh(token, now);
        result.map_err(|e| {
            debug!(reason = %e, "Refresh token rejected");
            AuthError::from(e)
        })
    }

    fn decode_refresh(&self, token: &str, now: DateTime<Utc>) -> Result<PresentedRefresh, VerifyError> {
        let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if header.alg != Algorithm::EdDSA {
            return Err(VerifyError::AlgorithmNotAllowed(header.alg));
        }
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;
        let key = self
            .signer
            .key_ring()
            .decoding_key(&kid)
            .ok_or_else(|| VerifyError::UnknownKey(kid.clone()))?;

        let claims = decode::<Claims>(token, &key, &signature_validation(Algorithm::EdDSA))
            .map_err(|e| VerifyError::BadSignature(e.to_string()))?
            .claims;

        if claims.iss != self.settings.issuer {
            return Err(VerifyError::UntrustedIssuer(claims.iss));
        }
        if !claims.is_token_type(TokenType::Refresh) {
            return Err(VerifyError::WrongTokenType);
        }
        check_time_claims(claims.exp, claims.nbf, Some(claims.iat), now, self.settings.skew)?;

        let session_id = claims
            .sid
            .as_deref()
            .and_then(|sid| Uuid::parse_str(sid).ok())
            .ok_or_else(|| VerifyError::Malformed("missing sid".to_string()))?;

        Ok(PresentedRefresh {
            session_id,
            fingerprint: fingerprint(token),
        })
    }
}

/// `jti` of the refresh token that replaces `previous` in `session_id`
fn rotation_jti(previous: &str, session_id: Uuid) -> String {
    let digest = Sha256::new()
        .chain_update(previous.as_bytes())
        .chain_update(session_id.as_bytes())
        .finalize();
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::memory::MemorySessionStore;
    use crate::token::keys::SigningKeyMaterial;

    const ISSUER: &str = "https://auth.stellovault.local";

    struct Fixture {
        clock: ManualClock,
        manager: SessionManager,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let keys = Arc::new(KeyRing::new(
            SigningKeyMaterial::generate().unwrap(),
            Duration::days(1),
            shared.clone(),
        ));
        let settings = SessionSettings {
            issuer: ISSUER.to_string(),
            audiences: vec!["api".to_string()],
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            grace: Duration::seconds(30),
            skew: Duration::seconds(60),
        };
        let manager = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            keys,
            EventDispatcher::new(Arc::new(crate::events::NoopEventSink)),
            shared,
            settings,
        );
        Fixture { clock, manager }
    }

    async fn issue(fx: &Fixture) -> SessionTokens {
        fx.manager
            .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rotation_advances_tokens() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();

        assert_eq!(t1.session_id, t0.session_id);
        assert_ne!(t1.refresh_token, t0.refresh_token);

        let t2 = fx.manager.rotate(&t1.refresh_token).await.unwrap();
        assert_eq!(t2.session_id, t0.session_id);
    }

    #[tokio::test]
    async fn test_access_token_rejected_as_refresh() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        assert!(matches!(
            fx.manager.rotate(&t0.access_token).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_grace_retry_returns_current_token() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();

        fx.clock.advance(Duration::seconds(2));
        let retried = fx.manager.rotate(&t0.refresh_token).await.unwrap();
        assert_eq!(retried.session_id, t0.session_id);
        assert_eq!(retried.refresh_token, t1.refresh_token);

        // The retry did not advance the session
        let t2 = fx.manager.rotate(&t1.refresh_token).await.unwrap();
        assert_eq!(t2.session_id, t0.session_id);
        assert!(fx.manager.rotate(&t2.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_grace_window_honoured_once() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();

        fx.clock.advance(Duration::seconds(5));
        fx.manager.rotate(&t0.refresh_token).await.unwrap();

        assert!(matches!(
            fx.manager.rotate(&t0.refresh_token).await,
            Err(AuthError::ReuseDetected)
        ));
        assert!(matches!(
            fx.manager.rotate(&t1.refresh_token).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_grace_retry_after_key_rotation_is_stale() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();

        fx.manager
            .signer
            .key_ring()
            .rotate(SigningKeyMaterial::generate().unwrap());
        assert!(matches!(
            fx.manager.rotate(&t0.refresh_token).await,
            Err(AuthError::StaleRefreshToken)
        ));
        assert!(fx.manager.rotate(&t1.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_previous_outside_grace_is_reuse() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();

        fx.clock.advance(Duration::seconds(31));
        assert!(matches!(
            fx.manager.rotate(&t0.refresh_token).await,
            Err(AuthError::ReuseDetected)
        ));
        assert!(matches!(
            fx.manager.rotate(&t1.refresh_token).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let fx = fixture();
        let t0 = issue(&fx).await;

        fx.manager.revoke(t0.session_id).await.unwrap();
        fx.manager.revoke(t0.session_id).await.unwrap();
        fx.manager.revoke(Uuid::new_v4()).await.unwrap();

        assert!(matches!(
            fx.manager.rotate(&t0.refresh_token).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_and_list() {
        let fx = fixture();
        issue(&fx).await;
        issue(&fx).await;
        assert_eq!(fx.manager.list_sessions("user-1").await.unwrap().len(), 2);

        assert_eq!(fx.manager.revoke_all("user-1").await.unwrap(), 2);
        assert_eq!(fx.manager.revoke_all("user-1").await.unwrap(), 0);
        assert!(fx.manager.list_sessions("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_session() {
        let fx = fixture();
        let t0 = issue(&fx).await;

        fx.clock.advance(Duration::days(8));
        assert!(matches!(
            fx.manager.rotate(&t0.refresh_token).await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_issue_validates_input() {
        let fx = fixture();
        let result = fx
            .manager
            .issue("", "wallet", LoginMethod::Wallet, ClientMeta::default())
            .await;
        assert!(matches!(result, Err(AuthError::InvalidInput(_))));

        let long_agent = ClientMeta {
            user_agent: Some("a".repeat(600)),
            ..Default::default()
        };
        let result = fx
            .manager
            .issue("user-1", "wallet", LoginMethod::Wallet, long_agent)
            .await;
        assert!(matches!(result, Err(AuthError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let fx = fixture();
        let t0 = issue(&fx).await;
        fx.manager.revoke(t0.session_id).await.unwrap();

        fx.clock.advance(Duration::days(31));
        assert_eq!(fx.manager.purge_expired(Duration::days(30)).await.unwrap(), 1);
    }
}
