//! Session persistence seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{FingerprintSlots, RefreshSession};
use crate::error::AuthResult;

/// Storage for refresh sessions.
///
/// Among non-revoked sessions a fingerprint appears in at most one current
/// slot and at most one previous slot.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &RefreshSession) -> AuthResult<()>;

    async fn get(&self, id: Uuid) -> AuthResult<Option<RefreshSession>>;

    /// Non-revoked session holding `fingerprint` in either slot
    async fn find_by_fingerprint(&self, fingerprint: &str) -> AuthResult<Option<RefreshSession>>;

    /// Replace the slots only if the session is live and its current
    /// fingerprint is still `expected_current`. Returns whether it applied.
    async fn swap_fingerprints(
        &self,
        id: Uuid,
        expected_current: &str,
        next: &FingerprintSlots,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool>;

    /// Drop the previous slot, keeping `current`, only if the session is
    /// live and still holds exactly `current` and `previous`.
    async fn consume_previous(
        &self,
        id: Uuid,
        current: &str,
        previous: &str,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool>;

    /// Returns false when the session was unknown or already revoked
    async fn revoke(&self, id: Uuid, at: DateTime<Utc>) -> AuthResult<bool>;

    async fn revoke_family(&self, family_id: Uuid, at: DateTime<Utc>) -> AuthResult<u64>;

    async fn revoke_subject(&self, subject: &str, at: DateTime<Utc>) -> AuthResult<u64>;

    /// Non-revoked, unexpired sessions for `subject`, newest first
    async fn list_active(&self, subject: &str, now: DateTime<Utc>)
        -> AuthResult<Vec<RefreshSession>>;

    /// Delete sessions revoked or expired before `before`
    async fn purge(&self, before: DateTime<Utc>) -> AuthResult<u64>;
}
