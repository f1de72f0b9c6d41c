//! In-process session store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{FingerprintSlots, RefreshSession};
use super::store::SessionStore;
use crate::error::{AuthError, AuthResult};

/// Sessions behind a single async lock; every method is atomic
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, RefreshSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn holds(session: &RefreshSession, fingerprint: &str) -> bool {
    session.slots.current() == fingerprint || session.slots.previous() == Some(fingerprint)
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &RefreshSession) -> AuthResult<()> {
        let mut sessions = self.sessions.lock().await;

        if sessions.contains_key(&session.id) {
            return Err(AuthError::Internal(format!(
                "session {} already exists",
                session.id
            )));
        }
        let clash = sessions
            .values()
            .filter(|s| !s.is_revoked())
            .any(|s| holds(s, session.slots.current()));
        if clash {
            return Err(AuthError::Internal("fingerprint already in use".to_string()));
        }

        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> AuthResult<Option<RefreshSession>> {
        Ok(self.sessions.lock().await.get(&id).cloned())
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> AuthResult<Option<RefreshSession>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .find(|s| !s.is_revoked() && holds(s, fingerprint))
            .cloned())
    }

    async fn swap_fingerprints(
        &self,
        id: Uuid,
        expected_current: &str,
        next: &FingerprintSlots,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(session)
                if !session.is_revoked() && session.slots.current() == expected_current =>
            {
                session.slots = next.clone();
                session.last_used_at = used_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_previous(
        &self,
        id: Uuid,
        current: &str,
        previous: &str,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(session)
                if !session.is_revoked()
                    && session.slots.current() == current
                    && session.slots.previous() == Some(previous) =>
            {
                session.slots = FingerprintSlots::Active {
                    current: current.to_string(),
                };
                session.last_used_at = used_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke(&self, id: Uuid, at: DateTime<Utc>) -> AuthResult<bool> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(session) if !session.is_revoked() => {
                session.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_family(&self, family_id: Uuid, at: DateTime<Utc>) -> AuthResult<u64> {
        let mut sessions = self.sessions.lock().await;
        let mut revoked = 0;
        for session in sessions
            .values_mut()
            .filter(|s| s.family_id == family_id && !s.is_revoked())
        {
            session.revoked_at = Some(at);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn revoke_subject(&self, subject: &str, at: DateTime<Utc>) -> AuthResult<u64> {
        let mut sessions = self.sessions.lock().await;
        let mut revoked = 0;
        for session in sessions
            .values_mut()
            .filter(|s| s.subject == subject && !s.is_revoked())
        {
            session.revoked_at = Some(at);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn list_active(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<RefreshSession>> {
        let sessions = self.sessions.lock().await;
        let mut active: Vec<RefreshSession> = sessions
            .values()
            .filter(|s| s.subject == subject && s.is_live(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn purge(&self, before: DateTime<Utc>) -> AuthResult<u64> {
        let mut sessions = self.sessions.lock().await;
        let initial = sessions.len();
        sessions.retain(|_, s| {
            let revoked_long_ago = s.revoked_at.map(|at| at < before).unwrap_or(false);
            let expired_long_ago = s.expires_at.map(|at| at < before).unwrap_or(false);
            !(revoked_long_ago || expired_long_ago)
        });
        Ok((initial - sessions.len()) as u64)
    }
}
