//! PostgreSQL session store
//!
//! Schema: `migrations/0001_refresh_sessions.sql`. The partial unique
//! indexes on both fingerprint columns enforce slot uniqueness among
//! non-revoked rows; rotation is a single conditional `UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

use super::model::{ClientMeta, FingerprintSlots, RefreshSession};
use super::store::SessionStore;
use crate::error::AuthResult;

const SESSION_COLUMNS: &str = "id, family_id, subject, issuer, current_fingerprint, \
     previous_fingerprint, rotated_at, created_at, last_used_at, expires_at, revoked_at, \
     user_agent, ip_address, device_info";

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    family_id: Uuid,
    subject: String,
    issuer: String,
    current_fingerprint: String,
    previous_fingerprint: Option<String>,
    rotated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    user_agent: Option<String>,
    ip_address: Option<String>,
    device_info: Option<String>,
}

impl From<SessionRow> for RefreshSession {
    fn from(row: SessionRow) -> Self {
        RefreshSession {
            id: row.id,
            family_id: row.family_id,
            subject: row.subject,
            issuer: row.issuer,
            slots: FingerprintSlots::from_columns(
                row.current_fingerprint,
                row.previous_fingerprint,
                row.rotated_at,
            ),
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            client: ClientMeta {
                user_agent: row.user_agent,
                ip_address: row.ip_address,
                device_info: row.device_info,
            },
        }
    }
}

/// Sessions in the `refresh_sessions` table
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> AuthResult<Self> {
        tracing::info!("Connecting session store");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &RefreshSession) -> AuthResult<()> {
        let (current, previous, rotated_at) = session.slots.to_columns();

        sqlx::query(
            r#"
            INSERT INTO refresh_sessions (
                id, family_id, subject, issuer, current_fingerprint, previous_fingerprint,
                rotated_at, created_at, last_used_at, expires_at, revoked_at,
                user_agent, ip_address, device_info
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(session.id)
        .bind(session.family_id)
        .bind(&session.subject)
        .bind(&session.issuer)
        .bind(current)
        .bind(previous)
        .bind(rotated_at)
        .bind(session.created_at)
        .bind(session.last_used_at)
        .bind(session.expires_at)
        .bind(session.revoked_at)
        .bind(&session.client.user_agent)
        .bind(&session.client.ip_address)
        .bind(&session.client.device_info)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> AuthResult<Option<RefreshSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refresh_sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RefreshSession::from))
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> AuthResult<Option<RefreshSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM refresh_sessions
            WHERE revoked_at IS NULL
              AND (current_fingerprint = $1 OR previous_fingerprint = $1)
            LIMIT 1
            "#,
            SESSION_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RefreshSession::from))
    }

    async fn swap_fingerprints(
        &self,
        id: Uuid,
        expected_current: &str,
        next: &FingerprintSlots,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let (current, previous, rotated_at) = next.to_columns();

        let rows_affected = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET current_fingerprint = $3,
                previous_fingerprint = $4,
                rotated_at = $5,
                last_used_at = $6
            WHERE id = $1 AND current_fingerprint = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(id)
        .bind(expected_current)
        .bind(current)
        .bind(previous)
        .bind(rotated_at)
        .bind(used_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn consume_previous(
        &self,
        id: Uuid,
        current: &str,
        previous: &str,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET previous_fingerprint = NULL,
                rotated_at = NULL,
                last_used_at = $4
            WHERE id = $1
              AND current_fingerprint = $2
              AND previous_fingerprint = $3
              AND revoked_at IS NULL
            "#,
        )
        .bind(id)
        .bind(current)
        .bind(previous)
        .bind(used_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn revoke(&self, id: Uuid, at: DateTime<Utc>) -> AuthResult<bool> {
        let rows_affected = sqlx::query(
            "UPDATE refresh_sessions SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn revoke_family(&self, family_id: Uuid, at: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_sessions SET revoked_at = $2 WHERE family_id = $1 AND revoked_at IS NULL",
        )
        .bind(family_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_subject(&self, subject: &str, at: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_sessions SET revoked_at = $2 WHERE subject = $1 AND revoked_at IS NULL",
        )
        .bind(subject)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_active(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<RefreshSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM refresh_sessions
            WHERE subject = $1
              AND revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY created_at DESC
            "#,
            SESSION_COLUMNS
        ))
        .bind(subject)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RefreshSession::from).collect())
    }

    async fn purge(&self, before: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query(
            "DELETE FROM refresh_sessions WHERE revoked_at < $1 OR expires_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
