//! Authentication audit events
//!
//! Recording is best-effort: the dispatcher hands events to the sink on a
//! spawned task and only logs failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// How the subject authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginMethod {
    Wallet,
    Oidc,
    Password,
    /// Credential checked by the caller before the session was issued
    External,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Wallet => "wallet",
            LoginMethod::Oidc => "oidc",
            LoginMethod::Password => "password",
            LoginMethod::External => "external",
        }
    }
}

/// Audit event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    Login {
        subject: String,
        issuer: String,
        method: LoginMethod,
        session_id: Uuid,
        ip_address: Option<String>,
        user_agent: Option<String>,
        at: DateTime<Utc>,
    },
    RefreshReuse {
        subject: String,
        family_id: Uuid,
        session_id: Uuid,
        revoked: u64,
        at: DateTime<Utc>,
    },
    SessionRevoked {
        subject: String,
        session_id: Option<Uuid>,
        revoked: u64,
        at: DateTime<Utc>,
    },
}

/// Destination for audit events
#[async_trait]
pub trait AuthEventSink: Send + Sync {
    async fn record(&self, event: &AuthEvent) -> anyhow::Result<()>;
}

/// Writes events to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl AuthEventSink for TracingEventSink {
    async fn record(&self, event: &AuthEvent) -> anyhow::Result<()> {
        match event {
            AuthEvent::Login {
                subject,
                issuer,
                method,
                session_id,
                ip_address,
                ..
            } => tracing::info!(
                subject = %subject,
                issuer = %issuer,
                method = method.as_str(),
                session_id = %session_id,
                ip = ?ip_address,
                "Login recorded"
            ),
            AuthEvent::RefreshReuse {
                subject,
                family_id,
                revoked,
                ..
            } => tracing::warn!(
                subject = %subject,
                family_id = %family_id,
                revoked,
                "Refresh token reuse recorded"
            ),
            AuthEvent::SessionRevoked {
                subject, revoked, ..
            } => tracing::info!(subject = %subject, revoked, "Session revocation recorded"),
        }
        Ok(())
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl AuthEventSink for NoopEventSink {
    async fn record(&self, _event: &AuthEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fire-and-forget front of a sink
#[derive(Clone)]
pub struct EventDispatcher {
    sink: Arc<dyn AuthEventSink>,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn AuthEventSink>) -> Self {
        Self { sink }
    }

    /// Record `event` in the background; never fails the caller
    pub fn emit(&self, event: AuthEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.record(&event).await {
                tracing::warn!(error = %e, "Failed to record auth event");
            }
        });
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(TracingEventSink))
    }
}
