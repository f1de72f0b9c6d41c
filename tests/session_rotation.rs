//! Refresh Session Rotation Tests
//!
//! Rotation chains, reuse detection, the grace window and concurrent
//! rotation of one token, driven through the public session API.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;
use uuid::Uuid;

use stello_auth::clock::{ManualClock, SharedClock};
use stello_auth::error::{AuthError, AuthResult};
use stello_auth::events::{AuthEvent, AuthEventSink, EventDispatcher, LoginMethod};
use stello_auth::session::{
    ClientMeta, FingerprintSlots, MemorySessionStore, RefreshSession, SessionManager,
    SessionSettings, SessionStore,
};
use stello_auth::token::{KeyRing, SigningKeyMaterial};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AuthEvent>>,
}

impl RecordingSink {
    fn reuse_events(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, AuthEvent::RefreshReuse { .. }))
            .count()
    }
}

#[async_trait]
impl AuthEventSink for RecordingSink {
    async fn record(&self, event: &AuthEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Holds the first two fingerprint lookups until both have read the store
struct RacingStore {
    inner: MemorySessionStore,
    barrier: Barrier,
    lookups: AtomicUsize,
}

#[async_trait]
impl SessionStore for RacingStore {
    async fn insert(&self, session: &RefreshSession) -> AuthResult<()> {
        self.inner.insert(session).await
    }

    async fn get(&self, id: Uuid) -> AuthResult<Option<RefreshSession>> {
        self.inner.get(id).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> AuthResult<Option<RefreshSession>> {
        let found = self.inner.find_by_fingerprint(fingerprint).await;
        if self.lookups.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait().await;
        }
        found
    }

    async fn swap_fingerprints(
        &self,
        id: Uuid,
        expected_current: &str,
        next: &FingerprintSlots,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        self.inner
            .swap_fingerprints(id, expected_current, next, used_at)
            .await
    }

    async fn consume_previous(
        &self,
        id: Uuid,
        current: &str,
        previous: &str,
        used_at: DateTime<Utc>,
    ) -> AuthResult<bool> {
        self.inner
            .consume_previous(id, current, previous, used_at)
            .await
    }

    async fn revoke(&self, id: Uuid, at: DateTime<Utc>) -> AuthResult<bool> {
        self.inner.revoke(id, at).await
    }

    async fn revoke_family(&self, family_id: Uuid, at: DateTime<Utc>) -> AuthResult<u64> {
        self.inner.revoke_family(family_id, at).await
    }

    async fn revoke_subject(&self, subject: &str, at: DateTime<Utc>) -> AuthResult<u64> {
        self.inner.revoke_subject(subject, at).await
    }

    async fn list_active(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Vec<RefreshSession>> {
        self.inner.list_active(subject, now).await
    }

    async fn purge(&self, before: DateTime<Utc>) -> AuthResult<u64> {
        self.inner.purge(before).await
    }
}

struct Fixture {
    clock: ManualClock,
    sink: Arc<RecordingSink>,
    manager: Arc<SessionManager>,
}

fn fixture_with(store: Arc<dyn SessionStore>) -> Fixture {
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let keys = Arc::new(KeyRing::new(
        SigningKeyMaterial::generate().unwrap(),
        Duration::days(1),
        shared.clone(),
    ));
    let sink = Arc::new(RecordingSink::default());
    let settings = SessionSettings {
        issuer: "https://auth.stellovault.local".to_string(),
        audiences: vec!["stellovault-api".to_string()],
        access_ttl: Duration::minutes(15),
        refresh_ttl: Duration::days(7),
        grace: Duration::seconds(30),
        skew: Duration::seconds(60),
    };
    let manager = Arc::new(SessionManager::new(
        store,
        keys,
        EventDispatcher::new(sink.clone()),
        shared,
        settings,
    ));
    Fixture {
        clock,
        sink,
        manager,
    }
}

fn fixture() -> Fixture {
    fixture_with(Arc::new(MemorySessionStore::new()))
}

async fn wait_for_reuse_event(sink: &RecordingSink) -> usize {
    for _ in 0..50 {
        if sink.reuse_events() > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    sink.reuse_events()
}

// ============================================================================
// Rotation Chain Tests
// ============================================================================

#[tokio::test]
async fn test_replaying_first_token_revokes_family() {
    let fx = fixture();
    let t0 = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();

    fx.clock.advance(Duration::minutes(5));
    let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();
    fx.clock.advance(Duration::minutes(5));
    let t2 = fx.manager.rotate(&t1.refresh_token).await.unwrap();

    fx.clock.advance(Duration::minutes(5));
    assert!(matches!(
        fx.manager.rotate(&t0.refresh_token).await,
        Err(AuthError::ReuseDetected)
    ));

    // The legitimate holder is locked out too
    assert!(matches!(
        fx.manager.rotate(&t2.refresh_token).await,
        Err(AuthError::Unauthenticated)
    ));
    assert!(fx.manager.list_sessions("user-1").await.unwrap().is_empty());
    assert_eq!(wait_for_reuse_event(&fx.sink).await, 1);
}

#[tokio::test]
async fn test_superseded_token_after_grace_is_reuse() {
    let fx = fixture();
    let t0 = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();
    let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();

    fx.clock.advance(Duration::seconds(31));
    assert!(matches!(
        fx.manager.rotate(&t0.refresh_token).await,
        Err(AuthError::ReuseDetected)
    ));
    assert!(fx.manager.rotate(&t1.refresh_token).await.is_err());
}

#[tokio::test]
async fn test_lost_response_retried_within_grace() {
    let fx = fixture();
    let t0 = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();
    let lost = fx.manager.rotate(&t0.refresh_token).await.unwrap();

    fx.clock.advance(Duration::seconds(5));
    let retried = fx.manager.rotate(&t0.refresh_token).await.unwrap();
    assert_eq!(retried.session_id, t0.session_id);
    assert_eq!(retried.refresh_token, lost.refresh_token);

    // The retried pair keeps working
    let next = fx.manager.rotate(&retried.refresh_token).await.unwrap();
    assert_eq!(next.session_id, t0.session_id);
    assert_eq!(fx.sink.reuse_events(), 0);
}

#[tokio::test]
async fn test_duplicate_request_keeps_winner_token_valid() {
    let fx = fixture();
    let t0 = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();

    // The client already holds t1 when a duplicate of the t0 request lands
    let t1 = fx.manager.rotate(&t0.refresh_token).await.unwrap();
    fx.clock.advance(Duration::seconds(2));
    assert!(fx.manager.rotate(&t0.refresh_token).await.is_ok());

    let t2 = fx.manager.rotate(&t1.refresh_token).await.unwrap();
    assert!(fx.manager.rotate(&t2.refresh_token).await.is_ok());
    assert_eq!(fx.manager.list_sessions("user-1").await.unwrap().len(), 1);
    assert_eq!(fx.sink.reuse_events(), 0);
}

#[tokio::test]
async fn test_sessions_are_independent_families() {
    let fx = fixture();
    let phone = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();
    let laptop = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();

    let _ = fx.manager.rotate(&phone.refresh_token).await.unwrap();
    fx.clock.advance(Duration::minutes(1));
    assert!(fx.manager.rotate(&phone.refresh_token).await.is_err());

    // Reuse on the phone leaves the laptop session alone
    assert!(fx.manager.rotate(&laptop.refresh_token).await.is_ok());
    assert_eq!(fx.manager.list_sessions("user-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_refresh_after_absolute_expiry() {
    let fx = fixture();
    let t0 = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();

    fx.clock.advance(Duration::days(8));
    assert!(matches!(
        fx.manager.rotate(&t0.refresh_token).await,
        Err(AuthError::Expired)
    ));
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_rotation_has_one_winner() {
    let store = Arc::new(RacingStore {
        inner: MemorySessionStore::new(),
        barrier: Barrier::new(2),
        lookups: AtomicUsize::new(0),
    });
    let fx = fixture_with(store);
    let t0 = fx
        .manager
        .issue("user-1", "wallet", LoginMethod::Wallet, ClientMeta::default())
        .await
        .unwrap();

    let first = {
        let manager = fx.manager.clone();
        let token = t0.refresh_token.clone();
        tokio::spawn(async move { manager.rotate(&token).await })
    };
    let second = {
        let manager = fx.manager.clone();
        let token = t0.refresh_token.clone();
        tokio::spawn(async move { manager.rotate(&token).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AuthError::StaleRefreshToken))));

    // Losing the race is not treated as theft
    let winner = winners[0].clone();
    assert!(fx.manager.rotate(&winner.refresh_token).await.is_ok());
    assert_eq!(fx.sink.reuse_events(), 0);
}
