//! Authentication service
//!
//! One entry point over every component. Credential operations are
//! admitted by the rate limiter before any work is done.

use axum::Router;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{MemoryCache, TtlCache};
use crate::clock::{system_clock, SharedClock};
use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::events::{AuthEventSink, EventDispatcher, LoginMethod, TracingEventSink};
use crate::oidc::{AuthorizationRequest, OidcIdentity, ProviderRegistry, RelyingParty};
use crate::password::{validate_password_policy, PasswordHasher};
use crate::ratelimit::{buckets, LimitTable, MemoryRateLimiter, RateLimiter};
use crate::session::{
    ClientMeta, MemorySessionStore, RefreshSession, SessionManager, SessionSettings,
    SessionStore, SessionTokens,
};
use crate::tasks::PeriodicTask;
use crate::token::{
    key_set_router, BearerVerifier, Claims, IssuerTrust, KeyRing, KeySetCache,
    SigningKeyMaterial,
};
use crate::wallet::{SignInInput, WalletChallenge, WalletIdentity, WalletVerifier};

/// Rate-limit key used when the caller has no address
const ANONYMOUS_PRINCIPAL: &str = "anonymous";

/// Idle limiter buckets are collected this often
const LIMITER_GC_INTERVAL_SECONDS: u64 = 300;

fn client_principal(client: &ClientMeta) -> &str {
    client
        .ip_address
        .as_deref()
        .filter(|ip| !ip.is_empty())
        .unwrap_or(ANONYMOUS_PRINCIPAL)
}

/// Authentication toolkit entry point
pub struct AuthService {
    config: Arc<AuthConfig>,
    clock: SharedClock,
    keys: Arc<KeyRing>,
    verifier: Arc<BearerVerifier>,
    sessions: Arc<SessionManager>,
    wallet: WalletVerifier,
    oidc: Arc<RelyingParty>,
    passwords: Arc<PasswordHasher>,
    limiter: Arc<dyn RateLimiter>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl AuthService {
    pub fn builder(config: AuthConfig) -> AuthServiceBuilder {
        AuthServiceBuilder::new(config)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Router serving the public key set
    pub fn key_set_router(&self) -> Router {
        key_set_router(self.keys.clone())
    }

    /// Make `next` the signing key; the previous key keeps verifying
    pub fn rotate_signing_key(&self, next: SigningKeyMaterial) {
        self.keys.rotate(next);
    }

    /// Admit or deny one event
    pub async fn allow(&self, bucket: &str, key: &str) -> AuthResult<bool> {
        self.limiter.allow(bucket, key).await
    }

    async fn admit(&self, bucket: &str, key: &str) -> AuthResult<()> {
        if self.limiter.allow(bucket, key).await? {
            Ok(())
        } else {
            debug!(bucket = %bucket, "Rate limited");
            Err(AuthError::RateLimited)
        }
    }

    // ---- tokens ----

    pub async fn verify_bearer_token(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> AuthResult<Claims> {
        self.verifier.verify(token, expected_audience).await
    }

    // ---- sessions ----

    /// Start a session for a subject the caller has already authenticated
    pub async fn issue_session(
        &self,
        subject: &str,
        issuer: &str,
        client: ClientMeta,
    ) -> AuthResult<SessionTokens> {
        self.sessions
            .issue(subject, issuer, LoginMethod::External, client)
            .await
    }

    pub async fn rotate_session(
        &self,
        refresh_token: &str,
        client: &ClientMeta,
    ) -> AuthResult<SessionTokens> {
        self.admit(buckets::TOKEN_REFRESH, client_principal(client))
            .await?;
        self.sessions.rotate(refresh_token).await
    }

    pub async fn revoke_session(&self, session_id: Uuid) -> AuthResult<()> {
        self.sessions.revoke(session_id).await
    }

    pub async fn revoke_all_sessions(&self, subject: &str) -> AuthResult<u64> {
        self.sessions.revoke_all(subject).await
    }

    pub async fn list_sessions(&self, subject: &str) -> AuthResult<Vec<RefreshSession>> {
        self.sessions.list_sessions(subject).await
    }

    /// Delete sessions that ended more than `retention` ago
    pub async fn purge_sessions(&self, retention: Duration) -> AuthResult<u64> {
        debug!(now = %self.clock.now(), "Purging ended sessions");
        self.sessions.purge_expired(retention).await
    }

    // ---- wallet ----

    pub async fn begin_wallet_challenge(
        &self,
        domain: &str,
        address: &str,
    ) -> AuthResult<WalletChallenge> {
        self.admit(buckets::WALLET_CHALLENGE, address).await?;
        self.wallet.begin_challenge(domain, address).await
    }

    pub async fn verify_wallet_sign_in(
        &self,
        message: &str,
        signature: &str,
    ) -> AuthResult<WalletIdentity> {
        let address = SignInInput::parse(message)?.address;
        self.admit(buckets::WALLET_VERIFY, &address).await?;
        self.wallet.verify_sign_in(message, signature).await
    }

    /// Verify a wallet sign-in and start a session for the address
    pub async fn sign_in_with_wallet(
        &self,
        message: &str,
        signature: &str,
        client: ClientMeta,
    ) -> AuthResult<(WalletIdentity, SessionTokens)> {
        let identity = self.verify_wallet_sign_in(message, signature).await?;
        let issuer = format!(
            "stellar:{}",
            identity.chain_id.as_deref().unwrap_or("mainnet")
        );
        let tokens = self
            .sessions
            .issue(&identity.address, &issuer, LoginMethod::Wallet, client)
            .await?;
        Ok((identity, tokens))
    }

    // ---- oidc ----

    pub async fn begin_oidc_flow(
        &self,
        provider: &str,
        client: &ClientMeta,
    ) -> AuthResult<AuthorizationRequest> {
        self.admit(buckets::OIDC_BEGIN, client_principal(client))
            .await?;
        self.oidc.begin_flow(provider).await
    }

    pub async fn complete_oidc_flow(
        &self,
        provider: &str,
        code: &str,
        state: &str,
        client: &ClientMeta,
    ) -> AuthResult<OidcIdentity> {
        self.admit(buckets::OIDC_COMPLETE, client_principal(client))
            .await?;
        self.oidc.complete_flow(provider, code, state).await
    }

    /// Complete an OIDC flow and start a session for the provider subject
    pub async fn sign_in_with_oidc(
        &self,
        provider: &str,
        code: &str,
        state: &str,
        client: ClientMeta,
    ) -> AuthResult<(OidcIdentity, SessionTokens)> {
        let identity = self
            .complete_oidc_flow(provider, code, state, &client)
            .await?;
        let tokens = self
            .sessions
            .issue(&identity.subject, &identity.issuer, LoginMethod::Oidc, client)
            .await?;
        Ok((identity, tokens))
    }

    // ---- passwords ----

    pub async fn hash_password(&self, plaintext: &str) -> AuthResult<String> {
        validate_password_policy(plaintext)?;
        let hasher = self.passwords.clone();
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.hash_password(&plaintext))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {}", e)))?
    }

    /// Check `plaintext` for `subject` against its stored digest
    pub async fn verify_password(
        &self,
        subject: &str,
        encoded: &str,
        plaintext: &str,
    ) -> AuthResult<bool> {
        self.admit(buckets::PASSWORD_VERIFY, subject).await?;
        let hasher = self.passwords.clone();
        let encoded = encoded.to_string();
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.verify_password(&encoded, &plaintext))
            .await
            .map_err(|e| AuthError::Internal(format!("verification task failed: {}", e)))?
    }

    /// Verify a password and start a session for `subject`
    pub async fn sign_in_with_password(
        &self,
        subject: &str,
        encoded: &str,
        plaintext: &str,
        client: ClientMeta,
    ) -> AuthResult<SessionTokens> {
        if !self.verify_password(subject, encoded, plaintext).await? {
            return Err(AuthError::Unauthenticated);
        }
        self.sessions
            .issue(subject, &self.config.issuer, LoginMethod::Password, client)
            .await
    }

    // ---- lifecycle ----

    /// Stop every background task
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<PeriodicTask> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let name = task.name();
            task.stop().await;
            debug!(task = name, "Background task stopped");
        }
        info!("Auth service stopped");
    }
}

/// Wires an [`AuthService`] from configuration and optional backends.
///
/// Unset backends default to the in-process implementations. `build` must
/// run inside a Tokio runtime when background tasks are enabled.
pub struct AuthServiceBuilder {
    config: AuthConfig,
    clock: Option<SharedClock>,
    signing_key_pem: Option<String>,
    cache: Option<Arc<dyn TtlCache>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    session_store: Option<Arc<dyn SessionStore>>,
    event_sink: Option<Arc<dyn AuthEventSink>>,
    providers: ProviderRegistry,
    trusted_issuers: Vec<IssuerTrust>,
    http: Option<reqwest::Client>,
    background_tasks: bool,
}

impl AuthServiceBuilder {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            clock: None,
            signing_key_pem: None,
            cache: None,
            limiter: None,
            session_store: None,
            event_sink: None,
            providers: ProviderRegistry::new(),
            trusted_issuers: Vec::new(),
            http: None,
            background_tasks: true,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// PKCS#8 PEM Ed25519 signing key
    pub fn signing_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.signing_key_pem = Some(pem.into());
        self
    }

    pub fn cache(mut self, cache: Arc<dyn TtlCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn AuthEventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn trust_issuer(mut self, trust: IssuerTrust) -> Self {
        self.trusted_issuers.push(trust);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Skip the sweeper and refresher tasks
    pub fn without_background_tasks(mut self) -> Self {
        self.background_tasks = false;
        self
    }

    pub fn build(self) -> AuthResult<AuthService> {
        self.config
            .validate_all()
            .map_err(|e| AuthError::InvalidInput(e.to_string()))?;

        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(system_clock);
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(config.http_timeout())
                .build()
                .map_err(|e| AuthError::Internal(format!("http client: {}", e)))?,
        };

        let keys = Arc::new(KeyRing::bootstrap(
            config.environment,
            self.signing_key_pem.as_deref(),
            config.key_retention(),
            clock.clone(),
        )?);

        let key_sets = Arc::new(KeySetCache::new(
            http.clone(),
            config.key_set_cache_ttl(),
            config.key_set_max_stale(),
            config.http_timeout(),
            clock.clone(),
        ));
        let mut verifier = BearerVerifier::new(
            key_sets.clone(),
            config.clock_skew(),
            config.key_set_max_stale(),
            config.http_timeout(),
            clock.clone(),
        )
        .with_local_issuer(config.issuer.clone(), keys.clone());
        for trust in self.trusted_issuers {
            verifier = verifier.trust(trust);
        }
        let refresh_urls = verifier.key_set_urls();

        let cache: Arc<dyn TtlCache> = match self.cache {
            Some(cache) => cache,
            None => {
                let memory = Arc::new(MemoryCache::new(clock.clone()));
                if self.background_tasks {
                    tasks.push(memory.start_sweeper(config.cache_sweep_interval(), &shutdown));
                }
                memory
            }
        };

        let limiter: Arc<dyn RateLimiter> = match self.limiter {
            Some(limiter) => limiter,
            None => {
                let memory = Arc::new(MemoryRateLimiter::new(
                    LimitTable::new(config.rate_limits.clone()),
                    clock.clone(),
                ));
                if self.background_tasks {
                    let gc = memory.clone();
                    tasks.push(PeriodicTask::spawn(
                        "rate-limit-gc",
                        std::time::Duration::from_secs(LIMITER_GC_INTERVAL_SECONDS),
                        &shutdown,
                        move || {
                            let gc = gc.clone();
                            async move {
                                gc.purge_idle();
                            }
                        },
                    ));
                }
                memory
            }
        };

        if self.background_tasks && !refresh_urls.is_empty() {
            let interval = config
                .key_set_cache_ttl()
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(300));
            tasks.push(key_sets.start_refresher(refresh_urls, interval, &shutdown));
        }

        let store = self
            .session_store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        let events = EventDispatcher::new(
            self.event_sink
                .unwrap_or_else(|| Arc::new(TracingEventSink)),
        );
        let sessions = Arc::new(SessionManager::new(
            store,
            keys.clone(),
            events,
            clock.clone(),
            SessionSettings::from_config(&config),
        ));

        let wallet = WalletVerifier::new(
            cache.clone(),
            clock.clone(),
            config.wallet_nonce_ttl(),
            config.clock_skew(),
        );

        let oidc = Arc::new(RelyingParty::new(
            Arc::new(self.providers),
            http,
            key_sets,
            cache,
            config.oidc_state_ttl(),
            config.key_set_cache_ttl(),
            config.clock_skew(),
            config.http_timeout(),
            clock.clone(),
        ));

        info!(
            issuer = %config.issuer,
            environment = config.environment.as_str(),
            background_tasks = tasks.len(),
            "Auth service ready"
        );

        Ok(AuthService {
            config,
            clock,
            keys,
            verifier: Arc::new(verifier),
            sessions,
            wallet,
            oidc,
            passwords: Arc::new(PasswordHasher::new()?),
            limiter,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}
