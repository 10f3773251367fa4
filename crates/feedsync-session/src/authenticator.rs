use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use feedsync_core::{
    auth::{AuthContext, ProbeOutcome, SessionProbe},
    bundle::CredentialBundle,
    cancel::Cancellation,
    clock::{Clock, SystemClock},
    secret::SecretString,
    vault::{CredentialVault, StoreReport, WeakProtectionWarning},
};
use tracing::{debug, info, instrument, warn};

use crate::error::AuthError;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::Authenticating => "authenticating",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Expired => "expired",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a successful authentication is trusted without re-deriving.
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
        }
    }
}

/// Point-in-time view of the session, safe to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub authenticated: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub time_remaining: Duration,
    pub has_cookies: bool,
    pub has_headers: bool,
    pub captured_at: Option<DateTime<Utc>>,
    pub weak_protection: Option<WeakProtectionWarning>,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    context: Option<AuthContext>,
    captured_at: Option<DateTime<Utc>>,
    generation: u64,
    warning: Option<WeakProtectionWarning>,
}

impl SessionState {
    /// Lazily move an elapsed session to `Expired`.
    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.phase != SessionPhase::Authenticated {
            return;
        }
        let elapsed = self.context.as_ref().is_none_or(|ctx| now >= ctx.valid_until());
        if elapsed {
            debug!(generation = self.generation, "session validity window elapsed");
            self.expire();
        }
    }

    fn expire(&mut self) {
        self.phase = SessionPhase::Expired;
        self.context = None;
    }
}

/// Turns the stored credential bundle into request headers and cookies and
/// tracks how long they may be used.
///
/// All methods take `&self` and are safe to call from concurrent tasks;
/// authentications are serialized so a context is never built from a state
/// a concurrent re-authentication already replaced.
pub struct SessionAuthenticator<V, C = SystemClock> {
    vault: V,
    clock: C,
    config: SessionConfig,
    state: Mutex<SessionState>,
    auth_gate: tokio::sync::Mutex<()>,
}

impl<V: CredentialVault> SessionAuthenticator<V, SystemClock> {
    pub fn new(vault: V, config: SessionConfig) -> Self {
        Self::with_clock(vault, config, SystemClock)
    }
}

impl<V: CredentialVault, C: Clock> SessionAuthenticator<V, C> {
    pub fn with_clock(vault: V, config: SessionConfig, clock: C) -> Self {
        Self {
            vault,
            clock,
            config,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Unauthenticated,
                context: None,
                captured_at: None,
                generation: 0,
                warning: None,
            }),
            auth_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn vault(&self) -> &V {
        &self.vault
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // State is only mutated by non-panicking assignments.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encrypt a freshly captured bundle into the vault. The session itself
    /// is not opened; call [`authenticate`](Self::authenticate) afterwards.
    #[instrument(skip_all)]
    pub async fn store_credentials(
        &self,
        bundle: CredentialBundle,
        password: &SecretString,
    ) -> Result<StoreReport, AuthError> {
        let _gate = self.auth_gate.lock().await;
        let report = self.vault.store(bundle, password).await?;
        let mut state = self.state();
        state.warning = report.warning.clone();
        if let Some(warning) = &report.warning {
            warn!(%warning, "credentials stored with weak protection");
        }
        Ok(report)
    }

    /// Decrypt the stored bundle and open a session valid for the configured TTL.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, password: &SecretString) -> Result<(), AuthError> {
        let _gate = self.auth_gate.lock().await;
        let started = {
            let mut state = self.state();
            state.phase = SessionPhase::Authenticating;
            state.context = None;
            state.generation
        };

        let result = self.vault.load(password).await;
        let mut state = self.state();
        if state.generation != started {
            // A logout landed while the vault was loading.
            info!("authentication superseded by logout");
            return Err(AuthError::Cancelled);
        }
        match result {
            Ok(loaded) => {
                let now = self.clock.now();
                let valid_until = now
                    .checked_add_signed(self.config.ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let generation = state.generation + 1;
                state.generation = generation;
                state.context = Some(AuthContext::from_bundle(
                    &loaded.bundle,
                    valid_until,
                    generation,
                ));
                state.captured_at = Some(loaded.bundle.captured_at);
                state.warning = loaded.warning.clone();
                state.phase = SessionPhase::Authenticated;
                if let Some(warning) = &state.warning {
                    warn!(%warning, "session opened from weakly protected credentials");
                }
                info!(generation = state.generation, %valid_until, "session authenticated");
                Ok(())
            }
            Err(err) => {
                let err = AuthError::from(err);
                state.phase = SessionPhase::Unauthenticated;
                state.context = None;
                warn!(error = %err, "authentication failed");
                Err(err)
            }
        }
    }

    /// `true` while the validity window is open; flips the session to
    /// `Expired` once it has elapsed.
    pub fn is_valid(&self) -> bool {
        let mut state = self.state();
        state.refresh(self.clock.now());
        state.phase == SessionPhase::Authenticated
    }

    /// Headers and cookies of the current session.
    pub fn auth_context(&self) -> Result<AuthContext, AuthError> {
        let mut state = self.state();
        state.refresh(self.clock.now());
        match (&state.phase, &state.context) {
            (SessionPhase::Authenticated, Some(ctx)) => Ok(ctx.clone()),
            (phase, _) => Err(AuthError::NotAuthenticated { phase: *phase }),
        }
    }

    /// The remote service rejected the session of `generation`. Returns
    /// whether the session moved to `Expired`; rejections of a superseded
    /// generation are ignored.
    pub fn mark_expired(&self, generation: u64) -> bool {
        let mut state = self.state();
        if state.phase == SessionPhase::Authenticated && state.generation == generation {
            warn!(generation, "remote service rejected session; marking expired");
            state.expire();
            true
        } else {
            false
        }
    }

    /// Ask the remote service whether it still accepts the session. A
    /// rejection expires the session even inside its validity window.
    #[instrument(skip_all)]
    pub async fn verify(
        &self,
        probe: &dyn SessionProbe,
        cancel: &Cancellation,
    ) -> Result<bool, AuthError> {
        let context = self.auth_context()?;
        match probe.probe(&context, cancel).await {
            ProbeOutcome::Accepted => {
                debug!("session probe accepted");
                Ok(true)
            }
            ProbeOutcome::Rejected { category, status } => {
                warn!(%category, ?status, "session probe rejected");
                self.mark_expired(context.generation());
                Ok(false)
            }
            ProbeOutcome::Unreachable { category } => {
                Err(AuthError::ProbeUnreachable { category })
            }
            ProbeOutcome::Cancelled => Err(AuthError::Cancelled),
        }
    }

    /// Drop the in-memory session. Stored credentials are kept. An
    /// authentication still loading when this runs is discarded.
    pub fn logout(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.phase = SessionPhase::Unauthenticated;
        state.context = None;
        state.captured_at = None;
        info!("session closed");
    }

    /// Drop the session and destroy the stored credentials.
    #[instrument(skip_all)]
    pub async fn clear_credentials(&self) -> Result<(), AuthError> {
        let _gate = self.auth_gate.lock().await;
        self.logout();
        self.vault.clear().await?;
        self.state().warning = None;
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        let now = self.clock.now();
        let mut state = self.state();
        state.refresh(now);
        let ctx = state.context.as_ref();
        let valid_until = ctx.map(|c| c.valid_until());
        SessionStatus {
            phase: state.phase,
            authenticated: state.phase == SessionPhase::Authenticated,
            valid_until,
            time_remaining: valid_until
                .map(|until| (until - now).max(Duration::zero()))
                .unwrap_or_else(Duration::zero),
            has_cookies: ctx.is_some_and(|c| !c.cookies().is_empty()),
            has_headers: ctx.is_some_and(|c| !c.headers().is_empty()),
            captured_at: state.captured_at,
            weak_protection: state.warning.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use feedsync_core::{
        clock::ManualClock,
        error::ErrorCategory,
        vault::{InMemoryVault, LoadedBundle, Protection, VaultError},
    };

    use super::*;

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    async fn stored_vault() -> InMemoryVault {
        let vault = InMemoryVault::new();
        vault
            .store(CredentialBundle::new([("token", "abc")]), &pw("correct"))
            .await
            .expect("store");
        vault
    }

    fn authenticator(
        vault: InMemoryVault,
        ttl: Duration,
    ) -> (SessionAuthenticator<InMemoryVault, ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        let auth = SessionAuthenticator::with_clock(vault, SessionConfig { ttl }, clock.clone());
        (auth, clock)
    }

    struct FixedProbe {
        outcome: ProbeOutcome,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionProbe for FixedProbe {
        async fn probe(&self, _context: &AuthContext, _cancel: &Cancellation) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    #[tokio::test]
    async fn context_requires_authentication() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(24));
        let err = auth.auth_context().expect_err("not yet authenticated");
        assert_eq!(
            err,
            AuthError::NotAuthenticated {
                phase: SessionPhase::Unauthenticated
            }
        );

        auth.authenticate(&pw("correct")).await.expect("authenticate");
        let ctx = auth.auth_context().expect("context");
        assert_eq!(ctx.cookie_header().expose(), "token=abc");
        assert_eq!(auth.status().phase, SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn wrong_password_returns_to_unauthenticated() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(24));
        let err = auth.authenticate(&pw("wrong")).await.expect_err("wrong password");
        assert_eq!(err, AuthError::DecryptionFailed);
        assert_eq!(auth.status().phase, SessionPhase::Unauthenticated);
        assert!(!err.to_string().contains("wrong"));
    }

    #[tokio::test]
    async fn missing_credentials_surface_with_hint() {
        let (auth, _) = authenticator(InMemoryVault::new(), Duration::hours(24));
        let err = auth.authenticate(&pw("pw")).await.expect_err("empty vault");
        assert_eq!(err, AuthError::NoCredentialsStored);
        assert!(err.remediation().contains("import"));
    }

    #[tokio::test]
    async fn expiry_is_detected_lazily() {
        let (auth, clock) = authenticator(stored_vault().await, Duration::seconds(1));
        auth.authenticate(&pw("correct")).await.expect("authenticate");

        clock.advance(Duration::milliseconds(500));
        assert!(auth.is_valid());
        assert!(auth.auth_context().is_ok());

        clock.advance(Duration::milliseconds(1000));
        assert!(!auth.is_valid());
        assert_eq!(auth.status().phase, SessionPhase::Expired);
        assert_eq!(
            auth.auth_context().expect_err("expired"),
            AuthError::NotAuthenticated {
                phase: SessionPhase::Expired
            }
        );
    }

    #[tokio::test]
    async fn expired_session_reauthenticates_from_stored_bundle() {
        let (auth, clock) = authenticator(stored_vault().await, Duration::seconds(1));
        auth.authenticate(&pw("correct")).await.expect("authenticate");
        let first = auth.auth_context().expect("context").generation();

        clock.advance(Duration::seconds(2));
        assert!(!auth.is_valid());

        auth.authenticate(&pw("correct")).await.expect("re-authenticate");
        let second = auth.auth_context().expect("context");
        assert!(second.generation() > first);
        assert_eq!(second.valid_until(), clock.now() + Duration::seconds(1));
    }

    #[tokio::test]
    async fn stale_rejection_does_not_expire_new_session() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(1));
        auth.authenticate(&pw("correct")).await.expect("authenticate");
        let old = auth.auth_context().expect("context").generation();
        auth.authenticate(&pw("correct")).await.expect("re-authenticate");

        assert!(!auth.mark_expired(old));
        assert!(auth.is_valid());

        let current = auth.auth_context().expect("context").generation();
        assert!(auth.mark_expired(current));
        assert!(!auth.is_valid());
    }

    #[tokio::test]
    async fn rejected_probe_expires_session_inside_window() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(24));
        auth.authenticate(&pw("correct")).await.expect("authenticate");

        let probe = FixedProbe {
            outcome: ProbeOutcome::Rejected {
                category: ErrorCategory::AuthExpired,
                status: Some(401),
            },
            calls: AtomicUsize::new(0),
        };
        let accepted = auth
            .verify(&probe, &Cancellation::none())
            .await
            .expect("verify");
        assert!(!accepted);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.status().phase, SessionPhase::Expired);
    }

    #[tokio::test]
    async fn accepted_probe_keeps_session_and_unreachable_is_an_error() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(24));
        auth.authenticate(&pw("correct")).await.expect("authenticate");

        let ok = FixedProbe {
            outcome: ProbeOutcome::Accepted,
            calls: AtomicUsize::new(0),
        };
        assert!(auth.verify(&ok, &Cancellation::none()).await.expect("verify"));

        let offline = FixedProbe {
            outcome: ProbeOutcome::Unreachable {
                category: ErrorCategory::Transient,
            },
            calls: AtomicUsize::new(0),
        };
        let err = auth
            .verify(&offline, &Cancellation::none())
            .await
            .expect_err("unreachable");
        assert_eq!(
            err,
            AuthError::ProbeUnreachable {
                category: ErrorCategory::Transient
            }
        );
        assert!(auth.is_valid());
    }

    #[tokio::test]
    async fn verify_without_session_does_not_probe() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(24));
        let probe = FixedProbe {
            outcome: ProbeOutcome::Accepted,
            calls: AtomicUsize::new(0),
        };
        assert!(auth.verify(&probe, &Cancellation::none()).await.is_err());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logout_and_clear() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(24));
        auth.authenticate(&pw("correct")).await.expect("authenticate");
        auth.logout();
        assert!(!auth.is_valid());
        assert_eq!(auth.status().phase, SessionPhase::Unauthenticated);

        auth.authenticate(&pw("correct")).await.expect("stored bundle survives logout");
        auth.clear_credentials().await.expect("clear");
        assert!(!auth.is_valid());
        assert_eq!(
            auth.authenticate(&pw("correct")).await,
            Err(AuthError::NoCredentialsStored)
        );
    }

    #[tokio::test]
    async fn status_reports_window_and_material() {
        let (auth, clock) = authenticator(stored_vault().await, Duration::seconds(60));
        let before = auth.status();
        assert!(!before.authenticated);
        assert_eq!(before.time_remaining, Duration::zero());

        auth.authenticate(&pw("correct")).await.expect("authenticate");
        clock.advance(Duration::seconds(20));
        let status = auth.status();
        assert!(status.authenticated);
        assert!(status.has_cookies);
        assert!(!status.has_headers);
        assert_eq!(status.time_remaining, Duration::seconds(40));
        assert!(status.captured_at.is_some());
        assert!(status.weak_protection.is_none());
    }

    struct WeakVault(InMemoryVault);

    #[async_trait]
    impl CredentialVault for WeakVault {
        async fn store(
            &self,
            bundle: CredentialBundle,
            password: &SecretString,
        ) -> Result<StoreReport, VaultError> {
            self.0.store(bundle, password).await?;
            Ok(StoreReport {
                protection: Protection::Fallback,
                warning: Some(WeakProtectionWarning {
                    reason: "test".into(),
                }),
            })
        }

        async fn load(&self, password: &SecretString) -> Result<LoadedBundle, VaultError> {
            let mut loaded = self.0.load(password).await?;
            loaded.protection = Protection::Fallback;
            loaded.warning = Some(WeakProtectionWarning {
                reason: "test".into(),
            });
            Ok(loaded)
        }

        async fn clear(&self) -> Result<(), VaultError> {
            self.0.clear().await
        }

        async fn exists(&self) -> bool {
            self.0.exists().await
        }
    }

    /// Holds every load until a permit is added.
    struct GatedVault {
        inner: InMemoryVault,
        release: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl CredentialVault for GatedVault {
        async fn store(
            &self,
            bundle: CredentialBundle,
            password: &SecretString,
        ) -> Result<StoreReport, VaultError> {
            self.inner.store(bundle, password).await
        }

        async fn load(&self, password: &SecretString) -> Result<LoadedBundle, VaultError> {
            let permit = self.release.acquire().await.map_err(|e| VaultError::Storage {
                reason: e.to_string(),
            })?;
            permit.forget();
            self.inner.load(password).await
        }

        async fn clear(&self) -> Result<(), VaultError> {
            self.inner.clear().await
        }

        async fn exists(&self) -> bool {
            self.inner.exists().await
        }
    }

    #[tokio::test]
    async fn logout_discards_an_authentication_in_flight() {
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let vault = GatedVault {
            inner: stored_vault().await,
            release: release.clone(),
        };
        let auth = Arc::new(SessionAuthenticator::new(vault, SessionConfig::default()));

        let pending = tokio::spawn({
            let auth = auth.clone();
            async move { auth.authenticate(&pw("correct")).await }
        });
        while auth.status().phase != SessionPhase::Authenticating {
            tokio::task::yield_now().await;
        }

        auth.logout();
        assert_eq!(auth.status().phase, SessionPhase::Unauthenticated);
        release.add_permits(1);

        let result = pending.await.expect("join");
        assert_eq!(result, Err(AuthError::Cancelled));
        assert_eq!(auth.status().phase, SessionPhase::Unauthenticated);
        assert!(auth.auth_context().is_err());

        release.add_permits(1);
        auth.authenticate(&pw("correct"))
            .await
            .expect("a later authenticate still works");
        assert!(auth.is_valid());
    }

    #[tokio::test]
    async fn weak_protection_is_never_suppressed() {
        let auth = SessionAuthenticator::new(WeakVault(InMemoryVault::new()), SessionConfig::default());
        let report = auth
            .store_credentials(CredentialBundle::new([("token", "abc")]), &pw("pw"))
            .await
            .expect("store");
        assert!(report.warning.is_some());
        assert!(auth.status().weak_protection.is_some());

        auth.authenticate(&pw("pw")).await.expect("authenticate");
        assert!(auth.status().weak_protection.is_some());
    }

    #[tokio::test]
    async fn concurrent_readers_see_consistent_contexts() {
        let (auth, _) = authenticator(stored_vault().await, Duration::hours(1));
        let auth = Arc::new(auth);
        auth.authenticate(&pw("correct")).await.expect("authenticate");

        let mut handles = Vec::new();
        for i in 0..8 {
            let auth = Arc::clone(&auth);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    auth.authenticate(&pw("correct")).await.expect("re-authenticate");
                }
                match auth.auth_context() {
                    Ok(ctx) => assert!(ctx.generation() >= 1),
                    Err(AuthError::NotAuthenticated { phase }) => {
                        assert_eq!(phase, SessionPhase::Authenticating)
                    }
                    Err(other) => panic!("unexpected error {other}"),
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert!(auth.is_valid());
        assert_eq!(auth.auth_context().expect("context").generation(), 5);
    }
}
