//! Token lifecycle management
//!
//! Keeps a session alive without visible interruption:
//! - Proactive refresh scheduled shortly before the access credential expires
//! - Single-flight `refresh()`: concurrent callers share one network call
//! - Cooldown after a failed refresh so a flapping backend is not hammered
//!
//! State transitions:
//! - Unauthenticated → Authenticated: on successful login
//! - Authenticated → Refreshing: when a refresh starts
//! - Refreshing → Authenticated: refresh succeeded
//! - Refreshing → CooldownAfterFailure: refresh failed for a transient reason
//! - Refreshing → Unauthenticated: refresh credential rejected (session cleared)

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::api::{AuthApi, Credentials, Identity};
use crate::error::{RefreshError, Result, SessionError};
use crate::store::{Session, SessionStore};

/// Longest delay a timer accepts (2^31 - 1 ms, about 24.8 days)
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

type RefreshResult = std::result::Result<Session, RefreshError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Timing policy for proactive refresh
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long before expiry the refresh fires
    pub lead_time: Duration,
    /// Shortest scheduled delay
    pub min_delay: Duration,
    /// Longest scheduled delay; longer delays are capped, never wrapped
    pub timer_ceiling: Duration,
    /// Window after a failed refresh during which new attempts fail fast
    pub cooldown: Duration,
    /// Margin before expiry at which a credential stops counting as valid
    pub expiry_buffer: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_secs(15),
            min_delay: Duration::from_secs(5),
            timer_ceiling: MAX_TIMER_DELAY,
            cooldown: Duration::from_secs(5),
            expiry_buffer: Duration::from_secs(10),
        }
    }
}

/// Authentication state of the managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Refreshing,
    CooldownAfterFailure,
}

/// Delay until the next proactive refresh.
///
/// `expires_at - now - lead_time`, clamped to `[min_delay, timer_ceiling]`.
/// A credential that expires within the lead time gets `min_delay`.
pub fn compute_refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &LifecycleConfig,
) -> Duration {
    let lead = TimeDelta::from_std(config.lead_time).unwrap_or(TimeDelta::MAX);
    let raw = expires_at
        .signed_duration_since(now)
        .checked_sub(&lead)
        .unwrap_or(TimeDelta::MIN);

    // Negative deltas fail the conversion
    let delay = raw.to_std().unwrap_or(Duration::ZERO);
    delay.max(config.min_delay).min(config.timer_ceiling)
}

#[derive(Default)]
struct RefreshState {
    in_flight: Option<InFlight>,
    last_failure_at: Option<Instant>,
    generation: u64,
    /// Bumped on every sign-in and sign-out; a refresh started under an
    /// older epoch never writes to the store
    session_epoch: u64,
}

struct InFlight {
    generation: u64,
    pending: SharedRefresh,
}

struct Inner {
    api: Arc<dyn AuthApi>,
    store: Arc<SessionStore>,
    config: LifecycleConfig,
    refresh: Mutex<RefreshState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<AuthState>,
}

/// Releases the in-flight marker when the refresh task ends, however it ends
struct InFlightGuard {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock_refresh();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == self.generation)
        {
            state.in_flight = None;
        }
    }
}

/// Drives login, proactive refresh and logout for one session.
///
/// Cheap to clone; clones share state. The owner calls [`start`] once the
/// session is available and [`stop`] on teardown. Dropping the last clone
/// also cancels the pending timer.
///
/// [`start`]: TokenLifecycleManager::start
/// [`stop`]: TokenLifecycleManager::stop
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

impl TokenLifecycleManager {
    pub fn new(api: Arc<dyn AuthApi>, store: Arc<SessionStore>, config: LifecycleConfig) -> Self {
        let initial = if store.access_token().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        let (state, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                api,
                store,
                config,
                refresh: Mutex::new(RefreshState::default()),
                timer: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AuthState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Begin managing an already-persisted session
    pub fn start(&self) {
        if self.inner.store.access_token().is_some() {
            self.inner.set_state(AuthState::Authenticated);
        }
        self.inner.schedule_refresh();
    }

    /// Cancel the pending refresh timer. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.inner.cancel_timer() {
            debug!("Stopped token lifecycle timer");
        }
    }

    pub fn has_scheduled_refresh(&self) -> bool {
        self.inner
            .lock_timer()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Sign in and start proactive refresh
    #[instrument(skip(self, credentials), fields(email = %credentials.email))]
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Session> {
        let tokens = self.inner.api.login(credentials).await.inspect_err(|e| {
            warn!("Login failed: {}", e);
        })?;

        let session = {
            let _state = self.inner.begin_epoch();
            let session = self.inner.store.replace(&tokens);
            self.inner.set_state(AuthState::Authenticated);
            self.inner.schedule_refresh();
            session
        };

        info!("Signed in");
        Ok(session)
    }

    /// Fetch the profile for the current credential and attach it to the session
    #[instrument(skip(self))]
    pub async fn load_profile(&self) -> Result<Identity> {
        let access_token = self
            .inner
            .store
            .access_token()
            .ok_or(SessionError::NotAuthenticated)?;

        let identity = Identity::from(self.inner.api.profile(&access_token).await?);
        self.inner.store.set_identity(identity.clone());
        Ok(identity)
    }

    /// Refresh the access credential.
    ///
    /// Joins the in-flight attempt when there is one, so any number of
    /// concurrent callers cause at most one network call.
    pub async fn refresh(&self) -> std::result::Result<Session, RefreshError> {
        self.inner.begin_refresh()?.await
    }

    /// Recompute and arm the refresh timer; returns the delay if one was armed
    pub fn schedule_refresh(&self) -> Option<Duration> {
        self.inner.schedule_refresh()
    }

    /// True iff an access credential is present and not about to expire
    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated_at(Utc::now())
    }

    pub fn is_authenticated_at(&self, now: DateTime<Utc>) -> bool {
        let Some(session) = self.inner.store.get() else {
            return false;
        };
        if session.access_token.is_none() {
            return false;
        }
        match session.access_expires_at {
            None => true,
            Some(expires_at) => {
                let buffer =
                    TimeDelta::from_std(self.inner.config.expiry_buffer).unwrap_or(TimeDelta::MAX);
                expires_at
                    .checked_sub_signed(buffer)
                    .is_some_and(|deadline| now < deadline)
            }
        }
    }

    /// Sign out everywhere.
    ///
    /// The local session is cleared first; the server call is best-effort
    /// and its failure is only logged.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        let refresh_token = self.inner.store.refresh_token();
        self.sign_out();

        if let Some(refresh_token) = refresh_token
            && let Err(e) = self.inner.api.logout(&refresh_token).await
        {
            warn!("Server-side logout failed (ignored): {}", e);
        }
    }

    /// Clear the local session without contacting the server
    pub fn sign_out(&self) {
        let _state = self.inner.begin_epoch();
        self.stop();
        self.inner.store.clear();
        self.inner.set_state(AuthState::Unauthenticated);
        info!("Signed out");
    }
}

impl Inner {
    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: AuthState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = ?*current, to = ?next, "Auth state changed");
                *current = next;
                true
            }
        });
    }

    /// Invalidate every refresh started so far.
    ///
    /// The returned guard keeps the refresh lock held so the caller's store
    /// write cannot interleave with a settling refresh.
    fn begin_epoch(&self) -> MutexGuard<'_, RefreshState> {
        let mut state = self.lock_refresh();
        state.session_epoch += 1;
        state.in_flight = None;
        state.last_failure_at = None;
        state
    }

    fn cancel_timer(&self) -> bool {
        match self.lock_timer().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Join the in-flight refresh or start a new one
    fn begin_refresh(self: &Arc<Self>) -> std::result::Result<SharedRefresh, RefreshError> {
        let mut state = self.lock_refresh();

        if let Some(in_flight) = &state.in_flight {
            debug!("Joining in-flight token refresh");
            return Ok(in_flight.pending.clone());
        }

        if let Some(failed_at) = state.last_failure_at {
            let elapsed = failed_at.elapsed();
            if elapsed < self.config.cooldown {
                let remaining = self.config.cooldown - elapsed;
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Token refresh suppressed during cooldown"
                );
                return Err(RefreshError::CoolingDown { remaining });
            }
        }

        state.generation += 1;
        let generation = state.generation;
        let epoch = state.session_epoch;

        // The marker is published before this lock is released, and the
        // guard needs the same lock to clear it, so it can never be cleared
        // before it is set.
        let task_inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                inner: Arc::clone(&task_inner),
                generation,
            };
            task_inner.perform_refresh(epoch).await
        });

        let pending = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(RefreshError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            generation,
            pending: pending.clone(),
        });
        Ok(pending)
    }

    async fn perform_refresh(self: Arc<Self>, epoch: u64) -> RefreshResult {
        let refresh_token = {
            let _state = self.lock_current(epoch)?;
            let Some(refresh_token) = self.store.refresh_token() else {
                warn!("Token refresh requested without a refresh token");
                return Err(RefreshError::MissingRefreshToken);
            };
            self.set_state(AuthState::Refreshing);
            refresh_token
        };
        debug!("Refreshing access token");

        let outcome = self.api.refresh(&refresh_token).await;

        // Settle under the lock so a concurrent sign-in or sign-out either
        // happens entirely before or entirely after this write
        let mut state = self.lock_current(epoch)?;
        match outcome {
            Ok(tokens) => {
                let session = self.store.set(&tokens);
                state.last_failure_at = None;
                self.set_state(AuthState::Authenticated);
                self.schedule_refresh();
                info!("Access token refreshed");
                Ok(session)
            }
            Err(e) if e.is_unauthorized() => {
                warn!("Refresh token rejected, clearing session: {}", e);
                self.cancel_timer();
                self.store.clear();
                self.set_state(AuthState::Unauthenticated);
                Err(RefreshError::Rejected(e))
            }
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                state.last_failure_at = Some(Instant::now());
                self.set_state(AuthState::CooldownAfterFailure);
                Err(RefreshError::Failed(e))
            }
        }
    }

    /// Refresh lock, provided no sign-in or sign-out happened since `epoch`
    fn lock_current(
        &self,
        epoch: u64,
    ) -> std::result::Result<MutexGuard<'_, RefreshState>, RefreshError> {
        let state = self.lock_refresh();
        if state.session_epoch != epoch {
            debug!("Session changed during refresh, discarding result");
            return Err(RefreshError::Superseded);
        }
        Ok(state)
    }

    fn schedule_refresh(self: &Arc<Self>) -> Option<Duration> {
        let mut timer = self.lock_timer();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let Some(expires_at) = self.store.get().and_then(|s| s.access_expires_at) else {
            debug!("Access expiry unknown, not scheduling a refresh");
            return None;
        };

        let delay = compute_refresh_delay(expires_at, Utc::now(), &self.config);
        let weak = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            debug!("Refresh timer fired");
            let result = match inner.begin_refresh() {
                Ok(pending) => pending.await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Scheduled token refresh failed: {}", e);
            }
        }));

        debug!(delay_secs = delay.as_secs(), "Scheduled token refresh");
        Some(delay)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AuthApiError, Profile, TokenSet};
    use crate::claims::tests::make_token;
    use crate::store::SessionStoreConfig;
    use async_trait::async_trait;
    use clinicgate_core::cookie::MemoryCookieStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn token_expiring_in(secs: i64) -> String {
        token_for("doc@clinic.test", secs)
    }

    fn token_for(email: &str, secs: i64) -> String {
        make_token(serde_json::json!({
            "exp": Utc::now().timestamp() + secs,
            "email": email
        }))
    }

    fn fresh_tokens() -> TokenSet {
        TokenSet::new(token_expiring_in(3600), "refresh-next")
    }

    #[derive(Default)]
    struct FakeAuthApi {
        refresh_calls: AtomicUsize,
        logout_calls: AtomicUsize,
        refresh_delay: Duration,
        refresh_outcomes: Mutex<VecDeque<std::result::Result<TokenSet, AuthApiError>>>,
        fail_logout: bool,
        panic_next_refresh: AtomicBool,
    }

    impl FakeAuthApi {
        fn with_outcomes(
            outcomes: Vec<std::result::Result<TokenSet, AuthApiError>>,
        ) -> Self {
            Self {
                refresh_outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthApi for FakeAuthApi {
        async fn login(
            &self,
            credentials: &Credentials,
        ) -> std::result::Result<TokenSet, AuthApiError> {
            if credentials.password == "correct" {
                Ok(TokenSet::new(token_for(&credentials.email, 60), "refresh-1"))
            } else {
                Err(AuthApiError::Unauthorized("bad credentials".to_string()))
            }
        }

        async fn refresh(&self, _refresh_token: &str) -> std::result::Result<TokenSet, AuthApiError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_next_refresh.swap(false, Ordering::SeqCst) {
                panic!("auth client crashed");
            }
            if !self.refresh_delay.is_zero() {
                tokio::time::sleep(self.refresh_delay).await;
            }
            self.refresh_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(fresh_tokens()))
        }

        async fn logout(&self, _refresh_token: &str) -> std::result::Result<(), AuthApiError> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout {
                Err(AuthApiError::Network("connection reset".to_string()))
            } else {
                Ok(())
            }
        }

        async fn profile(&self, _access_token: &str) -> std::result::Result<Profile, AuthApiError> {
            Ok(Profile {
                email: "doc@clinic.test".to_string(),
                full_name: "Dr. Ada Lovelace".to_string(),
                role: "doctor".to_string(),
            })
        }
    }

    fn manager_with(api: Arc<FakeAuthApi>) -> TokenLifecycleManager {
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryCookieStore::new()),
            SessionStoreConfig::default(),
        ));
        TokenLifecycleManager::new(api, store, LifecycleConfig::default())
    }

    fn seed_session(manager: &TokenLifecycleManager) {
        manager
            .store()
            .set(&TokenSet::new(token_expiring_in(3600), "refresh-1"));
    }

    #[test]
    fn test_delay_far_future_subtracts_lead_time() {
        let config = LifecycleConfig::default();
        let now = Utc::now();
        let delay = compute_refresh_delay(now + TimeDelta::seconds(3600), now, &config);
        assert_eq!(delay, Duration::from_secs(3600 - 15));
    }

    #[test]
    fn test_delay_within_lead_time_is_min_delay() {
        let config = LifecycleConfig::default();
        let now = Utc::now();
        for secs in [-3600, -1, 0, 1, 10, 15, 19] {
            let delay = compute_refresh_delay(now + TimeDelta::seconds(secs), now, &config);
            assert_eq!(delay, config.min_delay, "expiry in {}s", secs);
        }
    }

    #[test]
    fn test_delay_capped_at_timer_ceiling() {
        let config = LifecycleConfig::default();
        let now = Utc::now();
        let delay = compute_refresh_delay(now + TimeDelta::days(365), now, &config);
        assert_eq!(delay, MAX_TIMER_DELAY);

        let delay = compute_refresh_delay(DateTime::<Utc>::MAX_UTC, now, &config);
        assert_eq!(delay, MAX_TIMER_DELAY);
    }

    #[test]
    fn test_delay_always_within_bounds() {
        let config = LifecycleConfig::default();
        let now = Utc::now();
        for secs in [16, 20, 21, 600, 86_400, 2_200_000, 10_000_000] {
            let delay = compute_refresh_delay(now + TimeDelta::seconds(secs), now, &config);
            assert!(delay >= config.min_delay && delay <= config.timer_ceiling);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_call() {
        let api = Arc::new(FakeAuthApi {
            refresh_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let manager = manager_with(api.clone());
        seed_session(&manager);

        let results =
            futures::future::join_all((0..8).map(|_| manager.refresh())).await;

        assert_eq!(api.refresh_calls(), 1);
        assert!(results.iter().all(|r| r.is_ok()));
        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| r.as_ref().unwrap() == first));
        assert_eq!(first.refresh_token.as_deref(), Some("refresh-next"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_marker_cleared_after_settlement() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api.clone());
        seed_session(&manager);

        manager.refresh().await.unwrap();
        manager.refresh().await.unwrap();

        assert_eq!(api.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_refresh_releases_in_flight_marker() {
        let api = Arc::new(FakeAuthApi {
            panic_next_refresh: AtomicBool::new(true),
            ..Default::default()
        });
        let manager = manager_with(api.clone());
        seed_session(&manager);

        let first = manager.refresh().await;
        assert!(matches!(first, Err(RefreshError::Aborted(_))));

        // The next caller starts a new attempt instead of joining the dead one
        let second = manager.refresh().await.unwrap();
        assert_eq!(api.refresh_calls(), 2);
        assert_eq!(second.refresh_token.as_deref(), Some("refresh-next"));
        assert_eq!(manager.state(), AuthState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_discards_new_tokens() {
        let api = Arc::new(FakeAuthApi {
            refresh_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let manager = manager_with(api.clone());
        seed_session(&manager);

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.refresh_calls(), 1);

        manager.logout().await;
        let result = refreshing.await.unwrap();

        assert!(matches!(result, Err(RefreshError::Superseded)));
        assert!(manager.store().get().is_none());
        assert_eq!(manager.state(), AuthState::Unauthenticated);
        assert!(!manager.has_scheduled_refresh());
        assert_eq!(api.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_during_refresh_keeps_new_session() {
        let api = Arc::new(FakeAuthApi {
            refresh_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let manager = manager_with(api.clone());
        seed_session(&manager);

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager
            .authenticate(&Credentials::new("nurse@clinic.test", "correct"))
            .await
            .unwrap();
        let result = refreshing.await.unwrap();

        assert!(matches!(result, Err(RefreshError::Superseded)));
        let session = manager.store().get().unwrap();
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(session.identity.unwrap().email, "nurse@clinic.test");
        assert_eq!(manager.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_new_sign_in_drops_previous_profile() {
        let manager = manager_with(Arc::new(FakeAuthApi::default()));
        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();
        assert_eq!(manager.load_profile().await.unwrap().name, "Dr. Ada Lovelace");

        let session = manager
            .authenticate(&Credentials::new("nurse@clinic.test", "correct"))
            .await
            .unwrap();

        let identity = session.identity.unwrap();
        assert_eq!(identity.email, "nurse@clinic.test");
        assert_ne!(identity.name, "Dr. Ada Lovelace");
        assert_eq!(
            manager.store().get().unwrap().identity.unwrap().email,
            "nurse@clinic.test"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_within_cooldown_fails_fast() {
        let api = Arc::new(FakeAuthApi::with_outcomes(vec![
            Err(AuthApiError::Status {
                status: 503,
                message: "unavailable".to_string(),
            }),
            Err(AuthApiError::Status {
                status: 503,
                message: "unavailable".to_string(),
            }),
        ]));
        let manager = manager_with(api.clone());
        seed_session(&manager);

        let first = manager.refresh().await.unwrap_err();
        assert!(matches!(first, RefreshError::Failed(_)));
        assert_eq!(manager.state(), AuthState::CooldownAfterFailure);

        let second = manager.refresh().await.unwrap_err();
        assert!(matches!(second, RefreshError::CoolingDown { .. }));
        assert_eq!(api.refresh_calls(), 1);

        // Session survives transient failures
        assert!(manager.store().get().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        let third = manager.refresh().await.unwrap_err();
        assert!(matches!(third, RefreshError::Failed(_)));
        assert_eq!(api.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failure_marker() {
        let api = Arc::new(FakeAuthApi::with_outcomes(vec![Err(AuthApiError::Timeout)]));
        let manager = manager_with(api.clone());
        seed_session(&manager);

        assert!(manager.refresh().await.is_err());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.refresh().await.is_ok());
        assert_eq!(manager.state(), AuthState::Authenticated);

        // No cooldown after a success
        assert!(manager.refresh().await.is_ok());
        assert_eq!(api.refresh_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_clears_session() {
        let api = Arc::new(FakeAuthApi::with_outcomes(vec![Err(
            AuthApiError::Unauthorized("refresh token revoked".to_string()),
        )]));
        let manager = manager_with(api.clone());
        seed_session(&manager);
        manager.start();
        assert!(manager.has_scheduled_refresh());

        let err = manager.refresh().await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(manager.store().get().is_none());
        assert_eq!(manager.state(), AuthState::Unauthenticated);
        assert!(!manager.has_scheduled_refresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_refresh_token_makes_no_call() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api.clone());

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::MissingRefreshToken));
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_schedules_refresh_that_fires() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api.clone());

        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();
        assert_eq!(manager.state(), AuthState::Authenticated);
        assert!(manager.has_scheduled_refresh());

        // Token expires in 60s, lead time 15s: the timer fires at ~45s
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.refresh_calls(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(
            manager.store().refresh_token().as_deref(),
            Some("refresh-next")
        );
        // Rescheduled against the new expiry
        assert!(manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn test_authenticate_with_bad_credentials() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api);

        let err = manager
            .authenticate(&Credentials::new("doc@clinic.test", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Api(AuthApiError::Unauthorized(_))));
        assert!(manager.store().get().is_none());
        assert!(!manager.has_scheduled_refresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer_and_is_idempotent() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api.clone());
        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();

        manager.stop();
        manager.stop();
        assert!(!manager.has_scheduled_refresh());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_never_stacks_timers() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api.clone());
        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();

        for _ in 0..5 {
            manager.schedule_refresh();
        }

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_cancels_timer() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api.clone());
        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();

        drop(manager);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_schedule_without_expiry_does_nothing() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api);
        manager
            .store()
            .set(&TokenSet::new("opaque-token", "refresh-1"));

        assert!(manager.schedule_refresh().is_none());
        assert!(!manager.has_scheduled_refresh());
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_server_fails() {
        let api = Arc::new(FakeAuthApi {
            fail_logout: true,
            ..Default::default()
        });
        let manager = manager_with(api.clone());
        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();

        manager.logout().await;

        assert_eq!(api.logout_calls.load(Ordering::SeqCst), 1);
        assert!(manager.store().get().is_none());
        assert!(!manager.has_scheduled_refresh());
        assert_eq!(manager.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_is_authenticated() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api);
        assert!(!manager.is_authenticated());

        manager
            .store()
            .set(&TokenSet::new(token_expiring_in(3600), "r"));
        assert!(manager.is_authenticated());

        // Inside the expiry buffer
        manager.store().set(&TokenSet::new(token_expiring_in(5), "r"));
        assert!(!manager.is_authenticated());

        // No expiry known
        manager.store().set(&TokenSet::new("opaque-token", "r"));
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_load_profile_attaches_identity() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api);
        assert!(matches!(
            manager.load_profile().await,
            Err(SessionError::NotAuthenticated)
        ));

        seed_session(&manager);
        let identity = manager.load_profile().await.unwrap();
        assert_eq!(identity.name, "Dr. Ada Lovelace");
        assert_eq!(
            manager.store().get().unwrap().identity.unwrap().role,
            "doctor"
        );
    }

    #[tokio::test]
    async fn test_state_changes_are_observable() {
        let api = Arc::new(FakeAuthApi::default());
        let manager = manager_with(api);
        let mut rx = manager.subscribe_state();
        assert_eq!(*rx.borrow_and_update(), AuthState::Unauthenticated);

        manager
            .authenticate(&Credentials::new("doc@clinic.test", "correct"))
            .await
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AuthState::Authenticated);

        manager.sign_out();
        assert_eq!(*rx.borrow_and_update(), AuthState::Unauthenticated);
    }
}
