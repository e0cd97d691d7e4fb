use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::recovery::{self, Attempt, RecoveryStep};
use super::refresh::{self, RefreshFailure, RefreshGate};
use super::token;
use super::types::{LoginCredentials, LoginRequest, LoginResponse, Session, SessionState, UserProfile};
use crate::broadcast::{BroadcastChannel, BroadcastKind, BroadcastMessage, ContextId, Notification};
use crate::error::{Result, SessionError};
use crate::store::{CredentialRecord, CredentialStore};
use crate::transport::{Transport, TransportOutcome, TransportRequest};

pub const LOGIN_PATH: &str = "/auth/login";
pub const PROFILE_PATH: &str = "/auth/profile";
pub const LOGOUT_PATH: &str = "/auth/logout";

const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 60;

/// Tunables for a session manager
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Refresh proactively when the access token expires within this window
    pub refresh_threshold: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
        }
    }
}

struct SessionInner {
    store: Arc<dyn CredentialStore>,
    channel: Arc<dyn BroadcastChannel>,
    transport: Arc<dyn Transport>,
    options: SessionOptions,

    /// Current session, published to watchers
    session: watch::Sender<Session>,

    /// Bumped on every change of session identity (login, logout, remote clear)
    epoch: AtomicU64,

    /// Serializes the synchronous commit step of every transition
    transition: Mutex<()>,

    refresh: RefreshGate,

    /// Listener for other contexts' changes; stopped by `dispose`
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let task = self
            .sync_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Session lifecycle manager
/// Owns the session state machine for one execution context
///
/// Clone is cheap; clones drive the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Create a manager and start listening for other contexts' changes
    ///
    /// The session starts empty; call `initialize` to hydrate it from the store.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        channel: Arc<dyn BroadcastChannel>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_options(store, channel, transport, SessionOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn CredentialStore>,
        channel: Arc<dyn BroadcastChannel>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
    ) -> Self {
        let (session, _) = watch::channel(Session::default());

        let manager = Self {
            inner: Arc::new(SessionInner {
                store,
                channel,
                transport,
                options,
                session,
                epoch: AtomicU64::new(0),
                transition: Mutex::new(()),
                refresh: RefreshGate::new(),
                sync_task: Mutex::new(None),
            }),
        };

        let task = manager.spawn_sync_listener();
        *manager
            .inner
            .sync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = task;
        manager
    }

    /// Context id this manager broadcasts as
    pub fn context_id(&self) -> ContextId {
        self.inner.channel.context_id()
    }

    /// Current session
    pub fn snapshot(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.borrow().state
    }

    /// Observe session transitions
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    /// Whether a refresh network call is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.is_pending()
    }

    /// Stop reacting to other contexts
    pub fn dispose(&self) {
        let task = self
            .inner
            .sync_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            tracing::debug!(context = %self.context_id(), "Disposing session manager");
            task.abort();
        }
    }

    /// Hydrate the session from the credential store
    ///
    /// Returns the state the session settled in.
    pub async fn initialize(&self) -> SessionState {
        let state = self.restore().await;
        if !state.is_terminal() {
            // Another context replaced the session while this one was validating
            tracing::debug!(state = %state, "Session still settling after initialize");
        }
        state
    }

    async fn restore(&self) -> SessionState {
        let record = match CredentialRecord::load(self.inner.store.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Failed to read credential store: {}", e);
                self.reset_local();
                return SessionState::Unauthenticated;
            }
        };

        let record = match record {
            Some(record) => record,
            None => {
                tracing::debug!("No stored credentials");
                self.reset_local();
                return SessionState::Unauthenticated;
            }
        };

        let claims = match token::claims(&record.access_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::error!("Stored access token is unusable: {}", e);
                self.force_logout(self.epoch(), "malformed stored token");
                return SessionState::Unauthenticated;
            }
        };

        let epoch = {
            let _guard = self.lock_transition();
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.session.send_replace(Session {
                access_token: Some(record.access_token.clone()),
                refresh_token: record.refresh_token.clone(),
                user: None,
                state: SessionState::Authenticating,
            });
            epoch
        };
        tracing::info!(
            "Validating stored session ({})",
            token::redact(&record.access_token)
        );

        if claims.map(|c| c.is_expired(Utc::now())).unwrap_or(false) {
            tracing::info!("Stored access token has expired, refreshing before validation");
            self.update_if_current(epoch, |s| s.state = SessionState::Expired);

            if let Err(e) = self.refresh().await {
                tracing::warn!("Could not refresh expired session: {}", e);
                self.update_if_current(epoch, |s| {
                    s.user = None;
                    s.state = SessionState::Unauthenticated;
                });
                return self.state();
            }
        }

        match self.load_profile(epoch).await {
            Ok(profile) => {
                tracing::info!("Session restored for user {}", profile.id);
            }
            Err(e) => {
                tracing::warn!("Session validation failed: {}", e);
                // Credentials stay unless the refresh path cleared them
                self.update_if_current(epoch, |s| {
                    s.user = None;
                    s.state = SessionState::Unauthenticated;
                });
            }
        }
        self.state()
    }

    /// Sign in with username and password
    ///
    /// Expected authentication failures come back as `InvalidCredentials`,
    /// `NetworkError` or `ServerError`; `InvalidInput` means the caller passed
    /// blank credentials.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<UserProfile> {
        credentials.validate()?;

        let previous_state = self.state();
        let epoch = self.epoch();
        self.update_if_current(epoch, |s| s.state = SessionState::Authenticating);
        tracing::info!(username = %credentials.username, "Logging in...");

        let response = match self.request_login(credentials).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(username = %credentials.username, "Login failed: {}", e);
                self.update_if_current(epoch, |s| s.state = previous_state);
                return Err(e);
            }
        };

        let subject = token::claims(&response.access_token)
            .ok()
            .flatten()
            .and_then(|c| c.subject);
        let user = response
            .user
            .unwrap_or_else(|| UserProfile::placeholder(subject));

        let record = CredentialRecord {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            last_refresh_at: Some(Utc::now()),
        };

        let epoch = {
            let _guard = self.lock_transition();
            if let Err(e) = record.persist(self.inner.store.as_ref()) {
                tracing::error!("Failed to persist credentials: {}", e);
                if self.epoch() == epoch {
                    self.inner.session.send_modify(|s| s.state = previous_state);
                }
                return Err(e.into());
            }
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.session.send_replace(Session {
                access_token: Some(record.access_token.clone()),
                refresh_token: record.refresh_token.clone(),
                user: Some(user.clone()),
                state: SessionState::Authenticated,
            });
            epoch
        };

        let subject_id = (!user.placeholder).then(|| user.id.clone());
        self.inner
            .channel
            .post(BroadcastMessage::new(BroadcastKind::Login, subject_id));
        tracing::info!(
            username = %credentials.username,
            "Login successful ({})",
            token::redact(&record.access_token)
        );

        if !user.placeholder {
            return Ok(user);
        }

        // Profile not included in the login response; fill it in now if we can
        match self.fetch_profile(&record.access_token).await {
            Ok(profile) => {
                let applied = self.update_if_current(epoch, |s| s.user = Some(profile.clone()));
                if applied {
                    return Ok(profile);
                }
                Ok(user)
            }
            Err(e) => {
                tracing::warn!("Profile fetch after login failed, keeping placeholder: {}", e);
                Ok(user)
            }
        }
    }

    async fn request_login(&self, credentials: &LoginCredentials) -> Result<LoginResponse> {
        let body = serde_json::to_value(LoginRequest {
            username: credentials.username.trim(),
            password: &credentials.password,
        })
        .map_err(|e| SessionError::Internal(e.to_string()))?;

        let outcome = self
            .inner
            .transport
            .send(TransportRequest::post(LOGIN_PATH).with_json(body))
            .await;

        let value = match outcome {
            TransportOutcome::Ok(value) => value,
            TransportOutcome::Unauthorized
            | TransportOutcome::ServerError { status: 403, .. } => {
                return Err(SessionError::InvalidCredentials)
            }
            TransportOutcome::NetworkError(msg) => return Err(SessionError::NetworkError(msg)),
            TransportOutcome::ServerError { status, message } => {
                return Err(SessionError::ServerError { status, message })
            }
        };

        let response: LoginResponse = serde_json::from_value(value).map_err(|e| {
            SessionError::ServerError {
                status: 200,
                message: format!("Failed to parse login response: {}", e),
            }
        })?;
        token::claims(&response.access_token)?;
        Ok(response)
    }

    /// Sign out: clear credentials everywhere, tell other contexts
    ///
    /// Safe to call repeatedly. An in-flight refresh is left to settle and
    /// its result discarded.
    ///
    /// Returns the background server-side logout call when one was started.
    /// The local session is already cleared; await the handle only to make
    /// sure the call goes out before the runtime shuts down.
    pub async fn logout(&self) -> Option<JoinHandle<()>> {
        let previous = self.snapshot();
        tracing::info!("Logging out");
        self.clear_session(previous.subject_id().map(str::to_string));

        previous
            .access_token
            .and_then(|access_token| self.revoke_remote(access_token))
    }

    /// Best-effort server-side invalidation; local logout does not wait for it
    fn revoke_remote(&self, access_token: String) -> Option<JoinHandle<()>> {
        let header = token::authorization_value(&access_token).ok()?;
        let transport = Arc::clone(&self.inner.transport);
        let request = TransportRequest::post(LOGOUT_PATH).with_header("Authorization", header);

        let call = async move {
            match transport.send(request).await {
                TransportOutcome::Ok(_) => tracing::debug!("Server-side logout acknowledged"),
                other => tracing::debug!("Server-side logout not acknowledged: {:?}", other),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(call)),
            Err(_) => {
                tracing::debug!("No runtime, skipping server-side logout");
                None
            }
        }
    }

    /// Obtain a new access token
    ///
    /// Single-flight: concurrent callers share one network call. A result that
    /// arrives after the session was cleared is discarded (`Cancelled`).
    pub async fn refresh(&self) -> Result<String> {
        if self.snapshot().access_token.is_none() {
            return Err(SessionError::Unauthorized);
        }

        let epoch = self.epoch();
        let (attempt, started) = self.inner.refresh.join_or_start(epoch, |id| {
            let manager = self.clone();
            let task = tokio::spawn(async move {
                let result = AssertUnwindSafe(manager.perform_refresh(epoch))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(SessionError::Internal("refresh attempt panicked".to_string()))
                    });
                manager.inner.refresh.clear(id);
                result
            });
            async move {
                task.await.unwrap_or_else(|e| {
                    Err(SessionError::Internal(format!("refresh task failed: {}", e)))
                })
            }
            .boxed()
        });

        if !started {
            tracing::debug!("Joining in-flight refresh");
        }
        attempt.await
    }

    async fn perform_refresh(&self, epoch: u64) -> Result<String> {
        let stored = CredentialRecord::load(self.inner.store.as_ref())?;
        let started_with = stored.as_ref().map(|r| r.access_token.clone());

        let refresh_token = stored
            .and_then(|r| r.refresh_token)
            .or_else(|| self.snapshot().refresh_token);

        let refresh_token = match refresh_token {
            Some(token) => token,
            None => {
                tracing::warn!("No refresh token available, ending session");
                self.force_logout(epoch, "no refresh token");
                return Err(SessionError::RefreshExhausted(
                    "no refresh token available".to_string(),
                ));
            }
        };

        let previous_state = self.state();
        self.update_if_current(epoch, |s| s.state = SessionState::Refreshing);

        let result =
            refresh::request_new_token(self.inner.transport.as_ref(), &refresh_token).await;

        let data = match result {
            Ok(data) => data,
            Err(RefreshFailure::Transient(e)) => {
                tracing::warn!("Token refresh failed: {}", e);
                self.update_if_current(epoch, |s| s.state = previous_state);
                return Err(e);
            }
            Err(RefreshFailure::Rejected(reason)) => {
                if self.epoch() != epoch {
                    return Err(SessionError::Cancelled);
                }
                if let Some(token) = self.adopt_rotated_token(epoch, started_with.as_deref()) {
                    return Ok(token);
                }
                tracing::error!("Token refresh rejected: {}", reason);
                self.force_logout(epoch, "refresh rejected");
                return Err(SessionError::RefreshExhausted(reason));
            }
        };

        let record = CredentialRecord {
            access_token: data.access_token,
            refresh_token: data.refresh_token.or(Some(refresh_token)),
            last_refresh_at: Some(Utc::now()),
        };

        let subject_id = {
            let _guard = self.lock_transition();
            if self.epoch() != epoch || self.state() == SessionState::Unauthenticated {
                tracing::info!("Session cleared while refreshing, discarding new token");
                return Err(SessionError::Cancelled);
            }
            if let Err(e) = record.persist(self.inner.store.as_ref()) {
                tracing::error!("Failed to persist refreshed credentials: {}", e);
                self.inner.session.send_modify(|s| s.state = previous_state);
                return Err(e.into());
            }

            let mut subject_id = None;
            self.inner.session.send_modify(|s| {
                s.access_token = Some(record.access_token.clone());
                s.refresh_token = record.refresh_token.clone();
                s.state = if s.user.is_some() {
                    SessionState::Authenticated
                } else {
                    SessionState::Authenticating
                };
                subject_id = s.subject_id().map(str::to_string);
            });
            subject_id
        };

        self.inner
            .channel
            .post(BroadcastMessage::new(BroadcastKind::Refresh, subject_id));
        Ok(record.access_token)
    }

    /// Another context may have refreshed first and rotated the refresh token
    /// out from under us; if the store moved on, use its token
    fn adopt_rotated_token(&self, epoch: u64, started_with: Option<&str>) -> Option<String> {
        let stored = CredentialRecord::load(self.inner.store.as_ref()).ok()??;
        if Some(stored.access_token.as_str()) == started_with {
            return None;
        }

        tracing::info!("Another context refreshed the session, adopting its token");
        let token = stored.access_token.clone();
        let adopted = self.update_if_current(epoch, |s| {
            s.access_token = Some(stored.access_token);
            s.refresh_token = stored.refresh_token;
            s.state = if s.user.is_some() {
                SessionState::Authenticated
            } else {
                SessionState::Authenticating
            };
        });
        adopted.then_some(token)
    }

    /// Current access token, refreshed first if it is about to expire
    pub async fn access_token(&self) -> Result<String> {
        let epoch = self.epoch();
        let token = self
            .snapshot()
            .access_token
            .ok_or(SessionError::Unauthorized)?;

        let claims = match token::claims(&token) {
            Ok(Some(claims)) => claims,
            Ok(None) => return Ok(token),
            Err(e) => {
                tracing::error!("Current access token is unusable: {}", e);
                self.force_logout(epoch, "malformed access token");
                return Err(e);
            }
        };

        let threshold = chrono::Duration::from_std(self.inner.options.refresh_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        if !claims.expires_within(threshold, now) {
            return Ok(token);
        }

        tracing::debug!("Access token expiring soon, refreshing");
        match self.refresh().await {
            Ok(token) => Ok(token),
            Err(e) if e.is_retryable() && !claims.is_expired(now) => {
                tracing::warn!("Using existing token despite refresh failure (not yet expired)");
                Ok(token)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a protected call with the current token
    ///
    /// On `Unauthorized` the session is refreshed once and the call retried
    /// once; a second `Unauthorized` ends the session.
    pub async fn execute_authorized(&self, request: TransportRequest) -> Result<Value> {
        let epoch = self.epoch();
        let mut token = self.access_token().await?;
        let mut attempt = Attempt::First;

        loop {
            let header = match token::authorization_value(&token) {
                Ok(header) => header,
                Err(e) => {
                    tracing::error!("Current access token is unusable: {}", e);
                    self.force_logout(epoch, "malformed access token");
                    return Err(e);
                }
            };

            let mut call = request.clone();
            call.set_header("Authorization", header);
            tracing::debug!(
                method = %call.method,
                path = %call.path,
                attempt = ?attempt,
                "Executing protected call"
            );
            let outcome = self.inner.transport.send(call).await;

            match recovery::next_step(&outcome, attempt) {
                RecoveryStep::Complete => {
                    if matches!(outcome, TransportOutcome::Ok(_)) {
                        self.mark_usable(epoch);
                    }
                    return outcome.into_result();
                }
                RecoveryStep::RefreshAndRetry => {
                    tracing::warn!(path = %request.path, "Received 401, refreshing token and retrying...");
                    let resume_state = self.state();
                    self.update_if_current(epoch, |s| {
                        if s.state == SessionState::Authenticated {
                            s.state = SessionState::Expired;
                        }
                    });
                    token = match self.refresh().await {
                        Ok(token) => token,
                        Err(e) => {
                            if e.is_retryable() {
                                // Token may still be good; nothing proved otherwise
                                self.update_if_current(epoch, |s| {
                                    if s.state == SessionState::Expired {
                                        s.state = resume_state;
                                    }
                                });
                            }
                            return Err(e);
                        }
                    };
                    attempt = Attempt::Retry;
                }
                RecoveryStep::ForceLogout => {
                    tracing::error!(path = %request.path, "Still unauthorized after refresh");
                    self.force_logout(epoch, "unauthorized after refresh");
                    return Err(SessionError::Unauthorized);
                }
            }
        }
    }

    /// Fetch the profile through the recovery path and mark the session authenticated
    async fn load_profile(&self, epoch: u64) -> Result<UserProfile> {
        let value = self
            .execute_authorized(TransportRequest::get(PROFILE_PATH))
            .await?;
        let profile = parse_profile(value)?;

        self.update_if_current(epoch, |s| {
            s.user = Some(profile.clone());
            s.state = SessionState::Authenticated;
        });
        Ok(profile)
    }

    /// Re-fetch the profile and replace it wholesale
    pub async fn reload_profile(&self) -> Result<UserProfile> {
        self.load_profile(self.epoch()).await
    }

    /// Single profile fetch with a given token, no recovery
    async fn fetch_profile(&self, access_token: &str) -> Result<UserProfile> {
        let request = TransportRequest::get(PROFILE_PATH)
            .with_header("Authorization", token::authorization_value(access_token)?);
        let value = self.inner.transport.send(request).await.into_result()?;
        parse_profile(value)
    }

    /// Converge on what another context persisted, without refreshing
    async fn resync(&self, hint: Option<BroadcastMessage>) {
        let epoch = self.epoch();
        let record = match CredentialRecord::load(self.inner.store.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Resync skipped, credential store unreadable: {}", e);
                return;
            }
        };
        let current = self.snapshot();

        let record = match record {
            Some(record) => record,
            None => {
                if current.access_token.is_some() || current.state != SessionState::Unauthenticated {
                    tracing::info!(context = %self.context_id(), "Session cleared by another context");
                    self.reset_local();
                }
                return;
            }
        };

        if current.access_token.as_deref() == Some(record.access_token.as_str()) {
            if current.refresh_token != record.refresh_token {
                self.sync_refresh_token(epoch, &record);
            }
            return;
        }

        if self.same_subject(&current, &record.access_token, hint.as_ref()) {
            tracing::debug!(context = %self.context_id(), "Adopting token refreshed by another context");
            self.adopt_remote_token(epoch, &record);
            return;
        }

        let epoch = {
            let _guard = self.lock_transition();
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.session.send_replace(Session {
                access_token: Some(record.access_token.clone()),
                refresh_token: record.refresh_token.clone(),
                user: None,
                state: SessionState::Authenticating,
            });
            epoch
        };
        tracing::info!(context = %self.context_id(), "New session from another context, validating");

        match self.fetch_profile(&record.access_token).await {
            Ok(profile) => {
                self.update_if_current(epoch, |s| {
                    s.user = Some(profile);
                    s.state = SessionState::Authenticated;
                });
            }
            Err(e) => {
                tracing::warn!("Could not validate session from another context: {}", e);
                self.update_if_current(epoch, |s| {
                    s.user = None;
                    s.state = SessionState::Unauthenticated;
                });
            }
        }
    }

    /// Take over the refresh token another context rotated, if the session is still `epoch`
    fn sync_refresh_token(&self, epoch: u64, record: &CredentialRecord) -> bool {
        self.update_if_current(epoch, |s| s.refresh_token = record.refresh_token.clone())
    }

    /// Take over a token another context refreshed for the same user, if the session is still `epoch`
    fn adopt_remote_token(&self, epoch: u64, record: &CredentialRecord) -> bool {
        self.update_if_current(epoch, |s| {
            s.access_token = Some(record.access_token.clone());
            s.refresh_token = record.refresh_token.clone();
            if s.state == SessionState::Expired && s.user.is_some() {
                s.state = SessionState::Authenticated;
            }
        })
    }

    /// Whether `new_token` belongs to the user this session already holds
    fn same_subject(&self, current: &Session, new_token: &str, hint: Option<&BroadcastMessage>) -> bool {
        let current_subject = match current.subject_id() {
            Some(subject) => subject,
            None => return false,
        };
        if !matches!(
            current.state,
            SessionState::Authenticated | SessionState::Refreshing | SessionState::Expired
        ) {
            return false;
        }

        if let Some(message) = hint {
            if message.kind == BroadcastKind::Refresh
                && message.subject_id.as_deref() == Some(current_subject)
            {
                return true;
            }
        }

        matches!(
            token::claims(new_token),
            Ok(Some(ref claims)) if claims.subject.as_deref() == Some(current_subject)
        )
    }

    fn spawn_sync_listener(&self) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No runtime available, cross-context sync disabled");
                return None;
            }
        };

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let mut store_changes = self.inner.store.subscribe();
        let mut broadcasts = self.inner.channel.subscribe();
        let context = self.context_id();

        Some(handle.spawn(async move {
            loop {
                let hint = tokio::select! {
                    change = store_changes.recv() => match change {
                        Some(Notification::Event(change)) if !change.touches_token() => continue,
                        Some(_) => None,
                        None => break,
                    },
                    message = broadcasts.recv() => match message {
                        Some(Notification::Event(message)) => Some(message),
                        Some(Notification::Missed(skipped)) => {
                            tracing::debug!(context = %context, skipped = skipped, "Missed broadcasts, resyncing");
                            None
                        }
                        None => break,
                    },
                };

                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                SessionManager { inner }.resync(hint).await;
            }
            tracing::debug!(context = %context, "Sync listener stopped");
        }))
    }

    /// End the session everywhere, unless it already changed identity since `epoch`
    fn force_logout(&self, epoch: u64, reason: &str) {
        if self.epoch() != epoch {
            tracing::debug!("Skipping forced logout ({}), session already replaced", reason);
            return;
        }
        tracing::warn!("Forcing logout: {}", reason);
        let subject = self.snapshot().subject_id().map(str::to_string);
        self.clear_session(subject);
    }

    fn clear_session(&self, subject_id: Option<String>) {
        {
            let _guard = self.lock_transition();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.inner.store.clear() {
                tracing::error!("Failed to clear credential store: {}", e);
            }
            self.inner.session.send_replace(Session::default());
        }
        self.inner
            .channel
            .post(BroadcastMessage::new(BroadcastKind::Logout, subject_id));
    }

    /// Drop to `Unauthenticated` locally without touching the store or other contexts
    fn reset_local(&self) {
        let _guard = self.lock_transition();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.session.send_replace(Session::default());
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.inner
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` only if the session identity is still `epoch`
    fn update_if_current<F>(&self, epoch: u64, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        let _guard = self.lock_transition();
        if self.epoch() != epoch {
            return false;
        }
        self.inner.session.send_modify(f);
        true
    }

    /// A protected call just succeeded; an `Expired` session with a profile is usable again
    fn mark_usable(&self, epoch: u64) {
        if self.state() != SessionState::Expired {
            return;
        }
        self.update_if_current(epoch, |s| {
            if s.state == SessionState::Expired && s.user.is_some() {
                s.state = SessionState::Authenticated;
            }
        });
    }
}

fn parse_profile(value: Value) -> Result<UserProfile> {
    serde_json::from_value(value)
        .map_err(|e| SessionError::Internal(format!("Malformed profile response: {}", e)))
}
