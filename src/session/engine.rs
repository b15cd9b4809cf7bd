use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{
    decode_claims,
    services::{is_valid_email, normalize_email},
    AuthGrant, BackendFailure, LoginRequest, RefreshGrant, RegisterRequest, SessionSnapshot,
    SessionSource, UserRecord,
};
use crate::profile::{OnProfileChanged, ProfileSubscription};
use crate::provider::{ProviderEvent, ProviderSession, SessionHandlerId};
use crate::state::SessionDeps;

use super::{SessionError, SessionPhase, SessionState};

/// Owner of the current user.
///
/// Startup arbitration, provider events, profile notifications and the
/// login/logout commands all funnel through one gate, so at most one of them
/// talks to the network at a time. Every identity-changing trigger bumps a
/// generation counter; a run whose generation is no longer current when it
/// finishes publishes nothing.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

struct Inner {
    deps: SessionDeps,
    published: watch::Sender<SessionState>,
    gate: AsyncMutex<()>,
    ledger: Mutex<Ledger>,
    events: mpsc::UnboundedSender<EngineEvent>,
    driver: Mutex<Option<JoinHandle<()>>>,
    provider_handler: SessionHandlerId,
}

#[derive(Default)]
struct Ledger {
    generation: u64,
    logouts: u64,
    torn_down: bool,
    session: Option<SessionSnapshot>,
    subscription: Option<ActiveSubscription>,
}

struct ActiveSubscription {
    user_id: String,
    handle: Box<dyn ProfileSubscription>,
}

impl Ledger {
    /// Closes the profile channel unless it already watches `keep_for`.
    fn release_subscription(&mut self, keep_for: Option<&str>) {
        if let (Some(active), Some(user_id)) = (&self.subscription, keep_for) {
            if active.user_id == user_id {
                return;
            }
        }
        if let Some(mut active) = self.subscription.take() {
            active.handle.unsubscribe();
            debug!(user_id = %active.user_id, "profile channel released");
        }
    }

    fn watches(&self, user_id: &str) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|active| active.user_id == user_id)
    }

    fn holds(&self, generation: u64) -> bool {
        !self.torn_down && self.generation == generation
    }
}

enum EngineEvent {
    Provider(ProviderEvent),
    ProfileChanged(String),
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Startup,
    ProviderSignedIn,
    ProviderSignedOut,
}

enum Arbitration {
    /// Provider session wins; persist it and watch its profile.
    Provider(SessionSnapshot),
    /// Stored backend session with a live access credential.
    Stored(SessionSnapshot),
    /// Stored backend session revived by a refresh.
    Refreshed {
        snapshot: SessionSnapshot,
        grant: RefreshGrant,
    },
    /// Nothing usable. `clear_store` drops whatever was persisted.
    SignedOut { clear_store: bool },
}

impl SessionEngine {
    /// Runs startup arbitration and starts listening to provider events.
    pub async fn start(deps: SessionDeps) -> Self {
        let (published, _) = watch::channel(SessionState::default());
        let (events, queue) = mpsc::unbounded_channel();

        let sink = events.clone();
        let provider_handler = deps.provider.on_session_change(Arc::new(move |event| {
            // fails only once the engine is gone
            let _ = sink.send(EngineEvent::Provider(event));
        }));

        let engine = Self {
            inner: Arc::new(Inner {
                deps,
                published,
                gate: AsyncMutex::new(()),
                ledger: Mutex::new(Ledger::default()),
                events,
                driver: Mutex::new(None),
                provider_handler,
            }),
        };
        let driver = tokio::spawn(drive(Arc::downgrade(&engine.inner), queue));
        *engine
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(driver);

        engine.reconcile(Trigger::Startup).await;
        engine
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.published.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.published.borrow().clone()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.inner.published.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.published.borrow().is_loading()
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<UserRecord, SessionError> {
        let request = LoginRequest {
            email: normalize_email(email),
            password: password.to_string(),
        };
        if !is_valid_email(&request.email) {
            warn!(email = %request.email, "invalid email");
            return Err(SessionError::Validation("Invalid email".into()));
        }
        if request.password.is_empty() {
            return Err(SessionError::Validation("Password is required".into()));
        }

        let (logouts, _gate) = self.begin_command().await?;
        let grant = self.inner.deps.backend.login(&request).await?;
        self.adopt_backend_grant(logouts, grant)
    }

    #[instrument(skip(self, details), fields(email = %details.email))]
    pub async fn register(&self, mut details: RegisterRequest) -> Result<UserRecord, SessionError> {
        details.email = normalize_email(&details.email);
        details.display_name = details.display_name.trim().to_string();
        if !is_valid_email(&details.email) {
            warn!(email = %details.email, "invalid email");
            return Err(SessionError::Validation("Invalid email".into()));
        }
        if details.password.len() < 8 {
            warn!("password too short");
            return Err(SessionError::Validation("Password too short".into()));
        }
        if details.display_name.is_empty() {
            return Err(SessionError::Validation("Display name is required".into()));
        }

        let (logouts, _gate) = self.begin_command().await?;
        let grant = self.inner.deps.backend.register(&details).await?;
        self.adopt_backend_grant(logouts, grant)
    }

    /// Opens the provider's sign-in flow. The session itself arrives later as
    /// a provider event.
    pub async fn login_with_provider(&self) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.inner.deps.provider.start_sign_in().await?;
        debug!("federated sign-in started");
        Ok(())
    }

    /// Clears the local session, then signs out of the provider. Local state
    /// is gone even when the remote call fails.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        {
            let mut ledger = self.ledger();
            ledger.logouts += 1;
            self.end_session(&mut ledger);
        }
        info!("signed out locally");

        if let Err(e) = self.inner.deps.provider.sign_out().await {
            warn!(error = %e, "remote sign-out failed; local session already cleared");
        }
    }

    /// Re-reads the authoritative profile of the current user.
    pub async fn refresh_profile(&self) -> Result<UserRecord, SessionError> {
        self.reconcile_profile(None)
            .await?
            .ok_or(SessionError::NotAuthenticated)
    }

    /// An access credential that is safe to send. An expired backend
    /// credential is refreshed first; an expired provider credential is
    /// re-read from the provider.
    pub async fn valid_access_credential(&self) -> Result<String, SessionError> {
        let _gate = self.inner.gate.lock().await;
        let (generation, snapshot) = {
            let ledger = self.ledger();
            if ledger.torn_down {
                return Err(SessionError::TornDown);
            }
            match &ledger.session {
                Some(snapshot) => (ledger.generation, snapshot.clone()),
                None => return Err(SessionError::NotAuthenticated),
            }
        };
        match snapshot.source {
            SessionSource::Provider => self.live_provider_access(generation, &snapshot).await,
            SessionSource::Backend => self.live_backend_access(generation, &snapshot).await,
        }
    }

    /// Stops the event driver and closes the profile channel. Commands issued
    /// afterwards fail with [`SessionError::TornDown`].
    pub fn shutdown(&self) {
        {
            let mut ledger = self.ledger();
            if ledger.torn_down {
                return;
            }
            ledger.torn_down = true;
            ledger.generation += 1;
            ledger.release_subscription(None);
        }
        self.inner
            .deps
            .provider
            .remove_session_handler(self.inner.provider_handler);
        if let Some(driver) = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
        info!("session engine shut down");
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.inner.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.ledger().torn_down {
            Err(SessionError::TornDown)
        } else {
            Ok(())
        }
    }

    fn publish(&self, ledger: &Ledger, phase: SessionPhase) {
        let state = SessionState {
            phase,
            user: ledger.session.as_ref().map(|s| s.user.clone()),
            source: ledger.session.as_ref().map(|s| s.source),
        };
        self.inner.published.send_replace(state);
    }

    /// Drops the current session everywhere and publishes `Unauthenticated`.
    /// Bumps the generation so in-flight runs publish nothing.
    fn end_session(&self, ledger: &mut Ledger) {
        ledger.generation += 1;
        if let Err(e) = self.inner.deps.store.clear() {
            error!(error = %e, "failed to clear stored session");
        }
        ledger.release_subscription(None);
        ledger.session = None;
        self.publish(ledger, SessionPhase::Unauthenticated);
    }

    fn normalize(&self, user: UserRecord) -> UserRecord {
        user.with_role_override(&self.inner.deps.config.superuser_email)
    }

    fn access_is_live(&self, access: &str) -> bool {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let skew = self.inner.deps.config.expiry_skew_secs;
        decode_claims(access).is_some_and(|claims| claims.is_live_at(now, skew))
    }

    async fn begin_command(&self) -> Result<(u64, AsyncMutexGuard<'_, ()>), SessionError> {
        let gate = self.inner.gate.lock().await;
        let ledger = self.ledger();
        if ledger.torn_down {
            return Err(SessionError::TornDown);
        }
        Ok((ledger.logouts, gate))
    }

    fn adopt_backend_grant(&self, logouts: u64, grant: AuthGrant) -> Result<UserRecord, SessionError> {
        let user = self.normalize(grant.user);
        let snapshot = SessionSnapshot::new(user, grant.credentials, SessionSource::Backend);

        let mut ledger = self.ledger();
        if ledger.torn_down {
            return Err(SessionError::TornDown);
        }
        if ledger.logouts != logouts {
            info!("sign-in completed after logout; discarding it");
            return Err(SessionError::Superseded);
        }
        if let Err(e) = self.inner.deps.store.save(&snapshot) {
            error!(error = %e, "failed to persist session; it will not survive a restart");
        }
        ledger.release_subscription(None);
        let user = snapshot.user.clone();
        ledger.session = Some(snapshot);
        self.publish(&ledger, SessionPhase::Authenticated);
        info!(user_id = %user.id, role = ?user.role, "signed in with backend credentials");
        Ok(user)
    }

    #[instrument(skip(self))]
    async fn reconcile(&self, trigger: Trigger) {
        let generation = {
            let mut ledger = self.ledger();
            if ledger.torn_down {
                return;
            }
            ledger.generation += 1;
            ledger.generation
        };

        let _gate = self.inner.gate.lock().await;
        {
            let ledger = self.ledger();
            if !ledger.holds(generation) {
                debug!(generation, "arbitration superseded before it started");
                return;
            }
            self.publish(&ledger, SessionPhase::Arbitrating);
        }

        let outcome = self.arbitrate().await;
        if let Some(user_id) = self.commit_arbitration(generation, outcome) {
            self.watch_profile(generation, user_id).await;
        }
    }

    async fn arbitrate(&self) -> Arbitration {
        let deps = &self.inner.deps;

        let provider_reachable = match deps.provider.current_session().await {
            Ok(Some(session)) => {
                let profile = match deps.provider.fetch_profile(&session.user_id).await {
                    Ok(profile) => profile,
                    Err(e) => {
                        warn!(user_id = %session.user_id, error = %e, "profile fetch failed; using session metadata");
                        None
                    }
                };
                let user = self.normalize(session.to_user_record(profile.as_ref()));
                return Arbitration::Provider(SessionSnapshot::new(
                    user,
                    session.credentials(),
                    SessionSource::Provider,
                ));
            }
            Ok(None) => {
                debug!("no identity-provider session");
                true
            }
            Err(e) => {
                warn!(error = %e, "identity-provider session query failed; checking stored session");
                false
            }
        };

        let Some(mut snapshot) = deps.store.load() else {
            return Arbitration::SignedOut { clear_store: true };
        };

        if snapshot.source == SessionSource::Provider {
            // provider credentials are never sent to the backend
            if provider_reachable {
                info!(user_id = %snapshot.user.id, "provider session ended; dropping its snapshot");
            }
            return Arbitration::SignedOut {
                clear_store: provider_reachable,
            };
        }

        snapshot.user.apply_role_override(&deps.config.superuser_email);
        if self.access_is_live(&snapshot.credentials.access) {
            debug!(user_id = %snapshot.user.id, "stored access credential still valid");
            return Arbitration::Stored(snapshot);
        }

        debug!(user_id = %snapshot.user.id, "stored access credential expired; refreshing");
        match deps.backend.refresh(&snapshot.credentials.refresh).await {
            Ok(grant) => Arbitration::Refreshed { snapshot, grant },
            // only a server rejection ends the session; an unreachable backend
            // keeps the record for the next start
            Err(BackendFailure::Network(reason)) => {
                warn!(%reason, "backend unreachable; keeping stored session for a later start");
                Arbitration::SignedOut { clear_store: false }
            }
            Err(failure) => {
                info!(reason = %failure, "refresh credential rejected; discarding stored session");
                Arbitration::SignedOut { clear_store: true }
            }
        }
    }

    /// Applies an arbitration result if it is still current. Returns the user
    /// whose profile channel should be opened.
    fn commit_arbitration(&self, generation: u64, outcome: Arbitration) -> Option<String> {
        let store = &self.inner.deps.store;
        let mut ledger = self.ledger();
        if !ledger.holds(generation) {
            debug!(generation, "discarding superseded arbitration result");
            return None;
        }

        match outcome {
            Arbitration::Provider(snapshot) => {
                if let Err(e) = store.save(&snapshot) {
                    error!(error = %e, "failed to persist provider session");
                }
                let user_id = snapshot.user.id.clone();
                ledger.release_subscription(Some(user_id.as_str()));
                let needs_channel = !ledger.watches(&user_id);
                ledger.session = Some(snapshot);
                self.publish(&ledger, SessionPhase::Authenticated);
                info!(%user_id, source = "provider", "authenticated");
                needs_channel.then_some(user_id)
            }
            Arbitration::Stored(snapshot) => {
                info!(user_id = %snapshot.user.id, source = "backend", "authenticated from stored session");
                ledger.release_subscription(None);
                ledger.session = Some(snapshot);
                self.publish(&ledger, SessionPhase::Authenticated);
                None
            }
            Arbitration::Refreshed { mut snapshot, grant } => {
                snapshot.set_access_credential(&grant.access_credential);
                if let Err(e) = store.update_access_credential(&grant.access_credential) {
                    error!(error = %e, "failed to persist refreshed access credential");
                }
                if let Some(refresh) = &grant.rotated_refresh {
                    snapshot.set_refresh_credential(refresh);
                    if let Err(e) = store.update_refresh_credential(refresh) {
                        error!(error = %e, "failed to persist rotated refresh credential");
                    }
                }
                info!(user_id = %snapshot.user.id, source = "backend", "authenticated after refresh");
                ledger.release_subscription(None);
                ledger.session = Some(snapshot);
                self.publish(&ledger, SessionPhase::Authenticated);
                None
            }
            Arbitration::SignedOut { clear_store } => {
                if clear_store {
                    if let Err(e) = store.clear() {
                        error!(error = %e, "failed to clear stored session");
                    }
                }
                ledger.release_subscription(None);
                ledger.session = None;
                self.publish(&ledger, SessionPhase::Unauthenticated);
                info!("unauthenticated");
                None
            }
        }
    }

    async fn watch_profile(&self, generation: u64, user_id: String) {
        let sink = self.inner.events.clone();
        let changed = user_id.clone();
        let on_changed: OnProfileChanged = Arc::new(move || {
            let _ = sink.send(EngineEvent::ProfileChanged(changed.clone()));
        });

        let mut handle = match self.inner.deps.profiles.subscribe(&user_id, on_changed).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%user_id, error = %e, "live profile updates unavailable");
                return;
            }
        };

        let mut ledger = self.ledger();
        let still_signed_in = ledger.holds(generation)
            && ledger
                .session
                .as_ref()
                .is_some_and(|s| s.user.id == user_id);
        if !still_signed_in {
            handle.unsubscribe();
            return;
        }
        ledger.release_subscription(None);
        debug!(%user_id, "watching profile changes");
        ledger.subscription = Some(ActiveSubscription { user_id, handle });
    }

    /// Profile re-fetch. With `expected` set, only runs if that user is still
    /// the signed-in one.
    async fn reconcile_profile(&self, expected: Option<&str>) -> Result<Option<UserRecord>, SessionError> {
        let _gate = self.inner.gate.lock().await;
        let (generation, snapshot) = {
            let ledger = self.ledger();
            if ledger.torn_down {
                return Err(SessionError::TornDown);
            }
            let snapshot = match (&ledger.session, expected) {
                (Some(s), Some(id)) if s.user.id != id => {
                    debug!(user_id = id, "profile notification for a previous user ignored");
                    return Ok(None);
                }
                (Some(s), _) => s.clone(),
                (None, Some(_)) => return Ok(None),
                (None, None) => return Err(SessionError::NotAuthenticated),
            };
            self.publish(&ledger, SessionPhase::Reconciling);
            (ledger.generation, snapshot)
        };

        let fetched = match snapshot.source {
            SessionSource::Provider => self
                .inner
                .deps
                .provider
                .fetch_profile(&snapshot.user.id)
                .await
                .map(|profile| profile.map(|p| p.merge_into(&snapshot.user)))
                .map_err(SessionError::from),
            SessionSource::Backend => match self.live_backend_access(generation, &snapshot).await {
                Ok(access) => self
                    .inner
                    .deps
                    .backend
                    .me(&access)
                    .await
                    .map(Some)
                    .map_err(SessionError::from),
                Err(e) => Err(e),
            },
        };

        self.commit_profile(generation, &snapshot.user.id, fetched)
    }

    fn commit_profile(
        &self,
        generation: u64,
        user_id: &str,
        fetched: Result<Option<UserRecord>, SessionError>,
    ) -> Result<Option<UserRecord>, SessionError> {
        let superuser = self.inner.deps.config.superuser_email.clone();
        let mut ledger = self.ledger();
        let current = ledger.holds(generation);

        let fresh = match fetched {
            Ok(fresh) => fresh,
            Err(e) => {
                // last known-good record stays published
                if current && ledger.session.is_some() {
                    self.publish(&ledger, SessionPhase::Authenticated);
                }
                return Err(e);
            }
        };

        let Some(session) = ledger
            .session
            .as_mut()
            .filter(|s| current && s.user.id == user_id)
        else {
            debug!(%user_id, "profile result superseded");
            return Err(SessionError::Superseded);
        };

        match fresh {
            Some(fresh) => {
                session.user = UserRecord {
                    id: session.user.id.clone(),
                    email: session.user.email.clone(),
                    access_credential: session.user.access_credential.clone(),
                    ..fresh
                }
                .with_role_override(&superuser);
                if let Err(e) = self.inner.deps.store.save(session) {
                    error!(error = %e, "failed to persist refreshed profile");
                }
                debug!(%user_id, role = ?session.user.role, "profile refreshed");
            }
            None => debug!(%user_id, "no profile row; keeping current record"),
        }
        let user = session.user.clone();
        self.publish(&ledger, SessionPhase::Authenticated);
        Ok(Some(user))
    }

    /// Returns the backend access credential, refreshing it first when its
    /// embedded expiry has passed. A rejected refresh signs the user out.
    async fn live_backend_access(
        &self,
        generation: u64,
        snapshot: &SessionSnapshot,
    ) -> Result<String, SessionError> {
        if self.access_is_live(&snapshot.credentials.access) {
            return Ok(snapshot.credentials.access.clone());
        }

        {
            let ledger = self.ledger();
            if ledger.holds(generation) {
                self.publish(&ledger, SessionPhase::Refreshing);
            }
        }
        let outcome = self
            .inner
            .deps
            .backend
            .refresh(&snapshot.credentials.refresh)
            .await;

        let store = &self.inner.deps.store;
        let mut ledger = self.ledger();
        if !ledger.holds(generation) {
            return Err(SessionError::Superseded);
        }

        match outcome {
            Ok(grant) => {
                if let Some(session) = ledger.session.as_mut() {
                    session.set_access_credential(&grant.access_credential);
                    if let Some(refresh) = &grant.rotated_refresh {
                        session.set_refresh_credential(refresh);
                    }
                }
                if let Err(e) = store.update_access_credential(&grant.access_credential) {
                    error!(error = %e, "failed to persist refreshed access credential");
                }
                if let Some(refresh) = &grant.rotated_refresh {
                    if let Err(e) = store.update_refresh_credential(refresh) {
                        error!(error = %e, "failed to persist rotated refresh credential");
                    }
                }
                self.publish(&ledger, SessionPhase::Authenticated);
                debug!(user_id = %snapshot.user.id, "access credential refreshed");
                Ok(grant.access_credential)
            }
            Err(BackendFailure::Network(reason)) => {
                self.publish(&ledger, SessionPhase::Authenticated);
                Err(SessionError::Transport(reason))
            }
            Err(failure) => {
                info!(reason = %failure, user_id = %snapshot.user.id, "refresh credential rejected; signing out");
                self.end_session(&mut ledger);
                Err(SessionError::ExpiredRefresh)
            }
        }
    }

    /// Returns the provider access credential. Once its embedded expiry has
    /// passed the provider is asked for its current session; a vanished
    /// session signs the user out.
    async fn live_provider_access(
        &self,
        generation: u64,
        snapshot: &SessionSnapshot,
    ) -> Result<String, SessionError> {
        if self.access_is_live(&snapshot.credentials.access) {
            return Ok(snapshot.credentials.access.clone());
        }

        debug!(user_id = %snapshot.user.id, "provider access credential expired; re-reading provider session");
        let current = self.inner.deps.provider.current_session().await?;

        let mut ledger = self.ledger();
        if !ledger.holds(generation) {
            return Err(SessionError::Superseded);
        }
        match current {
            None => {
                info!(user_id = %snapshot.user.id, "provider session ended; signing out");
                self.end_session(&mut ledger);
                Err(SessionError::ExpiredRefresh)
            }
            Some(session) if session.user_id != snapshot.user.id => {
                // the sign-in event for the new identity re-arbitrates
                debug!(user_id = %session.user_id, "provider identity changed");
                Err(SessionError::Superseded)
            }
            Some(session) if !self.access_is_live(&session.access_token) => {
                warn!(user_id = %session.user_id, "provider has no fresh access credential yet");
                Err(SessionError::Provider(
                    "access credential expired and was not renewed".into(),
                ))
            }
            Some(session) => {
                self.apply_provider_token(&mut ledger, &session);
                Ok(session.access_token)
            }
        }
    }

    fn apply_provider_token(&self, ledger: &mut Ledger, session: &ProviderSession) {
        let Some(current) = ledger.session.as_mut().filter(|s| {
            s.source == SessionSource::Provider && s.user.id == session.user_id
        }) else {
            debug!(user_id = %session.user_id, "token refresh for an inactive identity ignored");
            return;
        };

        current.set_access_credential(&session.access_token);
        current.set_refresh_credential(&session.refresh_token);
        if let Err(e) = self.inner.deps.store.save(current) {
            error!(error = %e, "failed to persist provider credential");
        }
        debug!(user_id = %session.user_id, "provider credential refreshed");
        let phase = self.inner.published.borrow().phase;
        self.publish(ledger, phase);
    }

    async fn dispatch(&self, batch: Vec<EngineEvent>) {
        // queued sign-in/sign-out events collapse into one arbitration
        let mut trigger = None;
        let mut changed_profiles: Vec<String> = Vec::new();
        for event in batch {
            match event {
                EngineEvent::Provider(ProviderEvent::SignedIn(_)) => {
                    trigger = Some(Trigger::ProviderSignedIn)
                }
                EngineEvent::Provider(ProviderEvent::SignedOut) => {
                    trigger = Some(Trigger::ProviderSignedOut)
                }
                EngineEvent::Provider(ProviderEvent::TokenRefreshed(session)) => {
                    self.apply_provider_token(&mut self.ledger(), &session)
                }
                EngineEvent::ProfileChanged(user_id) => {
                    if !changed_profiles.contains(&user_id) {
                        changed_profiles.push(user_id);
                    }
                }
            }
        }

        if let Some(trigger) = trigger {
            self.reconcile(trigger).await;
        }
        for user_id in changed_profiles {
            if let Err(e) = self.reconcile_profile(Some(&user_id)).await {
                warn!(%user_id, error = %e, "profile re-fetch failed; keeping last known record");
            }
        }
    }
}

async fn drive(engine: Weak<Inner>, mut queue: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(first) = queue.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = queue.try_recv() {
            batch.push(next);
        }
        let Some(inner) = engine.upgrade() else {
            break;
        };
        SessionEngine { inner }.dispatch(batch).await;
    }
    debug!("session event driver stopped");
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(driver) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
        self.deps.provider.remove_session_handler(self.provider_handler);
        self.ledger
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .release_subscription(None);
    }
}
