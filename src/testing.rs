//! Scripted collaborators for engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::auth::{
    ApprovalStatus, AuthGrant, BackendAuth, BackendFailure, CredentialPair, LoginRequest,
    RefreshGrant, RegisterRequest, Role, SessionSnapshot, SessionSource, UserRecord,
};
use crate::config::SessionConfig;
use crate::profile::ProfileFeed;
use crate::provider::{
    IdentityProvider, ProfileRecord, ProviderError, ProviderEvent, ProviderSession,
    SessionChangeHandler, SessionHandlerId,
};
use crate::session::{SessionEngine, SessionState};
use crate::state::SessionDeps;
use crate::storage::MemorySessionStore;

pub(crate) const SUPERUSER: &str = "admin@learnhub.dev";

/// Access token for `sub` expiring `ttl_secs` from now (negative is expired).
pub(crate) fn mint_token(sub: &str, ttl_secs: i64) -> String {
    let exp = OffsetDateTime::now_utc().unix_timestamp() + ttl_secs;
    encode(
        &Header::default(),
        &json!({ "sub": sub, "exp": exp, "kind": "access" }),
        &EncodingKey::from_secret(b"unit-test-secret"),
    )
    .expect("sign token")
}

pub(crate) fn user(id: &str, email: &str, role: Role) -> UserRecord {
    UserRecord {
        id: id.into(),
        email: email.into(),
        display_name: email.split('@').next().unwrap_or_default().into(),
        role,
        approval_status: ApprovalStatus::Approved,
        is_active: true,
        profile_picture: None,
        access_credential: String::new(),
    }
}

pub(crate) fn backend_snapshot(user: UserRecord, access: String, refresh: &str) -> SessionSnapshot {
    SessionSnapshot::new(
        user,
        CredentialPair {
            access,
            refresh: refresh.into(),
        },
        SessionSource::Backend,
    )
}

pub(crate) fn grant(user: UserRecord, access: String, refresh: &str) -> AuthGrant {
    AuthGrant {
        user,
        credentials: CredentialPair {
            access,
            refresh: refresh.into(),
        },
    }
}

pub(crate) fn provider_session(id: &str, email: &str) -> ProviderSession {
    ProviderSession {
        user_id: id.into(),
        email: email.into(),
        access_token: mint_token(id, 3600),
        refresh_token: format!("{id}-refresh"),
        display_name: None,
        avatar_url: None,
    }
}

pub(crate) fn profile(id: &str, role: Role) -> ProfileRecord {
    ProfileRecord {
        id: id.into(),
        display_name: Some(format!("Profile {id}")),
        role,
        approval_status: ApprovalStatus::Approved,
        is_active: true,
        profile_picture: None,
    }
}

/// Backend whose answers are set by the test. Unset answers are rejections.
pub(crate) struct FakeBackend {
    pub login_result: Mutex<Result<AuthGrant, BackendFailure>>,
    pub refresh_result: Mutex<Result<RefreshGrant, BackendFailure>>,
    pub me_result: Mutex<Result<UserRecord, BackendFailure>>,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
    login_hold: Mutex<Option<oneshot::Receiver<()>>>,
    refresh_hold: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        let unset = || BackendFailure::ServerRejected("not scripted".into());
        Self {
            login_result: Mutex::new(Err(unset())),
            refresh_result: Mutex::new(Err(unset())),
            me_result: Mutex::new(Err(unset())),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            login_hold: Mutex::new(None),
            refresh_hold: Mutex::new(None),
        }
    }
}

impl FakeBackend {
    pub fn set_login(&self, result: Result<AuthGrant, BackendFailure>) {
        *self.login_result.lock().unwrap() = result;
    }

    pub fn set_refresh(&self, result: Result<RefreshGrant, BackendFailure>) {
        *self.refresh_result.lock().unwrap() = result;
    }

    pub fn set_me(&self, result: Result<UserRecord, BackendFailure>) {
        *self.me_result.lock().unwrap() = result;
    }

    /// Next login or registration answers only once the returned sender fires.
    pub fn hold_login(&self) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        *self.login_hold.lock().unwrap() = Some(held);
        release
    }

    /// Next refresh answers only once the returned sender fires.
    pub fn hold_refresh(&self) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        *self.refresh_hold.lock().unwrap() = Some(held);
        release
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAuth for FakeBackend {
    async fn register(&self, _details: &RegisterRequest) -> Result<AuthGrant, BackendFailure> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        released(&self.login_hold).await;
        self.login_result.lock().unwrap().clone()
    }

    async fn login(&self, _request: &LoginRequest) -> Result<AuthGrant, BackendFailure> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        released(&self.login_hold).await;
        self.login_result.lock().unwrap().clone()
    }

    async fn refresh(&self, _refresh_credential: &str) -> Result<RefreshGrant, BackendFailure> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        released(&self.refresh_hold).await;
        self.refresh_result.lock().unwrap().clone()
    }

    async fn me(&self, _access_credential: &str) -> Result<UserRecord, BackendFailure> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        self.me_result.lock().unwrap().clone()
    }
}

async fn released(hold: &Mutex<Option<oneshot::Receiver<()>>>) {
    let held = hold.lock().unwrap().take();
    if let Some(held) = held {
        let _ = held.await;
    }
}

struct ScriptedQuery {
    release: Option<oneshot::Receiver<()>>,
    answer: Option<ProviderSession>,
}

/// Provider whose session queries can be scripted and held open.
#[derive(Default)]
pub(crate) struct FakeProvider {
    script: Mutex<VecDeque<ScriptedQuery>>,
    session: Mutex<Option<ProviderSession>>,
    profiles: Mutex<HashMap<String, ProfileRecord>>,
    handlers: Mutex<Vec<(SessionHandlerId, SessionChangeHandler)>>,
    next_handler: AtomicUsize,
    pub fail_sign_out: AtomicBool,
    pub fail_profile: AtomicBool,
    pub queries: AtomicUsize,
    pub profile_fetches: AtomicUsize,
    pub sign_outs: AtomicUsize,
}

impl FakeProvider {
    pub fn set_session(&self, session: Option<ProviderSession>) {
        *self.session.lock().unwrap() = session;
    }

    pub fn put_profile(&self, profile: ProfileRecord) {
        self.profiles.lock().unwrap().insert(profile.id.clone(), profile);
    }

    /// Next query answers `answer`, after `release` fires if given.
    pub fn script(&self, answer: Option<ProviderSession>, release: Option<oneshot::Receiver<()>>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedQuery { release, answer });
    }

    pub fn emit(&self, event: ProviderEvent) {
        let handlers = self.handlers.lock().unwrap().clone();
        for (_, handler) in handlers {
            handler(event.clone());
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn current_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(ScriptedQuery { release, answer }) => {
                if let Some(release) = release {
                    let _ = release.await;
                }
                Ok(answer)
            }
            None => Ok(self.session.lock().unwrap().clone()),
        }
    }

    fn on_session_change(&self, handler: SessionChangeHandler) -> SessionHandlerId {
        let id = SessionHandlerId(self.next_handler.fetch_add(1, Ordering::SeqCst) as u64);
        self.handlers.lock().unwrap().push((id, handler));
        id
    }

    fn remove_session_handler(&self, id: SessionHandlerId) {
        self.handlers.lock().unwrap().retain(|(registered, _)| *registered != id);
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>, ProviderError> {
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_profile.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("profile service down".into()));
        }
        Ok(self.profiles.lock().unwrap().get(user_id).cloned())
    }

    async fn start_sign_in(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("offline".into()));
        }
        *self.session.lock().unwrap() = None;
        Ok(())
    }
}

/// Everything an engine test pokes at.
pub(crate) struct Harness {
    pub backend: Arc<FakeBackend>,
    pub provider: Arc<FakeProvider>,
    pub feed: ProfileFeed,
    pub store: Arc<MemorySessionStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(FakeBackend::default()),
            provider: Arc::new(FakeProvider::default()),
            feed: ProfileFeed::new(),
            store: Arc::new(MemorySessionStore::new()),
        }
    }

    pub fn with_store(store: MemorySessionStore) -> Self {
        Self {
            store: Arc::new(store),
            ..Self::new()
        }
    }

    pub fn deps(&self) -> SessionDeps {
        let mut config = SessionConfig::new("http://backend.test");
        config.superuser_email = SUPERUSER.into();
        SessionDeps::from_parts(
            config,
            self.backend.clone(),
            self.provider.clone(),
            Arc::new(self.feed.clone()),
            self.store.clone(),
        )
    }

    pub async fn start(&self) -> SessionEngine {
        SessionEngine::start(self.deps()).await
    }
}

/// Waits until the published state satisfies `pred`.
pub(crate) async fn wait_for(
    engine: &SessionEngine,
    pred: impl Fn(&SessionState) -> bool,
) -> SessionState {
    let mut rx = engine.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("engine dropped")
        .clone();
    state
}

/// Polls `cond` until it holds.
pub(crate) async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
