use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use async_trait::async_trait;
use tracing::debug;

use super::{
    IdentityProvider, ProfileRecord, ProviderError, ProviderEvent, ProviderSession,
    SessionChangeHandler, SessionHandlerId,
};

type SignInLauncher = Arc<dyn Fn() -> Result<(), ProviderError> + Send + Sync>;

/// Adapter a host fills from its provider SDK callbacks.
///
/// `emit` records the latest session and fans the event out to every
/// registered handler. Handlers only enqueue, so `emit` never waits on the
/// session engine.
#[derive(Default)]
pub struct ProviderBridge {
    session: RwLock<Option<ProviderSession>>,
    profiles: RwLock<HashMap<String, ProfileRecord>>,
    handlers: RwLock<Vec<(SessionHandlerId, SessionChangeHandler)>>,
    next_handler: AtomicU64,
    launcher: Option<SignInLauncher>,
}

impl ProviderBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `launcher` to open the provider's sign-in flow.
    pub fn with_sign_in<F>(mut self, launcher: F) -> Self
    where
        F: Fn() -> Result<(), ProviderError> + Send + Sync + 'static,
    {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    pub fn emit(&self, event: ProviderEvent) {
        {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            match &event {
                ProviderEvent::SignedIn(s) | ProviderEvent::TokenRefreshed(s) => {
                    *session = Some(s.clone())
                }
                ProviderEvent::SignedOut => *session = None,
            }
        }
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug!(handlers = handlers.len(), "provider event emitted");
        for (_, handler) in handlers {
            handler(event.clone());
        }
    }

    pub fn put_profile(&self, profile: ProfileRecord) {
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl IdentityProvider for ProviderBridge {
    async fn current_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        Ok(self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn on_session_change(&self, handler: SessionChangeHandler) -> SessionHandlerId {
        let id = SessionHandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    fn remove_session_handler(&self, id: SessionHandlerId) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(registered, _)| *registered != id);
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>, ProviderError> {
        Ok(self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    async fn start_sign_in(&self) -> Result<(), ProviderError> {
        match &self.launcher {
            Some(launch) => launch(),
            None => Err(ProviderError::Unavailable),
        }
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.emit(ProviderEvent::SignedOut);
        Ok(())
    }
}

/// Provider for installations without federated sign-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProvider;

#[async_trait]
impl IdentityProvider for DisabledProvider {
    async fn current_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        Ok(None)
    }

    fn on_session_change(&self, _handler: SessionChangeHandler) -> SessionHandlerId {
        SessionHandlerId(0)
    }

    fn remove_session_handler(&self, _id: SessionHandlerId) {}

    async fn fetch_profile(&self, _user_id: &str) -> Result<Option<ProfileRecord>, ProviderError> {
        Ok(None)
    }

    async fn start_sign_in(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Unavailable)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
