use std::{sync::Arc, time::Duration};

use crate::auth::{BackendAuth, HttpBackendAuth};
use crate::config::SessionConfig;
use crate::profile::{ProfileChannel, ProfileFeed};
use crate::provider::{DisabledProvider, IdentityProvider};
use crate::storage::{FileSessionStore, SessionStore};

/// Collaborators of the session engine, built once and handed over at start.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<SessionConfig>,
    pub backend: Arc<dyn BackendAuth>,
    pub provider: Arc<dyn IdentityProvider>,
    pub profiles: Arc<dyn ProfileChannel>,
    pub store: Arc<dyn SessionStore>,
}

impl SessionDeps {
    /// HTTP backend, session file, and no federated provider.
    pub fn init(config: SessionConfig) -> anyhow::Result<Self> {
        let backend = Arc::new(HttpBackendAuth::new(
            &config.backend_url,
            Duration::from_secs(config.http_timeout_secs),
        )?) as Arc<dyn BackendAuth>;
        let store = Arc::new(FileSessionStore::new(config.session_path.clone())) as Arc<dyn SessionStore>;

        Ok(Self {
            config: Arc::new(config),
            backend,
            provider: Arc::new(DisabledProvider),
            profiles: Arc::new(ProfileFeed::new()),
            store,
        })
    }

    pub fn from_parts(
        config: SessionConfig,
        backend: Arc<dyn BackendAuth>,
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileChannel>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            provider,
            profiles,
            store,
        }
    }

    /// Swaps in a federated identity provider and its profile channel.
    pub fn with_provider(
        mut self,
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileChannel>,
    ) -> Self {
        self.provider = provider;
        self.profiles = profiles;
        self
    }
}
