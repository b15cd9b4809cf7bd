use std::path::PathBuf;

use serde::Deserialize;

use crate::auth::DEFAULT_SUPERUSER_EMAIL;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub backend_url: String,
    pub session_path: PathBuf,
    pub superuser_email: String,
    pub http_timeout_secs: u64,
    pub expiry_skew_secs: i64,
}

impl SessionConfig {
    /// Defaults for everything except the backend location.
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            session_path: PathBuf::from(".learnhub/session.json"),
            superuser_email: DEFAULT_SUPERUSER_EMAIL.into(),
            http_timeout_secs: 15,
            expiry_skew_secs: 0,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::new(std::env::var("LEARNHUB_BACKEND_URL")?);
        Ok(Self {
            session_path: std::env::var("LEARNHUB_SESSION_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_path.clone()),
            superuser_email: std::env::var("LEARNHUB_SUPERUSER_EMAIL")
                .unwrap_or_else(|_| defaults.superuser_email.clone()),
            http_timeout_secs: std::env::var("LEARNHUB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.http_timeout_secs),
            expiry_skew_secs: std::env::var("LEARNHUB_EXPIRY_SKEW_SECS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(defaults.expiry_skew_secs),
            ..defaults
        })
    }
}
