use crate::auth::BackendFailure;
use crate::provider::ProviderError;

/// Failures surfaced to callers of the session engine. `Display` is the
/// reason shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("Unable to reach the server: {0}")]
    Transport(String),
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("{0}")]
    Rejected(String),
    #[error("Your session has expired, please sign in again")]
    ExpiredRefresh,
    #[error("Sign-in provider error: {0}")]
    Provider(String),
    #[error("Not signed in")]
    NotAuthenticated,
    #[error("Signed out while the request was in flight")]
    Superseded,
    #[error("Session engine has been shut down")]
    TornDown,
}

impl SessionError {
    /// Worth retrying later without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Provider(_))
    }
}

impl From<BackendFailure> for SessionError {
    fn from(failure: BackendFailure) -> Self {
        match failure {
            BackendFailure::Network(reason) => Self::Transport(reason),
            BackendFailure::InvalidCredentials(reason) => Self::InvalidCredentials(reason),
            BackendFailure::ServerRejected(reason) => Self::Rejected(reason),
        }
    }
}

impl From<ProviderError> for SessionError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e.to_string())
    }
}
