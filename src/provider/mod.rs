//! Identity-provider adapter.
//!
//! The federated sign-in protocol itself lives in the provider's SDK. This
//! module defines what the session engine needs from it and normalizes the
//! provider's session into the internal [`UserRecord`] shape.

mod bridge;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::{dto::email_local_part, ApprovalStatus, CredentialPair, Role, UserRecord};

pub use bridge::{DisabledProvider, ProviderBridge};

/// A live session held by the identity provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSession {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSession")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Durable profile row kept alongside a provider identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub approval_status: ApprovalStatus,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Session change emitted by the provider, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SignedIn(ProviderSession),
    SignedOut,
    TokenRefreshed(ProviderSession),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("identity provider unreachable: {0}")]
    Transport(String),
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),
    #[error("federated sign-in is not configured")]
    Unavailable,
}

/// Receives provider events. Must return quickly; it runs on the provider's
/// delivery path.
pub type SessionChangeHandler = Arc<dyn Fn(ProviderEvent) + Send + Sync>;

/// Identifies one registered [`SessionChangeHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandlerId(pub u64);

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Point-in-time session query.
    async fn current_session(&self) -> Result<Option<ProviderSession>, ProviderError>;

    /// Registers a handler for session changes.
    fn on_session_change(&self, handler: SessionChangeHandler) -> SessionHandlerId;

    /// Drops a handler. Unknown ids are ignored.
    fn remove_session_handler(&self, id: SessionHandlerId);

    /// Profile row for a provider-authenticated identity.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRecord>, ProviderError>;

    /// Starts federated sign-in. Completion arrives as `SignedIn`.
    async fn start_sign_in(&self) -> Result<(), ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;
}

impl ProviderSession {
    pub fn credentials(&self) -> CredentialPair {
        CredentialPair {
            access: self.access_token.clone(),
            refresh: self.refresh_token.clone(),
        }
    }

    /// Builds the internal user record. Profile fields win over session
    /// metadata; without a profile row the account is a pending student.
    pub fn to_user_record(&self, profile: Option<&ProfileRecord>) -> UserRecord {
        let display_name = profile
            .and_then(|p| p.display_name.clone())
            .or_else(|| self.display_name.clone())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| email_local_part(&self.email));

        UserRecord {
            id: self.user_id.clone(),
            email: self.email.clone(),
            display_name,
            role: profile.map(|p| p.role).unwrap_or_default(),
            approval_status: profile.map(|p| p.approval_status).unwrap_or_default(),
            is_active: profile.map(|p| p.is_active).unwrap_or(true),
            profile_picture: profile
                .and_then(|p| p.profile_picture.clone())
                .or_else(|| self.avatar_url.clone()),
            access_credential: self.access_token.clone(),
        }
    }
}

impl ProfileRecord {
    /// Applies the profile's mutable fields to `user`. Id and email stay.
    pub fn merge_into(&self, user: &UserRecord) -> UserRecord {
        UserRecord {
            display_name: self
                .display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| user.display_name.clone()),
            role: self.role,
            approval_status: self.approval_status,
            is_active: self.is_active,
            profile_picture: self.profile_picture.clone().or_else(|| user.profile_picture.clone()),
            ..user.clone()
        }
    }
}
