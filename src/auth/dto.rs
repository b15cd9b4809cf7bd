use serde::{Deserialize, Serialize};

use super::user::{ApprovalStatus, CredentialPair, Role, UserRecord};

/// Request body for `POST /auth/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
}

/// Request body for `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Request body for `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Response returned after login or register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: PublicUser,
}

/// Response returned by refresh. Servers that rotate refresh tokens also
/// send the replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// User fields as the backend sends them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub approval_status: ApprovalStatus,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

fn default_active() -> bool {
    true
}

impl PublicUser {
    pub fn into_record(self, access_credential: &str) -> UserRecord {
        let display_name = if self.display_name.trim().is_empty() {
            email_local_part(&self.email)
        } else {
            self.display_name
        };
        UserRecord {
            id: self.id,
            email: self.email,
            display_name,
            role: self.role,
            approval_status: self.approval_status,
            is_active: self.is_active,
            profile_picture: self.profile_picture,
            access_credential: access_credential.to_string(),
        }
    }
}

impl AuthResponse {
    pub fn into_parts(self) -> (UserRecord, CredentialPair) {
        let user = self.user.into_record(&self.access_token);
        let credentials = CredentialPair {
            access: self.access_token,
            refresh: self.refresh_token,
        };
        (user, credentials)
    }
}

/// Error body some deployments send instead of plain text.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(alias = "error")]
    pub message: String,
}

pub(crate) fn email_local_part(email: &str) -> String {
    email.split('@').next().unwrap_or_default().to_string()
}
