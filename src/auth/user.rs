use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identity that always resolves to the admin role.
pub const DEFAULT_SUPERUSER_EMAIL: &str = "admin@learnhub.dev";

/// Role of a platform user.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    #[serde(alias = "Student")]
    Student,
    #[serde(alias = "Teacher")]
    Teacher,
    #[serde(alias = "Admin")]
    Admin,
}

/// Account approval state, set by an admin.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "Approved")]
    Approved,
    #[serde(alias = "Rejected")]
    Rejected,
}

/// Which authority issued the credentials of a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    #[default]
    Backend,
    Provider,
}

/// The signed-in user as the rest of the application sees it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,                      // identity id, never changes
    pub email: String,                   // fixed after creation
    pub display_name: String,
    pub role: Role,
    pub approval_status: ApprovalStatus,
    pub is_active: bool,
    pub profile_picture: Option<String>,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub access_credential: String,       // bearer, never logged
}

impl UserRecord {
    /// Forces the admin role for the superuser email. Idempotent.
    pub fn apply_role_override(&mut self, superuser_email: &str) {
        if is_superuser(&self.email, superuser_email) {
            self.role = Role::Admin;
        }
    }

    pub fn with_role_override(mut self, superuser_email: &str) -> Self {
        self.apply_role_override(superuser_email);
        self
    }

    /// Both id and email must be present for a record to be usable.
    pub fn is_structurally_valid(&self) -> bool {
        !self.id.trim().is_empty() && !self.email.trim().is_empty()
    }
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("role", &self.role)
            .field("approval_status", &self.approval_status)
            .field("is_active", &self.is_active)
            .field("profile_picture", &self.profile_picture)
            .finish_non_exhaustive()
    }
}

pub fn is_superuser(email: &str, superuser_email: &str) -> bool {
    let superuser_email = superuser_email.trim();
    !superuser_email.is_empty() && email.trim().eq_ignore_ascii_case(superuser_email)
}

/// Access and refresh credential issued together.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialPair { .. }")
    }
}

/// User record and credentials persisted as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user: UserRecord,
    pub credentials: CredentialPair,
    pub source: SessionSource,
    pub saved_at: i64, // unix seconds
}

impl SessionSnapshot {
    pub fn new(mut user: UserRecord, credentials: CredentialPair, source: SessionSource) -> Self {
        user.access_credential = credentials.access.clone();
        Self {
            user,
            credentials,
            source,
            saved_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn set_access_credential(&mut self, access: &str) {
        self.credentials.access = access.to_string();
        self.user.access_credential = access.to_string();
    }

    pub fn set_refresh_credential(&mut self, refresh: &str) {
        self.credentials.refresh = refresh.to_string();
    }
}
