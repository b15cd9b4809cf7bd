use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{
    dto::email_local_part, ApprovalStatus, CredentialPair, Role, SessionSnapshot, SessionSource,
    UserRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence for the single session of this installation.
///
/// Only the session engine writes through this trait. `load` returns `None`
/// for both a missing and an unusable record; it never repairs.
pub trait SessionStore: Send + Sync {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;
    fn load(&self) -> Option<SessionSnapshot>;
    fn clear(&self) -> Result<(), StoreError>;

    /// Replaces the access credential of the stored snapshot, if any.
    fn update_access_credential(&self, access: &str) -> Result<(), StoreError> {
        match self.load() {
            Some(mut snapshot) => {
                snapshot.set_access_credential(access);
                self.save(&snapshot)
            }
            None => Ok(()),
        }
    }

    /// Replaces the refresh credential after the backend rotated it.
    fn update_refresh_credential(&self, refresh: &str) -> Result<(), StoreError> {
        match self.load() {
            Some(mut snapshot) => {
                snapshot.set_refresh_credential(refresh);
                self.save(&snapshot)
            }
            None => Ok(()),
        }
    }
}

/// On-disk layout, one record per installation.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    user_id: Option<String>,
    email: Option<String>,
    display_name: Option<String>,
    role: Option<Role>,
    approval_status: Option<ApprovalStatus>,
    is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile_picture: Option<String>,
    access_credential: Option<String>,
    refresh_credential: Option<String>,
    saved_at_epoch: Option<i64>,
    #[serde(default)]
    source: Option<SessionSource>,
}

impl From<&SessionSnapshot> for PersistedSession {
    fn from(s: &SessionSnapshot) -> Self {
        Self {
            user_id: Some(s.user.id.clone()),
            email: Some(s.user.email.clone()),
            display_name: Some(s.user.display_name.clone()),
            role: Some(s.user.role),
            approval_status: Some(s.user.approval_status),
            is_active: Some(s.user.is_active),
            profile_picture: s.user.profile_picture.clone(),
            access_credential: Some(s.credentials.access.clone()),
            refresh_credential: Some(s.credentials.refresh.clone()),
            saved_at_epoch: Some(s.saved_at),
            source: Some(s.source),
        }
    }
}

impl PersistedSession {
    fn into_snapshot(self) -> Option<SessionSnapshot> {
        let user_id = non_empty(self.user_id)?;
        let email = non_empty(self.email)?;
        let access = non_empty(self.access_credential)?;
        let refresh = non_empty(self.refresh_credential)?;

        let display_name = non_empty(self.display_name).unwrap_or_else(|| email_local_part(&email));
        let user = UserRecord {
            id: user_id,
            email,
            display_name,
            role: self.role.unwrap_or_default(),
            approval_status: self.approval_status.unwrap_or_default(),
            is_active: self.is_active.unwrap_or(true),
            profile_picture: self.profile_picture,
            access_credential: access.clone(),
        };
        Some(SessionSnapshot {
            user,
            credentials: CredentialPair { access, refresh },
            source: self.source.unwrap_or_default(),
            saved_at: self.saved_at_epoch.unwrap_or_default(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_record(raw: &str, origin: &str) -> Option<SessionSnapshot> {
    let record = match serde_json::from_str::<PersistedSession>(raw) {
        Ok(record) => record,
        Err(e) => {
            warn!(origin, error = %e, "stored session is malformed; ignoring it");
            return None;
        }
    };
    let snapshot = record.into_snapshot();
    if snapshot.is_none() {
        warn!(origin, "stored session is missing required fields; ignoring it");
    }
    snapshot
}

/// JSON file store. Writes go to a temp file that is renamed into place.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let payload = serde_json::to_vec_pretty(&PersistedSession::from(snapshot))?;
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&temp_path, payload)?;
        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        debug!(path = %self.path.display(), user_id = %snapshot.user.id, "session saved");
        Ok(())
    }

    fn load(&self) -> Option<SessionSnapshot> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read session file");
                return None;
            }
        };
        parse_record(&raw, "file")
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "session cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Store that keeps the serialized record in memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with an arbitrary raw record, as if read from disk.
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(raw.into())),
        }
    }

    pub fn raw(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.raw().is_none()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&PersistedSession::from(snapshot))?;
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
        Ok(())
    }

    fn load(&self) -> Option<SessionSnapshot> {
        let raw = self.raw()?;
        parse_record(&raw, "memory")
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
