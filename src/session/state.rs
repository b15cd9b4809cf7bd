use crate::auth::{SessionSource, UserRecord};

/// Where the session engine is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Arbitrating,
    Authenticated,
    Unauthenticated,
    Refreshing,
    Reconciling,
}

/// What the rest of the application observes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub user: Option<UserRecord>,
    pub source: Option<SessionSource>,
}

impl SessionState {
    pub fn is_loading(&self) -> bool {
        matches!(self.phase, SessionPhase::Uninitialized | SessionPhase::Arbitrating)
    }

    pub fn current_user(&self) -> Option<&UserRecord> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}
