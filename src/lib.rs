//! Client-side session management for LearnHub.
//!
//! [`SessionEngine`] decides who the current user is at startup, keeps that
//! answer current as the identity provider, the credential backend and the
//! user's profile change, and publishes it through a `watch` channel.

pub mod auth;
pub mod config;
pub mod profile;
pub mod provider;
pub mod session;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;

pub use auth::{ApprovalStatus, Role, SessionSource, UserRecord};
pub use config::SessionConfig;
pub use session::{SessionEngine, SessionError, SessionPhase, SessionState};
pub use state::SessionDeps;
