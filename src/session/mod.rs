//! The session engine: decides who the current user is and keeps that answer
//! consistent while providers, the backend and the local store change under it.

mod engine;
mod error;
mod state;


pub use engine::SessionEngine;
pub use error::SessionError;
pub use state::{SessionPhase, SessionState};
