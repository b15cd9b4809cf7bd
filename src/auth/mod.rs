//! Backend credentials: token decoding, the user model and the HTTP client for
//! the credential service.

pub mod claims;
pub mod dto;
pub mod services;
pub mod user;

pub use claims::{decode_claims, AccessClaims};
pub use dto::{LoginRequest, RegisterRequest};
pub use services::{AuthGrant, BackendAuth, BackendFailure, HttpBackendAuth, RefreshGrant};
pub use user::{
    ApprovalStatus, CredentialPair, Role, SessionSnapshot, SessionSource, UserRecord,
    DEFAULT_SUPERUSER_EMAIL,
};
