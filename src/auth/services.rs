use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument, warn};

use crate::auth::{
    dto::{AuthResponse, ErrorBody, LoginRequest, PublicUser, RefreshRequest, RefreshResponse, RegisterRequest},
    user::{CredentialPair, UserRecord},
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Why a backend call did not succeed. The caller decides between retry and
/// teardown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendFailure {
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("{0}")]
    ServerRejected(String),
}

/// User and credentials returned by login or register.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub user: UserRecord,
    pub credentials: CredentialPair,
}

/// Result of a refresh exchange.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub access_credential: String,
    pub rotated_refresh: Option<String>,
}

/// The backend credential service.
#[async_trait]
pub trait BackendAuth: Send + Sync {
    async fn register(&self, details: &RegisterRequest) -> Result<AuthGrant, BackendFailure>;
    async fn login(&self, request: &LoginRequest) -> Result<AuthGrant, BackendFailure>;
    /// Exchanges a refresh credential. Stale or rotated credentials come back
    /// as `ServerRejected`.
    async fn refresh(&self, refresh_credential: &str) -> Result<RefreshGrant, BackendFailure>;
    /// Authoritative user record for the bearer of `access_credential`.
    async fn me(&self, access_credential: &str) -> Result<UserRecord, BackendFailure>;
}

/// `BackendAuth` over HTTP+JSON.
#[derive(Clone)]
pub struct HttpBackendAuth {
    base_url: String,
    http: reqwest::Client,
}

impl HttpBackendAuth {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B, R>(
        &self,
        path: &str,
        body: &B,
        credential_statuses: &[StatusCode],
    ) -> Result<R, BackendFailure>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        read_json(response, credential_statuses).await
    }
}

#[async_trait]
impl BackendAuth for HttpBackendAuth {
    #[instrument(skip(self, details), fields(email = %details.email))]
    async fn register(&self, details: &RegisterRequest) -> Result<AuthGrant, BackendFailure> {
        let res: AuthResponse = self
            .post_json("/auth/register", details, &[StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN])
            .await?;
        let (user, credentials) = res.into_parts();
        debug!(user_id = %user.id, "registered");
        Ok(AuthGrant { user, credentials })
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    async fn login(&self, request: &LoginRequest) -> Result<AuthGrant, BackendFailure> {
        let res: AuthResponse = self
            .post_json(
                "/auth/login",
                request,
                &[StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN],
            )
            .await?;
        let (user, credentials) = res.into_parts();
        debug!(user_id = %user.id, "logged in");
        Ok(AuthGrant { user, credentials })
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_credential: &str) -> Result<RefreshGrant, BackendFailure> {
        let body = RefreshRequest {
            refresh_token: refresh_credential.to_string(),
        };
        // every rejection is terminal for a refresh credential
        let res: RefreshResponse = self.post_json("/auth/refresh", &body, &[]).await?;
        debug!(rotated = res.refresh_token.is_some(), "access credential refreshed");
        Ok(RefreshGrant {
            access_credential: res.access_token,
            rotated_refresh: res.refresh_token,
        })
    }

    #[instrument(skip_all)]
    async fn me(&self, access_credential: &str) -> Result<UserRecord, BackendFailure> {
        let response = self
            .http
            .get(self.endpoint("/auth/me"))
            .bearer_auth(access_credential)
            .send()
            .await
            .map_err(transport)?;
        let user: PublicUser = read_json(response, &[]).await?;
        Ok(user.into_record(access_credential))
    }
}

fn transport(e: reqwest::Error) -> BackendFailure {
    warn!(error = %e, timeout = e.is_timeout(), connect = e.is_connect(), "backend unreachable");
    BackendFailure::Network(e.to_string())
}

async fn read_json<R: DeserializeOwned>(
    response: reqwest::Response,
    credential_statuses: &[StatusCode],
) -> Result<R, BackendFailure> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<R>()
            .await
            .map_err(|e| BackendFailure::ServerRejected(format!("malformed response: {e}")));
    }

    let text = response.text().await.unwrap_or_default();
    let reason = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.message,
        Err(_) if !text.trim().is_empty() => text.trim().to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    warn!(%status, %reason, "backend rejected request");

    Err(classify(status, reason, credential_statuses))
}

fn classify(status: StatusCode, reason: String, credential_statuses: &[StatusCode]) -> BackendFailure {
    if credential_statuses.contains(&status) {
        BackendFailure::InvalidCredentials(reason)
    } else if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        BackendFailure::Network(reason)
    } else {
        BackendFailure::ServerRejected(reason)
    }
}
