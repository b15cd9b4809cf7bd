//! In-process credential backend speaking the same HTTP contract as the real
//! one: register, login, rotating refresh and `/auth/me`.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use learnhub_session::auth::{
    dto::{AuthResponse, LoginRequest, PublicUser, RefreshRequest, RefreshResponse, RegisterRequest},
    ApprovalStatus, Role,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn reject(status: StatusCode, message: &str) -> ApiError {
    (status, Json(serde_json::json!({ "message": message })))
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: String,
    pub jti: Uuid,
    pub kind: TokenKind,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl JwtKeys {
    pub fn new(secret: &str, access_ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: "learnhub-test".into(),
            audience: "learnhub-app".into(),
            access_ttl_secs,
            refresh_ttl_secs: 3600,
        }
    }

    fn sign(&self, user_id: Uuid, kind: TokenKind) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl_secs,
            TokenKind::Refresh => self.refresh_ttl_secs,
        };
        let claims = Claims {
            sub: user_id,
            iat: now,
            exp: now + ttl,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4(),
            kind,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    fn verify(&self, token: &str, kind: TokenKind) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.leeway = 0;
        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;
        if claims.kind != kind {
            anyhow::bail!("wrong token kind");
        }
        Ok(claims)
    }

    fn pair(&self, user_id: Uuid) -> Result<(String, String), ApiError> {
        let issue = |kind| {
            self.sign(user_id, kind)
                .map_err(|e| reject(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        };
        Ok((issue(TokenKind::Access)?, issue(TokenKind::Refresh)?))
    }
}

#[derive(Clone)]
struct Account {
    id: Uuid,
    email: String,
    password: String,
    display_name: String,
    role: Role,
}

impl Account {
    fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id.to_string(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            approval_status: ApprovalStatus::Approved,
            is_active: true,
            profile_picture: None,
        }
    }
}

#[derive(Default)]
struct Ledger {
    accounts: HashMap<String, Account>,
    spent_refresh: HashSet<Uuid>,
    refreshes: usize,
}

#[derive(Clone)]
struct AppState {
    keys: JwtKeys,
    ledger: Arc<Mutex<Ledger>>,
}

pub struct TestBackend {
    pub url: String,
    pub keys: JwtKeys,
    ledger: Arc<Mutex<Ledger>>,
    server: JoinHandle<()>,
}

impl TestBackend {
    pub async fn spawn() -> Self {
        Self::spawn_with_access_ttl(300).await
    }

    /// A negative ttl issues access tokens that are already expired.
    pub async fn spawn_with_access_ttl(access_ttl_secs: i64) -> Self {
        let keys = JwtKeys::new("integration-secret", access_ttl_secs);
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let state = AppState {
            keys: keys.clone(),
            ledger: ledger.clone(),
        };
        let app = Router::new()
            .route("/auth/register", post(register))
            .route("/auth/login", post(login))
            .route("/auth/refresh", post(refresh))
            .route("/auth/me", get(me))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind test backend");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test backend");
        });

        Self {
            url: format!("http://{addr}"),
            keys,
            ledger,
            server,
        }
    }

    pub fn add_account(&self, email: &str, password: &str, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        let account = Account {
            id,
            email: email.to_string(),
            password: password.to_string(),
            display_name: email.split('@').next().unwrap_or_default().to_string(),
            role,
        };
        self.ledger
            .lock()
            .unwrap()
            .accounts
            .insert(email.to_string(), account);
        id
    }

    pub fn rename(&self, email: &str, display_name: &str) {
        if let Some(account) = self.ledger.lock().unwrap().accounts.get_mut(email) {
            account.display_name = display_name.to_string();
        }
    }

    pub fn refreshes(&self) -> usize {
        self.ledger.lock().unwrap().refreshes
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    payload.email = payload.email.trim().to_lowercase();
    if !payload.email.contains('@') {
        return Err(reject(StatusCode::BAD_REQUEST, "Invalid email"));
    }
    if payload.password.len() < 8 {
        return Err(reject(StatusCode::BAD_REQUEST, "Password too short"));
    }

    let account = {
        let mut ledger = state.ledger.lock().unwrap();
        if ledger.accounts.contains_key(&payload.email) {
            return Err(reject(StatusCode::CONFLICT, "Email already registered"));
        }
        let account = Account {
            id: Uuid::new_v4(),
            email: payload.email.clone(),
            password: payload.password,
            display_name: payload.display_name,
            role: payload.role,
        };
        ledger.accounts.insert(payload.email, account.clone());
        account
    };

    let (access_token, refresh_token) = state.keys.pair(account.id)?;
    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: account.public(),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let email = payload.email.trim().to_lowercase();
    let account = state
        .ledger
        .lock()
        .unwrap()
        .accounts
        .get(&email)
        .filter(|a| a.password == payload.password)
        .cloned()
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Invalid credentials"))?;

    let (access_token, refresh_token) = state.keys.pair(account.id)?;
    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: account.public(),
    }))
}

async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let claims = state
        .keys
        .verify(&payload.refresh_token, TokenKind::Refresh)
        .map_err(|e| reject(StatusCode::UNAUTHORIZED, &e.to_string()))?;

    {
        let mut ledger = state.ledger.lock().unwrap();
        if !ledger.spent_refresh.insert(claims.jti) {
            return Err(reject(StatusCode::UNAUTHORIZED, "Refresh token already used"));
        }
        ledger.refreshes += 1;
    }

    let (access_token, refresh_token) = state.keys.pair(claims.sub)?;
    Ok(Json(RefreshResponse {
        access_token,
        refresh_token: Some(refresh_token),
    }))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<PublicUser>, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;
    let claims = state
        .keys
        .verify(token, TokenKind::Access)
        .map_err(|e| reject(StatusCode::UNAUTHORIZED, &e.to_string()))?;

    state
        .ledger
        .lock()
        .unwrap()
        .accounts
        .values()
        .find(|a| a.id == claims.sub)
        .map(|a| Json(a.public()))
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "User not found"))
}
