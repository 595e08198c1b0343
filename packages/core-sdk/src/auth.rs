use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::COOKIE, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{db, models::Principal, telemetry};

pub const SESSION_COOKIE: &str = "relaychat_session";
pub const SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/**
 * \brief 会话门禁错误；Unauthorized 对应 401，Forbidden 对应 403。
 */
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    Denied,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("authentication backend failed: {0}")]
    Backend(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Denied | AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/**
 * \brief 生成 argon2 PHC 口令串（随机盐）。
 */
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow!("hash password failed: {}", e))
}

/** \brief 旧版账户文件使用的无盐 SHA-256 十六进制摘要。 */
pub fn legacy_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    /** \brief 旧版摘要校验通过，应改存为 argon2。 */
    MatchLegacy,
    Mismatch,
}

pub fn verify_password(stored: &str, password: &str) -> Verification {
    if let Ok(parsed) = PasswordHash::new(stored) {
        return if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
        {
            Verification::Match
        } else {
            Verification::Mismatch
        };
    }
    if stored.len() == 64 && stored.eq_ignore_ascii_case(&legacy_digest(password)) {
        Verification::MatchLegacy
    } else {
        Verification::Mismatch
    }
}

/**
 * \brief 基于 Cookie 的会话门禁：登录校验口令并签发令牌，请求时按令牌还原调用方。
 */
#[derive(Clone)]
pub struct SessionGate {
    db_path: PathBuf,
    ttl: Duration,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

#[derive(Debug, Clone)]
struct Session {
    principal: Principal,
    issued_at: Instant,
}

impl Session {
    fn expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() >= ttl
    }
}

impl SessionGate {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ttl: SESSION_TTL,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /** \brief 覆盖会话有效期，缺省为 SESSION_TTL。 */
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<(String, Principal), AuthError> {
        let conn = db::open(&self.db_path).map_err(|e| AuthError::Backend(e.to_string()))?;
        let user = db::get_user(&conn, username)
            .map_err(|e| AuthError::Backend(e.to_string()))?
            .ok_or(AuthError::Denied)?;

        match verify_password(&user.password, password) {
            Verification::Mismatch => return Err(AuthError::Denied),
            Verification::MatchLegacy => {
                let upgraded = hash_password(password).map_err(|e| AuthError::Backend(e.to_string()))?;
                if let Err(e) = db::set_password(&conn, username, &upgraded) {
                    telemetry::log_error("auth", &format!("upgrade hash for {} failed: {}", username, e));
                } else {
                    telemetry::log_event("auth", &format!("upgraded legacy hash for {}", username));
                }
            }
            Verification::Match => {}
        }

        let principal = Principal {
            username: user.username,
            role: user.role,
        };
        let token = new_token();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AuthError::Backend("session table poisoned".into()))?;
        sessions.retain(|_, session| !session.expired(self.ttl));
        sessions.insert(
            token.clone(),
            Session {
                principal: principal.clone(),
                issued_at: Instant::now(),
            },
        );
        Ok((token, principal))
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = session_token(headers).ok_or(AuthError::Unauthorized)?;
        self.sessions
            .read()
            .map_err(|_| AuthError::Backend("session table poisoned".into()))?
            .get(&token)
            .filter(|session| !session.expired(self.ttl))
            .map(|session| session.principal.clone())
            .ok_or(AuthError::Unauthorized)
    }

    pub fn logout(&self, headers: &HeaderMap) {
        if let Some(token) = session_token(headers) {
            if let Ok(mut guard) = self.sessions.write() {
                guard.remove(&token);
            }
        }
    }

    /** \brief 删除账户后使其现有会话全部失效。 */
    pub fn revoke_user(&self, username: &str) {
        if let Ok(mut guard) = self.sessions.write() {
            guard.retain(|_, session| session.principal.username != username);
        }
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

pub fn session_cookie(token: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        SESSION_TTL.as_secs()
    )
}

pub fn cleared_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

impl<S> FromRequestParts<S> for Principal
where
    SessionGate: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        SessionGate::from_ref(state).authorize(&parts.headers)
    }
}

/**
 * \brief 仅允许 admin 角色通过的提取器。
 */
#[derive(Debug, Clone)]
pub struct AdminPrincipal(pub Principal);

impl<S> FromRequestParts<S> for AdminPrincipal
where
    SessionGate: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let principal = SessionGate::from_ref(state).authorize(&parts.headers)?;
        if principal.is_admin() {
            Ok(AdminPrincipal(principal))
        } else {
            Err(AuthError::Forbidden)
        }
    }
}
