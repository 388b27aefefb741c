use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{DateTime, TimeDelta, Utc};
use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{AppError, AppJson};
use crate::state::SharedState;
use crate::store::{Db, User};

/// Cookie carrying the session token for browser flows
pub const SESSION_COOKIE: &str = "session";

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// Signup payload
///
/// Accepts both the `name` and `fullName` spellings used by the different
/// frontend forms.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default, alias = "name")]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub college: Option<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninRequest {
    #[serde(default, alias = "email")]
    pub email_or_phone: String,
    #[serde(default)]
    pub password: String,
}

/// The subset of a user returned alongside a token
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub full_name: String,
    pub email: String,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        PublicUser {
            id: user.id.clone(),
            full_name: user.full_name.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub message: &'static str,
    pub token: String,
    pub user: PublicUser,
}

/// Validated data for a new account
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub course: Option<String>,
    pub college: Option<String>,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
}

/// Identity attached to an authenticated request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    expires_at: DateTime<Utc>,
}

/// In-memory bearer sessions
pub struct SessionStore {
    ttl: TimeDelta,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        SessionStore {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::days(7)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a new token for `user_id`
    ///
    /// Sessions that have expired by `now` are dropped first.
    pub fn create(&self, user_id: &str, now: DateTime<Utc>) -> String {
        let token = Uuid::new_v4().to_string();
        let session = Session {
            user_id: user_id.to_string(),
            expires_at: now
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, s| s.expires_at > now);
        sessions.insert(token.clone(), session);
        token
    }

    /// Number of sessions currently held, expired or not
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// User behind `token`, if it exists and has not expired
    ///
    /// Expired entries are removed as they are found.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            match sessions.get(token) {
                Some(session) if session.expires_at > now => {
                    return Some(session.user_id.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        self.revoke(token);
        None
    }

    pub fn revoke(&self, token: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(token).is_some()
    }
}

/// Hash a password with Argon2id
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))
}

/// Check a password against a stored hash
///
/// A malformed hash never matches.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Trimmed value, or `None` when blank
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Add a user, enforcing unique e-mail and phone
pub fn insert_user(db: &mut Db, new_user: NewUser, now: DateTime<Utc>) -> Result<User, AppError> {
    if db.identity_taken(&new_user.email, new_user.phone.as_deref()) {
        return Err(AppError::bad_request("User already exists"));
    }

    let user = User {
        id: Uuid::new_v4().simple().to_string(),
        full_name: new_user.full_name,
        email: new_user.email,
        phone: new_user.phone,
        course: new_user.course,
        college: new_user.college,
        password_hash: new_user.password_hash,
        google_id: new_user.google_id,
        subjects: Vec::new(),
        push_subscription: None,
        created_at: now,
    };
    db.users.push(user.clone());
    Ok(user)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Authentication middleware
///
/// Takes the token from `Authorization: Bearer ...` or the session cookie and
/// attaches an [`AuthUser`] to the request.
pub async fn require_auth(
    State(state): State<SharedState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())
        .or_else(|| jar.get(SESSION_COOKIE).map(|c| c.value().to_string()))
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".to_string()))?;

    let user_id = state
        .sessions
        .validate(&token, Utc::now())
        .ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;

    request.extensions_mut().insert(AuthUser { user_id, token });
    Ok(next.run(request).await)
}

/// Handle password signup
pub async fn handle_signup(
    State(state): State<SharedState>,
    AppJson(req): AppJson<SignupRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let email = req.email.trim().to_string();
    if email.is_empty() || req.password.is_empty() {
        return Err(AppError::bad_request("email and password required"));
    }
    if !is_valid_email(&email) {
        return Err(AppError::bad_request("invalid email address"));
    }

    let new_user = NewUser {
        full_name: req.full_name.trim().to_string(),
        email,
        phone: non_blank(req.phone),
        course: non_blank(req.course),
        college: non_blank(req.college),
        password_hash: Some(hash_password(&req.password)?),
        google_id: None,
    };

    let now = Utc::now();
    let user = state.db.write(|db| insert_user(db, new_user, now))?;
    info!("New user {} signed up", user.id);

    let token = state.sessions.create(&user.id, now);
    Ok(Json(AuthResponse {
        message: "signup ok",
        token,
        user: PublicUser::from(&user),
    }))
}

/// Handle password signin by e-mail or phone
pub async fn handle_signin(
    State(state): State<SharedState>,
    jar: CookieJar,
    AppJson(req): AppJson<SigninRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AppError> {
    let login = req.email_or_phone.trim().to_string();
    if login.is_empty() || req.password.is_empty() {
        return Err(AppError::bad_request("emailOrPhone and password required"));
    }

    let user = state
        .db
        .read(|db| Ok::<_, AppError>(db.user_by_login(&login).cloned()))?
        .ok_or_else(|| AppError::bad_request("invalid credentials"))?;

    let matches = user
        .password_hash
        .as_deref()
        .is_some_and(|hash| verify_password(&req.password, hash));
    if !matches {
        return Err(AppError::bad_request("invalid credentials"));
    }

    let token = state.sessions.create(&user.id, Utc::now());
    let cookie = Cookie::build((SESSION_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .build();

    Ok((
        jar.add(cookie),
        Json(AuthResponse {
            message: "signin ok",
            token,
            user: PublicUser::from(&user),
        }),
    ))
}

pub async fn handle_logout(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
    jar: CookieJar,
) -> (CookieJar, Json<Value>) {
    state.sessions.revoke(&auth.token);
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Json(json!({ "message": "logged out" })),
    )
}

/// Profile of the signed-in user
pub async fn handle_me(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    let user = state
        .db
        .read(|db| Ok::<_, AppError>(db.user(&auth.user_id).cloned()))?
        .ok_or_else(|| AppError::not_found("user not found"))?;

    Ok(Json(json!({
        "id": user.id,
        "fullName": user.full_name,
        "email": user.email,
        "phone": user.phone,
        "course": user.course,
        "college": user.college,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_expire_after_ttl() {
        let store = SessionStore::new(Duration::from_secs(60));
        let now = Utc::now();
        let token = store.create("u1", now);

        assert_eq!(store.validate(&token, now).as_deref(), Some("u1"));
        assert_eq!(store.validate(&token, now + TimeDelta::seconds(61)), None);
        // removed once seen expired
        assert!(!store.revoke(&token));
    }

    #[test]
    fn creating_a_session_drops_expired_ones() {
        let store = SessionStore::new(Duration::from_secs(60));
        let start = Utc::now();
        let stale = store.create("u1", start);
        let live = store.create("u2", start + TimeDelta::seconds(30));
        assert_eq!(store.len(), 2);

        // u1's token was never presented again but is gone after the next sign-in
        let fresh = store.create("u3", start + TimeDelta::seconds(61));
        assert_eq!(store.len(), 2);
        assert!(!store.revoke(&stale));
        assert!(store.revoke(&live));
        assert!(store.revoke(&fresh));
        assert!(store.is_empty());
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        // largest TTL chrono accepts; `now + ttl` is past the end of time
        let store = SessionStore::new(Duration::from_secs(i64::MAX as u64 / 1000));
        let now = Utc::now();
        let token = store.create("u1", now);
        assert_eq!(store.validate(&token, now).as_deref(), Some("u1"));
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-phc-string"));
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("a.b@college.edu.in"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("no spaces@x.com"));
    }
}
