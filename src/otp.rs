use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{AppError, AppJson};
use crate::login::{NewUser, hash_password, insert_user, is_valid_email, non_blank};
use crate::state::SharedState;

/// How long a sent code stays valid, in seconds
pub const OTP_TTL_SECS: i64 = 5 * 60;

/// Wrong guesses allowed before the pending signup is dropped
pub const MAX_ATTEMPTS: u32 = 5;

/// A signup waiting for its phone number to be confirmed
#[derive(Debug, Clone)]
pub struct PendingSignup {
    pub user: NewUser,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub failed_attempts: u32,
}

impl PendingSignup {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_at).num_seconds() > OTP_TTL_SECS
    }
}

/// Delivery channel for one-time codes
pub trait OtpSender: Send + Sync {
    fn send(&self, pending: &PendingSignup) -> Result<(), String>;
}

/// Writes the code to the server log; used when no mail relay is configured
pub struct LogOtpSender;

impl OtpSender for LogOtpSender {
    fn send(&self, pending: &PendingSignup) -> Result<(), String> {
        let phone = pending.user.phone.as_deref().unwrap_or_default();
        info!("OTP for {phone} is: {}", pending.code);
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyError {
    Missing,
    Expired,
    Mismatch,
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        let message = match err {
            VerifyError::Missing => "Session expired.",
            VerifyError::Expired => "OTP has expired.",
            VerifyError::Mismatch => "Invalid OTP.",
        };
        AppError::bad_request(message)
    }
}

/// Pending signups keyed by phone number
#[derive(Default)]
pub struct OtpStore {
    pending: Mutex<HashMap<String, PendingSignup>>,
}

impl OtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a signup under `phone`, replacing any earlier one
    pub fn insert(&self, phone: &str, pending: PendingSignup) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(phone.to_string(), pending);
    }

    /// Check `code` and hand back the signup on success
    ///
    /// Expired entries, and entries that used up their attempts, are removed.
    pub fn verify(
        &self,
        phone: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingSignup, VerifyError> {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.get_mut(phone).ok_or(VerifyError::Missing)?;

        if entry.is_expired(now) {
            map.remove(phone);
            return Err(VerifyError::Expired);
        }

        if entry.code != code {
            entry.failed_attempts += 1;
            if entry.failed_attempts >= MAX_ATTEMPTS {
                map.remove(phone);
            }
            return Err(VerifyError::Mismatch);
        }

        map.remove(phone).ok_or(VerifyError::Missing)
    }

    /// Drop every expired entry
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, p| !p.is_expired(now));
        before - map.len()
    }
}

/// Six-digit numeric code
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

#[derive(Debug, Deserialize)]
pub struct SendOtpRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub college: Option<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub otp: String,
}

pub async fn handle_send_otp(
    State(state): State<SharedState>,
    AppJson(req): AppJson<SendOtpRequest>,
) -> Result<Json<Value>, AppError> {
    let phone = req.phone.trim().to_string();
    let email = req.email.trim().to_string();
    if phone.is_empty() || email.is_empty() || req.password.is_empty() {
        return Err(AppError::bad_request("name, email, phone and password required"));
    }
    if !is_valid_email(&email) {
        return Err(AppError::bad_request("invalid email address"));
    }

    let taken = state
        .db
        .read(|db| Ok::<_, AppError>(db.identity_taken(&email, Some(phone.as_str()))))?;
    if taken {
        return Err(AppError::bad_request(
            "User with this email or phone already exists.",
        ));
    }

    let now = Utc::now();
    let pending = PendingSignup {
        user: NewUser {
            full_name: req.name.trim().to_string(),
            email,
            phone: Some(phone.clone()),
            course: non_blank(req.course),
            college: non_blank(req.college),
            password_hash: Some(hash_password(&req.password)?),
            google_id: None,
        },
        code: generate_code(),
        created_at: now,
        failed_attempts: 0,
    };

    let sender = Arc::clone(&state.otp_sender);
    let outgoing = pending.clone();
    tokio::task::spawn_blocking(move || sender.send(&outgoing))
        .await
        .map_err(|e| AppError::Internal(format!("OTP delivery task failed: {e}")))?
        .map_err(|e| AppError::Internal(format!("Failed to send OTP: {e}")))?;

    state.otps.purge_expired(now);
    state.otps.insert(&phone, pending);

    Ok(Json(json!({ "message": "OTP sent successfully." })))
}

pub async fn handle_verify_otp(
    State(state): State<SharedState>,
    AppJson(req): AppJson<VerifyOtpRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let phone = req.phone.trim();
    let now = Utc::now();

    let pending = state
        .otps
        .verify(phone, req.otp.trim(), now)
        .inspect_err(|e| warn!("OTP verification for {phone} failed: {e:?}"))?;

    let user = state.db.write(|db| insert_user(db, pending.user, now))?;
    info!("User {} created through OTP signup", user.id);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Account created successfully!" })),
    ))
}
