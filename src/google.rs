//! Google OAuth 2.0 sign-in
//!
//! Authorization-code flow: `/auth/google` sends the browser to Google with a
//! random `state` kept in a cookie, `/auth/google/callback` trades the code
//! for a profile and hands the SPA a session token in the redirect URL.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::GoogleConfig;
use crate::error::AppError;
use crate::login::{NewUser, insert_user};
use crate::state::SharedState;
use crate::store::{Db, User};

pub const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const STATE_COOKIE: &str = "oauth_state";

/// Profile fields read from the userinfo endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleProfile {
    /// Stable Google account id
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Google consent screen URL for `client` with the given anti-forgery `state`
pub fn authorization_url(client: &GoogleConfig, state: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
        urlencoding::encode(&client.client_id),
        urlencoding::encode(&client.callback_url),
        urlencoding::encode("openid email profile"),
        urlencoding::encode(state),
    )
}

/// Find the account for a Google profile, creating or linking one as needed
///
/// Lookup order is Google id, then e-mail (the account gets the Google id
/// attached), then a new password-less account.
pub fn upsert_google_user(
    db: &mut Db,
    profile: &GoogleProfile,
    now: DateTime<Utc>,
) -> Result<User, AppError> {
    if let Some(user) = db.user_by_google_id_mut(&profile.sub) {
        return Ok(user.clone());
    }

    if let Some(user) = db
        .users
        .iter_mut()
        .find(|u| u.email.eq_ignore_ascii_case(&profile.email))
    {
        user.google_id = Some(profile.sub.clone());
        if user.full_name.is_empty() {
            user.full_name = profile.name.clone();
        }
        return Ok(user.clone());
    }

    insert_user(
        db,
        NewUser {
            full_name: profile.name.clone(),
            email: profile.email.clone(),
            google_id: Some(profile.sub.clone()),
            ..NewUser::default()
        },
        now,
    )
}

async fn fetch_profile(
    http: &reqwest::Client,
    client: &GoogleConfig,
    code: &str,
) -> Result<GoogleProfile, String> {
    let token: TokenResponse = http
        .post(TOKEN_URL)
        .form(&[
            ("code", code),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("redirect_uri", client.callback_url.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("token exchange failed: {e}"))?
        .json()
        .await
        .map_err(|e| format!("bad token response: {e}"))?;

    http.get(USERINFO_URL)
        .bearer_auth(&token.access_token)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("userinfo request failed: {e}"))?
        .json()
        .await
        .map_err(|e| format!("bad userinfo response: {e}"))
}

pub async fn handle_google_login(
    State(state): State<SharedState>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AppError> {
    let client = state
        .config
        .google
        .as_ref()
        .ok_or_else(|| AppError::Unavailable("Google sign-in is not configured".to_string()))?;

    let nonce = Uuid::new_v4().simple().to_string();
    let cookie = Cookie::build((STATE_COOKIE, nonce.clone()))
        .path("/auth/google")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();

    Ok((jar.add(cookie), Redirect::to(&authorization_url(client, &nonce))))
}

pub async fn handle_google_callback(
    State(state): State<SharedState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let frontend = state.config.frontend_url.trim_end_matches('/').to_string();
    let failed = format!("{frontend}/login?error=auth_failed");
    let cleared = jar.clone().remove(Cookie::build(STATE_COOKIE).path("/auth/google"));

    let Some(client) = state.config.google.as_ref() else {
        return (cleared, Redirect::to(&failed)).into_response();
    };
    if let Some(error) = query.error {
        warn!("Google sign-in refused: {error}");
        return (cleared, Redirect::to(&failed)).into_response();
    }

    let expected = jar.get(STATE_COOKIE).map(|c| c.value().to_string());
    let (Some(code), Some(returned)) = (query.code, query.state) else {
        return (cleared, Redirect::to(&failed)).into_response();
    };
    if expected.as_deref() != Some(returned.as_str()) {
        warn!("Google sign-in state mismatch");
        return (cleared, Redirect::to(&failed)).into_response();
    }

    let profile = match fetch_profile(&state.http, client, &code).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!("Google sign-in failed: {e}");
            return (cleared, Redirect::to(&failed)).into_response();
        }
    };

    let now = Utc::now();
    let user = match state.db.write(|db| upsert_google_user(db, &profile, now)) {
        Ok(user) => user,
        Err(e) => {
            warn!("Google sign-in could not store user: {e}");
            return (cleared, Redirect::to(&failed)).into_response();
        }
    };
    info!("User {} signed in with Google", user.id);

    let token = state.sessions.create(&user.id, now);
    let target = format!(
        "{frontend}/auth/callback?token={}",
        urlencoding::encode(&token)
    );
    (cleared, Redirect::to(&target)).into_response()
}
