use std::time::Instant;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use log::info;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::attendance;
use crate::google;
use crate::login;
use crate::otp;
use crate::payment;
use crate::state::{AppState, SharedState};
use crate::uploads;

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Log one line per request
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        "{method} {path} -> {} ({} ms)",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Build the full application router
pub fn router(state: SharedState) -> Router {
    let protected = Router::new()
        .route(
            "/api/user/subjects",
            get(attendance::handle_list_subjects).post(attendance::handle_add_subject),
        )
        .route("/api/user/subjects/:id", delete(attendance::handle_remove_subject))
        .route("/api/user/subjects/:id/mark", post(attendance::handle_mark))
        .route("/api/user/reminders", get(attendance::handle_reminders))
        .route("/api/user/subscribe", post(attendance::handle_subscribe))
        .route("/api/auth/logout", post(login::handle_logout))
        .route("/api/auth/me", get(login::handle_me))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            login::require_auth,
        ));

    Router::new()
        .route("/", get(health))
        .route("/api/auth/signup", post(login::handle_signup))
        .route("/auth/register", post(login::handle_signup))
        .route("/api/auth/signin", post(login::handle_signin))
        .route("/api/signin", post(login::handle_signin))
        .route("/auth/login", post(login::handle_signin))
        .route("/api/signup-send-otp", post(otp::handle_send_otp))
        .route("/api/signup-verify-otp", post(otp::handle_verify_otp))
        .route("/auth/google", get(google::handle_google_login))
        .route("/auth/google/callback", get(google::handle_google_callback))
        .route("/api/upload-pdf", post(uploads::handle_upload_pdf))
        .route("/api/upload-pyq", post(uploads::handle_upload_pyq))
        .route("/api/pyqs", get(uploads::handle_list_pyqs))
        .route("/api/pyqs/:id/download", get(uploads::handle_download_pyq))
        .route("/api/pay", post(payment::handle_pay))
        .route("/api/donate", post(payment::handle_donate))
        .route("/api/callback", post(payment::handle_callback))
        .route(
            "/api/transactions/:id",
            get(payment::handle_transaction_status),
        )
        .merge(protected)
        .nest_service("/uploads", ServeDir::new(&state.config.uploads_dir))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(middleware::from_fn(log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server and serve until the process is stopped
pub async fn run(state: SharedState) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("VidyaSphere backend listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience for `main`: load state from a config and run
pub async fn run_with_config(
    config: crate::config::Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new(config)?;
    run(state).await
}
