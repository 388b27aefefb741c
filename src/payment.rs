//! PhonePe payment gateway integration
//!
//! A payment starts by saving a `PENDING` [`Transaction`], then posting a
//! signed pay request to PhonePe and returning its hosted-page URL. PhonePe
//! later calls `/api/callback` with the outcome, signed with the same salt.

use std::future::Future;
use std::pin::Pin;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::PhonePeConfig;
use crate::error::{AppError, AppJson};
use crate::state::SharedState;

/// API path that is part of the signed string for pay requests
pub const PAY_ENDPOINT: &str = "/pg/v1/pay";

/// Callback `code` meaning the payment went through
pub const PAYMENT_SUCCESS: &str = "PAYMENT_SUCCESS";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    CourseEnrollment,
    Donation,
}

/// One payment attempt, saved before PhonePe is contacted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Our id for the payment (`txn-...` or `donation-txn-...`)
    pub merchant_transaction_id: String,
    /// Account that paid, when the client sent one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Payer or donor name as entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Rupees
    pub amount: f64,
    /// `PENDING` until the callback arrives
    pub status: TransactionStatus,
    pub transaction_type: TransactionType,
    /// Course being enrolled in; absent for donations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentType {
    PayPage,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaymentInstrument {
    #[serde(rename = "type")]
    pub kind: InstrumentType,
}

/// Body of a PhonePe pay request, before base64 encoding
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PayPayload {
    pub merchant_id: String,
    pub merchant_transaction_id: String,
    pub merchant_user_id: String,
    /// Paisa
    pub amount: u64,
    pub redirect_url: String,
    pub redirect_mode: String,
    pub callback_url: String,
    pub mobile_number: String,
    pub payment_instrument: PaymentInstrument,
}

/// Encoded request ready to be posted to PhonePe
#[derive(Debug, Clone)]
pub struct SignedPayRequest {
    pub payload_base64: String,
    pub x_verify: String,
}

impl SignedPayRequest {
    pub fn new(payload: &PayPayload, salt_key: &str, salt_index: u32) -> Result<Self, AppError> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| AppError::Internal(format!("failed to encode pay payload: {e}")))?;
        let payload_base64 = STANDARD.encode(json);
        let x_verify = pay_checksum(&payload_base64, salt_key, salt_index);
        Ok(SignedPayRequest {
            payload_base64,
            x_verify,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct GatewayError(pub String);

pub type GatewayFuture<'a> = Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + 'a>>;

/// Sends signed pay requests and yields the hosted payment page URL
pub trait PaymentGateway: Send + Sync {
    fn initiate<'a>(&'a self, request: &'a SignedPayRequest) -> GatewayFuture<'a>;
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// `X-VERIFY` for a pay request: `sha256(base64 + "/pg/v1/pay" + salt) ### index`
pub fn pay_checksum(payload_base64: &str, salt_key: &str, salt_index: u32) -> String {
    let digest = sha256_hex(&format!("{payload_base64}{PAY_ENDPOINT}{salt_key}"));
    format!("{digest}###{salt_index}")
}

/// Expected `X-VERIFY` on a callback: `sha256(base64 + salt) ### index`
pub fn callback_checksum(payload_base64: &str, salt_key: &str, salt_index: u32) -> String {
    let digest = sha256_hex(&format!("{payload_base64}{salt_key}"));
    format!("{digest}###{salt_index}")
}

/// Compare a received `X-VERIFY` with the expected one in constant time
pub fn checksum_matches(received: &str, expected: &str) -> bool {
    bool::from(received.as_bytes().ct_eq(expected.as_bytes()))
}

/// Rupees to paisa
///
/// Rejects zero, negative and non-finite amounts.
pub fn to_paisa(amount: f64) -> Option<u64> {
    if !amount.is_finite() || amount <= 0.0 {
        return None;
    }
    let paisa = (amount * 100.0).round();
    (paisa >= 1.0 && paisa < u64::MAX as f64).then_some(paisa as u64)
}

fn unique_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

#[derive(Debug, Deserialize)]
struct PhonePeResponse {
    data: Option<PhonePeData>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeData {
    instrument_response: InstrumentResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentResponse {
    redirect_info: RedirectInfo,
}

#[derive(Debug, Deserialize)]
struct RedirectInfo {
    url: String,
}

/// PhonePe REST client
pub struct PhonePeClient {
    http: reqwest::Client,
    host_url: String,
}

impl PhonePeClient {
    pub fn new(http: reqwest::Client, host_url: impl Into<String>) -> Self {
        PhonePeClient {
            http,
            host_url: host_url.into(),
        }
    }

    async fn send(&self, request: &SignedPayRequest) -> Result<String, GatewayError> {
        let url = format!("{}{PAY_ENDPOINT}", self.host_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .header("X-VERIFY", &request.x_verify)
            .header("accept", "application/json")
            .json(&json!({ "request": request.payload_base64 }))
            .send()
            .await
            .map_err(|e| GatewayError(format!("request failed: {e}")))?;

        let status = response.status();
        let body: PhonePeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError(format!("unreadable response ({status}): {e}")))?;

        match body.data {
            Some(data) if status.is_success() => Ok(data.instrument_response.redirect_info.url),
            _ => Err(GatewayError(format!(
                "rejected ({status}): {}",
                body.message.unwrap_or_default()
            ))),
        }
    }
}

impl PaymentGateway for PhonePeClient {
    fn initiate<'a>(&'a self, request: &'a SignedPayRequest) -> GatewayFuture<'a> {
        Box::pin(self.send(request))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    /// Rupees; validated by [`to_paisa`]
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub course_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DonateRequest {
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Details of one payment to start
struct Checkout {
    transaction_type: TransactionType,
    amount: Option<f64>,
    user_id: Option<String>,
    name: Option<String>,
    course_name: Option<String>,
}

fn failure(message: &'static str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": message })),
    )
        .into_response()
}

fn merchant(config: &PhonePeConfig) -> Option<(&str, &str)> {
    Some((config.merchant_id.as_deref()?, config.salt_key.as_deref()?))
}

async fn start_checkout(state: &SharedState, checkout: Checkout) -> Result<String, AppError> {
    let (amount, paisa) = checkout
        .amount
        .and_then(|rupees| Some((rupees, to_paisa(rupees)?)))
        .ok_or_else(|| AppError::bad_request("amount must be a positive number"))?;

    let config = &state.config;
    let (merchant_id, salt_key) = merchant(&config.phonepe)
        .ok_or_else(|| AppError::Unavailable("payment gateway not configured".to_string()))?;

    let (txn_prefix, user_prefix) = match checkout.transaction_type {
        TransactionType::CourseEnrollment => ("txn-", "MUID-"),
        TransactionType::Donation => ("donation-txn-", "DONOR-"),
    };
    let merchant_transaction_id = unique_id(txn_prefix);
    let merchant_user_id = checkout
        .user_id
        .clone()
        .unwrap_or_else(|| unique_id(user_prefix));

    let now = Utc::now();
    let transaction = Transaction {
        merchant_transaction_id: merchant_transaction_id.clone(),
        user_id: checkout.user_id,
        name: checkout.name,
        amount,
        status: TransactionStatus::Pending,
        transaction_type: checkout.transaction_type,
        course_name: checkout.course_name,
        created_at: now,
        updated_at: now,
    };
    state.db.write(|db| {
        db.transactions.push(transaction);
        Ok::<_, AppError>(())
    })?;

    let payload = PayPayload {
        merchant_id: merchant_id.to_string(),
        merchant_transaction_id: merchant_transaction_id.clone(),
        merchant_user_id,
        amount: paisa,
        redirect_url: format!(
            "{}/payment-status/{merchant_transaction_id}",
            config.frontend_url.trim_end_matches('/')
        ),
        redirect_mode: "POST".to_string(),
        callback_url: format!("{}/api/callback", config.public_base_url.trim_end_matches('/')),
        mobile_number: config.phonepe.mobile_number.clone(),
        payment_instrument: PaymentInstrument {
            kind: InstrumentType::PayPage,
        },
    };
    let signed = SignedPayRequest::new(&payload, salt_key, config.phonepe.salt_index)?;

    let redirect_url = state
        .gateway
        .initiate(&signed)
        .await
        .map_err(|e| AppError::Internal(format!("PhonePe API error: {e}")))?;

    info!("Payment {merchant_transaction_id} initiated for {paisa} paisa");
    Ok(redirect_url)
}

fn checkout_response(result: Result<String, AppError>, failure_message: &'static str) -> Response {
    match result {
        Ok(redirect_url) => Json(json!({ "success": true, "redirectUrl": redirect_url })).into_response(),
        Err(err @ AppError::BadRequest(_)) => err.into_response(),
        Err(err) => {
            error!("{err}");
            failure(failure_message)
        }
    }
}

/// Course enrollment payment
pub async fn handle_pay(
    State(state): State<SharedState>,
    AppJson(req): AppJson<PayRequest>,
) -> Response {
    let checkout = Checkout {
        transaction_type: TransactionType::CourseEnrollment,
        amount: req.amount,
        user_id: req.user_id.filter(|u| !u.trim().is_empty()),
        name: req.name,
        course_name: req.course_name,
    };
    checkout_response(start_checkout(&state, checkout).await, "Could not initiate payment.")
}

pub async fn handle_donate(
    State(state): State<SharedState>,
    AppJson(req): AppJson<DonateRequest>,
) -> Response {
    let checkout = Checkout {
        transaction_type: TransactionType::Donation,
        amount: req.amount,
        user_id: None,
        name: req.name,
        course_name: None,
    };
    checkout_response(start_checkout(&state, checkout).await, "Could not initiate donation.")
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    pub response: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackPayload {
    #[serde(default)]
    code: String,
    #[serde(default)]
    data: Option<CallbackData>,
    #[serde(default)]
    merchant_transaction_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackData {
    merchant_transaction_id: String,
}

/// PhonePe server-to-server callback
pub async fn handle_callback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    AppJson(body): AppJson<CallbackBody>,
) -> (StatusCode, &'static str) {
    let Some((_, salt_key)) = merchant(&state.config.phonepe) else {
        error!("Callback received but PhonePe is not configured");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Error handling callback");
    };

    let received = headers
        .get("x-verify")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let expected = callback_checksum(&body.response, salt_key, state.config.phonepe.salt_index);
    if !checksum_matches(received, &expected) {
        warn!("Checksum mismatch on callback");
        return (StatusCode::BAD_REQUEST, "Invalid checksum");
    }

    let decoded = STANDARD
        .decode(body.response.trim())
        .ok()
        .and_then(|bytes| serde_json::from_slice::<CallbackPayload>(&bytes).ok());
    let Some(payload) = decoded else {
        warn!("Undecodable callback payload");
        return (StatusCode::BAD_REQUEST, "Invalid payload");
    };

    // PhonePe nests the id under `data`; older payloads carry it at the top level
    let Some(txn_id) = payload
        .data
        .map(|d| d.merchant_transaction_id)
        .or(payload.merchant_transaction_id)
    else {
        return (StatusCode::BAD_REQUEST, "Invalid payload");
    };

    let status = if payload.code == PAYMENT_SUCCESS {
        TransactionStatus::Success
    } else {
        TransactionStatus::Failure
    };

    let updated = state.db.write(|db| {
        let found = db.transaction_mut(&txn_id).map(|txn| {
            txn.status = status;
            txn.updated_at = Utc::now();
        });
        Ok::<_, AppError>(found.is_some())
    });

    match updated {
        Ok(true) => {
            info!("Transaction {txn_id} updated to {status:?}");
            (StatusCode::OK, "Callback handled successfully")
        }
        Ok(false) => {
            warn!("Transaction not found for callback: {txn_id}");
            (StatusCode::NOT_FOUND, "Transaction not found")
        }
        Err(e) => {
            error!("Error handling callback: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error handling callback")
        }
    }
}

/// Status lookup for the payment-status page
pub async fn handle_transaction_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let txn = state
        .db
        .read(|db| {
            Ok::<_, AppError>(
                db.transactions
                    .iter()
                    .find(|t| t.merchant_transaction_id == id)
                    .cloned(),
            )
        })?
        .ok_or_else(|| AppError::not_found("Transaction not found"))?;

    Ok(Json(json!({
        "merchantTransactionId": txn.merchant_transaction_id,
        "status": txn.status,
        "amount": txn.amount,
        "transactionType": txn.transaction_type,
    })))
}
