mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use common::{FakeGateway, SALT_INDEX, SALT_KEY, TestApp};
use vidyasphere::payment::{
    InstrumentType, PayPayload, PaymentInstrument, SignedPayRequest, TransactionStatus,
    callback_checksum, checksum_matches, pay_checksum, to_paisa,
};

fn decoded_payload(app: &TestApp) -> Value {
    let requests = app.gateway.requests.lock().unwrap();
    let last = requests.last().unwrap();
    serde_json::from_slice(&STANDARD.decode(&last.payload_base64).unwrap()).unwrap()
}

fn callback_request(payload: &Value, checksum: Option<String>) -> Request<Body> {
    let encoded = STANDARD.encode(payload.to_string());
    let checksum = checksum.unwrap_or_else(|| callback_checksum(&encoded, SALT_KEY, SALT_INDEX));
    Request::builder()
        .method("POST")
        .uri("/api/callback")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-VERIFY", checksum)
        .body(Body::from(json!({ "response": encoded }).to_string()))
        .unwrap()
}

async fn start_payment(app: &TestApp) -> String {
    let resp = app
        .post_json(
            "/api/pay",
            None,
            json!({ "amount": 499.5, "courseName": "Rust Basics", "name": "Asha" }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK, "{}", resp.text());
    decoded_payload(app)["merchantTransactionId"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn stored_status(app: &TestApp, id: &str) -> Value {
    let resp = app.get(&format!("/api/transactions/{id}"), None).await;
    assert_eq!(resp.status, StatusCode::OK, "{}", resp.text());
    resp.json()["status"].clone()
}

#[test]
fn checksums_follow_phonepe_format() {
    let b64 = "eyJhIjoxfQ==";
    let expected = format!(
        "{:x}###3",
        Sha256::digest(format!("{b64}/pg/v1/pay{SALT_KEY}").as_bytes())
    );
    assert_eq!(pay_checksum(b64, SALT_KEY, 3), expected);

    let expected = format!("{:x}###1", Sha256::digest(format!("{b64}{SALT_KEY}").as_bytes()));
    assert_eq!(callback_checksum(b64, SALT_KEY, 1), expected);

    let (digest, index) = expected.split_once("###").unwrap();
    assert_eq!(digest.len(), 64);
    assert_eq!(index, "1");
}

#[test]
fn checksum_comparison() {
    let expected = callback_checksum("eyJhIjoxfQ==", SALT_KEY, SALT_INDEX);
    assert!(checksum_matches(&expected, &expected));
    assert!(!checksum_matches("", &expected));
    assert!(!checksum_matches(&expected[..expected.len() - 1], &expected));
    assert!(!checksum_matches(&expected.replace("###1", "###2"), &expected));
}

#[test]
fn paisa_conversion() {
    assert_eq!(to_paisa(1.0), Some(100));
    assert_eq!(to_paisa(499.5), Some(49950));
    assert_eq!(to_paisa(0.1 + 0.2), Some(30));
    assert_eq!(to_paisa(0.0), None);
    assert_eq!(to_paisa(-5.0), None);
    assert_eq!(to_paisa(f64::NAN), None);
    assert_eq!(to_paisa(f64::INFINITY), None);
}

#[test]
fn signed_request_encodes_the_payload() {
    let payload = PayPayload {
        merchant_id: "M1".to_string(),
        merchant_transaction_id: "txn-1".to_string(),
        merchant_user_id: "MUID-1".to_string(),
        amount: 100,
        redirect_url: "http://app.test/payment-status/txn-1".to_string(),
        redirect_mode: "POST".to_string(),
        callback_url: "http://api.test/api/callback".to_string(),
        mobile_number: "9999999999".to_string(),
        payment_instrument: PaymentInstrument {
            kind: InstrumentType::PayPage,
        },
    };
    let signed = SignedPayRequest::new(&payload, SALT_KEY, SALT_INDEX).unwrap();
    assert_eq!(
        signed.x_verify,
        pay_checksum(&signed.payload_base64, SALT_KEY, SALT_INDEX)
    );

    let json: Value = serde_json::from_slice(&STANDARD.decode(&signed.payload_base64).unwrap()).unwrap();
    assert_eq!(json["merchantId"], "M1");
    assert_eq!(json["paymentInstrument"]["type"], "PAY_PAGE");
    assert_eq!(json["amount"], 100);
}

#[tokio::test]
async fn pay_records_pending_transaction_and_returns_redirect() {
    let app = common::spawn();

    let resp = app
        .post_json(
            "/api/pay",
            None,
            json!({ "amount": 499.5, "courseName": "Rust Basics", "name": "Asha" }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK, "{}", resp.text());
    assert_eq!(resp.json()["success"], true);
    assert_eq!(resp.json()["redirectUrl"], "https://pay.example/checkout");

    let payload = decoded_payload(&app);
    let txn_id = payload["merchantTransactionId"].as_str().unwrap().to_string();
    assert!(txn_id.starts_with("txn-"));
    assert!(payload["merchantUserId"].as_str().unwrap().starts_with("MUID-"));
    assert_eq!(payload["merchantId"], "MERCHANTUAT");
    assert_eq!(payload["amount"], 49950);
    assert_eq!(payload["redirectMode"], "POST");
    assert_eq!(
        payload["redirectUrl"],
        format!("http://app.test/payment-status/{txn_id}")
    );
    assert_eq!(payload["callbackUrl"], "http://api.test/api/callback");

    let status = app.get(&format!("/api/transactions/{txn_id}"), None).await.json();
    assert_eq!(status["status"], "PENDING");
    assert_eq!(status["amount"], 499.5);
    assert_eq!(status["transactionType"], "COURSE_ENROLLMENT");
}

#[tokio::test]
async fn donation_uses_donation_prefixes() {
    let app = common::spawn();
    let resp = app
        .post_json("/api/donate", None, json!({ "amount": 50, "name": "Well Wisher" }))
        .await;
    assert_eq!(resp.status, StatusCode::OK, "{}", resp.text());

    let payload = decoded_payload(&app);
    assert!(payload["merchantTransactionId"]
        .as_str()
        .unwrap()
        .starts_with("donation-txn-"));
    assert!(payload["merchantUserId"].as_str().unwrap().starts_with("DONOR-"));
    assert_eq!(payload["amount"], 5000);

    let txn_id = payload["merchantTransactionId"].as_str().unwrap();
    let status = app.get(&format!("/api/transactions/{txn_id}"), None).await.json();
    assert_eq!(status["transactionType"], "DONATION");
}

#[tokio::test]
async fn invalid_amount_is_a_bad_request() {
    let app = common::spawn();
    for amount in [json!(0), json!(-10)] {
        let resp = app.post_json("/api/pay", None, json!({ "amount": amount })).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }
    assert!(app.gateway.requests.lock().unwrap().is_empty());
    assert!(app
        .state
        .db
        .read(|db| Ok::<_, vidyasphere::AppError>(db.transactions.is_empty()))
        .unwrap());
}

#[tokio::test]
async fn gateway_failure_returns_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::test_config(&dir);
    let app = common::spawn_with(
        config,
        dir,
        FakeGateway {
            fail: true,
            ..FakeGateway::default()
        },
    );

    let pay = app.post_json("/api/pay", None, json!({ "amount": 10 })).await;
    assert_eq!(pay.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(pay.json()["success"], false);
    assert_eq!(pay.json()["message"], "Could not initiate payment.");

    let donate = app.post_json("/api/donate", None, json!({ "amount": 10 })).await;
    assert_eq!(donate.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(donate.json()["message"], "Could not initiate donation.");
}

#[tokio::test]
async fn unconfigured_merchant_cannot_take_payments() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(&dir);
    config.phonepe.merchant_id = None;
    let app = common::spawn_with(config, dir, FakeGateway::default());

    let pay = app.post_json("/api/pay", None, json!({ "amount": 10 })).await;
    assert_eq!(pay.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(pay.json()["success"], false);
}

#[tokio::test]
async fn callback_marks_success() {
    let app = common::spawn();
    let txn_id = start_payment(&app).await;

    let payload = json!({
        "success": true,
        "code": "PAYMENT_SUCCESS",
        "data": { "merchantTransactionId": txn_id, "amount": 49950 },
    });
    let resp = app.send(callback_request(&payload, None)).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.text(), "Callback handled successfully");
    assert_eq!(stored_status(&app, &txn_id).await, "SUCCESS");
    println!("✓ PhonePe callback applied");
}

#[tokio::test]
async fn callback_marks_failure_for_other_codes() {
    let app = common::spawn();
    let txn_id = start_payment(&app).await;

    // top-level id, as in older callback payloads
    let payload = json!({ "code": "PAYMENT_ERROR", "merchantTransactionId": txn_id });
    let resp = app.send(callback_request(&payload, None)).await;
    assert_eq!(resp.status, StatusCode::OK);

    let status = app
        .state
        .db
        .read(|db| {
            Ok::<_, vidyasphere::AppError>(
                db.transactions
                    .iter()
                    .find(|t| t.merchant_transaction_id == txn_id)
                    .map(|t| t.status),
            )
        })
        .unwrap();
    assert_eq!(status, Some(TransactionStatus::Failure));
}

#[tokio::test]
async fn callback_with_bad_checksum_is_rejected() {
    let app = common::spawn();
    let txn_id = start_payment(&app).await;

    let payload = json!({ "code": "PAYMENT_SUCCESS", "data": { "merchantTransactionId": txn_id } });
    let resp = app
        .send(callback_request(&payload, Some("deadbeef###1".to_string())))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.text(), "Invalid checksum");
    assert_eq!(stored_status(&app, &txn_id).await, "PENDING");
}

#[tokio::test]
async fn callback_for_unknown_transaction_is_not_found() {
    let app = common::spawn();
    let payload = json!({ "code": "PAYMENT_SUCCESS", "data": { "merchantTransactionId": "txn-missing" } });
    let resp = app.send(callback_request(&payload, None)).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(resp.text(), "Transaction not found");
}

#[tokio::test]
async fn callback_with_garbage_payload_is_rejected() {
    let app = common::spawn();
    let encoded = "not base64 at all!";
    let request = Request::builder()
        .method("POST")
        .uri("/api/callback")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-VERIFY", callback_checksum(encoded, SALT_KEY, SALT_INDEX))
        .body(Body::from(json!({ "response": encoded }).to_string()))
        .unwrap();
    let resp = app.send(request).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.text(), "Invalid payload");
}

#[tokio::test]
async fn unknown_transaction_status_is_not_found() {
    let app = common::spawn();
    let resp = app.get("/api/transactions/txn-nope", None).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_or_malformed_amount_is_a_bad_request() {
    let app = common::spawn();

    let missing = app
        .post_json("/api/pay", None, json!({ "courseName": "Rust Basics" }))
        .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.json()["message"], "amount must be a positive number");

    let as_string = app
        .post_json("/api/donate", None, json!({ "amount": "500" }))
        .await;
    assert_eq!(as_string.status, StatusCode::BAD_REQUEST);
    assert!(as_string.json()["message"].is_string(), "{}", as_string.text());

    let not_json = Request::builder()
        .method("POST")
        .uri("/api/pay")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{ amount: "))
        .unwrap();
    let resp = app.send(not_json).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert!(resp.json()["message"].is_string());

    assert!(app.gateway.requests.lock().unwrap().is_empty());
}
