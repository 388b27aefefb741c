#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode, header},
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use vidyasphere::app::router;
use vidyasphere::config::Config;
use vidyasphere::otp::{OtpSender, PendingSignup};
use vidyasphere::payment::{GatewayError, GatewayFuture, PaymentGateway, SignedPayRequest};
use vidyasphere::state::{AppState, SharedState};

pub const SALT_KEY: &str = "test-salt-key";
pub const SALT_INDEX: u32 = 1;

/// Keeps every code it is asked to deliver
#[derive(Default)]
pub struct CapturingOtpSender {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl CapturingOtpSender {
    pub fn last_code_for(&self, phone: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == phone)
            .map(|(_, code)| code.clone())
    }
}

impl OtpSender for CapturingOtpSender {
    fn send(&self, pending: &PendingSignup) -> Result<(), String> {
        let phone = pending.user.phone.clone().unwrap_or_default();
        self.sent.lock().unwrap().push((phone, pending.code.clone()));
        Ok(())
    }
}

/// Records pay requests and answers with a fixed hosted-page URL
#[derive(Default)]
pub struct FakeGateway {
    pub requests: Mutex<Vec<SignedPayRequest>>,
    pub fail: bool,
}

impl PaymentGateway for FakeGateway {
    fn initiate<'a>(&'a self, request: &'a SignedPayRequest) -> GatewayFuture<'a> {
        self.requests.lock().unwrap().push(request.clone());
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                Err(GatewayError("sandbox unavailable".to_string()))
            } else {
                Ok("https://pay.example/checkout".to_string())
            }
        })
    }
}

pub struct TestApp {
    pub dir: TempDir,
    pub state: SharedState,
    pub app: Router,
    pub otp: Arc<CapturingOtpSender>,
    pub gateway: Arc<FakeGateway>,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config {
        data_dir: dir.path().join("data"),
        uploads_dir: dir.path().join("uploads"),
        public_base_url: "http://api.test".to_string(),
        frontend_url: "http://app.test".to_string(),
        ..Config::default()
    };
    config.phonepe.merchant_id = Some("MERCHANTUAT".to_string());
    config.phonepe.salt_key = Some(SALT_KEY.to_string());
    config.phonepe.salt_index = SALT_INDEX;
    config
}

pub fn spawn_with(config: Config, dir: TempDir, gateway: FakeGateway) -> TestApp {
    let otp = Arc::new(CapturingOtpSender::default());
    let gateway = Arc::new(gateway);
    let state = AppState::with_services(config, otp.clone(), gateway.clone()).unwrap();
    let app = router(state.clone());
    TestApp {
        dir,
        state,
        app,
        otp,
        gateway,
    }
}

pub fn spawn() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    spawn_with(config, dir, FakeGateway::default())
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(&self, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
        self.json_request("POST", uri, token, body).await
    }

    pub async fn json_request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    /// Create an account and return its session token
    pub async fn signup(&self, email: &str, phone: &str) -> String {
        let resp = self
            .post_json(
                "/api/auth/signup",
                None,
                serde_json::json!({
                    "name": "Test Student",
                    "email": email,
                    "phone": phone,
                    "password": "hunter22",
                }),
            )
            .await;
        assert_eq!(resp.status, StatusCode::OK, "{}", resp.text());
        resp.json()["token"].as_str().unwrap().to_string()
    }
}

pub const BOUNDARY: &str = "----vidyasphere-test-boundary";

/// One part of a multipart body
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        field: &'a str,
        file_name: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    },
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                        .as_bytes(),
                );
            }
            Part::File {
                field,
                file_name,
                content_type,
                bytes,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}
