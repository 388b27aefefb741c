use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::config::Config;
use crate::error::AppError;
use crate::login::SessionStore;
use crate::otp::{LogOtpSender, OtpSender, OtpStore};
use crate::payment::{PaymentGateway, PhonePeClient};
use crate::store::Database;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub sessions: SessionStore,
    pub otps: OtpStore,
    pub otp_sender: Arc<dyn OtpSender>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub http: reqwest::Client,
}

fn http_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))
}

#[cfg(feature = "mail")]
fn default_otp_sender(config: &Config) -> Arc<dyn OtpSender> {
    use crate::mailer::{MailOtpSender, Mailer};

    match config.smtp.as_ref().map(Mailer::new) {
        Some(Ok(mailer)) => {
            info!("OTP codes will be e-mailed");
            Arc::new(MailOtpSender::new(mailer))
        }
        Some(Err(e)) => {
            log::warn!("Failed to initialize mailer, logging OTP codes instead: {e}");
            Arc::new(LogOtpSender)
        }
        None => Arc::new(LogOtpSender),
    }
}

#[cfg(not(feature = "mail"))]
fn default_otp_sender(_config: &Config) -> Arc<dyn OtpSender> {
    Arc::new(LogOtpSender)
}

impl AppState {
    /// Production wiring: PhonePe over HTTP, mail or log OTP delivery
    pub fn new(config: Config) -> Result<SharedState, AppError> {
        let otp_sender = default_otp_sender(&config);
        let gateway = Arc::new(PhonePeClient::new(
            http_client()?,
            config.phonepe.host_url.clone(),
        ));
        Self::with_services(config, otp_sender, gateway)
    }

    /// Wire the state with explicit OTP and payment backends
    pub fn with_services(
        config: Config,
        otp_sender: Arc<dyn OtpSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<SharedState, AppError> {
        let db = Database::open(&config.data_dir)?;
        info!("Using database at {}", db.path().display());

        std::fs::create_dir_all(config.uploads_dir.join(crate::uploads::PYQ_DIR)).map_err(|e| {
            AppError::Internal(format!(
                "failed to create {}: {e}",
                config.uploads_dir.display()
            ))
        })?;

        Ok(Arc::new(AppState {
            sessions: SessionStore::new(config.session_ttl),
            otps: OtpStore::new(),
            http: http_client()?,
            config,
            db,
            otp_sender,
            gateway,
        }))
    }
}
