use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use log::{info, warn};

/// PhonePe merchant credentials
#[derive(Debug, Clone)]
pub struct PhonePeConfig {
    /// Merchant id issued by PhonePe; payments fail while unset
    pub merchant_id: Option<String>,
    /// Secret appended to the signed string of every checksum
    pub salt_key: Option<String>,
    /// Index of `salt_key`, sent after `###` in `X-VERIFY`
    pub salt_index: u32,
    /// API root, sandbox by default
    pub host_url: String,
    /// Mobile number sent with every pay request
    pub mobile_number: String,
}

/// Google OAuth client registration
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Must match a redirect URI registered for the client
    pub callback_url: String,
}

/// Mail relay used for OTP delivery
///
/// The connection uses implicit TLS, so `port` is usually 465.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Server configuration
///
/// Built from the environment by [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to listen on
    pub bind_addr: String,
    pub port: u16,
    /// Directory holding `db.json`
    pub data_dir: PathBuf,
    /// Root for uploaded files; PYQs go in its `pyqs` subdirectory
    pub uploads_dir: PathBuf,
    /// Externally visible URL of this server, used in file and callback links
    pub public_base_url: String,
    /// Where the SPA lives; OAuth and payment redirects land here
    pub frontend_url: String,
    /// Lifetime of a bearer session
    pub session_ttl: Duration,
    /// Request body limit, which bounds upload size
    pub max_upload_bytes: usize,
    pub phonepe: PhonePeConfig,
    /// `None` disables `/auth/google`
    pub google: Option<GoogleConfig>,
    /// `None` means OTP codes are only logged
    pub smtp: Option<SmtpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 5000,
            data_dir: PathBuf::from("data"),
            uploads_dir: PathBuf::from("uploads"),
            public_base_url: "http://localhost:5000".to_string(),
            frontend_url: "http://localhost:5173".to_string(),
            session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_upload_bytes: 20 * 1024 * 1024,
            phonepe: PhonePeConfig {
                merchant_id: None,
                salt_key: None,
                salt_index: 1,
                host_url: "https://api-preprod.phonepe.com/apis/pg-sandbox".to_string(),
                mobile_number: "9999999999".to_string(),
            },
            google: None,
            smtp: None,
        }
    }
}

impl Config {
    /// Build the configuration from environment variables
    ///
    /// Unset variables fall back to [`Config::default`]; a set but malformed
    /// numeric value is an error.
    pub fn load() -> Result<Self, String> {
        let defaults = Config::default();

        let port = try_load("PORT", defaults.port)?;
        let public_base_url = optional("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"));
        let session_ttl = session_ttl(try_load("SESSION_TTL_HOURS", 7 * 24)?)?;

        let google = match (optional("GOOGLE_CLIENT_ID"), optional("GOOGLE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(GoogleConfig {
                client_id,
                client_secret,
                callback_url: optional("GOOGLE_CALLBACK_URL")
                    .unwrap_or_else(|| format!("{public_base_url}/auth/google/callback")),
            }),
            _ => {
                info!("Google OAuth not configured, /auth/google disabled");
                None
            }
        };

        let smtp = match (optional("SMTP_HOST"), optional("SMTP_USERNAME")) {
            (Some(host), Some(username)) => Some(SmtpConfig {
                host,
                port: try_load("SMTP_PORT", 465)?,
                password: optional("SMTP_PASSWORD").unwrap_or_default(),
                from: optional("SMTP_FROM").unwrap_or_else(|| username.clone()),
                username,
            }),
            _ => None,
        };

        let merchant_id = optional("PHONEPE_MERCHANT_ID");
        if merchant_id.is_none() {
            warn!("PHONEPE_MERCHANT_ID not set, payments will fail");
        }

        Ok(Config {
            bind_addr: optional("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port,
            data_dir: optional("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            uploads_dir: optional("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.uploads_dir),
            public_base_url,
            frontend_url: optional("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            session_ttl,
            max_upload_bytes: try_load("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            phonepe: PhonePeConfig {
                merchant_id,
                salt_key: optional("PHONEPE_SALT_KEY"),
                salt_index: try_load("PHONEPE_SALT_INDEX", defaults.phonepe.salt_index)?,
                host_url: optional("PHONEPE_HOST_URL").unwrap_or(defaults.phonepe.host_url),
                mobile_number: optional("PHONEPE_MOBILE_NUMBER")
                    .unwrap_or(defaults.phonepe.mobile_number),
            },
            google,
            smtp,
        })
    }
}

/// Session lifetime from a number of hours
pub fn session_ttl(hours: u64) -> Result<Duration, String> {
    hours
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Invalid SESSION_TTL_HOURS value {hours:?}: too large"))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T>(key: &str, default: T) -> Result<T, String>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {key} value {raw:?}: {e}")),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
