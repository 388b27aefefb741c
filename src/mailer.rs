use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use std::error::Error;

use crate::config::SmtpConfig;
use crate::otp::{OtpSender, OTP_TTL_SECS, PendingSignup};

pub struct Mailer {
    smtp: SmtpTransport,
    from: String,
}

impl Mailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, Box<dyn Error>> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let tls_parameters = TlsParameters::new(config.host.clone())?;

        let smtp = SmtpTransport::relay(&config.host)?
            .credentials(creds)
            .port(config.port)
            .tls(Tls::Wrapper(tls_parameters))
            .build();

        Ok(Mailer {
            smtp,
            from: config.from.clone(),
        })
    }

    pub fn send_otp(&self, to_email: &str, code: &str) -> Result<(), Box<dyn Error>> {
        let email = Message::builder()
            .from(format!("VidyaSphere <{}>", self.from).parse()?)
            .to(to_email.parse()?)
            .subject("Your VidyaSphere verification code")
            .body(format!(
                "Your verification code is: {}\nThis code will expire in {} minutes.",
                code,
                OTP_TTL_SECS / 60
            ))?;

        self.smtp.send(&email)?;
        Ok(())
    }
}

/// Delivers signup codes to the address entered on the form
pub struct MailOtpSender {
    mailer: Mailer,
}

impl MailOtpSender {
    pub fn new(mailer: Mailer) -> Self {
        MailOtpSender { mailer }
    }
}

impl OtpSender for MailOtpSender {
    fn send(&self, pending: &PendingSignup) -> Result<(), String> {
        self.mailer
            .send_otp(&pending.user.email, &pending.code)
            .map_err(|e| e.to_string())
    }
}
