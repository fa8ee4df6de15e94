//! `mailcast-smtp` — SMTP implementation of [`MailTransport`] on top of lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailcast_core::SmtpConfig;
use mailcast_dispatch::{MailTransport, OutgoingMail, TransportError};
use tracing::{debug, info};

/// Async SMTP sender built once from config and reused for every delivery.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the relay from `config`.
    ///
    /// `timeout` bounds each SMTP command; the dispatcher applies its own
    /// bound around the whole delivery on top of it.
    pub fn new(config: &SmtpConfig, timeout: Duration) -> Result<Self, TransportError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {e}", config.from)))?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| TransportError::Unavailable(format!("SMTP relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port).timeout(Some(timeout));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        info!(host = %config.host, port = config.port, starttls = config.starttls, "SMTP transport configured");
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

/// Build the lettre message: every recipient addressed in one envelope.
fn build_message(from: &Mailbox, mail: &OutgoingMail) -> Result<Message, TransportError> {
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(mail.subject.as_str())
        .header(ContentType::TEXT_PLAIN);

    for rcpt in &mail.recipients {
        let to: Mailbox = rcpt
            .parse()
            .map_err(|e| TransportError::InvalidAddress(format!("{rcpt}: {e}")))?;
        builder = builder.to(to);
    }

    builder
        .body(mail.body.clone())
        .map_err(|e| TransportError::Rejected(format!("build email: {e}")))
}

#[async_trait]
impl MailTransport for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        let email = build_message(&self.from, mail)?;
        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| TransportError::Rejected(format!("SMTP send: {e}")))?;
        debug!(code = %response.code(), recipients = mail.recipients.len(), "SMTP accepted message");
        Ok(())
    }
}
