use async_trait::async_trait;
use serde::Serialize;

use crate::error::TransportError;

/// One delivery operation: the same subject and body to every recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

/// Interface implemented by every outgoing mail backend (SMTP, test doubles).
///
/// Implementations must be `Send + Sync` so a single instance can be shared
/// by the dispatcher task across ticks.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Short identifier used in logs (e.g. `"smtp"`).
    fn name(&self) -> &str;

    /// Deliver `mail` as a single operation.
    ///
    /// An `Err` means the whole delivery is considered failed; partial
    /// per-recipient results are not reported.
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError>;
}

/// Placeholder transport used when no mail server is configured.
///
/// Every send fails, so launched mailings still leave a visible trail of
/// failed attempts instead of silently doing nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTransport;

#[async_trait]
impl MailTransport for DisabledTransport {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn send(&self, _mail: &OutgoingMail) -> Result<(), TransportError> {
        Err(TransportError::Unavailable(
            "no mail transport configured — set [smtp] in mailcast.toml".into(),
        ))
    }
}
