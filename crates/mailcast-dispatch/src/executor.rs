use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::{
    clock::Clock,
    error::{DispatchError, Result, TransportError},
    store::MailingStore,
    transport::{MailTransport, OutgoingMail},
    types::{Attempt, Mailing, MailingStatus, NewAttempt},
};

/// Sends one due mailing and records exactly one attempt for it.
pub struct DeliveryExecutor {
    store: Arc<dyn MailingStore>,
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
}

impl DeliveryExecutor {
    pub fn new(
        store: Arc<dyn MailingStore>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            send_timeout,
        }
    }

    /// Deliver `mailing` and append its attempt record.
    ///
    /// Transport failures (including the send timeout) never surface as
    /// `Err`: they become a `failure` attempt. `Err` is returned only when
    /// nothing was sent and nothing was recorded (missing message, no
    /// recipients, mailing not eligible) or when the attempt row itself
    /// could not be written.
    pub async fn execute(&self, mailing: &Mailing) -> Result<Attempt> {
        if mailing.status != MailingStatus::Launched || mailing.disabled {
            return Err(DispatchError::Configuration(format!(
                "mailing {} is not eligible for dispatch (status {}, disabled {})",
                mailing.id, mailing.status, mailing.disabled
            )));
        }

        let mail = self.prepare(mailing)?;
        let started_at = self.clock.now();

        let result = match tokio::time::timeout(self.send_timeout, self.transport.send(&mail)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout {
                secs: self.send_timeout.as_secs(),
            }),
        };

        let record = match result {
            Ok(()) => {
                info!(
                    mailing_id = %mailing.id,
                    transport = self.transport.name(),
                    recipients = mail.recipients.len(),
                    "mailing delivered"
                );
                NewAttempt::success(&mailing.id, started_at)
            }
            Err(e) => {
                warn!(
                    mailing_id = %mailing.id,
                    transport = self.transport.name(),
                    error = %e,
                    "mailing delivery failed"
                );
                NewAttempt::failure(&mailing.id, started_at, e.to_string())
            }
        };

        self.store.create_attempt(record)
    }

    /// Resolve the message and recipient list for `mailing`.
    fn prepare(&self, mailing: &Mailing) -> Result<OutgoingMail> {
        let message_id = mailing.message_id.as_deref().ok_or_else(|| {
            DispatchError::Configuration(format!("mailing {} has no message", mailing.id))
        })?;
        let message = self
            .store
            .message(message_id)?
            .ok_or_else(|| DispatchError::not_found("message", message_id))?;

        let recipients: Vec<String> = self
            .store
            .recipients(&mailing.id)?
            .into_iter()
            .map(|r| r.email)
            .collect();
        if recipients.is_empty() {
            return Err(DispatchError::Configuration(format!(
                "mailing {} has no recipients",
                mailing.id
            )));
        }

        Ok(OutgoingMail {
            subject: message.subject,
            body: message.body,
            recipients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::SqliteStore;
    use crate::types::{AttemptOutcome, NewMailing, NewRecipient, Recurrence};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<OutgoingMail>>);

    #[async_trait]
    impl MailTransport for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
            self.0.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    struct Rejecting;

    #[async_trait]
    impl MailTransport for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }
        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
            Err(TransportError::Rejected("554 relay access denied".into()))
        }
    }

    struct Stalled;

    #[async_trait]
    impl MailTransport for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap()
    }

    fn launched(store: &SqliteStore, with_message: bool, with_recipient: bool) -> Mailing {
        let message_id = with_message.then(|| store.create_message("Digest", "Body").unwrap().id);
        let recipient_ids = if with_recipient {
            vec![
                store
                    .create_recipient(NewRecipient {
                        email: "reader@example.com".into(),
                        ..Default::default()
                    })
                    .unwrap()
                    .id,
            ]
        } else {
            vec![]
        };
        let m = store
            .create_mailing(NewMailing {
                start_at: t0(),
                end_at: t0() + ChronoDuration::days(3),
                recurrence: Recurrence::Daily,
                message_id,
                recipient_ids,
            })
            .unwrap();
        store.update_mailing_status(&m.id, MailingStatus::Launched).unwrap();
        store.get_mailing(&m.id).unwrap()
    }

    fn executor(store: Arc<SqliteStore>, transport: Arc<dyn MailTransport>) -> DeliveryExecutor {
        DeliveryExecutor::new(
            store,
            transport,
            Arc::new(ManualClock::new(t0())),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn success_records_one_clean_attempt() {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let m = launched(&store, true, true);
        let transport = Arc::new(Recording(Mutex::new(Vec::new())));
        let exec = executor(store.clone(), transport.clone());

        let attempt = exec.execute(&m).await.unwrap();
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(attempt.diagnostic, "");
        assert_eq!(attempt.attempted_at, t0());

        let sent = transport.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Digest");
        assert_eq!(sent[0].recipients, vec!["reader@example.com".to_string()]);
        assert_eq!(store.list_attempts(&m.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transport_error_becomes_failure_attempt() {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let m = launched(&store, true, true);
        let exec = executor(store.clone(), Arc::new(Rejecting));

        let attempt = exec.execute(&m).await.unwrap();
        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(attempt.diagnostic, "554 relay access denied");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_times_out() {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let m = launched(&store, true, true);
        let exec = executor(store.clone(), Arc::new(Stalled));

        let attempt = exec.execute(&m).await.unwrap();
        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(attempt.diagnostic, "delivery timed out after 5s");
    }

    #[tokio::test]
    async fn missing_message_is_skipped_without_attempt() {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let m = launched(&store, false, true);
        let exec = executor(store.clone(), Arc::new(Rejecting));

        assert!(matches!(
            exec.execute(&m).await,
            Err(DispatchError::Configuration(_))
        ));
        assert!(store.list_attempts(&m.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_recipients_is_skipped_without_attempt() {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let m = launched(&store, true, false);
        let exec = executor(store.clone(), Arc::new(Rejecting));

        assert!(exec.execute(&m).await.is_err());
        assert!(store.list_attempts(&m.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_mailing_is_refused() {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let mut m = launched(&store, true, true);
        m.disabled = true;
        let exec = executor(store.clone(), Arc::new(Rejecting));

        assert!(exec.execute(&m).await.is_err());
        assert!(store.list_attempts(&m.id).unwrap().is_empty());
    }
}
