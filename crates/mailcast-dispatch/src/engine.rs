use std::sync::Arc;
use std::time::Duration;

use mailcast_core::DispatcherConfig;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::Result,
    executor::DeliveryExecutor,
    lifecycle::next_status,
    period::{is_due_after, next_due_at},
    store::MailingStore,
    transport::MailTransport,
    types::{AttemptOutcome, MailingFilter, MailingStatus},
};

/// Timing knobs for [`Dispatcher`].
#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub tick_interval: Duration,
    pub startup_delay: Duration,
    pub send_timeout: Duration,
    /// Validity of the database lease taken for each tick.
    pub lease_ttl: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        (&DispatcherConfig::default()).into()
    }
}

impl From<&DispatcherConfig> for DispatcherSettings {
    fn from(cfg: &DispatcherConfig) -> Self {
        Self {
            tick_interval: cfg.tick_interval(),
            startup_delay: cfg.startup_delay(),
            send_timeout: cfg.send_timeout(),
            lease_ttl: cfg.lease_ttl(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// `created → launched` transitions.
    pub launched: usize,
    /// Transitions into `completed`.
    pub completed: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Active mailings whose period has not elapsed yet.
    pub not_due: usize,
    /// Mailings skipped because of a per-mailing error (nothing recorded).
    pub skipped: usize,
}

impl TickReport {
    pub fn attempts(&self) -> usize {
        self.delivered + self.failed
    }

    fn merge(&mut self, other: TickReport) {
        self.launched += other.launched;
        self.completed += other.completed;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.not_due += other.not_due;
        self.skipped += other.skipped;
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still in flight, in this process or in another
    /// one sharing the database; nothing was done.
    Skipped,
    /// A phase could not even load its mailings. The next tick retries.
    Failed(crate::error::DispatchError),
}

/// The periodic mailing dispatcher.
///
/// One tick runs the lifecycle sweep and then the dispatch sweep. Ticks are
/// mutually exclusive: a tick requested while another is running returns
/// [`TickOutcome::Skipped`]. Within a process this is a mutex; across
/// processes it is a lease row in the store, held for the whole tick.
pub struct Dispatcher {
    store: Arc<dyn MailingStore>,
    clock: Arc<dyn Clock>,
    executor: DeliveryExecutor,
    settings: DispatcherSettings,
    in_flight: Mutex<()>,
    /// Lease owner id, unique per dispatcher instance.
    owner: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MailingStore>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        let executor = DeliveryExecutor::new(
            Arc::clone(&store),
            transport,
            Arc::clone(&clock),
            settings.send_timeout,
        );
        Self {
            store,
            clock,
            executor,
            settings,
            in_flight: Mutex::new(()),
            owner: Uuid::now_v7().to_string(),
        }
    }

    /// Run one lifecycle sweep followed by one dispatch sweep.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("previous tick still running — skipping");
            return TickOutcome::Skipped;
        };

        match self.renew_lease() {
            Ok(true) => {}
            Ok(false) => {
                warn!("another dispatcher holds the lease — skipping");
                return TickOutcome::Skipped;
            }
            Err(e) => return TickOutcome::Failed(e),
        }

        let outcome = self.sweeps().await;
        if let Err(e) = self.store.release_lease(&self.owner) {
            warn!(error = %e, "could not release dispatcher lease; it expires on its own");
        }
        outcome
    }

    fn renew_lease(&self) -> Result<bool> {
        let ttl = chrono::Duration::seconds(self.settings.lease_ttl.as_secs() as i64);
        self.store.acquire_lease(&self.owner, self.clock.now(), ttl)
    }

    async fn sweeps(&self) -> TickOutcome {
        let mut report = match self.lifecycle_sweep() {
            Ok(r) => r,
            Err(e) => return TickOutcome::Failed(e),
        };
        match self.dispatch_sweep().await {
            Ok(r) => report.merge(r),
            Err(e) => return TickOutcome::Failed(e),
        }
        TickOutcome::Completed(report)
    }

    /// Advance the status of every pending (not completed, not disabled) mailing.
    ///
    /// Per-mailing store errors are logged and counted as skipped.
    pub fn lifecycle_sweep(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for mailing in self.store.list_mailings(MailingFilter::Pending)? {
            let Some(target) = next_status(&mailing, now) else {
                continue;
            };
            match self.store.update_mailing_status(&mailing.id, target) {
                Ok(true) => {
                    info!(mailing_id = %mailing.id, from = %mailing.status, to = %target, "mailing status advanced");
                    match target {
                        MailingStatus::Launched => report.launched += 1,
                        MailingStatus::Completed => report.completed += 1,
                        MailingStatus::Created => {}
                    }
                }
                Ok(false) => {
                    debug!(mailing_id = %mailing.id, "status already advanced");
                }
                Err(e) => {
                    error!(mailing_id = %mailing.id, error = %e, "status update failed — skipping mailing");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Send every active mailing whose period has elapsed.
    ///
    /// Mailings are independent: an error on one is logged and the sweep
    /// moves on to the next. The dispatcher lease is renewed before each
    /// delivery; if it was lost the sweep stops and the rest waits for the
    /// next tick.
    pub async fn dispatch_sweep(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        for mailing in self.store.list_mailings(MailingFilter::Active)? {
            match self.renew_lease() {
                Ok(true) => {}
                Ok(false) => {
                    warn!(mailing_id = %mailing.id, "dispatcher lease lost — ending sweep early");
                    break;
                }
                Err(e) => {
                    error!(mailing_id = %mailing.id, error = %e, "cannot renew dispatcher lease — ending sweep early");
                    break;
                }
            }

            let last = match self.store.latest_attempt(&mailing.id) {
                Ok(last) => last,
                Err(e) => {
                    error!(mailing_id = %mailing.id, error = %e, "cannot read last attempt — skipping mailing");
                    report.skipped += 1;
                    continue;
                }
            };

            let now = self.clock.now();
            if !is_due_after(mailing.recurrence, last.as_ref(), now) {
                debug!(
                    mailing_id = %mailing.id,
                    next_due = ?next_due_at(mailing.recurrence, last.map(|a| a.attempted_at)),
                    "mailing not due"
                );
                report.not_due += 1;
                continue;
            }

            match self.executor.execute(&mailing).await {
                Ok(attempt) => match attempt.outcome {
                    AttemptOutcome::Success => report.delivered += 1,
                    AttemptOutcome::Failure => report.failed += 1,
                },
                Err(e) => {
                    warn!(mailing_id = %mailing.id, error = %e, "mailing skipped this tick");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Main loop. Ticks every `tick_interval` until `shutdown` broadcasts `true`.
    ///
    /// Each tick runs in its own task so that a panic inside one sweep is
    /// logged and the loop carries on. A shutdown request received during a
    /// tick takes effect once that tick has finished.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.tick_interval.as_secs(),
            startup_delay_secs = self.settings.startup_delay.as_secs(),
            "dispatcher started"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.settings.startup_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("dispatcher stopped before first tick");
                return;
            }
        }

        let mut interval = tokio::time::interval_at(Instant::now(), self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    match tokio::spawn(async move { this.tick().await }).await {
                        Ok(TickOutcome::Completed(report)) => {
                            if report == TickReport::default() {
                                debug!("tick finished, nothing to do");
                            } else {
                                info!(?report, "tick finished");
                            }
                        }
                        Ok(TickOutcome::Skipped) => {}
                        Ok(TickOutcome::Failed(e)) => error!("dispatcher tick failed: {e}"),
                        Err(e) => error!("dispatcher tick panicked: {e}"),
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        DispatcherHandle { shutdown_tx, task }
    }
}

/// Resolves once `true` is broadcast or every sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Owner-side handle of a running dispatcher.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Request shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("dispatcher task ended abnormally: {e}");
        }
        info!("dispatcher stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{DispatchError, TransportError};
    use crate::store::SqliteStore;
    use crate::transport::OutgoingMail;
    use crate::types::{
        Attempt, Mailing, Message, NewAttempt, NewMailing, NewRecipient, Recipient, Recurrence,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl MailTransport for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl MailTransport for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    }

    /// Panics on its first send, delivers afterwards.
    struct PanicsOnce(AtomicUsize);

    #[async_trait]
    impl MailTransport for PanicsOnce {
        fn name(&self) -> &str {
            "panics-once"
        }
        async fn send(&self, _mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("transport blew up");
            }
            Ok(())
        }
    }

    /// Delegates to SQLite, but the first `list_mailings` call fails.
    struct FlakyStore {
        inner: Arc<SqliteStore>,
        failed_once: AtomicBool,
    }

    impl MailingStore for FlakyStore {
        fn list_mailings(&self, filter: MailingFilter) -> Result<Vec<Mailing>> {
            if !self.failed_once.swap(true, Ordering::SeqCst) {
                return Err(DispatchError::Internal("database unavailable".into()));
            }
            self.inner.list_mailings(filter)
        }
        fn update_mailing_status(&self, id: &str, status: MailingStatus) -> Result<bool> {
            self.inner.update_mailing_status(id, status)
        }
        fn list_attempts(&self, mailing_id: &str) -> Result<Vec<Attempt>> {
            self.inner.list_attempts(mailing_id)
        }
        fn latest_attempt(&self, mailing_id: &str) -> Result<Option<Attempt>> {
            self.inner.latest_attempt(mailing_id)
        }
        fn create_attempt(&self, attempt: NewAttempt) -> Result<Attempt> {
            self.inner.create_attempt(attempt)
        }
        fn message(&self, id: &str) -> Result<Option<Message>> {
            self.inner.message(id)
        }
        fn recipients(&self, mailing_id: &str) -> Result<Vec<Recipient>> {
            self.inner.recipients(mailing_id)
        }
        fn acquire_lease(
            &self,
            owner: &str,
            now: DateTime<Utc>,
            ttl: ChronoDuration,
        ) -> Result<bool> {
            self.inner.acquire_lease(owner, now, ttl)
        }
        fn release_lease(&self, owner: &str) -> Result<()> {
            self.inner.release_lease(owner)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
    }

    fn seeded_store() -> (Arc<SqliteStore>, String) {
        let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let msg = store.create_message("Weekly", "News").unwrap();
        let client = store
            .create_recipient(NewRecipient {
                email: "x@example.com".into(),
                ..Default::default()
            })
            .unwrap();
        let m = store
            .create_mailing(NewMailing {
                start_at: t0(),
                end_at: t0() + ChronoDuration::days(14),
                recurrence: Recurrence::Weekly,
                message_id: Some(msg.id),
                recipient_ids: vec![client.id],
            })
            .unwrap();
        (store, m.id)
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            tick_interval: Duration::from_secs(60),
            startup_delay: Duration::from_secs(2),
            send_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn tick_launches_then_sends() {
        let (store, id) = seeded_store();
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::minutes(1)));
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let d = Dispatcher::new(store.clone(), transport.clone(), clock.clone(), settings());

        let TickOutcome::Completed(report) = d.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.launched, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);

        // Same instant again: nothing new.
        let TickOutcome::Completed(report) = d.tick().await else {
            panic!("tick did not complete");
        };
        assert_eq!(report.attempts(), 0);
        assert_eq!(report.not_due, 1);
        assert_eq!(store.list_attempts(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_sweep_is_idempotent() {
        let (store, _id) = seeded_store();
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::days(20)));
        let d = Dispatcher::new(store, Arc::new(Counting(AtomicUsize::new(0))), clock, settings());

        let first = d.lifecycle_sweep().unwrap();
        assert_eq!(first.completed, 1);
        assert_eq!(d.lifecycle_sweep().unwrap(), TickReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let (store, id) = seeded_store();
        store
            .update_mailing_status(&id, MailingStatus::Launched)
            .unwrap();
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::hours(1)));
        let d = Arc::new(Dispatcher::new(store.clone(), Arc::new(Slow), clock, settings()));

        let first = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.tick().await }
        });
        // Let the first tick reach the slow send.
        tokio::task::yield_now().await;

        assert!(matches!(d.tick().await, TickOutcome::Skipped));
        assert!(matches!(first.await.unwrap(), TickOutcome::Completed(_)));
        assert_eq!(store.list_attempts(&id).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn service_ticks_after_startup_delay_and_stops() {
        let (store, id) = seeded_store();
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::hours(1)));
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let d = Arc::new(Dispatcher::new(store.clone(), transport.clone(), clock, settings()));

        let handle = d.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_attempts(&id).unwrap().len(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn service_survives_panicking_tick() {
        let (store, id) = seeded_store();
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::hours(1)));
        let transport = Arc::new(PanicsOnce(AtomicUsize::new(0)));
        let d = Arc::new(Dispatcher::new(store.clone(), transport.clone(), clock, settings()));

        let handle = d.start();
        // First tick at 2s panics mid-send: nothing recorded.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert!(store.list_attempts(&id).unwrap().is_empty());
        assert!(!handle.is_finished());

        // Next tick at 62s delivers.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 2);
        assert_eq!(store.list_attempts(&id).unwrap().len(), 1);
        assert!(!handle.is_finished());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn service_retries_after_failed_tick() {
        let (store, id) = seeded_store();
        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failed_once: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::hours(1)));
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let d = Arc::new(Dispatcher::new(flaky, transport.clone(), clock, settings()));

        let handle = d.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
        assert!(store.list_attempts(&id).unwrap().is_empty());
        assert!(!handle.is_finished());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_attempts(&id).unwrap().len(), 1);
        assert!(!handle.is_finished());

        handle.stop().await;
    }

    #[tokio::test]
    async fn tick_is_skipped_while_lease_is_held_elsewhere() {
        let (store, id) = seeded_store();
        let clock = Arc::new(ManualClock::new(t0() + ChronoDuration::hours(1)));
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let d = Dispatcher::new(store.clone(), transport.clone(), clock.clone(), settings());

        store
            .acquire_lease("other-process", clock.now(), ChronoDuration::minutes(5))
            .unwrap();
        assert!(matches!(d.tick().await, TickOutcome::Skipped));
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);

        // The other holder vanished without releasing: its lease runs out.
        clock.advance(ChronoDuration::minutes(6));
        assert!(matches!(d.tick().await, TickOutcome::Completed(_)));
        assert_eq!(store.list_attempts(&id).unwrap().len(), 1);

        // A completed tick hands the lease back.
        assert!(store
            .acquire_lease("other-process", clock.now(), ChronoDuration::minutes(5))
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick() {
        let (store, _id) = seeded_store();
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let d = Arc::new(Dispatcher::new(store, transport.clone(), clock, settings()));

        let handle = d.start();
        handle.stop().await;
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }
}
