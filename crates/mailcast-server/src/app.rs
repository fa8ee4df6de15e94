use std::sync::Arc;

use mailcast_core::{MailcastConfig, MailcastError};
use mailcast_dispatch::{
    DisabledTransport, Dispatcher, DispatcherSettings, MailTransport, SqliteStore, SystemClock,
};
use mailcast_smtp::SmtpMailer;
use rusqlite::Connection;
use tracing::{info, warn};

/// Open the SQLite file, creating its directory if needed, and run migrations.
pub fn open_store(config: &MailcastConfig) -> mailcast_core::Result<SqliteStore> {
    let path = &config.database.path;
    ensure_parent_dir(path)?;
    info!(path = %path, "opening SQLite database");

    let conn = Connection::open(path).map_err(|e| MailcastError::Database(e.to_string()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| MailcastError::Database(e.to_string()))?;
    SqliteStore::new(conn).map_err(|e| MailcastError::Database(e.to_string()))
}

/// SMTP when configured, otherwise a transport that fails every send.
pub fn build_transport(config: &MailcastConfig) -> Arc<dyn MailTransport> {
    let Some(ref smtp) = config.smtp else {
        warn!("no [smtp] section configured — every delivery will be recorded as failed");
        return Arc::new(DisabledTransport);
    };
    match SmtpMailer::new(smtp, config.dispatcher.send_timeout()) {
        Ok(mailer) => Arc::new(mailer),
        Err(e) => {
            warn!("SMTP transport unusable ({e}) — every delivery will be recorded as failed");
            Arc::new(DisabledTransport)
        }
    }
}

/// Wire store, transport and wall clock into a dispatcher.
pub fn build_dispatcher(config: &MailcastConfig, store: Arc<SqliteStore>) -> Dispatcher {
    Dispatcher::new(
        store,
        build_transport(config),
        Arc::new(SystemClock),
        DispatcherSettings::from(&config.dispatcher),
    )
}

fn ensure_parent_dir(path: &str) -> mailcast_core::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
