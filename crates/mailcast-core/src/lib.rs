//! `mailcast-core` — configuration and process-level errors shared by every
//! mailcast crate.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, DispatcherConfig, MailcastConfig, SmtpConfig};
pub use error::{MailcastError, Result};
