//! `mailcast-dispatch` — periodic mailing dispatcher with SQLite persistence.
//!
//! # Overview
//!
//! Every tick of the [`engine::Dispatcher`] runs two phases in order:
//!
//! 1. **Lifecycle sweep**: moves each enabled, non-completed mailing along
//!    `created → launched → completed` according to its start/end window.
//! 2. **Dispatch sweep**: for each enabled `launched` mailing, checks the
//!    period policy against its latest attempt and, when due, sends the
//!    message to all recipients and appends one attempt record.
//!
//! # Recurrence
//!
//! | Variant   | Minimum gap between attempts |
//! |-----------|------------------------------|
//! | `Daily`   | 1 day                        |
//! | `Weekly`  | 7 days                       |
//! | `Monthly` | 30 days                      |

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod period;
pub mod store;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Dispatcher, DispatcherHandle, DispatcherSettings, TickOutcome, TickReport};
pub use error::{DispatchError, Result, TransportError};
pub use store::{MailingStore, SqliteStore};
pub use transport::{DisabledTransport, MailTransport, OutgoingMail};
pub use types::{
    Attempt, AttemptOutcome, Mailing, MailingFilter, MailingStats, MailingStatus, Message,
    NewAttempt, NewMailing, NewRecipient, Recipient, Recurrence,
};
