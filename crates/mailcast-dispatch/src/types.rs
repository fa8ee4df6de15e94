use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How often a launched mailing is re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekly,
    /// Fixed 30-day period, not calendar-month aware.
    Monthly,
}

impl Recurrence {
    /// Minimum time between two attempts of the same mailing.
    pub fn threshold(self) -> Duration {
        match self {
            Recurrence::Daily => Duration::days(1),
            Recurrence::Weekly => Duration::days(7),
            Recurrence::Monthly => Duration::days(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Recurrence {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            other => Err(format!("unknown recurrence: {other}")),
        }
    }
}

/// Lifecycle state of a mailing.
///
/// Variants are declared in lifecycle order so `Ord` doubles as the
/// "only moves forward" check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailingStatus {
    /// Waiting for `start_at`.
    Created,
    /// Inside its window; eligible for dispatch.
    Launched,
    /// Past `end_at`. Terminal.
    Completed,
}

impl MailingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MailingStatus::Created => "created",
            MailingStatus::Launched => "launched",
            MailingStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for MailingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MailingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(MailingStatus::Created),
            "launched" => Ok(MailingStatus::Launched),
            "completed" => Ok(MailingStatus::Completed),
            other => Err(format!("unknown mailing status: {other}")),
        }
    }
}

/// Result of one delivery try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "failure" => Ok(AttemptOutcome::Failure),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

/// A scheduled campaign: one message, many recipients, a recurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailing {
    /// UUIDv7 string, primary key.
    pub id: String,
    /// First instant at which the mailing may be sent.
    pub start_at: DateTime<Utc>,
    /// After this instant the mailing is completed.
    pub end_at: DateTime<Utc>,
    pub recurrence: Recurrence,
    pub status: MailingStatus,
    /// Manager override. Suppresses lifecycle sweeps and dispatch while set.
    pub disabled: bool,
    /// `None` means the mailing can never be dispatched.
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Subject and body sent by a mailing.
///
/// There is no update operation: once referenced by an attempt the text must
/// stay what was actually sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub subject: String,
    pub body: String,
}

/// A mailing recipient (a "client" of the service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    /// Unique across all recipients.
    pub email: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub comment: Option<String>,
}

/// One immutable record of a dispatch try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub mailing_id: String,
    /// When the delivery started.
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Server response or error text; empty on success.
    pub diagnostic: String,
}

/// Insert payload for [`Attempt`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub mailing_id: String,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub diagnostic: String,
}

impl NewAttempt {
    pub fn success(mailing_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            mailing_id: mailing_id.into(),
            attempted_at: at,
            outcome: AttemptOutcome::Success,
            diagnostic: String::new(),
        }
    }

    pub fn failure(
        mailing_id: impl Into<String>,
        at: DateTime<Utc>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            mailing_id: mailing_id.into(),
            attempted_at: at,
            outcome: AttemptOutcome::Failure,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Insert payload for a mailing.
#[derive(Debug, Clone)]
pub struct NewMailing {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub recurrence: Recurrence,
    pub message_id: Option<String>,
    pub recipient_ids: Vec<String>,
}

/// Insert payload for a recipient.
#[derive(Debug, Clone, Default)]
pub struct NewRecipient {
    pub email: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub comment: Option<String>,
}

/// Which mailings a sweep loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailingFilter {
    All,
    /// Not completed and not disabled: subject to the lifecycle sweep.
    Pending,
    /// Launched and not disabled: subject to the dispatch sweep.
    Active,
}

/// Dashboard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailingStats {
    pub mailing_count: u64,
    /// Launched and not disabled.
    pub active_count: u64,
    pub client_count: u64,
}
