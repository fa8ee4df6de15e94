use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{from_db_ts, init_db, to_db_ts},
    error::{DispatchError, Result},
    types::{
        Attempt, Mailing, MailingFilter, MailingStats, MailingStatus, Message, NewAttempt,
        NewMailing, NewRecipient, Recipient,
    },
};

/// Persistence interface consumed by the dispatcher.
///
/// The dispatcher is the only writer of mailing status and attempts.
pub trait MailingStore: Send + Sync {
    /// Mailings matching `filter`, oldest first.
    fn list_mailings(&self, filter: MailingFilter) -> Result<Vec<Mailing>>;

    /// Move a mailing to `status`.
    ///
    /// Forward-only: returns `Ok(false)` without writing when `status` is not
    /// ahead of the stored one. Unknown ids are `NotFound`.
    fn update_mailing_status(&self, id: &str, status: MailingStatus) -> Result<bool>;

    /// Every attempt of a mailing, newest first.
    fn list_attempts(&self, mailing_id: &str) -> Result<Vec<Attempt>>;

    /// The most recent attempt of a mailing, if it was ever attempted.
    fn latest_attempt(&self, mailing_id: &str) -> Result<Option<Attempt>>;

    /// Append one attempt record atomically.
    fn create_attempt(&self, attempt: NewAttempt) -> Result<Attempt>;

    fn message(&self, id: &str) -> Result<Option<Message>>;

    /// Recipients attached to a mailing, ordered by email.
    fn recipients(&self, mailing_id: &str) -> Result<Vec<Recipient>>;

    /// Claim or renew the dispatcher lease until `now + ttl`.
    ///
    /// Returns `Ok(false)` while another owner holds an unexpired lease.
    /// Re-acquiring a lease already held by `owner` extends it.
    fn acquire_lease(&self, owner: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool>;

    /// Drop the lease if `owner` still holds it.
    fn release_lease(&self, owner: &str) -> Result<()>;
}

/// SQLite-backed store.
///
/// Wraps a single connection in a `Mutex`; every method holds the lock for
/// its whole read/write so status checks and updates cannot interleave.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

const MAILING_COLUMNS: &str =
    "id, start_at, end_at, recurrence, status, disabled, message_id, created_at";
const ATTEMPT_COLUMNS: &str = "id, mailing_id, attempted_at, outcome, diagnostic";

impl SqliteStore {
    /// Enable foreign keys and run migrations on `conn`.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| DispatchError::Internal("mailing store lock poisoned".into()))
    }

    // --- management operations ----------------------------------------------

    #[instrument(skip(self, new), fields(email = %new.email))]
    pub fn create_recipient(&self, new: NewRecipient) -> Result<Recipient> {
        let id = Uuid::now_v7().to_string();
        let now = to_db_ts(Utc::now());
        let email = new.email.trim().to_string();
        if email.is_empty() {
            return Err(DispatchError::Configuration(
                "recipient email must not be empty".into(),
            ));
        }
        let db = self.lock()?;
        db.execute(
            "INSERT INTO clients (id, email, first_name, middle_name, last_name, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                email,
                new.first_name,
                new.middle_name,
                new.last_name,
                new.comment,
                now
            ],
        )?;
        Ok(Recipient {
            id,
            email,
            first_name: new.first_name,
            middle_name: new.middle_name,
            last_name: new.last_name,
            comment: new.comment,
        })
    }

    #[instrument(skip(self, body))]
    pub fn create_message(&self, subject: &str, body: &str) -> Result<Message> {
        let id = Uuid::now_v7().to_string();
        let now = to_db_ts(Utc::now());
        let db = self.lock()?;
        db.execute(
            "INSERT INTO messages (id, subject, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, subject, body, now],
        )?;
        Ok(Message {
            id,
            subject: subject.to_string(),
            body: body.to_string(),
        })
    }

    /// Insert a mailing in `created` status together with its recipient links.
    #[instrument(skip(self, new), fields(recurrence = %new.recurrence))]
    pub fn create_mailing(&self, new: NewMailing) -> Result<Mailing> {
        if new.end_at < new.start_at {
            return Err(DispatchError::Configuration(format!(
                "mailing ends ({}) before it starts ({})",
                new.end_at, new.start_at
            )));
        }

        let id = Uuid::now_v7().to_string();
        let created_at = Utc::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO mailings
             (id, start_at, end_at, recurrence, status, disabled, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, 'created', 0, ?5, ?6)",
            params![
                id,
                to_db_ts(new.start_at),
                to_db_ts(new.end_at),
                new.recurrence.as_str(),
                new.message_id,
                to_db_ts(created_at),
            ],
        )?;
        for client_id in &new.recipient_ids {
            tx.execute(
                "INSERT OR IGNORE INTO mailing_clients (mailing_id, client_id) VALUES (?1, ?2)",
                params![id, client_id],
            )?;
        }
        tx.commit()?;

        info!(mailing_id = %id, recipients = new.recipient_ids.len(), "mailing created");
        Ok(Mailing {
            id,
            start_at: new.start_at,
            end_at: new.end_at,
            recurrence: new.recurrence,
            status: MailingStatus::Created,
            disabled: false,
            message_id: new.message_id,
            created_at,
        })
    }

    pub fn get_mailing(&self, id: &str) -> Result<Mailing> {
        let db = self.lock()?;
        let row = db
            .query_row(
                &format!("SELECT {MAILING_COLUMNS} FROM mailings WHERE id = ?1"),
                [id],
                MailingRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_mailing(),
            None => Err(DispatchError::not_found("mailing", id)),
        }
    }

    /// Set or clear the manager override. Independent of status.
    #[instrument(skip(self))]
    pub fn set_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        let db = self.lock()?;
        let n = db.execute(
            "UPDATE mailings SET disabled = ?1 WHERE id = ?2",
            params![disabled, id],
        )?;
        if n == 0 {
            return Err(DispatchError::not_found("mailing", id));
        }
        info!(mailing_id = %id, disabled, "mailing override changed");
        Ok(())
    }

    /// Delete a mailing; its attempts and recipient links go with it.
    #[instrument(skip(self))]
    pub fn delete_mailing(&self, id: &str) -> Result<()> {
        let db = self.lock()?;
        let n = db.execute("DELETE FROM mailings WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(DispatchError::not_found("mailing", id));
        }
        info!(mailing_id = %id, "mailing deleted");
        Ok(())
    }

    pub fn stats(&self) -> Result<MailingStats> {
        let db = self.lock()?;
        let (mailing_count, active_count): (i64, i64) = db.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'launched' AND disabled = 0), 0)
             FROM mailings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let client_count: i64 = db.query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
        Ok(MailingStats {
            mailing_count: mailing_count as u64,
            active_count: active_count as u64,
            client_count: client_count as u64,
        })
    }
}

impl MailingStore for SqliteStore {
    #[instrument(skip(self))]
    fn list_mailings(&self, filter: MailingFilter) -> Result<Vec<Mailing>> {
        let clause = match filter {
            MailingFilter::All => "",
            MailingFilter::Pending => "WHERE status != 'completed' AND disabled = 0",
            MailingFilter::Active => "WHERE status = 'launched' AND disabled = 0",
        };
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {MAILING_COLUMNS} FROM mailings {clause} ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([], MailingRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // A single undecodable row must not hide every other mailing.
        let mailings = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.into_mailing() {
                    Ok(m) => Some(m),
                    Err(e) => {
                        warn!(mailing_id = %id, error = %e, "skipping undecodable mailing row");
                        None
                    }
                }
            })
            .collect();
        Ok(mailings)
    }

    #[instrument(skip(self))]
    fn update_mailing_status(&self, id: &str, status: MailingStatus) -> Result<bool> {
        let db = self.lock()?;
        let current: Option<String> = db
            .query_row("SELECT status FROM mailings WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let current: MailingStatus = current
            .ok_or_else(|| DispatchError::not_found("mailing", id))?
            .parse()
            .map_err(DispatchError::InvalidData)?;

        if status <= current {
            return Ok(false);
        }
        db.execute(
            "UPDATE mailings SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(true)
    }

    fn list_attempts(&self, mailing_id: &str) -> Result<Vec<Attempt>> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts
             WHERE mailing_id = ?1
             ORDER BY attempted_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map([mailing_id], AttemptRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }

    fn latest_attempt(&self, mailing_id: &str) -> Result<Option<Attempt>> {
        let db = self.lock()?;
        let row = db
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts
                     WHERE mailing_id = ?1
                     ORDER BY attempted_at DESC, id DESC
                     LIMIT 1"
                ),
                [mailing_id],
                AttemptRow::from_row,
            )
            .optional()?;
        row.map(AttemptRow::into_attempt).transpose()
    }

    #[instrument(skip(self, attempt), fields(mailing_id = %attempt.mailing_id, outcome = %attempt.outcome))]
    fn create_attempt(&self, attempt: NewAttempt) -> Result<Attempt> {
        let id = Uuid::now_v7().to_string();
        let db = self.lock()?;
        let n = db.execute(
            "INSERT INTO attempts (id, mailing_id, attempted_at, outcome, diagnostic)
             SELECT ?1, id, ?3, ?4, ?5 FROM mailings WHERE id = ?2",
            params![
                id,
                attempt.mailing_id,
                to_db_ts(attempt.attempted_at),
                attempt.outcome.as_str(),
                attempt.diagnostic,
            ],
        )?;
        if n == 0 {
            return Err(DispatchError::not_found("mailing", attempt.mailing_id));
        }
        Ok(Attempt {
            id,
            mailing_id: attempt.mailing_id,
            attempted_at: attempt.attempted_at,
            outcome: attempt.outcome,
            diagnostic: attempt.diagnostic,
        })
    }

    fn message(&self, id: &str) -> Result<Option<Message>> {
        let db = self.lock()?;
        let msg = db
            .query_row(
                "SELECT id, subject, body FROM messages WHERE id = ?1",
                [id],
                |row| {
                    Ok(Message {
                        id: row.get(0)?,
                        subject: row.get(1)?,
                        body: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(msg)
    }

    fn recipients(&self, mailing_id: &str) -> Result<Vec<Recipient>> {
        let db = self.lock()?;
        let mut stmt = db.prepare_cached(
            "SELECT c.id, c.email, c.first_name, c.middle_name, c.last_name, c.comment
             FROM clients c
             JOIN mailing_clients mc ON mc.client_id = c.id
             WHERE mc.mailing_id = ?1
             ORDER BY c.email",
        )?;
        let recipients = stmt
            .query_map([mailing_id], |row| {
                Ok(Recipient {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    first_name: row.get(2)?,
                    middle_name: row.get(3)?,
                    last_name: row.get(4)?,
                    comment: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(recipients)
    }

    #[instrument(skip(self, now, ttl))]
    fn acquire_lease(&self, owner: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        let mut db = self.lock()?;
        // IMMEDIATE takes the write lock up front so two processes cannot
        // both read a free lease and then both claim it.
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let holder: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM dispatcher_lease WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((holder, expires_at)) = holder {
            if holder != owner && from_db_ts(&expires_at)? > now {
                debug!(holder = %holder, expires_at = %expires_at, "dispatcher lease held elsewhere");
                return Ok(false);
            }
        }
        tx.execute(
            "INSERT INTO dispatcher_lease (id, owner, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at",
            params![owner, to_db_ts(now + ttl)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release_lease(&self, owner: &str) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "DELETE FROM dispatcher_lease WHERE id = 1 AND owner = ?1",
            [owner],
        )?;
        Ok(())
    }
}

/// Raw `mailings` row before enum/timestamp decoding.
struct MailingRow {
    id: String,
    start_at: String,
    end_at: String,
    recurrence: String,
    status: String,
    disabled: bool,
    message_id: Option<String>,
    created_at: String,
}

impl MailingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            start_at: row.get(1)?,
            end_at: row.get(2)?,
            recurrence: row.get(3)?,
            status: row.get(4)?,
            disabled: row.get(5)?,
            message_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_mailing(self) -> Result<Mailing> {
        Ok(Mailing {
            start_at: from_db_ts(&self.start_at)?,
            end_at: from_db_ts(&self.end_at)?,
            recurrence: self.recurrence.parse().map_err(DispatchError::InvalidData)?,
            status: self.status.parse().map_err(DispatchError::InvalidData)?,
            disabled: self.disabled,
            message_id: self.message_id,
            created_at: from_db_ts(&self.created_at)?,
            id: self.id,
        })
    }
}

struct AttemptRow {
    id: String,
    mailing_id: String,
    attempted_at: String,
    outcome: String,
    diagnostic: String,
}

impl AttemptRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mailing_id: row.get(1)?,
            attempted_at: row.get(2)?,
            outcome: row.get(3)?,
            diagnostic: row.get(4)?,
        })
    }

    fn into_attempt(self) -> Result<Attempt> {
        Ok(Attempt {
            attempted_at: from_db_ts(&self.attempted_at)?,
            outcome: self.outcome.parse().map_err(DispatchError::InvalidData)?,
            id: self.id,
            mailing_id: self.mailing_id,
            diagnostic: self.diagnostic,
        })
    }
}
