use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{DispatchError, Result};

/// Initialise the mailing schema in `conn`.
///
/// Idempotent. Foreign keys must be enabled on the connection for the
/// `ON DELETE CASCADE` clauses to take effect.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS clients (
            id          TEXT    NOT NULL PRIMARY KEY,
            email       TEXT    NOT NULL,
            first_name  TEXT,
            middle_name TEXT,
            last_name   TEXT,
            comment     TEXT,
            created_at  TEXT    NOT NULL
        ) STRICT;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_clients_email ON clients (email);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT    NOT NULL PRIMARY KEY,
            subject     TEXT    NOT NULL,
            body        TEXT    NOT NULL,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS mailings (
            id          TEXT    NOT NULL PRIMARY KEY,
            start_at    TEXT    NOT NULL,
            end_at      TEXT    NOT NULL,
            recurrence  TEXT    NOT NULL,   -- daily | weekly | monthly
            status      TEXT    NOT NULL DEFAULT 'created',
            disabled    INTEGER NOT NULL DEFAULT 0,
            message_id  TEXT    REFERENCES messages (id) ON DELETE CASCADE,
            created_at  TEXT    NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_mailings_status ON mailings (status, disabled);

        CREATE TABLE IF NOT EXISTS mailing_clients (
            mailing_id  TEXT    NOT NULL REFERENCES mailings (id) ON DELETE CASCADE,
            client_id   TEXT    NOT NULL REFERENCES clients (id) ON DELETE CASCADE,
            PRIMARY KEY (mailing_id, client_id)
        ) STRICT;

        -- Append-only: rows are only ever inserted, or removed with their mailing.
        CREATE TABLE IF NOT EXISTS attempts (
            id           TEXT    NOT NULL PRIMARY KEY,
            mailing_id   TEXT    NOT NULL REFERENCES mailings (id) ON DELETE CASCADE,
            attempted_at TEXT    NOT NULL,
            outcome      TEXT    NOT NULL,   -- success | failure
            diagnostic   TEXT    NOT NULL DEFAULT ''
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_attempts_latest
            ON attempts (mailing_id, attempted_at DESC);

        -- At most one row: the dispatcher currently allowed to tick.
        CREATE TABLE IF NOT EXISTS dispatcher_lease (
            id          INTEGER NOT NULL PRIMARY KEY CHECK (id = 1),
            owner       TEXT    NOT NULL,
            expires_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 (`2026-01-01T00:00:00.000Z`) so text order matches time order.
pub(crate) fn to_db_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DispatchError::InvalidData(format!("bad timestamp {s:?}: {e}")))
}
