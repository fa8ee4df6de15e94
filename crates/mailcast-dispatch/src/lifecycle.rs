use chrono::{DateTime, Utc};

use crate::types::{Mailing, MailingStatus};

/// Compute the status `mailing` should have at `now`.
///
/// Returns `None` when no transition is needed. Rules, in priority order:
///
/// 1. `completed` is terminal.
/// 2. Past `end_at` → `completed`, even if the mailing never launched.
/// 3. `created` and at or past `start_at` → `launched`.
///
/// The disabled flag is not consulted here; callers decide which mailings
/// are swept.
pub fn next_status(mailing: &Mailing, now: DateTime<Utc>) -> Option<MailingStatus> {
    let target = match mailing.status {
        MailingStatus::Completed => return None,
        _ if now > mailing.end_at => MailingStatus::Completed,
        MailingStatus::Created if now >= mailing.start_at => MailingStatus::Launched,
        current => current,
    };

    // Never step backwards, whatever the stored window says.
    (target > mailing.status).then_some(target)
}
