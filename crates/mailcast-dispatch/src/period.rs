use chrono::{DateTime, Utc};

use crate::types::{Attempt, Recurrence};

/// Decide whether a mailing with `recurrence` should be sent at `now`.
///
/// A mailing that was never attempted is always due. Otherwise it is due once
/// at least [`Recurrence::threshold`] has elapsed since the last attempt,
/// whatever that attempt's outcome was.
pub fn is_due(recurrence: Recurrence, last_attempt: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_attempt {
        None => true,
        Some(last) => now - last >= recurrence.threshold(),
    }
}

/// [`is_due`] against a stored attempt record.
pub fn is_due_after(recurrence: Recurrence, last: Option<&Attempt>, now: DateTime<Utc>) -> bool {
    is_due(recurrence, last.map(|a| a.attempted_at), now)
}

/// Earliest instant at which the mailing becomes due again, `None` if due now
/// because it was never attempted.
pub fn next_due_at(recurrence: Recurrence, last_attempt: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    last_attempt.map(|last| last + recurrence.threshold())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_send_is_always_due() {
        for r in [Recurrence::Daily, Recurrence::Weekly, Recurrence::Monthly] {
            assert!(is_due(r, None, t0()));
        }
    }

    #[test]
    fn daily_threshold() {
        let last = Some(t0());
        assert!(!is_due(Recurrence::Daily, last, t0() + Duration::hours(23)));
        assert!(is_due(Recurrence::Daily, last, t0() + Duration::hours(24)));
        assert!(is_due(Recurrence::Daily, last, t0() + Duration::hours(25)));
    }

    #[test]
    fn weekly_threshold() {
        let last = Some(t0());
        assert!(!is_due(Recurrence::Weekly, last, t0() + Duration::days(6)));
        assert!(is_due(Recurrence::Weekly, last, t0() + Duration::days(7)));
    }

    #[test]
    fn monthly_is_thirty_days_not_calendar() {
        // March has 31 days; a calendar-aware policy would not be due yet.
        let last = Some(t0());
        assert!(!is_due(Recurrence::Monthly, last, t0() + Duration::days(29)));
        assert!(is_due(Recurrence::Monthly, last, t0() + Duration::days(30)));
    }

    #[test]
    fn clock_skew_backwards_is_not_due() {
        assert!(!is_due(Recurrence::Daily, Some(t0()), t0() - Duration::hours(1)));
    }

    #[test]
    fn next_due_matches_threshold() {
        assert_eq!(next_due_at(Recurrence::Daily, None), None);
        assert_eq!(
            next_due_at(Recurrence::Weekly, Some(t0())),
            Some(t0() + Duration::days(7))
        );
    }
}
