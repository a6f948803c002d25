// =============================================================================
// Session Clock — DST-aware computation of the next trading session open
// =============================================================================
//
// Session opens follow civil time in the host city, not UTC:
//   Asian:   01:00 UTC fixed (Tokyo does not observe DST)
//   London:  08:00 Europe/London  (07:00 UTC in summer, 08:00 UTC in winter)
//   NewYork: 09:30 America/New_York (13:30 UTC in summer, 14:30 UTC in winter)
//
// A fixed-UTC schedule would drift by one hour against the actual market
// opens twice a year; localizing in the home timezone and converting keeps
// the engine aligned across both transitions.
// =============================================================================

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::types::{Session, SessionId};

/// Market state classification for the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Closed,
}

/// Compute the UTC open instant for a session on a given calendar date, or
/// `None` when the local time cannot be resolved (never the case for these
/// opening times, which sit well clear of DST gaps).
pub fn session_open_utc(id: SessionId, date: NaiveDate) -> Option<DateTime<Utc>> {
    match id {
        SessionId::Asian => Utc
            .with_ymd_and_hms(date.year(), date.month(), date.day(), 1, 0, 0)
            .single(),
        SessionId::London => localize(Tz::Europe__London, date, 8, 0),
        SessionId::NewYork => localize(Tz::America__New_York, date, 9, 30),
    }
}

fn localize(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    tz.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Return the earliest session open strictly after `now`.
///
/// Scans today and the next six UTC calendar days, skipping Saturdays and
/// Sundays; seven consecutive days always contain at least one qualifying
/// weekday session, so this cannot come back empty.
pub fn next_session(now: DateTime<Utc>) -> Session {
    for day_offset in 0..7u64 {
        let date = now.date_naive() + Days::new(day_offset);
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            continue;
        }
        for id in SessionId::ALL {
            if let Some(open) = session_open_utc(id, date) {
                if open > now {
                    return Session::new(id, open);
                }
            }
        }
    }
    unreachable!("seven consecutive days always contain a weekday session");
}

/// Weekend days are the only time the market is closed for this engine.
pub fn market_status(now: DateTime<Utc>) -> MarketStatus {
    match now.weekday() {
        Weekday::Sat | Weekday::Sun => MarketStatus::Closed,
        _ => MarketStatus::Open,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn asian_open_is_fixed_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();
        let open = session_open_utc(SessionId::Asian, date).unwrap();
        assert_eq!(open, utc(2024, 7, 15, 1, 0));
    }

    #[test]
    fn london_open_shifts_with_bst() {
        // January: GMT, 08:00 local == 08:00 UTC.
        let winter = session_open_utc(
            SessionId::London,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
        .unwrap();
        assert_eq!(winter, utc(2024, 1, 15, 8, 0));

        // July: BST, 08:00 local == 07:00 UTC.
        let summer = session_open_utc(
            SessionId::London,
            NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
        )
        .unwrap();
        assert_eq!(summer, utc(2024, 7, 15, 7, 0));
    }

    #[test]
    fn new_york_open_shifts_across_us_dst_start() {
        // US DST started Sunday 2024-03-10. The Monday before the transition
        // opens at 14:30 UTC (EST); the Monday after opens at 13:30 UTC (EDT).
        // The Asian open is unaffected on both dates.
        let before = next_session(utc(2024, 3, 4, 12, 0));
        assert_eq!(before.id, SessionId::NewYork);
        assert_eq!(before.open, utc(2024, 3, 4, 14, 30));

        let after = next_session(utc(2024, 3, 11, 12, 0));
        assert_eq!(after.id, SessionId::NewYork);
        assert_eq!(after.open, utc(2024, 3, 11, 13, 30));

        let asian_before =
            session_open_utc(SessionId::Asian, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
                .unwrap();
        let asian_after =
            session_open_utc(SessionId::Asian, NaiveDate::from_ymd_opt(2024, 3, 11).unwrap())
                .unwrap();
        assert_eq!(asian_before.format("%H:%M").to_string(), "01:00");
        assert_eq!(asian_after.format("%H:%M").to_string(), "01:00");
    }

    #[test]
    fn dst_transition_sunday_rolls_to_monday() {
        // 2024-03-10 (the US DST-start date) is a Sunday: the clock skips it
        // and lands on Monday's Asian open.
        let next = next_session(utc(2024, 3, 10, 6, 0));
        assert_eq!(next.id, SessionId::Asian);
        assert_eq!(next.open, utc(2024, 3, 11, 1, 0));
    }

    #[test]
    fn friday_after_ny_open_rolls_to_monday_asian() {
        // Friday 2024-07-12 18:00 UTC is after the NY open (13:30 UTC in
        // July); the weekend is skipped entirely.
        let next = next_session(utc(2024, 7, 12, 18, 0));
        assert_eq!(next.id, SessionId::Asian);
        assert_eq!(next.open, utc(2024, 7, 15, 1, 0));
    }

    #[test]
    fn session_order_within_a_day() {
        // Early on a summer weekday the next session is Asian, then London,
        // then New York as `now` advances past each open.
        let day = utc(2024, 7, 15, 0, 0);
        let s1 = next_session(day);
        assert_eq!((s1.id, s1.open), (SessionId::Asian, utc(2024, 7, 15, 1, 0)));

        let s2 = next_session(utc(2024, 7, 15, 1, 0));
        assert_eq!((s2.id, s2.open), (SessionId::London, utc(2024, 7, 15, 7, 0)));

        let s3 = next_session(utc(2024, 7, 15, 7, 0));
        assert_eq!(
            (s3.id, s3.open),
            (SessionId::NewYork, utc(2024, 7, 15, 13, 30))
        );
    }

    #[test]
    fn next_session_is_strictly_future_and_weekday() {
        // Property 1 sampled over two full weeks at varying hours.
        let start = utc(2024, 3, 1, 0, 0);
        for hours in 0..(14 * 24) {
            let now = start + chrono::Duration::hours(hours);
            let session = next_session(now);
            assert!(session.open > now, "open must be strictly after now");
            assert!(
                !matches!(session.open.weekday(), Weekday::Sat | Weekday::Sun),
                "session must land on a weekday"
            );
        }
    }

    #[test]
    fn exact_open_instant_is_not_returned() {
        // "Strictly greater": asking at the exact open yields the next one.
        let open = utc(2024, 7, 15, 1, 0);
        let next = next_session(open);
        assert!(next.open > open);
        assert_eq!(next.id, SessionId::London);
    }

    #[test]
    fn weekend_is_closed() {
        assert_eq!(market_status(utc(2024, 7, 13, 12, 0)), MarketStatus::Closed);
        assert_eq!(market_status(utc(2024, 7, 14, 12, 0)), MarketStatus::Closed);
        assert_eq!(market_status(utc(2024, 7, 15, 12, 0)), MarketStatus::Open);
    }
}
