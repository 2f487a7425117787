//! Parsed 5-field cron expressions (minute hour dom month dow).
//!
//! An expression is parsed once into per-field bitmasks and validated up
//! front; evaluation steps day-by-day and then scans the hour/minute
//! masks inside a matching day instead of testing every minute of the
//! year. Day-of-month and day-of-week follow the classic rule: when both
//! are restricted, a day matches if *either* does.
//!
//! Timezone handling: candidates are built in local time and mapped back
//! to UTC. A candidate that falls into a spring-forward gap is stepped
//! over; a fall-back duplicate resolves to its earlier (pre-transition)
//! instant.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};

use sb_domain::{Error, Result};

/// Resolve a timezone name, defaulting to UTC when it is unknown.
pub fn parse_tz(name: &str) -> chrono_tz::Tz {
    match name.parse::<chrono_tz::Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::debug!(tz = %name, "unknown timezone, evaluating in UTC");
            chrono_tz::UTC
        }
    }
}

/// Upper bound on search iterations: ~4 years of day hops leaves ample
/// room for sparse dom/dow combinations plus DST gap stepping.
const SEARCH_HOP_LIMIT: u32 = 20_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    dom: u64,
    months: u64,
    dow: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Config(format!(
                "cron expression needs 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }
        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let dom = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        // Both 0 and 7 mean Sunday.
        let dow_raw = parse_field(fields[4], 0, 7)?;
        let dow = if dow_raw & (1 << 7) != 0 {
            (dow_raw & !(1 << 7)) | 1
        } else {
            dow_raw
        };

        Ok(Self {
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom_hit = self.dom & (1 << date.day()) != 0;
        let dow_hit = self.dow & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }

    /// Earliest `(hour, minute)` slot at or after `from`, scanning the
    /// hour and minute masks.
    fn next_slot_in_day(&self, from: NaiveTime) -> Option<NaiveTime> {
        let mut minute_floor = from.minute();
        for hour in from.hour()..24 {
            if self.hours & (1 << hour) != 0 {
                if let Some(minute) = next_set_bit(self.minutes, minute_floor, 59) {
                    return NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
            minute_floor = 0;
        }
        None
    }

    /// Next firing strictly after `after`, evaluated in `tz`, as UTC.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        use chrono::TimeZone;

        let local = after.with_timezone(&tz).naive_local();
        let mut cursor = local
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))
            .unwrap_or(local)
            + Duration::minutes(1);

        for _ in 0..SEARCH_HOP_LIMIT {
            if !self.day_matches(cursor.date()) {
                cursor = cursor.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            let Some(slot) = self.next_slot_in_day(cursor.time()) else {
                cursor = cursor.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            };
            let candidate = cursor.date().and_time(slot);
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(first, second) => {
                    return Some(first.min(second).with_timezone(&Utc));
                }
                // Spring-forward gap: this wall-clock minute never
                // happens. Step past it and keep searching.
                chrono::LocalResult::None => {
                    cursor = candidate + Duration::minutes(1);
                }
            }
        }
        None
    }
}

/// Parse one field into a bitmask over `[min, max]`.
///
/// Grammar per comma-separated part: `*`, `N`, `A-B`, with an optional
/// `/STEP` suffix on any of them (`N/STEP` ranges from `N` to the field
/// maximum).
fn parse_field(spec: &str, min: u32, max: u32) -> Result<u64> {
    let mut mask = 0u64;
    for part in spec.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| Error::Config(format!("bad cron step in {part:?}")))?;
                if step == 0 {
                    return Err(Error::Config(format!("zero cron step in {part:?}")));
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            (parse_value(lo)?, parse_value(hi)?)
        } else {
            let value = parse_value(base)?;
            // `N/STEP` opens a range up to the field max.
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(Error::Config(format!(
                "cron value out of range in {part:?} (allowed {min}-{max})"
            )));
        }
        let mut value = lo;
        while value <= hi {
            mask |= 1 << value;
            value += step;
        }
    }
    if mask == 0 {
        return Err(Error::Config(format!("empty cron field: {spec:?}")));
    }
    Ok(mask)
}

fn parse_value(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| Error::Config(format!("bad cron value: {s:?}")))
}

fn next_set_bit(mask: u64, from: u32, max: u32) -> Option<u32> {
    (from..=max).find(|bit| mask & (1 << bit) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn next_utc(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        CronExpr::parse(expr)
            .unwrap()
            .next_after(&after, chrono_tz::UTC)
            .unwrap()
    }

    #[test]
    fn parse_rejects_malformed_expressions() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("ten * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err(), "dom starts at 1");
    }

    #[test]
    fn parse_accepts_lists_ranges_and_steps() {
        assert!(CronExpr::parse("0,15,30,45 * * * *").is_ok());
        assert!(CronExpr::parse("*/5 9-17 1-7 * 1-5").is_ok());
        assert!(CronExpr::parse("10-40/10 * * * *").is_ok());
    }

    #[test]
    fn next_is_strictly_after_even_on_a_match() {
        let on_the_hour = Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap();
        let next = next_utc("0 * * * *", on_the_hour);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn minute_steps_fire_within_the_hour() {
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 10, 7, 30).unwrap();
        let next = next_utc("*/15 * * * *", after);
        assert_eq!(next.hour(), 10);
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn range_with_step_skips_between_marks() {
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 10, 25, 0).unwrap();
        let next = next_utc("10-40/10 * * * *", after);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn rolls_to_next_day_when_todays_slots_are_spent() {
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap();
        let next = next_utc("30 9 * * *", after);
        assert_eq!(next.day(), 16);
        assert_eq!((next.hour(), next.minute()), (9, 30));
    }

    #[test]
    fn dom_and_dow_are_either_or_when_both_restricted() {
        // 2026-02-13 is a Friday; "the 13th or any Friday" must hit both
        // Friday the 6th and Friday the 13th.
        let after = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        let first = expr.next_after(&after, chrono_tz::UTC).unwrap();
        assert_eq!(first.day(), 6, "first Friday comes before the 13th");
        let second = expr.next_after(&first, chrono_tz::UTC).unwrap();
        assert_eq!(second.day(), 13);
    }

    #[test]
    fn seven_means_sunday() {
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap(); // a Monday
        let via_seven = next_utc("0 0 * * 7", after);
        let via_zero = next_utc("0 0 * * 0", after);
        assert_eq!(via_seven, via_zero);
        assert_eq!(via_seven.weekday().num_days_from_sunday(), 0);
    }

    #[test]
    fn evaluates_in_the_requested_timezone() {
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap();
        let tz = parse_tz("Asia/Tokyo");
        let next = CronExpr::parse("0 9 * * *")
            .unwrap()
            .next_after(&after, tz)
            .unwrap();
        // 09:00 JST is midnight UTC.
        assert_eq!((next.hour(), next.minute()), (0, 0));
    }

    #[test]
    fn spring_forward_gap_is_stepped_over() {
        // US/Eastern jumps 02:00 → 03:00 on 2026-03-08, so 02:30 local
        // does not exist that day; the firing lands on the 9th.
        let after = Utc.with_ymd_and_hms(2026, 3, 8, 6, 0, 0).unwrap();
        let tz = parse_tz("US/Eastern");
        let next = CronExpr::parse("30 2 * * *")
            .unwrap()
            .next_after(&after, tz)
            .unwrap();
        assert_eq!(next.day(), 9);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn fall_back_duplicate_resolves_to_the_earlier_instant() {
        // 01:30 local happens twice on 2026-11-01 in US/Eastern; the EDT
        // (UTC-4) occurrence wins.
        let after = Utc.with_ymd_and_hms(2026, 11, 1, 4, 0, 0).unwrap();
        let tz = parse_tz("US/Eastern");
        let next = CronExpr::parse("30 1 * * *")
            .unwrap()
            .next_after(&after, tz)
            .unwrap();
        assert_eq!((next.hour(), next.minute()), (5, 30));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(parse_tz("Neither/Here"), chrono_tz::UTC);
        assert_eq!(parse_tz(""), chrono_tz::UTC);
        assert_eq!(parse_tz("Europe/London"), chrono_tz::Europe::London);
    }

    #[test]
    fn impossible_dates_return_none() {
        // February the 30th never matches.
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert!(expr.next_after(&after, chrono_tz::UTC).is_none());
    }
}
