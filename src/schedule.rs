//! Recurring schedule parsing
//!
//! A schedule string turns into "next fire time after T". Accepted forms:
//!
//! - classic 5-field cron (`*/5 * * * *`), seconds implied as `0`
//! - 6/7-field cron with seconds (and optional year), as understood by the `cron` crate
//! - descriptors such as `@hourly` or `@daily`
//! - fixed intervals, `@every 1m30s` (units `ms`, `s`, `m`, `h`, `d`)

use crate::core::{KronError, Result};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
enum Rule {
    Cron(Box<Schedule>),
    Every(Duration),
}

#[derive(Debug, Clone)]
pub struct RecurringSchedule {
    source: String,
    rule: Rule,
}

impl RecurringSchedule {
    pub fn parse(spec: &str) -> Result<Self> {
        let source = spec.trim();
        if source.is_empty() {
            return Err(KronError::ScheduleParse("schedule is empty".to_string()));
        }

        let rule = if let Some(interval) = source.strip_prefix("@every") {
            Rule::Every(parse_interval(interval.trim())?)
        } else if source.starts_with('@') {
            Rule::Cron(Box::new(parse_cron(source)?))
        } else {
            let expression = match source.split_whitespace().count() {
                5 => format!("0 {source}"),
                6 | 7 => source.to_string(),
                n => {
                    return Err(KronError::ScheduleParse(format!(
                        "'{source}': expected 5, 6 or 7 fields, got {n}"
                    )));
                }
            };
            Rule::Cron(Box::new(parse_cron(&expression)?))
        };

        Ok(Self {
            source: source.to_string(),
            rule,
        })
    }

    /// First fire time strictly after `after`, `None` when the schedule is exhausted.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.rule {
            Rule::Cron(schedule) => schedule.after(&after).find(|next| *next > after),
            Rule::Every(interval) => after.checked_add_signed(*interval),
        }
    }

    /// Parses `spec` and resolves the next fire time in one step.
    pub fn next_fire(spec: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let schedule = Self::parse(spec)?;
        schedule.next_after(after).ok_or_else(|| {
            KronError::ScheduleParse(format!("'{}' has no upcoming fire time", schedule.source))
        })
    }
}

impl fmt::Display for RecurringSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression)
        .map_err(|e| KronError::ScheduleParse(format!("'{expression}': {e}")))
}

fn parse_interval(raw: &str) -> Result<Duration> {
    let invalid = || KronError::ScheduleParse(format!("invalid @every interval '{raw}'"));

    let mut total = Duration::zero();
    let mut rest = raw;
    if rest.is_empty() {
        return Err(invalid());
    }

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::try_milliseconds(amount),
            "s" => Duration::try_seconds(amount),
            "m" => Duration::try_minutes(amount),
            "h" => Duration::try_hours(amount),
            "d" => Duration::try_days(amount),
            _ => None,
        }
        .ok_or_else(invalid)?;
        rest = &rest[unit_len..];

        total = total.checked_add(&part).ok_or_else(invalid)?;
    }

    if total <= Duration::zero() {
        return Err(invalid());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_cron_implies_zero_seconds() {
        let schedule = RecurringSchedule::parse("*/5 * * * *").unwrap();
        let next = schedule.next_after(at(10, 2, 30)).unwrap();
        assert_eq!(next, at(10, 5, 0));
    }

    #[test]
    fn test_six_field_cron_with_seconds() {
        let schedule = RecurringSchedule::parse("*/10 * * * * *").unwrap();
        let next = schedule.next_after(at(10, 0, 0)).unwrap();
        assert_eq!(next, at(10, 0, 10));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = RecurringSchedule::parse("0 * * * * *").unwrap();
        let now = at(8, 15, 0);
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert_eq!(next.minute(), 16);
    }

    #[test]
    fn test_descriptor() {
        let schedule = RecurringSchedule::parse("@hourly").unwrap();
        assert_eq!(schedule.next_after(at(8, 15, 0)).unwrap(), at(9, 0, 0));
    }

    #[test]
    fn test_every_interval() {
        let schedule = RecurringSchedule::parse("@every 1m30s").unwrap();
        assert_eq!(schedule.next_after(at(8, 0, 0)).unwrap(), at(8, 1, 30));

        let schedule = RecurringSchedule::parse("@every 1500ms").unwrap();
        let next = schedule.next_after(at(8, 0, 0)).unwrap();
        assert_eq!((next - at(8, 0, 0)).num_milliseconds(), 1500);
    }

    #[test]
    fn test_invalid_schedules() {
        for spec in ["", "   ", "not a cron", "* * *", "@every", "@every 5", "@every 0s", "@every 5x", "@bogus"] {
            let err = RecurringSchedule::parse(spec).unwrap_err();
            assert_eq!(err.kind(), "schedule_parse", "spec {spec:?} should be rejected");
        }
    }

    #[test]
    fn test_next_fire_reports_parse_errors() {
        assert!(RecurringSchedule::next_fire("nope", Utc::now()).is_err());
        let now = Utc::now();
        assert!(RecurringSchedule::next_fire("@every 1s", now).unwrap() > now);
    }
}
