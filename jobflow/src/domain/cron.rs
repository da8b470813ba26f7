//! Cron schedules evaluated in a fixed time zone.
//!
//! Accepts the standard five-field form (`minute hour day-of-month month
//! day-of-week`) as well as the six/seven-field form with seconds understood by
//! the `cron` crate. In the five-field form a day matches when either a
//! restricted day-of-month or a restricted day-of-week matches.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

use crate::{Error, Result};

/// A parsed cron expression bound to a time zone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// Schedules whose fire times are merged; two when both day fields are restricted.
    schedules: Vec<cron::Schedule>,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse `expression` and bind it to the IANA zone `timezone`.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let tz: Tz = timezone.parse().map_err(|_| {
            Error::invalid_argument(format!("'{}' is not a valid IANA timezone", timezone))
        })?;

        let schedules = normalize_expression(expression)?
            .iter()
            .map(|normalized| {
                cron::Schedule::from_str(normalized).map_err(|e| {
                    Error::invalid_argument(format!(
                        "invalid cron expression '{}': {}",
                        expression, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedules,
            timezone: tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&local).next())
            .min()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Fire times in `(after, until]`, oldest first.
    pub fn fires_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        std::iter::successors(self.next_after(after), move |t| self.next_after(*t))
            .take_while(move |t| *t <= until)
    }
}

/// Rewrite a five-field expression into the seconds-first dialect of the `cron` crate.
///
/// The `cron` crate requires both day fields to match. When a five-field expression
/// restricts both, it is split into one expression per day field.
fn normalize_expression(expression: &str) -> Result<Vec<String>> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(vec![trimmed.to_string()]);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => {
            let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);
            let day_of_week = normalize_day_of_week(fields[4])?;
            if is_restricted(day_of_month) && is_restricted(fields[4]) {
                Ok(vec![
                    format!("0 {} {} {} {} *", minute, hour, day_of_month, month),
                    format!("0 {} {} * {} {}", minute, hour, month, day_of_week),
                ])
            } else {
                Ok(vec![format!(
                    "0 {} {} {} {} {}",
                    minute, hour, day_of_month, month, day_of_week
                )])
            }
        }
        6 | 7 => Ok(vec![fields.join(" ")]),
        n => Err(Error::invalid_argument(format!(
            "invalid cron expression '{}': expected 5 fields, got {}",
            expression, n
        ))),
    }
}

/// A day field starting with `*` (including `*/n`) leaves the other day field in charge.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// Standard cron numbers days 0-7 with Sunday as 0 and 7; the `cron` crate uses 1-7 with
/// Sunday as 1. Numeric items are expanded to explicit day lists so ranges such as
/// `5-7` keep their meaning. Named days pass through untouched.
fn normalize_day_of_week(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let invalid = || Error::invalid_argument(format!("invalid day-of-week field '{}'", field));
    let parse_day = |s: &str| -> Result<u32> {
        let day: u32 = s.parse().map_err(|_| invalid())?;
        if day > 7 { Err(invalid()) } else { Ok(day) }
    };

    let mut named = Vec::new();
    let mut days = [false; 7];

    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = match range {
            "*" => (0, 6),
            r => match r.split_once('-') {
                Some((a, b)) => (parse_day(a)?, parse_day(b)?),
                None if item.contains('/') => (parse_day(r)?, 6),
                None => {
                    let day = parse_day(r)?;
                    (day, day)
                }
            },
        };
        if start > end {
            return Err(invalid());
        }

        for day in (start..=end).step_by(step as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    let mut parts: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(day, _)| (day + 1).to_string())
        .collect();
    parts.extend(named);

    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.join(","))
}
