use crate::error::{EngineError, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;

/// Schedules more than this many years out are treated as never firing.
const MAX_LOOKAHEAD_YEARS: i32 = 5;

/// Parsed cron trigger expression, evaluated in UTC.
///
/// Accepts the classic five fields (`min hour dom month dow`), an optional
/// leading seconds field, and the `@hourly`-style descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    day_of_month_any: bool,
    day_of_week_any: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        Self::parse_inner(trimmed).map_err(|reason| {
            EngineError::Registration(format!(
                "Invalid trigger expression '{}': {}",
                trimmed, reason
            ))
        })
    }

    fn parse_inner(expr: &str) -> std::result::Result<Self, String> {
        if expr.is_empty() {
            return Err("expression is empty".to_string());
        }

        let expanded = match expr.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            other if other.starts_with('@') => {
                return Err(format!("unknown descriptor '{}'", expr));
            }
            _ => expr.to_string(),
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        let (seconds_field, fields) = match parts.len() {
            5 => (None, &parts[..]),
            6 => (Some(parts[0]), &parts[1..]),
            _ => {
                return Err(
                    "expected 5 fields (min hour day month dow) or 6 with leading seconds"
                        .to_string(),
                )
            }
        };

        let seconds = match seconds_field {
            Some(field) => parse_cron_field(field, 0, 59)?,
            None => BTreeSet::from([0]),
        };
        let minutes = parse_cron_field(fields[0], 0, 59)?;
        let hours = parse_cron_field(fields[1], 0, 23)?;
        let days_of_month = parse_cron_field(fields[2], 1, 31)?;
        let months = parse_cron_field(fields[3], 1, 12)?;
        // 7 is an alias for Sunday.
        let days_of_week = parse_cron_field(fields[4], 0, 7)?
            .into_iter()
            .map(|day| day % 7)
            .collect();

        Ok(Self {
            expression: expr.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            day_of_month_any: is_wildcard(fields[2]),
            day_of_week_any: is_wildcard(fields[4]),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `from`, or `None` if the expression can
    /// never match (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cursor = (from + Duration::seconds(1)).with_nanosecond(0)?;
        let year_limit = from.year() + MAX_LOOKAHEAD_YEARS;

        while cursor.year() <= year_limit {
            if !self.months.contains(&cursor.month()) {
                cursor = start_of_next_month(cursor)?;
                continue;
            }
            if !self.day_matches(cursor) {
                cursor = start_of_day(cursor)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&cursor.hour()) {
                cursor = start_of_hour(cursor)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&cursor.minute()) {
                cursor = start_of_minute(cursor)? + Duration::minutes(1);
                continue;
            }
            match self.seconds.range(cursor.second()..).next() {
                Some(second) => return cursor.with_second(*second),
                None => {
                    cursor = start_of_minute(cursor)? + Duration::minutes(1);
                }
            }
        }

        None
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&at.day());
        let dow = self
            .days_of_week
            .contains(&at.weekday().num_days_from_sunday());
        match (self.day_of_month_any, self.day_of_week_any) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            // Both restricted: classic cron fires when either matches.
            (false, false) => dom || dow,
        }
    }
}

fn is_wildcard(field: &str) -> bool {
    field == "*" || field == "?"
}

fn parse_cron_field(field: &str, min: u32, max: u32) -> std::result::Result<BTreeSet<u32>, String> {
    let mut out = BTreeSet::new();
    for part in field.split(',') {
        let token = part.trim();
        if token.is_empty() {
            return Err(format!("invalid cron token '{}'", field));
        }

        let (range_raw, step) = match token.split_once('/') {
            Some((range_raw, step_raw)) => {
                let step: u32 = step_raw
                    .parse()
                    .map_err(|_| format!("invalid cron step '{}'", token))?;
                if step == 0 {
                    return Err("cron step cannot be 0".to_string());
                }
                (range_raw, Some(step))
            }
            None => (token, None),
        };

        let (start, end) = if range_raw == "*" || range_raw == "?" {
            (min, max)
        } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
            let start: u32 = start_raw
                .parse()
                .map_err(|_| format!("invalid cron range '{}'", token))?;
            let end: u32 = end_raw
                .parse()
                .map_err(|_| format!("invalid cron range '{}'", token))?;
            if start > end {
                return Err(format!("cron range out of bounds '{}'", token));
            }
            (start, end)
        } else {
            let value: u32 = range_raw
                .parse()
                .map_err(|_| format!("invalid cron value '{}'", token))?;
            // `5/15` means "from 5 to the end of the field, every 15".
            match step {
                Some(_) => (value, max),
                None => (value, value),
            }
        };

        if start < min || end > max {
            return Err(format!("cron value out of bounds '{}'", token));
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            out.insert(value);
            value = match value.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
    }

    if out.is_empty() {
        return Err("cron field resolved to empty set".to_string());
    }

    Ok(out)
}

fn start_of_minute(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    at.with_second(0)?.with_nanosecond(0)
}

fn start_of_hour(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    start_of_minute(at)?.with_minute(0)
}

fn start_of_day(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    start_of_hour(at)?.with_hour(0)
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}
