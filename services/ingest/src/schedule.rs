//! Wake schedule calculator.
//!
//! Pure functions: no clock access, no store access.  The caller passes the
//! reference time, which must be the device's most recent *actual* wake —
//! never a previously-scheduled-but-missed time.  Deriving from the actual
//! wake keeps the schedule self-correcting every cycle; deriving from the
//! scheduled time would compound drift whenever a device wakes late.
//!
//! Three expression shapes are supported, all at hour granularity:
//! - `"8,16"`   — explicit wake hours within a day
//! - `"every 6h"` — fixed-step interval from the reference time
//! - `"14"`     — a single fixed hour
//!
//! Sub-hour expressions (e.g. `"6:30"`) are rejected; minute-level
//! scheduling is a documented limitation of this version.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed wake schedule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpr {
    /// Sorted, deduplicated wake hours within a day.
    Hours(Vec<u32>),
    /// Wake every N hours from the reference time.
    EveryHours(i64),
    /// One fixed wake hour per day.
    FixedHour(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("empty schedule expression")]
    Empty,
    #[error("invalid schedule expression '{0}'")]
    Invalid(String),
    #[error("wake hour {0} out of range 0..=23")]
    HourOutOfRange(u32),
    #[error("interval {0}h out of range 1..=24")]
    IntervalOutOfRange(i64),
    #[error("sub-hour schedule '{0}' not supported; hour granularity only")]
    SubHour(String),
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
}

impl FromStr for ScheduleExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, ScheduleError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if s.contains(':') {
            return Err(ScheduleError::SubHour(s.to_owned()));
        }
        if let Some(rest) = s.strip_prefix("every ") {
            let digits = rest
                .trim()
                .strip_suffix('h')
                .ok_or_else(|| ScheduleError::Invalid(s.to_owned()))?;
            let n: i64 = digits
                .trim()
                .parse()
                .map_err(|_| ScheduleError::Invalid(s.to_owned()))?;
            if !(1..=24).contains(&n) {
                return Err(ScheduleError::IntervalOutOfRange(n));
            }
            return Ok(ScheduleExpr::EveryHours(n));
        }
        if s.contains(',') {
            let mut hours = Vec::new();
            for part in s.split(',') {
                hours.push(parse_hour(part.trim(), s)?);
            }
            hours.sort_unstable();
            hours.dedup();
            return Ok(ScheduleExpr::Hours(hours));
        }
        Ok(ScheduleExpr::FixedHour(parse_hour(s, s)?))
    }
}

fn parse_hour(part: &str, whole: &str) -> Result<u32, ScheduleError> {
    let h: u32 = part
        .parse()
        .map_err(|_| ScheduleError::Invalid(whole.to_owned()))?;
    if h > 23 {
        return Err(ScheduleError::HourOutOfRange(h));
    }
    Ok(h)
}

/// Resolve the effective expression: device schedule, else site schedule,
/// else the configured fixed default hour.
///
/// The first *present* expression wins; a present-but-invalid expression is
/// an error for the caller to handle, not a fall-through.
pub fn resolve_expr(
    device: Option<&str>,
    site: Option<&str>,
    default_hour: u32,
) -> Result<ScheduleExpr, ScheduleError> {
    match device.or(site) {
        Some(expr) => expr.parse(),
        None => Ok(ScheduleExpr::FixedHour(default_hour)),
    }
}

pub fn parse_timezone(tz: &str) -> Result<Tz, ScheduleError> {
    tz.parse()
        .map_err(|_| ScheduleError::InvalidTimezone(tz.to_owned()))
}

// ---------------------------------------------------------------------------
// Next-wake computation
// ---------------------------------------------------------------------------

/// A computed next wake: the machine instant for persistence, and the
/// compact display string the device firmware parses from the sleep
/// directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextWake {
    pub instant: DateTime<Utc>,
    pub display: String,
}

/// Compute the next wake instant after `reference` in the device's timezone.
///
/// Interval schedules add the step to the reference directly, preserving
/// minutes (12:30 + 6h = 18:30).  Hour schedules pick the smallest scheduled
/// hour strictly after the current local hour — a wake inside a scheduled
/// hour counts that slot as satisfied — wrapping to the next day's first
/// slot when no later hour remains today.
pub fn next_wake(expr: &ScheduleExpr, reference: DateTime<Utc>, tz: Tz) -> NextWake {
    let instant = match expr {
        ScheduleExpr::EveryHours(n) => reference + Duration::hours(*n),
        ScheduleExpr::Hours(hours) => next_scheduled_hour(hours, reference, tz),
        ScheduleExpr::FixedHour(h) => next_scheduled_hour(std::slice::from_ref(h), reference, tz),
    };
    NextWake {
        instant,
        display: format_display(instant, tz),
    }
}

fn next_scheduled_hour(hours: &[u32], reference: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = reference.with_timezone(&tz);
    let current_hour = local.hour();
    if let Some(&h) = hours.iter().find(|&&h| h > current_hour) {
        return local_hour_instant(tz, local.date_naive(), h);
    }
    let tomorrow = local.date_naive() + Duration::days(1);
    local_hour_instant(tz, tomorrow, hours[0])
}

/// Resolve the top of a local hour to an absolute instant.
///
/// DST fold picks the earlier occurrence; a spring-forward gap slides to
/// the first hour that exists.
fn local_hour_instant(tz: Tz, date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let mut date = date;
    let mut hour = hour;
    loop {
        match tz.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, 0, 0) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => {
                if hour < 23 {
                    hour += 1;
                } else {
                    date = date + Duration::days(1);
                    hour = 0;
                }
            }
        }
    }
}

/// `H:MM AM/PM` in the device's local timezone, e.g. `"6:30 PM"`.
fn format_display(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format("%-I:%M %p").to_string()
}
