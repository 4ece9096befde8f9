//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds, UTC)
//! Fields: *, N, */N, N,M,...
//! Example: "0 8 * * *" = every day at 8:00
//!
//! No cron crate dependency. The search skips whole months, days and hours
//! that cannot match, so sparse expressions stay cheap.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use cronhub_core::error::{CronHubError, Result};

/// How far ahead `next_after` looks before giving up.
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

/// Bitset of allowed values for one field (all fields fit in 0..64).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    fn values(self) -> impl Iterator<Item = u32> {
        (0..64u32).filter(move |v| self.contains(*v))
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse and validate an expression. Fails with `InvalidExpression` on a
    /// wrong field count, an out-of-range value, or a schedule that can never
    /// fire (e.g. "0 0 31 2 *").
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronHubError::invalid_expression(
                expression,
                format!(
                    "need 5 fields (MIN HOUR DOM MON DOW), got {}",
                    parts.len()
                ),
            ));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(parts[idx], min, max)
                .map_err(|reason| CronHubError::invalid_expression(expression, format!("{name}: {reason}")))
        };

        let schedule = Self {
            expression: parts.join(" "),
            minutes: field(0, "minute", 0, 59)?,
            hours: field(1, "hour", 0, 23)?,
            days_of_month: field(2, "day-of-month", 1, 31)?,
            months: field(3, "month", 1, 12)?,
            days_of_week: field(4, "day-of-week", 0, 6)?,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        };

        if !schedule.can_fire() {
            return Err(CronHubError::invalid_expression(
                expression,
                "day-of-month never occurs in the selected months",
            ));
        }
        Ok(schedule)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut candidate = truncate_to_minute(after)? + Duration::minutes(1);

        while candidate <= limit {
            if !self.months.contains(candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = start_of_next_hour(candidate)?;
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// True iff a fire time exists in `(last_checkpoint, now]`.
    pub fn is_due(&self, last_checkpoint: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(last_checkpoint)
            .is_some_and(|next| next <= now)
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    /// Classic cron: when both day fields are restricted either may match.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day());
        let dow = self
            .days_of_week
            .contains(t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Static check that some (month, day) pair exists.
    fn can_fire(&self) -> bool {
        if self.dow_restricted {
            // every month contains every weekday
            return true;
        }
        self.months.values().any(|month| {
            let last_day = max_days_in_month(month);
            self.days_of_month.values().any(|day| day <= last_day)
        })
    }
}

/// Next fire time of `expression` strictly after `after`.
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = CronSchedule::parse(expression)?;
    schedule.next_after(after).ok_or_else(|| {
        CronHubError::invalid_expression(expression, "no fire time within the search horizon")
    })
}

/// True iff `expression` fires at least once in `(last_checkpoint, now]`.
/// Any number of missed fire times still yields a single `true`.
pub fn is_due(expression: &str, last_checkpoint: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
    Ok(CronSchedule::parse(expression)?.is_due(last_checkpoint, now))
}

/// Parse a cron field into a bitset of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<FieldSet, String> {
    if field == "*" {
        return Ok(range_set(min, max, 1));
    }

    // */N steps
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| format!("invalid step '{step}'"))?;
        if n == 0 || n > max {
            return Err(format!("step {n} out of range 1-{max}"));
        }
        return Ok(range_set(min, max, n));
    }

    // Comma-separated: "0,15,30,45"
    let mut bits = 0u64;
    for item in field.split(',') {
        let n: u32 = item
            .trim()
            .parse()
            .map_err(|_| format!("invalid value '{item}'"))?;
        if n < min || n > max {
            return Err(format!("value {n} out of range {min}-{max}"));
        }
        bits |= 1u64 << n;
    }
    Ok(FieldSet(bits))
}

fn range_set(min: u32, max: u32, step: u32) -> FieldSet {
    let bits = (min..=max)
        .step_by(step as usize)
        .fold(0u64, |acc, v| acc | (1u64 << v));
    FieldSet(bits)
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
}

fn start_of_next_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let hour = Utc
        .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()?;
    Some(hour + Duration::hours(1))
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}
