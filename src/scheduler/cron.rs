//! Five-field cron expressions: minute hour day month weekday

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::FlowError;

/// How far back `latest_at_or_before` scans for a matching minute
const MAX_LOOKBACK_MINUTES: i64 = 8 * 24 * 60;

/// Parsed cron expression
///
/// Example: "0 3 * * *" = 03:00 UTC daily. Weekday 0 and 7 are Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Value(u32),
    Range(u32, u32),
    List(Vec<u32>),
    Step(u32),
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, FlowError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();

        if parts.len() != 5 {
            return Err(FlowError::Config(format!(
                "cron expression '{}': expected 5 fields, got {}",
                expr,
                parts.len()
            )));
        }

        let field = |s: &str| {
            parse_field(s)
                .map_err(|e| FlowError::Config(format!("cron expression '{}': {}", expr, e)))
        };

        Ok(Self {
            source: expr.to_string(),
            minute: field(parts[0])?,
            hour: field(parts[1])?,
            day: field(parts[2])?,
            month: field(parts[3])?,
            weekday: field(parts[4])?,
        })
    }

    pub fn matches(&self, dt: DateTime<Utc>) -> bool {
        let weekday = dt.weekday().num_days_from_sunday();
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day.matches(dt.day())
            && self.month.matches(dt.month())
            && (self.weekday.matches(weekday) || (weekday == 0 && self.weekday.matches(7)))
    }

    /// First matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate(after) + Duration::minutes(1);

        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }

        None
    }

    /// Most recent matching minute at or before `at`, within about a week
    pub fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate(at);

        for _ in 0..MAX_LOOKBACK_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate -= Duration::minutes(1);
        }

        None
    }
}

impl FromStr for CronExpr {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn truncate(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(Duration::minutes(1)).unwrap_or(dt)
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Value(v) => *v == value,
            CronField::Range(start, end) => value >= *start && value <= *end,
            CronField::List(values) => values.contains(&value),
            CronField::Step(step) => value % step == 0,
        }
    }
}

fn parse_field(field: &str) -> Result<CronField, String> {
    if field == "*" {
        return Ok(CronField::Any);
    }

    if let Some(step) = field.strip_prefix("*/") {
        return match step.parse() {
            Ok(0) | Err(_) => Err(format!("invalid step: {}", field)),
            Ok(step) => Ok(CronField::Step(step)),
        };
    }

    if let Some((start, end)) = field.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.parse(), end.parse()) {
            return Ok(CronField::Range(start, end));
        }
    }

    if field.contains(',') {
        let values: Result<Vec<u32>, _> = field.split(',').map(|s| s.parse()).collect();
        if let Ok(v) = values {
            return Ok(CronField::List(v));
        }
    }

    if let Ok(v) = field.parse() {
        return Ok(CronField::Value(v));
    }

    Err(format!("invalid field: {}", field))
}
