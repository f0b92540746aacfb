//! Cron line validation and normalization.
//!
//! Backups accept 5-field (`min hour dom month dow`) or 6-field
//! (`sec min hour dom month dow`) lines with POSIX weekdays, where 0 and 7
//! are Sunday. The scheduler parses 6-field lines whose weekdays run from
//! 1 (Sunday) to 7 (Saturday), so weekday values are renumbered on the way.

use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{expr}'")]
    Syntax { field: &'static str, expr: String },
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("unschedulable expression '{expr}': {reason}")]
    Schedule { expr: String, reason: String },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    allow_question: bool,
}

const MONTHS: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[], allow_question: false };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], allow_question: false };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], allow_question: false };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], allow_question: true };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTHS, allow_question: false };
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: WEEKDAYS, allow_question: true };

/// Validates a cron line, returning the 6-field form handed to the scheduler.
///
/// Every restricted field is written out as a plain list of numbers. The
/// result is parsed with the scheduler's own parser before it is handed back,
/// so anything accepted here can be scheduled.
pub fn validate(line: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let specs: &[FieldSpec] = match fields.len() {
        5 => &[MINUTE, HOUR, DAY_OF_MONTH, MONTH, DAY_OF_WEEK],
        6 => &[SECOND, MINUTE, HOUR, DAY_OF_MONTH, MONTH, DAY_OF_WEEK],
        n => return Err(CronError::FieldCount(n)),
    };

    let mut out = Vec::with_capacity(6);
    if fields.len() == 5 {
        out.push("0".to_string());
    }
    for (expr, spec) in fields.iter().zip(specs) {
        let values = expand_field(expr, spec)?;
        out.push(scheduler_field(values, spec));
    }

    let expression = out.join(" ");
    ::cron::Schedule::from_str(&expression).map_err(|e| CronError::Schedule {
        expr: expression.clone(),
        reason: e.to_string(),
    })?;
    Ok(expression)
}

fn scheduler_field(values: Option<Vec<u32>>, spec: &FieldSpec) -> String {
    let Some(values) = values else {
        return "*".to_string();
    };
    let mut values: Vec<u32> = if spec.name == DAY_OF_WEEK.name {
        // POSIX 0..=7 with Sunday twice, scheduler 1..=7 from Sunday
        values.iter().map(|d| d % 7 + 1).collect()
    } else {
        values
    };
    values.sort_unstable();
    values.dedup();
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Every value the field selects, or `None` when it selects them all.
fn expand_field(expr: &str, spec: &FieldSpec) -> Result<Option<Vec<u32>>, CronError> {
    if expr == "*" || (expr == "?" && spec.allow_question) {
        return Ok(None);
    }
    let mut values = Vec::new();
    for part in expr.split(',') {
        values.extend(expand_part(part, spec)?);
    }
    Ok(Some(values))
}

fn expand_part(part: &str, spec: &FieldSpec) -> Result<Vec<u32>, CronError> {
    let syntax = || CronError::Syntax {
        field: spec.name,
        expr: part.to_string(),
    };

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };

    let step = match step.map(str::parse::<u32>) {
        None => 1,
        Some(Ok(0)) | Some(Err(_)) => return Err(syntax()),
        Some(Ok(step)) => step,
    };

    let (start, end) = if range == "*" {
        (spec.min, spec.max)
    } else {
        match range.split_once('-') {
            Some((start, end)) => (parse_value(start, spec)?, parse_value(end, spec)?),
            None => {
                let value = parse_value(range, spec)?;
                (value, value)
            }
        }
    };

    if start > end {
        return Err(syntax());
    }
    Ok((start..=end).step_by(step as usize).collect())
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let upper = raw.to_ascii_uppercase();
            let index = spec
                .names
                .iter()
                .position(|n| *n == upper)
                .ok_or_else(|| CronError::Syntax {
                    field: spec.name,
                    expr: raw.to_string(),
                })?;
            // Names are 1-based for months and 0-based for weekdays
            index as u32 + spec.min
        }
    };

    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Utc, Weekday};
    use std::collections::BTreeSet;

    /// Weekdays the scheduler actually fires on over the next few weeks.
    fn firing_weekdays(line: &str) -> BTreeSet<u32> {
        let expression = validate(line).unwrap();
        ::cron::Schedule::from_str(&expression)
            .unwrap()
            .upcoming(Utc)
            .take(30)
            .map(|t| t.weekday().num_days_from_sunday())
            .collect()
    }

    #[test]
    fn test_five_fields_gain_seconds() {
        assert_eq!(validate("0 0 * * *").unwrap(), "0 0 0 * * *");
        assert_eq!(validate("  30   2 * *   MON-FRI ").unwrap(), "0 30 2 * * 2,3,4,5,6");
    }

    #[test]
    fn test_six_fields_expand_steps() {
        assert_eq!(
            validate("*/10 * * * * *").unwrap(),
            "0,10,20,30,40,50 * * * * *"
        );
    }

    #[test]
    fn test_field_count() {
        assert_eq!(validate("* * * *"), Err(CronError::FieldCount(4)));
        assert_eq!(validate("* * * * * * *"), Err(CronError::FieldCount(7)));
        assert_eq!(validate(""), Err(CronError::FieldCount(0)));
    }

    #[test]
    fn test_ranges_lists_and_steps() {
        assert_eq!(
            validate("0,15,30,45 8-18/2 1-15 JAN,jun ?").unwrap(),
            "0 0,15,30,45 8,10,12,14,16,18 1,2,3,4,5,6,7,8,9,10,11,12,13,14,15 1,6 *"
        );
        assert!(validate("0 0 ? * 0").is_ok());
        assert!(validate("0 0 * * 7").is_ok());
    }

    #[test]
    fn test_sunday_is_zero_or_seven() {
        assert_eq!(validate("0 3 * * 0").unwrap(), "0 0 3 * * 1");
        assert_eq!(validate("0 3 * * 7").unwrap(), "0 0 3 * * 1");
        assert_eq!(firing_weekdays("0 3 * * 0"), BTreeSet::from([0]));
        assert_eq!(firing_weekdays("0 3 * * 7"), BTreeSet::from([0]));
        assert_eq!(firing_weekdays("0 3 * * SUN"), BTreeSet::from([0]));
    }

    #[test]
    fn test_weekday_ranges_fire_on_the_named_days() {
        let weekdays: BTreeSet<u32> = [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
            .iter()
            .map(|d| d.num_days_from_sunday())
            .collect();
        assert_eq!(firing_weekdays("0 0 * * 1-5"), weekdays);
        assert_eq!(firing_weekdays("0 0 * * 5-7"), BTreeSet::from([0, 5, 6]));
        assert_eq!(firing_weekdays("0 0 * * */2"), BTreeSet::from([0, 2, 4, 6]));
        assert_eq!(firing_weekdays("0 0 * * 6,0"), BTreeSet::from([0, 6]));
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(matches!(
            validate("61 * * * *"),
            Err(CronError::OutOfRange { field: "minute", value: 61, .. })
        ));
        assert!(matches!(validate("0 24 * * *"), Err(CronError::OutOfRange { .. })));
        assert!(matches!(validate("0 0 0 * *"), Err(CronError::OutOfRange { .. })));
        assert!(matches!(validate("0 0 * * 8"), Err(CronError::OutOfRange { .. })));
    }

    #[test]
    fn test_rejects_bad_syntax() {
        assert!(matches!(validate("*/0 * * * *"), Err(CronError::Syntax { .. })));
        assert!(matches!(validate("5-1 * * * *"), Err(CronError::Syntax { .. })));
        assert!(matches!(validate("a * * * *"), Err(CronError::Syntax { .. })));
        assert!(matches!(validate("? * * * *"), Err(CronError::Syntax { .. })));
    }
}
