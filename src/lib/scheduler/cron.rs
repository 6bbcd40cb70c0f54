//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Years searched ahead before concluding an expression never fires.
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("unknown macro {0}")]
    UnknownMacro(String),
    #[error("invalid {field} field `{value}`: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Offset of the first entry of `names`.
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES, name_base: 1 };
// 7 is accepted as Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: DAY_NAMES, name_base: 0 };

/// Bitset of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field(u64);

impl Field {
    fn has(&self, value: u32) -> bool {
        self.0 & (1 << value) != 0
    }
}

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, raw: &str, whole: &str) -> Result<u32, CronError> {
        let upper = raw.to_ascii_uppercase();
        if let Some(pos) = self.names.iter().position(|n| *n == upper) {
            return Ok(pos as u32 + self.name_base);
        }
        let value: u32 = raw
            .parse()
            .map_err(|_| self.error(whole, format!("`{}` is not a number", raw)))?;
        if value < self.min || value > self.max {
            return Err(self.error(
                whole,
                format!("{} out of range {}-{}", value, self.min, self.max),
            ));
        }
        Ok(value)
    }

    fn parse(&self, field: &str) -> Result<Field, CronError> {
        let mut bits = 0u64;
        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(field, "step is not a number"))?;
                    if step == 0 {
                        return Err(self.error(field, "step must be positive"));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (self.value(a, field)?, self.value(b, field)?)
            } else {
                let start = self.value(range, field)?;
                // `5/15` means 5 through the end of the range.
                (start, if step.is_some() { self.max } else { start })
            };
            if start > end {
                return Err(self.error(field, format!("range {}-{} is reversed", start, end)));
            }

            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                bits |= 1 << v;
                v += step;
            }
        }
        Ok(Field(bits))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn expand_macro(expr: &str) -> Result<&str, CronError> {
    let expanded = match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => return Err(CronError::UnknownMacro(expr.to_string())),
    };
    Ok(expanded)
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let source = expr.trim();
        let body = if source.starts_with('@') {
            expand_macro(source)?
        } else {
            source
        };

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4])?;
        if days_of_week.has(7) {
            days_of_week = Field((days_of_week.0 & !(1 << 7)) | 1);
        }

        Ok(CronExpression {
            source: source.to_string(),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week,
            // As in Vixie cron, a field starting with `*` is unrestricted.
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.has(date.day());
        let dow = self.days_of_week.has(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First firing time strictly after `after`, evaluated in `tz`.
    ///
    /// Local times skipped by a DST jump never fire; repeated local times
    /// fire once, at the earlier instant.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(tz).naive_local();
        let mut t = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let last_year = local.year() + SEARCH_YEARS;

        while t.year() <= last_year {
            if !self.months.has(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.has(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.has(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            let resolved = match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            };
            if let Some(dt) = resolved {
                let utc = dt.with_timezone(&Utc);
                if utc > *after {
                    return Some(utc);
                }
            }
            t += Duration::minutes(1);
        }
        None
    }
}

fn start_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
