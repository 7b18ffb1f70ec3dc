//! Filter rules and their resolution into constraint fragments.
//!
//! A rule decides how one caller-facing filter key becomes a predicate:
//! a SQL template, plain equality, a calendar-day range, a window around
//! the current time, or a redirect onto another column.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};

use super::bucketing::{self, TimeWindow};
use super::query::Constraint;
use super::types::{DATE_FORMAT, FilterValue, StatsError, StatsResult, quote_literal};

/// Placeholder replaced by the quoted filter value in templates.
pub const VALUE_PLACEHOLDER: &str = "?";

/// Placeholder replaced by the model's table name in templates.
pub const TABLE_PLACEHOLDER: &str = "%t";

/// How a filter key turns into a constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterRule {
    /// SQL fragment with `?` for the value and `%t` for the table.
    Template { pattern: String },
    /// `key = value` against the model's own column.
    DefaultEquality,
    /// The calendar day containing the value.
    DayRange,
    /// `range_today` / `range_week` / `range_month` / `range_year` over `field`.
    TimeRangeWindow { field: String },
    /// Resolve with `rule`, but against `target`'s column.
    Indirect {
        target: String,
        rule: Box<FilterRule>,
    },
}

impl FilterRule {
    pub fn template(pattern: impl Into<String>) -> Self {
        Self::Template {
            pattern: pattern.into(),
        }
    }

    pub fn time_range(field: impl Into<String>) -> Self {
        Self::TimeRangeWindow {
            field: field.into(),
        }
    }

    pub fn indirect(target: impl Into<String>, rule: FilterRule) -> Self {
        Self::Indirect {
            target: target.into(),
            rule: Box::new(rule),
        }
    }
}

impl From<&str> for FilterRule {
    fn from(pattern: &str) -> Self {
        Self::template(pattern)
    }
}

impl From<String> for FilterRule {
    fn from(pattern: String) -> Self {
        Self::template(pattern)
    }
}

/// Filter key → rule.
pub type FilterRules = BTreeMap<String, FilterRule>;

/// Resolve one filter pair into a constraint.
///
/// Null values produce `Ok(None)`. Without a rule, the well-known range keys
/// resolve as a window whose field is named by the value; any other key is
/// rejected with [`StatsError::UnknownFilterKey`].
pub fn resolve(
    key: &str,
    value: &FilterValue,
    rule: Option<&FilterRule>,
    table: &str,
    now: NaiveDateTime,
) -> StatsResult<Option<Constraint>> {
    if value.is_null() {
        return Ok(None);
    }
    match rule {
        Some(rule) => resolve_rule(key, key, value, rule, table, now).map(Some),
        None if bucketing::is_range_key(key) => {
            let field = value
                .to_plain_text()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| invalid(key, "range filters take the field name as value"))?;
            window_constraint(key, &field, value, now).map(Some)
        }
        None => Err(StatsError::UnknownFilterKey {
            key: key.to_string(),
        }),
    }
}

fn resolve_rule(
    key: &str,
    column: &str,
    value: &FilterValue,
    rule: &FilterRule,
    table: &str,
    now: NaiveDateTime,
) -> StatsResult<Constraint> {
    match rule {
        FilterRule::Template { pattern } => render_template(key, pattern, value, table),
        FilterRule::DefaultEquality => equality(key, column, value),
        FilterRule::DayRange => {
            let date = value_date(key, value)?;
            let (start, end) = bucketing::day_bounds(date);
            Ok(Constraint::between(column, start, end))
        }
        FilterRule::TimeRangeWindow { field } => window_constraint(key, field, value, now),
        FilterRule::Indirect { target, rule } => {
            resolve_rule(key, target, value, rule, table, now)
        }
    }
}

/// Substitute the table and the quoted value into `pattern`.
pub fn render_template(
    key: &str,
    pattern: &str,
    value: &FilterValue,
    table: &str,
) -> StatsResult<Constraint> {
    let literal = match value {
        FilterValue::List(items) => items
            .iter()
            .map(|item| {
                item.to_plain_text()
                    .map(|text| quote_literal(&text))
                    .ok_or_else(|| invalid(key, "nested lists cannot fill a template"))
            })
            .collect::<StatsResult<Vec<_>>>()?
            .join(", "),
        other => other
            .to_plain_text()
            .map(|text| quote_literal(&text))
            .ok_or_else(|| invalid(key, "ranges cannot fill a template"))?,
    };
    let with_table = pattern.replace(TABLE_PLACEHOLDER, table);
    Ok(Constraint::Sql(with_table.replace(VALUE_PLACEHOLDER, &literal)))
}

fn equality(key: &str, column: &str, value: &FilterValue) -> StatsResult<Constraint> {
    match value {
        FilterValue::Range(start, end) => Ok(Constraint::between(column, *start, *end)),
        FilterValue::List(items) => {
            let values = items
                .iter()
                .map(|item| {
                    item.as_sql_value()
                        .ok_or_else(|| invalid(key, "lists must contain scalar values"))
                })
                .collect::<StatsResult<Vec<_>>>()?;
            Ok(Constraint::In {
                column: column.to_string(),
                values,
            })
        }
        scalar => scalar
            .as_sql_value()
            .map(|v| Constraint::eq(column, v))
            .ok_or_else(|| invalid(key, "unsupported equality value")),
    }
}

/// Window comes from the key when it is a range key, else from the value.
fn window_constraint(
    key: &str,
    field: &str,
    value: &FilterValue,
    now: NaiveDateTime,
) -> StatsResult<Constraint> {
    let window = TimeWindow::from_key(key)
        .or_else(|| value.as_text().and_then(TimeWindow::from_key))
        .ok_or_else(|| invalid(key, "expected one of today, week, month, year"))?;
    let (start, end) = window
        .bounds(now)
        .ok_or_else(|| invalid(key, "current time is outside the supported calendar"))?;
    Ok(Constraint::between(field, start, end))
}

fn value_date(key: &str, value: &FilterValue) -> StatsResult<NaiveDate> {
    match value {
        FilterValue::Date(d) => Ok(*d),
        FilterValue::DateTime(dt) => Ok(dt.date()),
        FilterValue::Text(text) => match FilterValue::infer(text) {
            FilterValue::Date(d) => Ok(d),
            FilterValue::DateTime(dt) => Ok(dt.date()),
            _ => Err(invalid(key, &format!("expected a {DATE_FORMAT} date, got `{text}`"))),
        },
        _ => Err(invalid(key, "expected a date")),
    }
}

fn invalid(key: &str, reason: &str) -> StatsError {
    StatsError::InvalidFilterValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
