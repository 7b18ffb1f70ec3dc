//! Shared types for the statistics engine.
//!
//! Filter values, aggregate results, the literal-or-computed option wrapper,
//! and the error taxonomy used by every other module.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Timestamp layout used for inline SQL literals and bound text parameters.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Date layout accepted and produced for day-granular values.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Classification of a backend failure, used by the retry policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Transaction serialization / write conflict.
    Serialization,
    /// The database is busy (another writer holds the lock).
    Busy,
    /// A table is locked within the same connection.
    Locked,
    /// The backend could not be reached or opened.
    Connection,
    /// The emitted query was rejected.
    Malformed,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization => write!(f, "serialization"),
            Self::Busy => write!(f, "busy"),
            Self::Locked => write!(f, "locked"),
            Self::Connection => write!(f, "connection"),
            Self::Malformed => write!(f, "malformed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Failure reported by a [`QueryBackend`](super::query::QueryBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} backend error: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors surfaced by statistic evaluation.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    /// A filter key has no rule and is not a well-known time range.
    #[error("Invalid filter key `{key}`: no filter rule and not a time range")]
    UnknownFilterKey { key: String },

    /// The value supplied for a filter cannot be used by its rule.
    #[error("Invalid value for filter `{key}`: {reason}")]
    InvalidFilterValue { key: String, reason: String },

    /// A statistic chains a scope the backend does not know.
    #[error("Unknown scope `{scope}` on table `{table}`")]
    UnknownScope { table: String, scope: String },

    /// Calculated statistics referenced each other too deeply.
    #[error("Calculated statistic `{name}` exceeded the derivation depth limit")]
    DerivationDepth { name: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StatsError {
    /// The backend classification, if this error came from the backend.
    pub fn backend_kind(&self) -> Option<BackendErrorKind> {
        match self {
            Self::Backend(err) => Some(err.kind),
            _ => None,
        }
    }
}

/// Convenience alias.
pub type StatsResult<T> = std::result::Result<T, StatsError>;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Aggregate operation a statistic performs over its column.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Count,
    Sum,
    Average,
    Minimum,
    Maximum,
}

impl Operation {
    /// SQL aggregate function name.
    pub fn sql_function(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Average => "AVG",
            Self::Minimum => "MIN",
            Self::Maximum => "MAX",
        }
    }

    /// Projection applying this aggregate to an already-rendered column.
    pub fn projection(&self, column_sql: &str) -> String {
        format!("{}({column_sql})", self.sql_function())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::Sum => write!(f, "sum"),
            Self::Average => write!(f, "average"),
            Self::Minimum => write!(f, "minimum"),
            Self::Maximum => write!(f, "maximum"),
        }
    }
}

// ---------------------------------------------------------------------------
// SqlValue
// ---------------------------------------------------------------------------

/// Scalar passed to or returned from the backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Inline literal form (`NULL`, `5`, `'it''s'`).
    pub fn to_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Integer(v) => v.to_string(),
            Self::Real(v) => v.to_string(),
            Self::Text(s) => quote_literal(s),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Single-quote a string for SQL, doubling embedded quotes.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// FilterValue / Filters
// ---------------------------------------------------------------------------

/// Caller-supplied value for one filter key.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    /// No constraint for this key.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// Inclusive timestamp range.
    Range(NaiveDateTime, NaiveDateTime),
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Scalar SQL form; `None` for ranges and lists.
    pub fn as_sql_value(&self) -> Option<SqlValue> {
        match self {
            Self::Null => Some(SqlValue::Null),
            Self::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
            Self::Int(v) => Some(SqlValue::Integer(*v)),
            Self::Float(v) => Some(SqlValue::Real(*v)),
            Self::Text(s) => Some(SqlValue::Text(s.clone())),
            Self::Date(d) => Some(SqlValue::Text(d.format(DATE_FORMAT).to_string())),
            Self::DateTime(dt) => Some(SqlValue::Text(dt.format(TIMESTAMP_FORMAT).to_string())),
            Self::Range(..) | Self::List(_) => None,
        }
    }

    /// Plain text form used when substituting into templates; `None` for ranges.
    pub fn to_plain_text(&self) -> Option<String> {
        match self {
            Self::Null => Some(String::new()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
            Self::DateTime(dt) => Some(dt.format(TIMESTAMP_FORMAT).to_string()),
            Self::Range(..) | Self::List(_) => None,
        }
    }

    /// Infer a typed value from command-line style text.
    ///
    /// `null` → Null, integers and floats written in canonical form, `true`/`false`, `YYYY-MM-DD` dates,
    /// `YYYY-MM-DD HH:MM:SS` timestamps; anything else stays text.
    pub fn infer(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        // Numbers must print back unchanged, so `007` or `1.50` stay text.
        if let Ok(v) = trimmed.parse::<i64>()
            && v.to_string() == trimmed
        {
            return Self::Int(v);
        }
        if let Ok(v) = trimmed.parse::<f64>()
            && v.is_finite()
            && v.to_string() == trimmed
        {
            return Self::Float(v);
        }
        match trimmed {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
            return Self::Date(d);
        }
        for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, layout) {
                return Self::DateTime(dt);
            }
        }
        Self::Text(text.to_string())
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FilterValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for FilterValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for FilterValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Filter map keyed by filter name.
///
/// Keys are kept sorted, so two maps with the same pairs compare and
/// serialize identically regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, FilterValue>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FilterValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.0.get(key)
    }

    /// Text value of `key`, if present and textual.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FilterValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<FilterValue>> FromIterator<(K, V)> for Filters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut filters = Self::new();
        for (key, value) in iter {
            filters.insert(key, value);
        }
        filters
    }
}

// ---------------------------------------------------------------------------
// StatValue
// ---------------------------------------------------------------------------

/// Result of evaluating a statistic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    #[default]
    Null,
    Int(i64),
    Float(f64),
}

impl StatValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Null => None,
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(v.round() as i64),
        }
    }

    fn combine(
        self,
        rhs: Self,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Self {
        match (self, rhs) {
            (Self::Null, _) | (_, Self::Null) => Self::Null,
            (Self::Int(a), Self::Int(b)) => match int_op(a, b) {
                Some(v) => Self::Int(v),
                None => Self::Float(float_op(a as f64, b as f64)),
            },
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Self::Float(float_op(x, y)),
                _ => Self::Null,
            },
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for StatValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for StatValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl Add for StatValue {
    type Output = StatValue;

    fn add(self, rhs: Self) -> Self {
        self.combine(rhs, i64::checked_add, |a, b| a + b)
    }
}

impl Sub for StatValue {
    type Output = StatValue;

    fn sub(self, rhs: Self) -> Self {
        self.combine(rhs, i64::checked_sub, |a, b| a - b)
    }
}

impl Mul for StatValue {
    type Output = StatValue;

    fn mul(self, rhs: Self) -> Self {
        self.combine(rhs, i64::checked_mul, |a, b| a * b)
    }
}

/// Division always yields a float; a zero denominator yields `Null`.
impl Div for StatValue {
    type Output = StatValue;

    fn div(self, rhs: Self) -> Self {
        match (self.as_f64(), rhs.as_f64()) {
            (Some(_), Some(d)) if d == 0.0 => Self::Null,
            (Some(n), Some(d)) => Self::Float(n / d),
            _ => Self::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Dynamic
// ---------------------------------------------------------------------------

/// An option that is either fixed at definition time or computed per call
/// from the filter map (conditions, joins, cache TTLs).
pub enum Dynamic<T> {
    Literal(T),
    Computed(Arc<dyn Fn(&Filters) -> T + Send + Sync>),
}

impl<T: Clone> Dynamic<T> {
    pub fn computed(f: impl Fn(&Filters) -> T + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    pub fn resolve(&self, filters: &Filters) -> T {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Computed(f) => f(filters),
        }
    }
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

impl<T: Clone> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Literal(value) => Self::Literal(value.clone()),
            Self::Computed(f) => Self::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Computed(_) => write!(f, "Computed(<fn>)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("o'hara"), "'o''hara'");
        assert_eq!(SqlValue::Integer(5).to_literal(), "5");
        assert_eq!(SqlValue::Null.to_literal(), "NULL");
    }

    #[test]
    fn infer_recognizes_common_shapes() {
        assert_eq!(FilterValue::infer("54321"), FilterValue::Int(54321));
        assert_eq!(FilterValue::infer("2.5"), FilterValue::Float(2.5));
        assert_eq!(FilterValue::infer("null"), FilterValue::Null);
        assert_eq!(FilterValue::infer("true"), FilterValue::Bool(true));
        assert_eq!(
            FilterValue::infer("2024-03-15"),
            FilterValue::Date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
        );
        assert_eq!(FilterValue::infer("chan5"), FilterValue::Text("chan5".into()));
        assert_eq!(FilterValue::infer("-17"), FilterValue::Int(-17));
        assert_eq!(FilterValue::infer("01234"), FilterValue::Text("01234".into()));
        assert_eq!(FilterValue::infer("1.50"), FilterValue::Text("1.50".into()));
        assert_eq!(FilterValue::infer("+5"), FilterValue::Text("+5".into()));
    }

    #[test]
    fn filters_ignore_insertion_order() {
        let a = Filters::new().with("user_id", 5).with("channel", "web");
        let b = Filters::new().with("channel", "web").with("user_id", 5);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn option_none_becomes_null() {
        let value: FilterValue = Option::<i64>::None.into();
        assert!(value.is_null());
    }

    #[test]
    fn stat_value_arithmetic() {
        assert_eq!(StatValue::Int(3) * StatValue::Int(35), StatValue::Int(105));
        assert_eq!(StatValue::Int(3) + StatValue::Float(0.5), StatValue::Float(3.5));
        assert_eq!(StatValue::Int(1) - StatValue::Null, StatValue::Null);
        assert_eq!(StatValue::Int(10) / StatValue::Int(4), StatValue::Float(2.5));
        assert_eq!(StatValue::Int(10) / StatValue::Int(0), StatValue::Null);
    }

    #[test]
    fn stat_value_overflow_falls_back_to_float() {
        let big = StatValue::Int(i64::MAX) + StatValue::Int(1);
        assert!(matches!(big, StatValue::Float(_)));
    }

    #[test]
    fn dynamic_resolves_literal_and_computed() {
        let literal: Dynamic<u32> = 7.into();
        let computed = Dynamic::computed(|f: &Filters| if f.get("x").is_some() { 1 } else { 0 });
        let filters = Filters::new().with("x", 1);
        assert_eq!(literal.resolve(&filters), 7);
        assert_eq!(computed.resolve(&filters), 1);
        assert_eq!(computed.resolve(&Filters::new()), 0);
    }

    #[test]
    fn backend_kind_is_exposed() {
        let err: StatsError = BackendError::new(BackendErrorKind::Busy, "db busy").into();
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::Busy));
        assert!(err.to_string().contains("busy backend error"));
    }
}
