//! Constraint fragments, the per-evaluation query builder, and the
//! [`QueryBackend`] seam that executes them.
//!
//! The engine never executes SQL itself: it accumulates scopes, joins, and
//! AND-combined constraints into a [`Query`] and hands that to a backend.
//! Rendering supports two modes through [`SqlWriter`]: bound parameters
//! (`?1`, `?2`, ...) for execution and inline quoted literals for display.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;

use super::types::{Operation, SqlValue, StatValue, StatsResult, TIMESTAMP_FORMAT};

/// One row returned by [`QueryBackend::fetch`], column name → value.
pub type Record = BTreeMap<String, SqlValue>;

// ---------------------------------------------------------------------------
// Identifier helpers
// ---------------------------------------------------------------------------

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a column reference qualified by `table` unless it already is one.
///
/// `*` and expressions (anything with parentheses or spaces) pass through
/// untouched; `other.col` is quoted part by part.
pub fn qualify_column(table: &str, column: &str) -> String {
    if column == "*" || column.contains('(') || column.contains(' ') {
        return column.to_string();
    }
    if column.contains('.') {
        return column
            .split('.')
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(".");
    }
    format!("{}.{}", quote_ident(table), quote_ident(column))
}

// ---------------------------------------------------------------------------
// SqlWriter
// ---------------------------------------------------------------------------

/// Collects bind parameters while rendering, or inlines literals.
#[derive(Debug, Default)]
pub struct SqlWriter {
    params: Option<Vec<SqlValue>>,
}

impl SqlWriter {
    /// Render values as numbered placeholders and collect them.
    pub fn bound() -> Self {
        Self {
            params: Some(Vec::new()),
        }
    }

    /// Render values as quoted literals.
    pub fn inline() -> Self {
        Self { params: None }
    }

    fn value(&mut self, value: &SqlValue) -> String {
        match &mut self.params {
            Some(params) => {
                params.push(value.clone());
                format!("?{}", params.len())
            }
            None => value.to_literal(),
        }
    }

    pub fn into_params(self) -> Vec<SqlValue> {
        self.params.unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Constraint
// ---------------------------------------------------------------------------

/// A single predicate fragment. Fragments are AND-combined.
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// Raw SQL predicate, inserted verbatim.
    Sql(String),
    /// `column = value` (`IS NULL` for a null value).
    Eq { column: String, value: SqlValue },
    /// `column IN (values)`; an empty list matches nothing.
    In { column: String, values: Vec<SqlValue> },
    /// `column BETWEEN start AND end`, both inclusive.
    Between {
        column: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

impl Constraint {
    pub fn sql(fragment: impl Into<String>) -> Self {
        Self::Sql(fragment.into())
    }

    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn between(column: impl Into<String>, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self::Between {
            column: column.into(),
            start,
            end,
        }
    }

    /// Render against `table`, routing values through `out`.
    pub fn render(&self, table: &str, out: &mut SqlWriter) -> String {
        match self {
            Self::Sql(fragment) => format!("({fragment})"),
            Self::Eq {
                column,
                value: SqlValue::Null,
            } => format!("{} IS NULL", qualify_column(table, column)),
            Self::Eq { column, value } => {
                format!("{} = {}", qualify_column(table, column), out.value(value))
            }
            Self::In { values, .. } if values.is_empty() => "1=0".to_string(),
            Self::In { column, values } => {
                let list: Vec<String> = values.iter().map(|v| out.value(v)).collect();
                format!("{} IN ({})", qualify_column(table, column), list.join(", "))
            }
            Self::Between { column, start, end } => {
                let start = out.value(&timestamp_value(start));
                let end = out.value(&timestamp_value(end));
                format!(
                    "{} BETWEEN {start} AND {end}",
                    qualify_column(table, column)
                )
            }
        }
    }

    /// Inline-literal rendering, mainly for display and assertions.
    pub fn to_sql(&self, table: &str) -> String {
        self.render(table, &mut SqlWriter::inline())
    }
}

fn timestamp_value(ts: &NaiveDateTime) -> SqlValue {
    SqlValue::Text(ts.format(TIMESTAMP_FORMAT).to_string())
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Built-but-unexecuted query over one model's table.
///
/// A fresh `Query` is constructed per evaluation; definitions are never
/// mutated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    table: String,
    scopes: Vec<String>,
    joins: Vec<String>,
    constraints: Vec<Constraint>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scope names applied so far, in order.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn joins(&self) -> &[String] {
        &self.joins
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn record_scope(&mut self, name: impl Into<String>) -> &mut Self {
        self.scopes.push(name.into());
        self
    }

    pub fn join(&mut self, clause: impl Into<String>) -> &mut Self {
        self.joins.push(clause.into());
        self
    }

    pub fn constrain(&mut self, constraint: Constraint) -> &mut Self {
        self.constraints.push(constraint);
        self
    }

    /// `a AND b AND ...`, or `None` when unconstrained.
    pub fn where_clause(&self, out: &mut SqlWriter) -> Option<String> {
        if self.constraints.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .constraints
            .iter()
            .map(|c| c.render(&self.table, out))
            .collect();
        Some(parts.join(" AND "))
    }

    /// Full `SELECT {projection} FROM ...` statement.
    pub fn select_sql(&self, projection: &str, out: &mut SqlWriter) -> String {
        let mut sql = format!("SELECT {projection} FROM {}", quote_ident(&self.table));
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if let Some(clause) = self.where_clause(out) {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        sql
    }

    /// Projection of every column of the base table.
    pub fn row_projection(&self) -> String {
        format!("{}.*", quote_ident(&self.table))
    }

    /// Inline-literal SQL selecting the matching rows.
    pub fn to_sql(&self) -> String {
        self.select_sql(&self.row_projection(), &mut SqlWriter::inline())
    }
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Query execution collaborator.
///
/// Implementations resolve named scopes into constraints, execute one of the
/// fixed aggregates, and enumerate matching rows.
pub trait QueryBackend: Send + Sync {
    /// Chain the named scope onto `query`.
    fn apply_scope(&self, query: &mut Query, scope: &str) -> StatsResult<()>;

    /// Execute `operation` over `column` for the rows `query` matches.
    fn aggregate(&self, query: &Query, operation: Operation, column: &str)
    -> StatsResult<StatValue>;

    /// Return the rows `query` matches.
    fn fetch(&self, query: &Query) -> StatsResult<Vec<Record>>;
}

/// Handle to the filtered, unexecuted collection behind a statistic.
#[derive(Clone)]
pub struct StatCollection {
    query: Query,
    backend: Arc<dyn QueryBackend>,
}

impl StatCollection {
    pub fn new(query: Query, backend: Arc<dyn QueryBackend>) -> Self {
        Self { query, backend }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn to_sql(&self) -> String {
        self.query.to_sql()
    }

    pub fn records(&self) -> StatsResult<Vec<Record>> {
        self.backend.fetch(&self.query)
    }

    /// Row count of the collection.
    pub fn count(&self) -> StatsResult<i64> {
        let value = self.backend.aggregate(&self.query, Operation::Count, "*")?;
        Ok(value.as_i64().unwrap_or(0))
    }

    pub fn aggregate(&self, operation: Operation, column: &str) -> StatsResult<StatValue> {
        self.backend.aggregate(&self.query, operation, column)
    }
}

impl std::fmt::Debug for StatCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCollection")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
