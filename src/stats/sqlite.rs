//! SQLite implementation of [`QueryBackend`].
//!
//! Scopes are registered per table as lists of constraints; applying one
//! appends its constraints to the query. Aggregates and row fetches are run
//! with bound parameters rendered by [`SqlWriter::bound`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, params_from_iter};
use tracing::debug;

use super::query::{Constraint, Query, QueryBackend, Record, SqlWriter, qualify_column};
use super::registry::ALL_SCOPE;
use super::types::{
    BackendError, BackendErrorKind, Operation, SqlValue, StatValue, StatsError, StatsResult,
};

/// Extended result code for a stale WAL read snapshot (`SQLITE_BUSY | 2 << 8`).
const SQLITE_BUSY_SNAPSHOT: i32 = 517;

/// Query backend over a single SQLite connection.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    scopes: RwLock<HashMap<(String, String), Vec<Constraint>>>,
    queries: AtomicU64,
}

impl SqliteBackend {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            scopes: RwLock::new(HashMap::new()),
            queries: AtomicU64::new(0),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> StatsResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(classify)?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> StatsResult<Self> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self::new(conn))
    }

    /// Run `f` against the underlying connection (schema setup, seeding).
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StatsResult<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(classify)
    }

    /// Register (or replace) named scope `name` on `table`.
    pub fn define_scope(
        &self,
        table: impl Into<String>,
        name: impl Into<String>,
        constraints: Vec<Constraint>,
    ) {
        self.scopes
            .write()
            .insert((table.into(), name.into()), constraints);
    }

    /// Statements executed so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

impl QueryBackend for SqliteBackend {
    fn apply_scope(&self, query: &mut Query, scope: &str) -> StatsResult<()> {
        if scope == ALL_SCOPE {
            return Ok(());
        }
        let scopes = self.scopes.read();
        let constraints = scopes
            .get(&(query.table().to_string(), scope.to_string()))
            .ok_or_else(|| StatsError::UnknownScope {
                table: query.table().to_string(),
                scope: scope.to_string(),
            })?;
        query.record_scope(scope);
        for constraint in constraints {
            query.constrain(constraint.clone());
        }
        Ok(())
    }

    fn aggregate(
        &self,
        query: &Query,
        operation: Operation,
        column: &str,
    ) -> StatsResult<StatValue> {
        let projection = operation.projection(&qualify_column(query.table(), column));
        let mut out = SqlWriter::bound();
        let sql = query.select_sql(&projection, &mut out);
        let params: Vec<Value> = out.into_params().into_iter().map(to_sqlite).collect();
        debug!(sql = %sql, params = params.len(), "Running aggregate");

        let conn = self.conn.lock();
        self.queries.fetch_add(1, Ordering::Relaxed);
        let raw: Value = conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(classify)?;
        Ok(match raw {
            Value::Null => match operation {
                Operation::Count | Operation::Sum => StatValue::Int(0),
                _ => StatValue::Null,
            },
            Value::Integer(v) => StatValue::Int(v),
            Value::Real(v) => StatValue::Float(v),
            Value::Text(text) => text
                .trim()
                .parse::<f64>()
                .map(StatValue::Float)
                .unwrap_or(StatValue::Null),
            Value::Blob(_) => StatValue::Null,
        })
    }

    fn fetch(&self, query: &Query) -> StatsResult<Vec<Record>> {
        let mut out = SqlWriter::bound();
        let sql = query.select_sql(&query.row_projection(), &mut out);
        let params: Vec<Value> = out.into_params().into_iter().map(to_sqlite).collect();
        debug!(sql = %sql, params = params.len(), "Fetching rows");

        let conn = self.conn.lock();
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut stmt = conn.prepare(&sql).map_err(classify)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                let mut record = Record::new();
                for (idx, name) in columns.iter().enumerate() {
                    let value: Value = row.get(idx)?;
                    record.insert(name.clone(), from_sqlite(value));
                }
                Ok(record)
            })
            .map_err(classify)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(classify)
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("queries", &self.query_count())
            .finish_non_exhaustive()
    }
}

fn to_sqlite(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(v),
        SqlValue::Real(v) => Value::Real(v),
        SqlValue::Text(s) => Value::Text(s),
    }
}

fn from_sqlite(value: Value) -> SqlValue {
    match value {
        Value::Null | Value::Blob(_) => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(v),
        Value::Real(v) => SqlValue::Real(v),
        Value::Text(s) => SqlValue::Text(s),
    }
}

/// Map a SQLite failure onto the engine's error taxonomy.
pub fn classify(err: rusqlite::Error) -> StatsError {
    let kind = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy if failure.extended_code == SQLITE_BUSY_SNAPSHOT => {
                BackendErrorKind::Serialization
            }
            ErrorCode::DatabaseBusy => BackendErrorKind::Busy,
            ErrorCode::DatabaseLocked => BackendErrorKind::Locked,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => BackendErrorKind::Connection,
            // SQLITE_ERROR: no such table/column, syntax errors.
            ErrorCode::Unknown => BackendErrorKind::Malformed,
            _ => BackendErrorKind::Other,
        },
        rusqlite::Error::InvalidQuery
        | rusqlite::Error::InvalidParameterCount(..)
        | rusqlite::Error::InvalidColumnIndex(_)
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::QueryReturnedNoRows => BackendErrorKind::Malformed,
        _ => BackendErrorKind::Other,
    };
    BackendError::new(kind, err.to_string()).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
