use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use model_stats::stats::{
    ManualClock, MemoryStore, ModelInfo, RetryPolicy, SqliteBackend, StatisticRegistry, TtlCache,
};
use rusqlite::params;

#[allow(dead_code)]
pub const TABLE: &str = "mock_models";
#[allow(dead_code)]
pub const MODEL: &str = "MockModel";

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One row of the `mock_models` fixture table.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct MockRow {
    pub user_id: i64,
    pub channel: &'static str,
    pub amount: i64,
    pub created_at: &'static str,
}

#[allow(dead_code)]
impl MockRow {
    pub fn new(user_id: i64, channel: &'static str, amount: i64, created_at: &'static str) -> Self {
        Self {
            user_id,
            channel,
            amount,
            created_at,
        }
    }
}

/// 2024-03-15 12:00:00, a Friday.
#[allow(dead_code)]
pub fn fixture_now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 15)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

/// Create `mock_models` in `backend` and insert `rows`.
#[allow(dead_code)]
pub fn seed(backend: &SqliteBackend, rows: &[MockRow]) {
    backend
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS mock_models (
                    id INTEGER PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    channel TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )?;
            for row in rows {
                conn.execute(
                    "INSERT INTO mock_models (user_id, channel, amount, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row.user_id, row.channel, row.amount, row.created_at],
                )?;
            }
            Ok(())
        })
        .expect("seed mock_models");
}

/// Registry over a seeded in-memory database with a manual clock.
#[allow(dead_code)]
pub struct Fixture {
    pub backend: Arc<SqliteBackend>,
    pub clock: Arc<ManualClock>,
    pub registry: StatisticRegistry,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new(rows: &[MockRow]) -> Self {
        let backend = Arc::new(SqliteBackend::open_in_memory().expect("in-memory db"));
        seed(&backend, rows);
        let clock = Arc::new(ManualClock::new(fixture_now()));
        let cache = Arc::new(TtlCache::new(Arc::new(MemoryStore::new(64)), clock.clone()));
        let registry = StatisticRegistry::new(
            ModelInfo::new(MODEL, TABLE),
            backend.clone(),
            cache,
            RetryPolicy::no_retry(),
        );
        Self {
            backend,
            clock,
            registry,
        }
    }

    pub fn queries(&self) -> u64 {
        self.backend.query_count()
    }
}

/// Five rows: two for user 54321, amounts summing to 100.
#[allow(dead_code)]
pub fn five_rows() -> Vec<MockRow> {
    vec![
        MockRow::new(54321, "chan5", 10, "2024-03-15 08:00:00.000000"),
        MockRow::new(54321, "chan12", 20, "2024-03-14 23:59:59.999999"),
        MockRow::new(1, "chan5", 5, "2024-03-15 23:59:59.999999"),
        MockRow::new(2, "chan20", 40, "2024-03-16 00:00:00.000000"),
        MockRow::new(3, "chan1", 25, "2024-02-01 10:00:00.000000"),
    ]
}
