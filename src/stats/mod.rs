//! Named aggregate statistics over relational models.
//!
//! A model declares statistics once (count, sum, average, minimum, maximum,
//! or a value calculated from sibling statistics) and callers evaluate them
//! by name under an arbitrary filter map. Values may be cached per
//! (model, statistic, filters) fingerprint with a TTL.
//!
//! # Module structure
//!
//! - [`types`]: filter values, results, the error type
//! - [`bucketing`]: day and time-window bounds
//! - [`filter`]: filter rules and their resolution into constraints
//! - [`query`]: constraint fragments, the query builder, the backend seam
//! - [`cache`]: fingerprints, the TTL cache, pluggable stores and clocks
//! - [`retry`]: bounded retry of transient backend failures
//! - [`registry`]: definitions, per-model registries, the catalog
//! - [`sqlite`]: the bundled SQLite backend

pub mod bucketing;
pub mod cache;
pub mod filter;
pub mod query;
pub mod registry;
pub mod retry;
pub mod sqlite;
pub mod types;

// Re-export the most commonly used items at the crate::stats level.
pub use cache::{CacheStore, Clock, ManualClock, MemoryStore, SystemClock, TtlCache, fingerprint};
pub use filter::{FilterRule, FilterRules};
pub use query::{Constraint, Query, QueryBackend, Record, StatCollection};
pub use registry::{
    AggregateSpec, ModelInfo, Siblings, StatisticDefinition, StatisticKind, StatisticRegistry,
    StatisticsCatalog,
};
pub use retry::RetryPolicy;
pub use sqlite::SqliteBackend;
pub use types::{
    BackendError, BackendErrorKind, Dynamic, FilterValue, Filters, Operation, SqlValue, StatValue,
    StatsError, StatsResult,
};
