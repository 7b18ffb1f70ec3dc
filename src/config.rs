//! Declarative statistics configuration.
//!
//! Models, their scopes, filter rules, and aggregate statistics can be
//! declared in TOML and turned into a [`StatisticsCatalog`]. Calculated
//! statistics need closures and are registered from code instead.
//!
//! # Example Configuration
//!
//! ```toml
//! [cache]
//! capacity = 512
//!
//! [retry]
//! max_attempts = 4
//! retryable = ["serialization", "busy"]
//!
//! [defaults.filters]
//! user_id = "user_id = ?"
//!
//! [[models]]
//! name = "Payment"
//! table = "payments"
//!
//! [models.scopes]
//! large = ["amount >= 100"]
//!
//! [models.filters]
//! channel = { rule = "default" }
//! on = { rule = "day_range", on = "created_at" }
//!
//! [[models.statistics]]
//! name = "Large Payment Total"
//! operation = "sum"
//! column = "amount"
//! scopes = ["large"]
//! cache_for_secs = 300
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stats::cache::{DEFAULT_CACHE_CAPACITY, TtlCache};
use crate::stats::filter::{FilterRule, FilterRules};
use crate::stats::query::Constraint;
use crate::stats::registry::{AggregateSpec, DEFAULT_COLUMN, ModelInfo, StatisticsCatalog};
use crate::stats::retry::RetryPolicy;
use crate::stats::sqlite::SqliteBackend;
use crate::stats::types::{BackendErrorKind, Operation};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MSTAT_CONFIG";

/// Errors that can occur when loading statistics configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Max entries in the in-memory store.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

/// Retry overrides; unset fields keep the policy defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_ms: Option<u64>,
    #[serde(default)]
    pub max_ms: Option<u64>,
    #[serde(default)]
    pub retryable: Option<Vec<BackendErrorKind>>,
}

impl RetryConfig {
    /// Defaults, then this section, then `MSTAT_RETRY_*` env overrides.
    pub fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(max) = self.max_attempts {
            policy.max_attempts = max.max(1);
        }
        if let Some(ms) = self.base_ms {
            policy.base_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_ms {
            policy.max_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(kinds) = &self.retryable {
            policy = policy.with_retryable(kinds.iter().copied());
        }
        policy.with_env_overrides()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Rules inherited by every model.
    #[serde(default)]
    pub filters: BTreeMap<String, RuleConfig>,
}

/// One model and its statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,

    pub table: String,

    /// Scope name → raw SQL predicates, AND-combined.
    #[serde(default)]
    pub scopes: BTreeMap<String, Vec<String>>,

    /// Rules applied to every statistic of this model.
    #[serde(default)]
    pub filters: BTreeMap<String, RuleConfig>,

    #[serde(default)]
    pub statistics: Vec<StatisticConfig>,
}

/// One aggregate statistic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticConfig {
    pub name: String,

    #[serde(default)]
    pub operation: Operation,

    #[serde(default = "default_column")]
    pub column: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub filters: BTreeMap<String, RuleConfig>,

    /// Raw SQL predicates always applied.
    #[serde(default)]
    pub conditions: Vec<String>,

    #[serde(default)]
    pub joins: Vec<String>,

    #[serde(default)]
    pub cache_for_secs: Option<u64>,
}

fn default_column() -> String {
    DEFAULT_COLUMN.to_string()
}

/// A filter rule as written in TOML: a template string or a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleConfig {
    Template(String),
    Structured(StructuredRule),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredRule {
    pub rule: RuleKind,

    /// Column for `time_range`.
    #[serde(default)]
    pub field: Option<String>,

    /// Resolve against this column instead of the filter key's.
    #[serde(default)]
    pub on: Option<String>,

    /// SQL for `template`.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Default,
    DayRange,
    TimeRange,
    Template,
}

impl RuleConfig {
    pub fn to_rule(&self, key: &str) -> Result<FilterRule, ConfigError> {
        let structured = match self {
            Self::Template(pattern) => return Ok(FilterRule::template(pattern.clone())),
            Self::Structured(structured) => structured,
        };
        let base = match structured.rule {
            RuleKind::Default => FilterRule::DefaultEquality,
            RuleKind::DayRange => FilterRule::DayRange,
            RuleKind::TimeRange => {
                let field = structured.field.clone().ok_or_else(|| {
                    ConfigError::Validation(format!("filter `{key}`: time_range needs `field`"))
                })?;
                FilterRule::time_range(field)
            }
            RuleKind::Template => {
                let pattern = structured.pattern.clone().ok_or_else(|| {
                    ConfigError::Validation(format!("filter `{key}`: template needs `pattern`"))
                })?;
                FilterRule::template(pattern)
            }
        };
        Ok(match &structured.on {
            Some(target) => FilterRule::indirect(target.clone(), base),
            None => base,
        })
    }
}

fn rules_from(map: &BTreeMap<String, RuleConfig>) -> Result<FilterRules, ConfigError> {
    map.iter()
        .map(|(key, rule)| Ok((key.clone(), rule.to_rule(key)?)))
        .collect()
}

impl StatisticConfig {
    fn to_spec(&self) -> Result<AggregateSpec, ConfigError> {
        let mut spec = AggregateSpec::new(self.operation).column(self.column.clone());
        if !self.scopes.is_empty() {
            spec = spec.scopes(self.scopes.iter().cloned());
        }
        for (key, rule) in rules_from(&self.filters)? {
            spec = spec.filter_on(key, rule);
        }
        for condition in &self.conditions {
            spec = spec.condition(Constraint::sql(condition.clone()));
        }
        if !self.joins.is_empty() {
            spec = spec.joins(self.joins.iter().cloned());
        }
        if let Some(secs) = self.cache_for_secs {
            spec = spec.cache_for(Duration::from_secs(secs));
        }
        Ok(spec)
    }
}

impl StatsConfig {
    /// Load from the default location; a missing file yields an empty config.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from `path`, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `$MSTAT_CONFIG`, else `<config dir>/mstat/stats.toml`.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = dotenvy::var(CONFIG_ENV)
            && !path.is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|p| p.join("mstat").join("stats.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut models = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(ConfigError::Validation("Model name cannot be empty".into()));
            }
            if model.table.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Model `{}` has no table",
                    model.name
                )));
            }
            if !models.insert(&model.name) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate model name: {}",
                    model.name
                )));
            }
            let mut stats = HashSet::new();
            for stat in &model.statistics {
                if !stats.insert(&stat.name) {
                    return Err(ConfigError::Validation(format!(
                        "Duplicate statistic `{}` on model `{}`",
                        stat.name, model.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find_model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Register scopes on `backend` and build a catalog of every model.
    pub fn build_catalog(
        &self,
        backend: Arc<SqliteBackend>,
    ) -> Result<StatisticsCatalog, ConfigError> {
        let cache = Arc::new(TtlCache::in_memory(self.cache.capacity));
        let mut catalog = StatisticsCatalog::new(backend.clone(), cache, self.retry.policy());
        catalog.default_filter_rules(rules_from(&self.defaults.filters)?);

        for model in &self.models {
            for (scope, predicates) in &model.scopes {
                let constraints = predicates.iter().cloned().map(Constraint::Sql).collect();
                backend.define_scope(&model.table, scope, constraints);
            }
            let registry = catalog.model(ModelInfo::new(&model.name, &model.table));
            for (key, rule) in rules_from(&model.filters)? {
                registry.filter_all_on(key, rule);
            }
            for stat in &model.statistics {
                registry.define(stat.name.clone(), stat.to_spec()?);
            }
        }
        Ok(catalog)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
