//! Statistic definitions, the per-model registry that evaluates them, and the
//! catalog that owns one registry per model.
//!
//! Evaluation of an aggregate statistic:
//!
//! 1. unknown name → `Ok(None)`;
//! 2. cacheable → fingerprint lookup, an unexpired hit returns at once;
//! 3. build a fresh [`Query`]: scopes in order, static/computed conditions,
//!    joins, then one constraint per non-null filter;
//! 4. execute the aggregate on the backend;
//! 5. cacheable → store with the literal or computed TTL.
//!
//! Calculated statistics replace steps 3–4 with a closure that reads sibling
//! statistics under the same filters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::cache::{TtlCache, fingerprint};
use super::filter::{self, FilterRule, FilterRules};
use super::query::{Constraint, Query, QueryBackend, StatCollection};
use super::retry::RetryPolicy;
use super::types::{Dynamic, Filters, Operation, StatValue, StatsError, StatsResult};

/// Scope name meaning "the whole table".
pub const ALL_SCOPE: &str = "all";

/// Default aggregate column.
pub const DEFAULT_COLUMN: &str = "id";

/// How deep calculated statistics may nest before evaluation is aborted.
pub const MAX_DERIVATION_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Closure computing a calculated statistic from its siblings.
pub type Derivation = Arc<dyn Fn(&Siblings<'_>) -> StatsResult<StatValue> + Send + Sync>;

/// Options of an aggregate statistic.
#[derive(Clone, Debug)]
pub struct AggregateSpec {
    pub operation: Operation,
    pub column: String,
    pub scopes: Vec<String>,
    pub filter_on: FilterRules,
    pub conditions: Vec<Dynamic<Option<Constraint>>>,
    pub joins: Option<Dynamic<Vec<String>>>,
    pub cache_ttl: Option<Dynamic<Duration>>,
}

impl AggregateSpec {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            column: DEFAULT_COLUMN.to_string(),
            scopes: vec![ALL_SCOPE.to_string()],
            filter_on: FilterRules::new(),
            conditions: Vec::new(),
            joins: None,
            cache_ttl: None,
        }
    }

    pub fn count() -> Self {
        Self::new(Operation::Count)
    }

    pub fn sum(column: impl Into<String>) -> Self {
        Self::new(Operation::Sum).column(column)
    }

    pub fn average(column: impl Into<String>) -> Self {
        Self::new(Operation::Average).column(column)
    }

    pub fn minimum(column: impl Into<String>) -> Self {
        Self::new(Operation::Minimum).column(column)
    }

    pub fn maximum(column: impl Into<String>) -> Self {
        Self::new(Operation::Maximum).column(column)
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Scopes to chain, in order. `["all"]` chains nothing.
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter_on(mut self, key: impl Into<String>, rule: impl Into<FilterRule>) -> Self {
        self.filter_on.insert(key.into(), rule.into());
        self
    }

    pub fn condition(mut self, constraint: Constraint) -> Self {
        self.conditions.push(Dynamic::Literal(Some(constraint)));
        self
    }

    /// Condition computed from the full filter map; `None` adds nothing.
    pub fn computed_condition(
        mut self,
        f: impl Fn(&Filters) -> Option<Constraint> + Send + Sync + 'static,
    ) -> Self {
        self.conditions.push(Dynamic::computed(f));
        self
    }

    pub fn joins<I, S>(mut self, joins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.joins = Some(Dynamic::Literal(joins.into_iter().map(Into::into).collect()));
        self
    }

    pub fn computed_joins(
        mut self,
        f: impl Fn(&Filters) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.joins = Some(Dynamic::computed(f));
        self
    }

    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(Dynamic::Literal(ttl));
        self
    }

    pub fn cache_for_with(
        mut self,
        f: impl Fn(&Filters) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.cache_ttl = Some(Dynamic::computed(f));
        self
    }
}

/// What a statistic evaluates. Exactly one of the two by construction.
#[derive(Clone)]
pub enum StatisticKind {
    Aggregate(AggregateSpec),
    Calculated(Derivation),
}

impl fmt::Debug for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregate(spec) => f.debug_tuple("Aggregate").field(spec).finish(),
            Self::Calculated(_) => write!(f, "Calculated(<fn>)"),
        }
    }
}

/// A named statistic. Immutable once registered.
#[derive(Clone, Debug)]
pub struct StatisticDefinition {
    name: String,
    kind: StatisticKind,
    cache_ttl: Option<Dynamic<Duration>>,
}

impl StatisticDefinition {
    pub fn aggregate(name: impl Into<String>, mut spec: AggregateSpec) -> Self {
        let cache_ttl = spec.cache_ttl.take();
        Self {
            name: name.into(),
            kind: StatisticKind::Aggregate(spec),
            cache_ttl,
        }
    }

    pub fn calculated(
        name: impl Into<String>,
        derivation: impl Fn(&Siblings<'_>) -> StatsResult<StatValue> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StatisticKind::Calculated(Arc::new(derivation)),
            cache_ttl: None,
        }
    }

    /// Opt a calculated statistic into caching.
    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(Dynamic::Literal(ttl));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StatisticKind {
        &self.kind
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache_ttl.is_some()
    }
}

// ---------------------------------------------------------------------------
// Siblings
// ---------------------------------------------------------------------------

/// Lookup handed to calculated statistics.
pub struct Siblings<'a> {
    registry: &'a StatisticRegistry,
    filters: &'a Filters,
    caller: &'a str,
    depth: usize,
}

impl Siblings<'_> {
    /// Value of sibling `name` under the caller's filters.
    ///
    /// Unknown names and self-references yield [`StatValue::Null`].
    pub fn get(&self, name: &str) -> StatsResult<StatValue> {
        if name == self.caller {
            warn!(statistic = name, "Calculated statistic references itself");
            return Ok(StatValue::Null);
        }
        Ok(self
            .registry
            .evaluate_at_depth(name, self.filters, self.depth)?
            .unwrap_or_default())
    }

    /// Every other statistic of the model, in declaration order.
    pub fn all(&self) -> StatsResult<Vec<(String, StatValue)>> {
        self.registry
            .names()
            .iter()
            .filter(|name| name.as_str() != self.caller)
            .map(|name| Ok((name.clone(), self.get(name)?)))
            .collect()
    }

    pub fn filters(&self) -> &Filters {
        self.filters
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Identity of the model a registry serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub table: String,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
        }
    }
}

/// Statistics of one model.
pub struct StatisticRegistry {
    model: ModelInfo,
    order: Vec<String>,
    definitions: HashMap<String, Arc<StatisticDefinition>>,
    inherited_rules: FilterRules,
    model_rules: FilterRules,
    backend: Arc<dyn QueryBackend>,
    cache: Arc<TtlCache>,
    retry: RetryPolicy,
}

impl StatisticRegistry {
    pub fn new(
        model: ModelInfo,
        backend: Arc<dyn QueryBackend>,
        cache: Arc<TtlCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            order: Vec::new(),
            definitions: HashMap::new(),
            inherited_rules: FilterRules::new(),
            model_rules: FilterRules::new(),
            backend,
            cache,
            retry,
        }
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Insert `definition`; an existing name is replaced in place.
    pub fn register(&mut self, definition: StatisticDefinition) {
        let name = definition.name.clone();
        if self
            .definitions
            .insert(name.clone(), Arc::new(definition))
            .is_some()
        {
            debug!(model = %self.model.name, statistic = %name, "Replacing statistic definition");
        } else {
            self.order.push(name);
        }
    }

    pub fn define(&mut self, name: impl Into<String>, spec: AggregateSpec) {
        self.register(StatisticDefinition::aggregate(name, spec));
    }

    pub fn define_calculated(
        &mut self,
        name: impl Into<String>,
        derivation: impl Fn(&Siblings<'_>) -> StatsResult<StatValue> + Send + Sync + 'static,
    ) {
        self.register(StatisticDefinition::calculated(name, derivation));
    }

    /// Rule applied to `key` for every statistic of this model.
    pub fn filter_all_on(&mut self, key: impl Into<String>, rule: impl Into<FilterRule>) {
        self.model_rules.insert(key.into(), rule.into());
    }

    pub(crate) fn set_inherited_rules(&mut self, rules: FilterRules) {
        self.inherited_rules = rules;
    }

    /// Registered names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn definition(&self, name: &str) -> Option<&StatisticDefinition> {
        self.definitions.get(name).map(Arc::as_ref)
    }

    /// Evaluate once, without retry. Unknown names yield `Ok(None)`.
    pub fn evaluate(&self, name: &str, filters: &Filters) -> StatsResult<Option<StatValue>> {
        self.evaluate_at_depth(name, filters, 0)
    }

    /// Evaluate with transient backend failures retried.
    pub fn get(&self, name: &str, filters: &Filters) -> StatsResult<Option<StatValue>> {
        self.retry.run(name, |_| self.evaluate(name, filters))
    }

    /// Drop any cached value, then evaluate with retry.
    pub fn get_fresh(&self, name: &str, filters: &Filters) -> StatsResult<Option<StatValue>> {
        self.invalidate(name, filters);
        self.get(name, filters)
    }

    /// Every statistic except `except`, in declaration order.
    pub fn all(
        &self,
        filters: &Filters,
        except: Option<&str>,
    ) -> StatsResult<Vec<(String, StatValue)>> {
        self.order
            .iter()
            .filter(|name| Some(name.as_str()) != except)
            .map(|name| {
                let value = self.get(name, filters)?.unwrap_or_default();
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Remove the cached value for (name, filters) without recomputing.
    pub fn invalidate(&self, name: &str, filters: &Filters) {
        self.cache
            .invalidate(&fingerprint(&self.model.name, name, filters));
    }

    /// The filtered collection behind an aggregate statistic.
    ///
    /// Uses the same builder as [`evaluate`](Self::evaluate), so the rows
    /// enumerated here are the rows the aggregate runs over. Calculated and
    /// unknown statistics yield `Ok(None)`.
    pub fn query_for(&self, name: &str, filters: &Filters) -> StatsResult<Option<StatCollection>> {
        let Some(definition) = self.definitions.get(name) else {
            return Ok(None);
        };
        match &definition.kind {
            StatisticKind::Aggregate(spec) => {
                let query = self.build_query(spec, filters)?;
                Ok(Some(StatCollection::new(query, Arc::clone(&self.backend))))
            }
            StatisticKind::Calculated(_) => Ok(None),
        }
    }

    fn evaluate_at_depth(
        &self,
        name: &str,
        filters: &Filters,
        depth: usize,
    ) -> StatsResult<Option<StatValue>> {
        let Some(definition) = self.definitions.get(name) else {
            debug!(model = %self.model.name, statistic = name, "Unknown statistic");
            return Ok(None);
        };

        let key = definition
            .cache_ttl
            .as_ref()
            .map(|_| fingerprint(&self.model.name, name, filters));
        if let Some(key) = &key
            && let Some(value) = self.cache.get(key)
        {
            debug!(statistic = name, fingerprint = %key, "Statistic cache hit");
            return Ok(Some(value));
        }

        let value = match &definition.kind {
            StatisticKind::Calculated(derive) => {
                if depth >= MAX_DERIVATION_DEPTH {
                    return Err(StatsError::DerivationDepth {
                        name: name.to_string(),
                    });
                }
                let siblings = Siblings {
                    registry: self,
                    filters,
                    caller: name,
                    depth: depth + 1,
                };
                derive(&siblings)?
            }
            StatisticKind::Aggregate(spec) => {
                let query = self.build_query(spec, filters)?;
                debug!(
                    statistic = name,
                    operation = %spec.operation,
                    column = %spec.column,
                    constraints = query.constraints().len(),
                    "Executing statistic"
                );
                self.backend.aggregate(&query, spec.operation, &spec.column)?
            }
        };

        if let (Some(key), Some(ttl)) = (key, &definition.cache_ttl) {
            let ttl = ttl.resolve(filters);
            debug!(statistic = name, fingerprint = %key, ttl = ?ttl, "Caching statistic");
            self.cache.put(&key, value, ttl);
        }
        Ok(Some(value))
    }

    /// Defaults, then model rules, then statistic rules; the most local wins.
    fn merged_rules<'a>(&'a self, spec: &'a AggregateSpec) -> HashMap<&'a str, &'a FilterRule> {
        self.inherited_rules
            .iter()
            .chain(&self.model_rules)
            .chain(&spec.filter_on)
            .map(|(key, rule)| (key.as_str(), rule))
            .collect()
    }

    fn build_query(&self, spec: &AggregateSpec, filters: &Filters) -> StatsResult<Query> {
        let mut query = Query::new(&self.model.table);
        for scope in spec.scopes.iter().filter(|s| s.as_str() != ALL_SCOPE) {
            self.backend.apply_scope(&mut query, scope)?;
        }

        let rules = self.merged_rules(spec);
        let now = self.cache.clock().now();
        let mut filter_constraints = Vec::with_capacity(filters.len());
        for (key, value) in filters.iter() {
            let rule = rules.get(key).copied();
            if let Some(constraint) = filter::resolve(key, value, rule, &self.model.table, now)? {
                filter_constraints.push(constraint);
            }
        }

        for condition in &spec.conditions {
            if let Some(constraint) = condition.resolve(filters) {
                query.constrain(constraint);
            }
        }
        if let Some(joins) = &spec.joins {
            for join in joins.resolve(filters) {
                query.join(join);
            }
        }
        for constraint in filter_constraints {
            query.constrain(constraint);
        }
        Ok(query)
    }
}

impl fmt::Debug for StatisticRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatisticRegistry")
            .field("model", &self.model)
            .field("statistics", &self.order)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Composition root: default filter rules plus one registry per model.
pub struct StatisticsCatalog {
    default_rules: FilterRules,
    registries: HashMap<String, StatisticRegistry>,
    backend: Arc<dyn QueryBackend>,
    cache: Arc<TtlCache>,
    retry: RetryPolicy,
}

impl StatisticsCatalog {
    pub fn new(backend: Arc<dyn QueryBackend>, cache: Arc<TtlCache>, retry: RetryPolicy) -> Self {
        Self {
            default_rules: FilterRules::new(),
            registries: HashMap::new(),
            backend,
            cache,
            retry,
        }
    }

    /// Replace the rules every model inherits, including existing ones.
    pub fn default_filter_rules(&mut self, rules: FilterRules) {
        for registry in self.registries.values_mut() {
            registry.set_inherited_rules(rules.clone());
        }
        self.default_rules = rules;
    }

    /// Registry for `model`, created on first use.
    pub fn model(&mut self, model: ModelInfo) -> &mut StatisticRegistry {
        let Self {
            default_rules,
            registries,
            backend,
            cache,
            retry,
        } = self;
        registries.entry(model.name.clone()).or_insert_with(|| {
            let mut registry =
                StatisticRegistry::new(model, Arc::clone(backend), Arc::clone(cache), retry.clone());
            registry.set_inherited_rules(default_rules.clone());
            registry
        })
    }

    pub fn registry(&self, model_name: &str) -> Option<&StatisticRegistry> {
        self.registries.get(model_name)
    }

    /// Model names, sorted.
    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.registries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::cache::{ManualClock, MemoryStore};
    use crate::stats::query::Record;
    use crate::stats::types::{BackendError, BackendErrorKind, FilterValue};
    use chrono::{NaiveDate, NaiveDateTime};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every query it sees and answers from a fixed script.
    struct ScriptedBackend {
        queries: Mutex<Vec<(Query, Operation, String)>>,
        answer: Mutex<StatValue>,
        fail_first: u32,
        failure: BackendErrorKind,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn answering(value: i64) -> Self {
            Self::failing(value, 0, BackendErrorKind::Serialization)
        }

        fn failing(value: i64, fail_first: u32, failure: BackendErrorKind) -> Self {
            Self {
                queries: Mutex::new(Vec::new()),
                answer: Mutex::new(StatValue::Int(value)),
                fail_first,
                failure,
                calls: AtomicU32::new(0),
            }
        }

        fn set_answer(&self, value: i64) {
            *self.answer.lock() = StatValue::Int(value);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }

        fn last_sql(&self) -> String {
            self.queries
                .lock()
                .last()
                .map(|(q, _, _)| q.to_sql())
                .unwrap_or_default()
        }
    }

    impl QueryBackend for ScriptedBackend {
        fn apply_scope(&self, query: &mut Query, scope: &str) -> StatsResult<()> {
            if scope == "missing" {
                return Err(StatsError::UnknownScope {
                    table: query.table().to_string(),
                    scope: scope.to_string(),
                });
            }
            query.record_scope(scope);
            query.constrain(Constraint::sql(format!("scope_{scope}")));
            Ok(())
        }

        fn aggregate(
            &self,
            query: &Query,
            operation: Operation,
            column: &str,
        ) -> StatsResult<StatValue> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            self.queries
                .lock()
                .push((query.clone(), operation, column.to_string()));
            if call < self.fail_first {
                return Err(BackendError::new(self.failure, "scripted failure").into());
            }
            Ok(*self.answer.lock())
        }

        fn fetch(&self, _query: &Query) -> StatsResult<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn registry_with(backend: Arc<ScriptedBackend>) -> (StatisticRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(TtlCache::new(Arc::new(MemoryStore::new(64)), clock.clone()));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let registry =
            StatisticRegistry::new(ModelInfo::new("MockModel", "mock_models"), backend, cache, retry);
        (registry, clock)
    }

    #[test]
    fn unknown_statistic_is_none() {
        let backend = Arc::new(ScriptedBackend::answering(1));
        let (registry, _) = registry_with(backend.clone());
        assert_eq!(registry.evaluate("nope", &Filters::new()).unwrap(), None);
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn names_keep_declaration_order_on_redefinition() {
        let backend = Arc::new(ScriptedBackend::answering(1));
        let (mut registry, _) = registry_with(backend);
        registry.define("Basic Count", AggregateSpec::count());
        registry.define("Basic Sum", AggregateSpec::sum("amount"));
        registry.define("Basic Count", AggregateSpec::maximum("amount"));
        assert_eq!(registry.names(), ["Basic Count", "Basic Sum"]);
        let def = registry.definition("Basic Count").unwrap();
        match def.kind() {
            StatisticKind::Aggregate(spec) => assert_eq!(spec.operation, Operation::Maximum),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn unfiltered_count_hits_base_table() {
        let backend = Arc::new(ScriptedBackend::answering(3));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define("Basic Count", AggregateSpec::count());
        assert_eq!(
            registry.evaluate("Basic Count", &Filters::new()).unwrap(),
            Some(StatValue::Int(3))
        );
        let (query, op, column) = backend.queries.lock()[0].clone();
        assert!(query.constraints().is_empty());
        assert!(query.scopes().is_empty());
        assert_eq!(op, Operation::Count);
        assert_eq!(column, "id");
    }

    #[test]
    fn scopes_chain_in_order() {
        let backend = Arc::new(ScriptedBackend::answering(5));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define(
            "Chained Scope Count",
            AggregateSpec::count().scopes(["all", "named_scope", "recent"]),
        );
        registry.evaluate("Chained Scope Count", &Filters::new()).unwrap();
        let (query, _, _) = backend.queries.lock()[0].clone();
        assert_eq!(query.scopes(), ["named_scope", "recent"]);
    }

    #[test]
    fn unknown_scope_propagates() {
        let backend = Arc::new(ScriptedBackend::answering(5));
        let (mut registry, _) = registry_with(backend);
        registry.define("Broken", AggregateSpec::count().scopes(["missing"]));
        let err = registry.evaluate("Broken", &Filters::new()).unwrap_err();
        assert!(matches!(err, StatsError::UnknownScope { .. }));
    }

    #[test]
    fn model_rule_applies_and_local_rule_wins() {
        let backend = Arc::new(ScriptedBackend::answering(2));
        let (mut registry, _) = registry_with(backend.clone());
        registry.filter_all_on("user_id", "user_id = ?");
        registry.define("Basic Count", AggregateSpec::count());
        registry.define(
            "Overridden",
            AggregateSpec::count().filter_on("user_id", "owner_id = ?"),
        );
        let filters = Filters::new().with("user_id", 54321);

        registry.evaluate("Basic Count", &filters).unwrap();
        assert!(backend.last_sql().contains("(user_id = '54321')"));

        registry.evaluate("Overridden", &filters).unwrap();
        let sql = backend.last_sql();
        assert!(sql.contains("(owner_id = '54321')"));
        assert!(!sql.contains("(user_id = '54321')"));
    }

    #[test]
    fn unknown_filter_key_fails_without_backend_call() {
        let backend = Arc::new(ScriptedBackend::answering(2));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define(
            "Custom Filter",
            AggregateSpec::count().filter_on("channel", "channel = ?"),
        );
        let err = registry
            .get("Custom Filter", &Filters::new().with("status", "active"))
            .unwrap_err();
        assert!(matches!(err, StatsError::UnknownFilterKey { ref key } if key == "status"));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn null_filter_is_skipped_even_without_rule() {
        let backend = Arc::new(ScriptedBackend::answering(2));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define("Basic Count", AggregateSpec::count());
        let filters = Filters::new().with("status", FilterValue::Null);
        assert!(registry.evaluate("Basic Count", &filters).is_ok());
    }

    #[test]
    fn computed_condition_sees_filters() {
        let backend = Arc::new(ScriptedBackend::answering(2));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define(
            "Filter In Conditions",
            AggregateSpec::count()
                .filter_on("channel", FilterRule::DefaultEquality)
                .computed_condition(|f| {
                    let high = f.get("channel").and_then(|v| v.as_i64()).is_some_and(|c| c > 10);
                    Some(Constraint::sql(if high { "amount > 0" } else { "amount < 0" }))
                }),
        );
        registry
            .evaluate("Filter In Conditions", &Filters::new().with("channel", 12))
            .unwrap();
        let sql = backend.last_sql();
        assert!(sql.contains("(amount > 0)"), "{sql}");
        assert!(sql.contains("\"mock_models\".\"channel\" = 12"), "{sql}");

        registry
            .evaluate("Filter In Conditions", &Filters::new())
            .unwrap();
        assert!(backend.last_sql().contains("(amount < 0)"));
    }

    #[test]
    fn computed_joins_are_applied() {
        let backend = Arc::new(ScriptedBackend::answering(2));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define(
            "Joined",
            AggregateSpec::count().computed_joins(|f| {
                if f.get("team").is_some() {
                    vec!["INNER JOIN users ON users.id = mock_models.user_id".to_string()]
                } else {
                    Vec::new()
                }
            })
            .filter_on("team", "users.team = ?"),
        );
        registry
            .evaluate("Joined", &Filters::new().with("team", "red"))
            .unwrap();
        let sql = backend.last_sql();
        assert!(sql.contains("INNER JOIN users"));
        assert!(sql.contains("(users.team = 'red')"));
    }

    #[test]
    fn calculated_statistic_combines_siblings() {
        let backend = Arc::new(ScriptedBackend::answering(7));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define("Basic Count", AggregateSpec::count());
        registry.define("Basic Sum", AggregateSpec::sum("amount"));
        registry.define_calculated("Total Amount", |stats| {
            Ok(stats.get("Basic Sum")? * stats.get("Basic Count")?)
        });
        assert_eq!(
            registry.evaluate("Total Amount", &Filters::new()).unwrap(),
            Some(StatValue::Int(49))
        );
        assert_eq!(backend.calls(), 2);
        assert!(registry.query_for("Total Amount", &Filters::new()).unwrap().is_none());
    }

    #[test]
    fn calculated_statistics_propagate_filters() {
        let backend = Arc::new(ScriptedBackend::answering(1));
        let (mut registry, _) = registry_with(backend.clone());
        registry.filter_all_on("user_id", "user_id = ?");
        registry.define("Basic Count", AggregateSpec::count());
        registry.define_calculated("Doubled", |stats| {
            Ok(stats.get("Basic Count")? * StatValue::Int(2))
        });
        registry
            .evaluate("Doubled", &Filters::new().with("user_id", 5))
            .unwrap();
        assert!(backend.last_sql().contains("(user_id = '5')"));
    }

    #[test]
    fn self_reference_is_null_and_cycles_are_bounded() {
        let backend = Arc::new(ScriptedBackend::answering(1));
        let (mut registry, _) = registry_with(backend);
        registry.define_calculated("Selfish", |stats| stats.get("Selfish"));
        assert_eq!(
            registry.evaluate("Selfish", &Filters::new()).unwrap(),
            Some(StatValue::Null)
        );

        registry.define_calculated("Ping", |stats| stats.get("Pong"));
        registry.define_calculated("Pong", |stats| stats.get("Ping"));
        let err = registry.evaluate("Ping", &Filters::new()).unwrap_err();
        assert!(matches!(err, StatsError::DerivationDepth { .. }));
    }

    #[test]
    fn all_skips_except_and_keeps_order() {
        let backend = Arc::new(ScriptedBackend::answering(4));
        let (mut registry, _) = registry_with(backend);
        registry.define("A", AggregateSpec::count());
        registry.define("B", AggregateSpec::count());
        registry.define_calculated("C", |stats| {
            let total = stats
                .all()?
                .into_iter()
                .fold(StatValue::Int(0), |acc, (_, v)| acc + v);
            Ok(total)
        });
        let all = registry.all(&Filters::new(), Some("B")).unwrap();
        let names: Vec<&str> = all.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["A", "C"]);
        assert_eq!(all[1].1, StatValue::Int(8));
    }

    #[test]
    fn static_ttl_caches_until_expiry() {
        let backend = Arc::new(ScriptedBackend::answering(6));
        let (mut registry, clock) = registry_with(backend.clone());
        registry.define(
            "Cached",
            AggregateSpec::count()
                .filter_on("channel", "channel = ?")
                .cache_for(Duration::from_secs(1)),
        );
        let filters = Filters::new().with("channel", "chan5");
        assert_eq!(registry.get("Cached", &filters).unwrap(), Some(StatValue::Int(6)));
        backend.set_answer(8);
        assert_eq!(registry.get("Cached", &filters).unwrap(), Some(StatValue::Int(6)));
        assert_eq!(backend.calls(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(registry.get("Cached", &filters).unwrap(), Some(StatValue::Int(8)));
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn get_fresh_bypasses_cache() {
        let backend = Arc::new(ScriptedBackend::answering(6));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define(
            "Cached",
            AggregateSpec::count().cache_for(Duration::from_secs(300)),
        );
        let filters = Filters::new();
        assert_eq!(registry.get("Cached", &filters).unwrap(), Some(StatValue::Int(6)));
        backend.set_answer(8);
        assert_eq!(registry.get_fresh("Cached", &filters).unwrap(), Some(StatValue::Int(8)));
        assert_eq!(registry.get("Cached", &filters).unwrap(), Some(StatValue::Int(8)));
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn uncached_statistic_always_recomputes() {
        let backend = Arc::new(ScriptedBackend::answering(6));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define("Basic Count", AggregateSpec::count());
        registry.get("Basic Count", &Filters::new()).unwrap();
        registry.get("Basic Count", &Filters::new()).unwrap();
        assert_eq!(backend.calls(), 2);
        assert_eq!(registry.cache().stats().get().2, 0);
    }

    #[test]
    fn transient_failures_are_retried() {
        let backend = Arc::new(ScriptedBackend::failing(
            9,
            2,
            BackendErrorKind::Serialization,
        ));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define("Basic Count", AggregateSpec::count());
        assert_eq!(
            registry.get("Basic Count", &Filters::new()).unwrap(),
            Some(StatValue::Int(9))
        );
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn other_backend_failures_are_not_retried() {
        let backend = Arc::new(ScriptedBackend::failing(9, 2, BackendErrorKind::Connection));
        let (mut registry, _) = registry_with(backend.clone());
        registry.define("Basic Count", AggregateSpec::count());
        let err = registry.get("Basic Count", &Filters::new()).unwrap_err();
        assert_eq!(err.backend_kind(), Some(BackendErrorKind::Connection));
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn catalog_creates_registries_lazily_with_defaults() {
        let backend = Arc::new(ScriptedBackend::answering(1));
        let cache = Arc::new(TtlCache::default());
        let mut catalog = StatisticsCatalog::new(backend.clone(), cache, RetryPolicy::no_retry());
        let mut defaults = FilterRules::new();
        defaults.insert("user_id".into(), FilterRule::template("user_id = ?"));
        catalog.default_filter_rules(defaults);

        let registry = catalog.model(ModelInfo::new("Payment", "payments"));
        registry.define("Count", AggregateSpec::count());
        catalog.model(ModelInfo::new("Payment", "payments"));
        assert_eq!(catalog.model_names(), ["Payment"]);

        let registry = catalog.registry("Payment").unwrap();
        registry
            .evaluate("Count", &Filters::new().with("user_id", 3))
            .unwrap();
        assert!(backend.last_sql().contains("(user_id = '3')"));
        assert!(catalog.registry("Other").is_none());
    }
}
