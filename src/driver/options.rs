//! Request Options
//!
//! Per-service option bags. `to_map` validates mutually exclusive options and
//! renders the request body fields; nothing is dispatched when it fails.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::error::{DriverError, DriverResult};
use super::observability::RequestSpan;
use super::retry::RetryStrategy;
use super::search::{HighlightStyle, SearchFacet, SearchSort};

/// JSON object rendered from options.
pub type OptionMap = Map<String, Value>;

// ============================================================================
// Consistency
// ============================================================================

/// Query scan consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryScanConsistency {
    #[default]
    NotBounded,
    RequestPlus,
}

impl QueryScanConsistency {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NotBounded => "not_bounded",
            Self::RequestPlus => "request_plus",
        }
    }
}

/// Analytics scan consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalyticsScanConsistency {
    #[default]
    NotBounded,
    RequestPlus,
}

impl AnalyticsScanConsistency {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NotBounded => "not_bounded",
            Self::RequestPlus => "request_plus",
        }
    }
}

/// Search scan consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScanConsistency {
    #[default]
    NotBounded,
}

/// Query profiling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryProfileMode {
    #[default]
    None,
    Phases,
    Timings,
}

impl QueryProfileMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Phases => "phases",
            Self::Timings => "timings",
        }
    }
}

/// Sequence number of one mutation on one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationToken {
    pub bucket_name: String,
    pub partition_id: u16,
    pub partition_uuid: u64,
    pub sequence_number: u64,
}

impl MutationToken {
    pub fn new(bucket_name: impl Into<String>, partition_id: u16, partition_uuid: u64, sequence_number: u64) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            partition_id,
            partition_uuid,
            sequence_number,
        }
    }
}

/// Set of mutations a request must observe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationState {
    tokens: Vec<MutationToken>,
}

impl MutationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add tokens, keeping only the newest per partition
    pub fn add(&mut self, tokens: impl IntoIterator<Item = MutationToken>) -> &mut Self {
        for token in tokens {
            match self.tokens.iter_mut().find(|t| {
                t.bucket_name == token.bucket_name && t.partition_id == token.partition_id
            }) {
                Some(existing) if existing.sequence_number < token.sequence_number => *existing = token,
                Some(_) => {}
                None => self.tokens.push(token),
            }
        }
        self
    }

    pub fn tokens(&self) -> &[MutationToken] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Query service form: `{bucket: {"<vbid>": [seqno, "<vbuuid>"]}}`
    pub fn to_scan_vectors(&self) -> Value {
        let mut buckets: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
        for token in &self.tokens {
            buckets.entry(token.bucket_name.as_str()).or_default().insert(
                token.partition_id.to_string(),
                json!([token.sequence_number, token.partition_uuid.to_string()]),
            );
        }
        json!(buckets)
    }

    /// Search service form: `{index: {"<vbid>/<vbuuid>": seqno}}`
    pub fn to_search_vectors(&self, index_name: &str) -> Value {
        let mut vectors = Map::new();
        for token in &self.tokens {
            vectors.insert(
                format!("{}/{}", token.partition_id, token.partition_uuid),
                json!(token.sequence_number),
            );
        }
        json!({ index_name: vectors })
    }
}

/// Render a duration the way the services accept it, e.g. `"2500ms"`.
pub(crate) fn duration_to_ms_string(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

fn generated_context_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn named_parameter_key(name: &str) -> String {
    if name.starts_with('$') {
        name.to_string()
    } else {
        format!("${}", name)
    }
}

fn insert_parameters(
    map: &mut OptionMap,
    positional: &[Value],
    named: &BTreeMap<String, Value>,
) -> DriverResult<()> {
    if !positional.is_empty() && !named.is_empty() {
        return Err(DriverError::invalid_argument(
            "positional and named parameters must be used exclusively",
        ));
    }
    if !positional.is_empty() {
        map.insert("args".into(), Value::Array(positional.to_vec()));
    }
    for (name, value) in named {
        map.insert(named_parameter_key(name), value.clone());
    }
    Ok(())
}

fn to_value<T: Serialize>(value: &T, what: &str) -> DriverResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| DriverError::invalid_argument(format!("failed to encode {}: {}", what, e)))
}

// ============================================================================
// QueryOptions
// ============================================================================

/// N1QL query options
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub scan_consistency: Option<QueryScanConsistency>,
    pub consistent_with: Option<MutationState>,
    pub profile: QueryProfileMode,
    pub scan_cap: Option<u32>,
    pub pipeline_batch: Option<u32>,
    pub pipeline_cap: Option<u32>,
    pub scan_wait: Option<Duration>,
    pub readonly: bool,
    pub max_parallelism: Option<u32>,
    /// Generated when absent
    pub client_context_id: Option<String>,
    pub positional_parameters: Vec<Value>,
    pub named_parameters: BTreeMap<String, Value>,
    pub metrics: bool,
    /// Extra body fields, sent as-is
    pub raw: HashMap<String, Value>,
    /// Skip the prepare-then-execute path
    pub adhoc: bool,
    pub flex_index: bool,
    pub preserve_expiry: bool,
    pub use_replica: Option<bool>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub parent_span: Option<Arc<dyn RequestSpan>>,
    pub cancellation: Option<CancellationToken>,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("scan_consistency", &self.scan_consistency)
            .field("consistent_with", &self.consistent_with)
            .field("readonly", &self.readonly)
            .field("client_context_id", &self.client_context_id)
            .field("adhoc", &self.adhoc)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scan_consistency(mut self, consistency: QueryScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_consistent_with(mut self, state: MutationState) -> Self {
        self.consistent_with = Some(state);
        self
    }

    pub fn with_positional_parameters(mut self, params: Vec<Value>) -> Self {
        self.positional_parameters = params;
        self
    }

    pub fn with_named_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_parameters.insert(name.into(), value);
        self
    }

    pub fn with_client_context_id(mut self, id: impl Into<String>) -> Self {
        self.client_context_id = Some(id.into());
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }

    pub fn with_profile(mut self, profile: QueryProfileMode) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_metrics(mut self, metrics: bool) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_raw(mut self, key: impl Into<String>, value: Value) -> Self {
        self.raw.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_parent_span(mut self, span: Arc<dyn RequestSpan>) -> Self {
        self.parent_span = Some(span);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Render the request body fields, validating exclusive options.
    pub fn to_map(&self) -> DriverResult<OptionMap> {
        let mut map = OptionMap::new();

        if self.scan_consistency.is_some() && self.consistent_with.is_some() {
            return Err(DriverError::invalid_argument(
                "scan consistency and consistent with must be used exclusively",
            ));
        }
        if let Some(consistency) = self.scan_consistency {
            map.insert("scan_consistency".into(), json!(consistency.as_str()));
        }
        if let Some(state) = &self.consistent_with {
            map.insert("scan_consistency".into(), json!("at_plus"));
            map.insert("scan_vectors".into(), state.to_scan_vectors());
        }

        if self.profile != QueryProfileMode::None {
            map.insert("profile".into(), json!(self.profile.as_str()));
        }
        if let Some(cap) = self.scan_cap {
            map.insert("scan_cap".into(), json!(cap.to_string()));
        }
        if let Some(batch) = self.pipeline_batch {
            map.insert("pipeline_batch".into(), json!(batch.to_string()));
        }
        if let Some(cap) = self.pipeline_cap {
            map.insert("pipeline_cap".into(), json!(cap.to_string()));
        }
        if let Some(wait) = self.scan_wait {
            map.insert("scan_wait".into(), json!(duration_to_ms_string(wait)));
        }
        if self.readonly {
            map.insert("readonly".into(), json!(true));
        }
        if let Some(max) = self.max_parallelism {
            map.insert("max_parallelism".into(), json!(max.to_string()));
        }
        if !self.metrics {
            map.insert("metrics".into(), json!(false));
        }
        if self.flex_index {
            map.insert("use_fts".into(), json!(true));
        }
        if self.preserve_expiry {
            map.insert("preserve_expiry".into(), json!(true));
        }
        if let Some(use_replica) = self.use_replica {
            map.insert("use_replica".into(), json!(if use_replica { "on" } else { "off" }));
        }

        let context_id = self
            .client_context_id
            .clone()
            .unwrap_or_else(generated_context_id);
        map.insert("client_context_id".into(), json!(context_id));

        insert_parameters(&mut map, &self.positional_parameters, &self.named_parameters)?;

        for (key, value) in &self.raw {
            map.insert(key.clone(), value.clone());
        }

        Ok(map)
    }
}

// ============================================================================
// AnalyticsOptions
// ============================================================================

/// Analytics query options
#[derive(Clone, Default)]
pub struct AnalyticsOptions {
    pub client_context_id: Option<String>,
    /// Run ahead of normal-priority requests
    pub priority: bool,
    pub positional_parameters: Vec<Value>,
    pub named_parameters: BTreeMap<String, Value>,
    pub readonly: bool,
    pub scan_consistency: Option<AnalyticsScanConsistency>,
    pub raw: HashMap<String, Value>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub parent_span: Option<Arc<dyn RequestSpan>>,
    pub cancellation: Option<CancellationToken>,
}

impl fmt::Debug for AnalyticsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsOptions")
            .field("client_context_id", &self.client_context_id)
            .field("priority", &self.priority)
            .field("readonly", &self.readonly)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AnalyticsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_scan_consistency(mut self, consistency: AnalyticsScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_positional_parameters(mut self, params: Vec<Value>) -> Self {
        self.positional_parameters = params;
        self
    }

    pub fn with_named_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.named_parameters.insert(name.into(), value);
        self
    }

    pub fn with_client_context_id(mut self, id: impl Into<String>) -> Self {
        self.client_context_id = Some(id.into());
        self
    }

    pub fn with_raw(mut self, key: impl Into<String>, value: Value) -> Self {
        self.raw.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Transport priority value; -1 marks high priority
    pub fn priority_value(&self) -> i32 {
        if self.priority {
            -1
        } else {
            0
        }
    }

    /// Render the request body fields, validating exclusive options.
    pub fn to_map(&self) -> DriverResult<OptionMap> {
        let mut map = OptionMap::new();

        let context_id = self
            .client_context_id
            .clone()
            .unwrap_or_else(generated_context_id);
        map.insert("client_context_id".into(), json!(context_id));

        if let Some(consistency) = self.scan_consistency {
            map.insert("scan_consistency".into(), json!(consistency.as_str()));
        }
        if self.readonly {
            map.insert("readonly".into(), json!(true));
        }

        insert_parameters(&mut map, &self.positional_parameters, &self.named_parameters)?;

        for (key, value) in &self.raw {
            map.insert(key.clone(), value.clone());
        }

        Ok(map)
    }
}

// ============================================================================
// SearchOptions
// ============================================================================

/// Search highlighting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHighlight {
    pub style: Option<HighlightStyle>,
    pub fields: Vec<String>,
}

/// Search query options
#[derive(Clone, Default)]
pub struct SearchOptions {
    pub scan_consistency: Option<SearchScanConsistency>,
    pub consistent_with: Option<MutationState>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
    pub explain: bool,
    pub highlight: Option<SearchHighlight>,
    pub fields: Vec<String>,
    pub sort: Vec<SearchSort>,
    pub facets: BTreeMap<String, SearchFacet>,
    pub disable_scoring: bool,
    pub collections: Vec<String>,
    pub include_locations: bool,
    pub raw: HashMap<String, Value>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub parent_span: Option<Arc<dyn RequestSpan>>,
    pub cancellation: Option<CancellationToken>,
}

impl fmt::Debug for SearchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchOptions")
            .field("limit", &self.limit)
            .field("skip", &self.skip)
            .field("fields", &self.fields)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u32) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    pub fn with_highlight(mut self, style: Option<HighlightStyle>, fields: Vec<String>) -> Self {
        self.highlight = Some(SearchHighlight { style, fields });
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_sort(mut self, sort: Vec<SearchSort>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_facet(mut self, name: impl Into<String>, facet: SearchFacet) -> Self {
        self.facets.insert(name.into(), facet);
        self
    }

    pub fn with_scan_consistency(mut self, consistency: SearchScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }

    pub fn with_consistent_with(mut self, state: MutationState) -> Self {
        self.consistent_with = Some(state);
        self
    }

    pub fn with_disable_scoring(mut self, disable: bool) -> Self {
        self.disable_scoring = disable;
        self
    }

    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    pub fn with_include_locations(mut self, include: bool) -> Self {
        self.include_locations = include;
        self
    }

    pub fn with_raw(mut self, key: impl Into<String>, value: Value) -> Self {
        self.raw.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Render the request body fields for `index_name`, validating exclusive options.
    pub fn to_map(&self, index_name: &str) -> DriverResult<OptionMap> {
        let mut map = OptionMap::new();

        if let Some(limit) = self.limit {
            map.insert("size".into(), json!(limit));
        }
        if let Some(skip) = self.skip {
            map.insert("from".into(), json!(skip));
        }
        if self.explain {
            map.insert("explain".into(), json!(true));
        }
        if let Some(highlight) = &self.highlight {
            let mut h = Map::new();
            if let Some(style) = highlight.style {
                h.insert("style".into(), json!(style.as_str()));
            }
            if !highlight.fields.is_empty() {
                h.insert("fields".into(), json!(highlight.fields));
            }
            map.insert("highlight".into(), Value::Object(h));
        }
        if !self.fields.is_empty() {
            map.insert("fields".into(), json!(self.fields));
        }
        if !self.sort.is_empty() {
            let sort: Vec<Value> = self.sort.iter().map(SearchSort::to_json).collect();
            map.insert("sort".into(), Value::Array(sort));
        }
        if !self.facets.is_empty() {
            let mut facets = Map::new();
            for (name, facet) in &self.facets {
                facets.insert(name.clone(), facet.to_json());
            }
            map.insert("facets".into(), Value::Object(facets));
        }

        if self.scan_consistency.is_some() && self.consistent_with.is_some() {
            return Err(DriverError::invalid_argument(
                "scan consistency and consistent with must be used exclusively",
            ));
        }
        let mut ctl = Map::new();
        if self.scan_consistency.is_some() {
            ctl.insert("consistency".into(), json!({ "level": "not_bounded" }));
        }
        if let Some(state) = &self.consistent_with {
            ctl.insert(
                "consistency".into(),
                json!({ "level": "at_plus", "vectors": state.to_search_vectors(index_name) }),
            );
        }
        if !ctl.is_empty() {
            map.insert("ctl".into(), Value::Object(ctl));
        }

        if self.disable_scoring {
            map.insert("score".into(), json!("none"));
        }
        if !self.collections.is_empty() {
            map.insert("collections".into(), to_value(&self.collections, "collections")?);
        }
        if self.include_locations {
            map.insert("includeLocations".into(), json!(true));
        }

        for (key, value) in &self.raw {
            map.insert(key.clone(), value.clone());
        }

        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> MutationState {
        let mut state = MutationState::new();
        state.add([
            MutationToken::new("travel", 12, 1234, 7),
            MutationToken::new("travel", 12, 1234, 9),
            MutationToken::new("travel", 3, 99, 1),
        ]);
        state
    }

    #[test]
    fn test_query_exclusive_consistency() {
        let opts = QueryOptions::new()
            .with_scan_consistency(QueryScanConsistency::RequestPlus)
            .with_consistent_with(state());
        assert!(matches!(opts.to_map(), Err(DriverError::InvalidArgument(_))));
    }

    #[test]
    fn test_query_exclusive_parameters() {
        let opts = QueryOptions::new()
            .with_positional_parameters(vec![json!(1)])
            .with_named_parameter("name", json!("x"));
        assert!(matches!(opts.to_map(), Err(DriverError::InvalidArgument(_))));
    }

    #[test]
    fn test_query_to_map() {
        let opts = QueryOptions::new()
            .with_scan_consistency(QueryScanConsistency::RequestPlus)
            .with_named_parameter("name", json!("alice"))
            .with_named_parameter("$age", json!(30))
            .with_client_context_id("ctx-1")
            .with_readonly(true)
            .with_profile(QueryProfileMode::Timings)
            .with_raw("custom", json!(true));
        let map = opts.to_map().unwrap();

        assert_eq!(map["scan_consistency"], "request_plus");
        assert_eq!(map["$name"], "alice");
        assert_eq!(map["$age"], 30);
        assert_eq!(map["client_context_id"], "ctx-1");
        assert_eq!(map["readonly"], true);
        assert_eq!(map["profile"], "timings");
        assert_eq!(map["metrics"], false);
        assert_eq!(map["custom"], true);
    }

    #[test]
    fn test_query_generates_context_id() {
        let map = QueryOptions::new().to_map().unwrap();
        let id = map["client_context_id"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_query_scan_vectors() {
        let map = QueryOptions::new().with_consistent_with(state()).to_map().unwrap();
        assert_eq!(map["scan_consistency"], "at_plus");
        assert_eq!(map["scan_vectors"]["travel"]["12"], json!([9, "1234"]));
        assert_eq!(map["scan_vectors"]["travel"]["3"], json!([1, "99"]));
    }

    #[test]
    fn test_analytics_to_map() {
        let opts = AnalyticsOptions::new()
            .with_positional_parameters(vec![json!("a"), json!(2)])
            .with_priority(true);
        let map = opts.to_map().unwrap();
        assert_eq!(map["args"], json!(["a", 2]));
        assert_eq!(opts.priority_value(), -1);

        let bad = AnalyticsOptions::new()
            .with_positional_parameters(vec![json!(1)])
            .with_named_parameter("x", json!(1));
        assert!(matches!(bad.to_map(), Err(DriverError::InvalidArgument(_))));
    }

    #[test]
    fn test_search_to_map() {
        let opts = SearchOptions::new()
            .with_limit(10)
            .with_skip(5)
            .with_disable_scoring(true)
            .with_include_locations(true)
            .with_consistent_with(state());
        let map = opts.to_map("hotels").unwrap();
        assert_eq!(map["size"], 10);
        assert_eq!(map["from"], 5);
        assert_eq!(map["score"], "none");
        assert_eq!(map["includeLocations"], true);
        assert_eq!(map["ctl"]["consistency"]["level"], "at_plus");
        assert_eq!(map["ctl"]["consistency"]["vectors"]["hotels"]["12/1234"], 9);

        let bad = SearchOptions::new()
            .with_scan_consistency(SearchScanConsistency::NotBounded)
            .with_consistent_with(state());
        assert!(matches!(bad.to_map("hotels"), Err(DriverError::InvalidArgument(_))));
    }
}
