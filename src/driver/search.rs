//! Search Requests
//!
//! Structured full-text queries, vector queries, sort and facet definitions.
//! A [`SearchRequest`] carries a structured query, a vector search, or both.

use serde_json::{json, Map, Value};

use super::error::{DriverError, DriverResult};

// ============================================================================
// SearchQuery
// ============================================================================

/// Operator joining the terms of a match query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOperator {
    Or,
    And,
}

/// Structured full-text query
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    Match {
        text: String,
        field: Option<String>,
        analyzer: Option<String>,
        fuzziness: Option<u32>,
        prefix_length: Option<u32>,
        operator: Option<MatchOperator>,
    },
    MatchPhrase {
        phrase: String,
        field: Option<String>,
        analyzer: Option<String>,
    },
    QueryString(String),
    Term {
        term: String,
        field: Option<String>,
        fuzziness: Option<u32>,
        prefix_length: Option<u32>,
    },
    Prefix {
        prefix: String,
        field: Option<String>,
    },
    Regexp {
        regexp: String,
        field: Option<String>,
    },
    Wildcard {
        wildcard: String,
        field: Option<String>,
    },
    NumericRange {
        min: Option<f64>,
        min_inclusive: Option<bool>,
        max: Option<f64>,
        max_inclusive: Option<bool>,
        field: Option<String>,
    },
    DocId(Vec<String>),
    Conjunction(Vec<SearchQuery>),
    Disjunction {
        queries: Vec<SearchQuery>,
        min: Option<u32>,
    },
    Boolean {
        must: Vec<SearchQuery>,
        should: Vec<SearchQuery>,
        should_min: Option<u32>,
        must_not: Vec<SearchQuery>,
    },
    MatchAll,
    MatchNone,
    /// Any query with a score multiplier
    Boosted {
        query: Box<SearchQuery>,
        boost: f64,
    },
}

impl SearchQuery {
    pub fn match_query(text: impl Into<String>) -> Self {
        Self::Match {
            text: text.into(),
            field: None,
            analyzer: None,
            fuzziness: None,
            prefix_length: None,
            operator: None,
        }
    }

    pub fn match_phrase(phrase: impl Into<String>) -> Self {
        Self::MatchPhrase {
            phrase: phrase.into(),
            field: None,
            analyzer: None,
        }
    }

    pub fn query_string(query: impl Into<String>) -> Self {
        Self::QueryString(query.into())
    }

    pub fn term(term: impl Into<String>) -> Self {
        Self::Term {
            term: term.into(),
            field: None,
            fuzziness: None,
            prefix_length: None,
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix {
            prefix: prefix.into(),
            field: None,
        }
    }

    pub fn regexp(regexp: impl Into<String>) -> Self {
        Self::Regexp {
            regexp: regexp.into(),
            field: None,
        }
    }

    pub fn wildcard(wildcard: impl Into<String>) -> Self {
        Self::Wildcard {
            wildcard: wildcard.into(),
            field: None,
        }
    }

    pub fn numeric_range(min: Option<f64>, max: Option<f64>) -> Self {
        Self::NumericRange {
            min,
            min_inclusive: None,
            max,
            max_inclusive: None,
            field: None,
        }
    }

    pub fn doc_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::DocId(ids.into_iter().map(Into::into).collect())
    }

    pub fn conjunction(queries: Vec<SearchQuery>) -> Self {
        Self::Conjunction(queries)
    }

    pub fn disjunction(queries: Vec<SearchQuery>) -> Self {
        Self::Disjunction { queries, min: None }
    }

    pub fn boolean() -> Self {
        Self::Boolean {
            must: Vec::new(),
            should: Vec::new(),
            should_min: None,
            must_not: Vec::new(),
        }
    }

    /// Restrict the query to one field. Ignored by variants without a field.
    pub fn with_field(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            Self::Match { field, .. }
            | Self::MatchPhrase { field, .. }
            | Self::Term { field, .. }
            | Self::Prefix { field, .. }
            | Self::Regexp { field, .. }
            | Self::Wildcard { field, .. }
            | Self::NumericRange { field, .. } => *field = Some(name.into()),
            Self::Boosted { query, .. } => {
                let inner = std::mem::replace(query.as_mut(), Self::MatchNone);
                **query = inner.with_field(name);
            }
            _ => {}
        }
        self
    }

    /// Multiply the score of matching documents.
    pub fn boost(self, boost: f64) -> Self {
        match self {
            Self::Boosted { query, .. } => Self::Boosted { query, boost },
            query => Self::Boosted {
                query: Box::new(query),
                boost,
            },
        }
    }

    /// Add a clause every hit must match. Ignored by non-boolean variants.
    pub fn must(mut self, query: SearchQuery) -> Self {
        if let Self::Boolean { must, .. } = &mut self {
            must.push(query);
        }
        self
    }

    /// Add a clause hits should match. Ignored by non-boolean variants.
    pub fn should(mut self, query: SearchQuery) -> Self {
        if let Self::Boolean { should, .. } = &mut self {
            should.push(query);
        }
        self
    }

    /// Add a clause no hit may match. Ignored by non-boolean variants.
    pub fn must_not(mut self, query: SearchQuery) -> Self {
        if let Self::Boolean { must_not, .. } = &mut self {
            must_not.push(query);
        }
        self
    }

    /// Render the query in the search service's JSON form.
    pub fn to_json(&self) -> DriverResult<Value> {
        let mut obj = Map::new();
        match self {
            Self::Match {
                text,
                field,
                analyzer,
                fuzziness,
                prefix_length,
                operator,
            } => {
                obj.insert("match".into(), json!(text));
                put(&mut obj, "field", field);
                put(&mut obj, "analyzer", analyzer);
                put(&mut obj, "fuzziness", fuzziness);
                put(&mut obj, "prefix_length", prefix_length);
                if let Some(op) = operator {
                    let op = match op {
                        MatchOperator::Or => "or",
                        MatchOperator::And => "and",
                    };
                    obj.insert("operator".into(), json!(op));
                }
            }
            Self::MatchPhrase {
                phrase,
                field,
                analyzer,
            } => {
                obj.insert("match_phrase".into(), json!(phrase));
                put(&mut obj, "field", field);
                put(&mut obj, "analyzer", analyzer);
            }
            Self::QueryString(query) => {
                obj.insert("query".into(), json!(query));
            }
            Self::Term {
                term,
                field,
                fuzziness,
                prefix_length,
            } => {
                obj.insert("term".into(), json!(term));
                put(&mut obj, "field", field);
                put(&mut obj, "fuzziness", fuzziness);
                put(&mut obj, "prefix_length", prefix_length);
            }
            Self::Prefix { prefix, field } => {
                obj.insert("prefix".into(), json!(prefix));
                put(&mut obj, "field", field);
            }
            Self::Regexp { regexp, field } => {
                obj.insert("regexp".into(), json!(regexp));
                put(&mut obj, "field", field);
            }
            Self::Wildcard { wildcard, field } => {
                obj.insert("wildcard".into(), json!(wildcard));
                put(&mut obj, "field", field);
            }
            Self::NumericRange {
                min,
                min_inclusive,
                max,
                max_inclusive,
                field,
            } => {
                if min.is_none() && max.is_none() {
                    return Err(DriverError::invalid_argument(
                        "numeric range query must specify min or max",
                    ));
                }
                put(&mut obj, "min", min);
                put(&mut obj, "inclusive_min", min_inclusive);
                put(&mut obj, "max", max);
                put(&mut obj, "inclusive_max", max_inclusive);
                put(&mut obj, "field", field);
            }
            Self::DocId(ids) => {
                obj.insert("ids".into(), json!(ids));
            }
            Self::Conjunction(queries) => {
                obj.insert("conjuncts".into(), render_all(queries)?);
            }
            Self::Disjunction { queries, min } => {
                obj.insert("disjuncts".into(), render_all(queries)?);
                put(&mut obj, "min", min);
            }
            Self::Boolean {
                must,
                should,
                should_min,
                must_not,
            } => {
                if must.is_empty() && should.is_empty() && must_not.is_empty() {
                    return Err(DriverError::invalid_argument(
                        "boolean query must have at least one of must, should or must_not",
                    ));
                }
                if !must.is_empty() {
                    obj.insert("must".into(), json!({ "conjuncts": render_all(must)? }));
                }
                if !should.is_empty() {
                    let mut s = Map::new();
                    s.insert("disjuncts".into(), render_all(should)?);
                    put(&mut s, "min", should_min);
                    obj.insert("should".into(), Value::Object(s));
                }
                if !must_not.is_empty() {
                    obj.insert("must_not".into(), json!({ "disjuncts": render_all(must_not)? }));
                }
            }
            Self::MatchAll => {
                obj.insert("match_all".into(), json!({}));
            }
            Self::MatchNone => {
                obj.insert("match_none".into(), json!({}));
            }
            Self::Boosted { query, boost } => {
                let mut inner = query.to_json()?;
                if let Value::Object(map) = &mut inner {
                    map.insert("boost".into(), json!(boost));
                }
                return Ok(inner);
            }
        }
        Ok(Value::Object(obj))
    }
}

fn put<T: serde::Serialize>(obj: &mut Map<String, Value>, key: &str, value: &Option<T>) {
    if let Some(v) = value {
        obj.insert(key.to_string(), json!(v));
    }
}

fn render_all(queries: &[SearchQuery]) -> DriverResult<Value> {
    queries
        .iter()
        .map(SearchQuery::to_json)
        .collect::<DriverResult<Vec<_>>>()
        .map(Value::Array)
}

// ============================================================================
// Vector search
// ============================================================================

/// How multiple vector queries combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorQueryCombination {
    And,
    Or,
}

/// One nearest-neighbour query against a vector field
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub field: String,
    pub vector: Vec<f32>,
    pub base64_vector: Option<String>,
    pub num_candidates: u32,
    pub boost: Option<f64>,
    pub prefilter: Option<SearchQuery>,
}

impl VectorQuery {
    pub fn new(field: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            field: field.into(),
            vector,
            base64_vector: None,
            num_candidates: 3,
            boost: None,
            prefilter: None,
        }
    }

    pub fn from_base64(field: impl Into<String>, vector: impl Into<String>) -> Self {
        Self {
            base64_vector: Some(vector.into()),
            ..Self::new(field, Vec::new())
        }
    }

    pub fn with_num_candidates(mut self, n: u32) -> Self {
        self.num_candidates = n;
        self
    }

    pub fn with_boost(mut self, boost: f64) -> Self {
        self.boost = Some(boost);
        self
    }

    pub fn with_prefilter(mut self, filter: SearchQuery) -> Self {
        self.prefilter = Some(filter);
        self
    }

    pub fn to_json(&self) -> DriverResult<Value> {
        if self.num_candidates < 1 {
            return Err(DriverError::invalid_argument("num candidates must be at least 1"));
        }
        let mut obj = Map::new();
        obj.insert("field".into(), json!(self.field));
        obj.insert("k".into(), json!(self.num_candidates));
        match (&self.base64_vector, self.vector.is_empty()) {
            (Some(_), false) => {
                return Err(DriverError::invalid_argument(
                    "vector and base64 vector must be used exclusively",
                ))
            }
            (Some(encoded), true) => {
                obj.insert("vector_base64".into(), json!(encoded));
            }
            (None, false) => {
                obj.insert("vector".into(), json!(self.vector));
            }
            (None, true) => {
                return Err(DriverError::invalid_argument("vector query requires a vector"))
            }
        }
        put(&mut obj, "boost", &self.boost);
        if let Some(filter) = &self.prefilter {
            obj.insert("filter".into(), filter.to_json()?);
        }
        Ok(Value::Object(obj))
    }
}

/// A set of vector queries
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearch {
    pub queries: Vec<VectorQuery>,
    pub combination: Option<VectorQueryCombination>,
}

impl VectorSearch {
    pub fn new(queries: Vec<VectorQuery>) -> Self {
        Self {
            queries,
            combination: None,
        }
    }

    pub fn with_combination(mut self, combination: VectorQueryCombination) -> Self {
        self.combination = Some(combination);
        self
    }

    /// Fields merged into the request body: `knn` and `knn_operator`.
    pub fn to_fields(&self) -> DriverResult<Map<String, Value>> {
        if self.queries.is_empty() {
            return Err(DriverError::invalid_argument("vector search requires at least one query"));
        }
        let knn = self
            .queries
            .iter()
            .map(VectorQuery::to_json)
            .collect::<DriverResult<Vec<_>>>()?;
        let mut fields = Map::new();
        fields.insert("knn".into(), Value::Array(knn));
        if let Some(combination) = self.combination {
            let op = match combination {
                VectorQueryCombination::And => "and",
                VectorQueryCombination::Or => "or",
            };
            fields.insert("knn_operator".into(), json!(op));
        }
        Ok(fields)
    }
}

// ============================================================================
// SearchRequest
// ============================================================================

/// Structured query, vector search, or both
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub search_query: Option<SearchQuery>,
    pub vector_search: Option<VectorSearch>,
}

impl SearchRequest {
    pub fn with_search_query(query: SearchQuery) -> Self {
        Self {
            search_query: Some(query),
            vector_search: None,
        }
    }

    pub fn with_vector_search(search: VectorSearch) -> Self {
        Self {
            search_query: None,
            vector_search: Some(search),
        }
    }

    pub fn and_vector_search(mut self, search: VectorSearch) -> Self {
        self.vector_search = Some(search);
        self
    }

    pub fn and_search_query(mut self, query: SearchQuery) -> Self {
        self.search_query = Some(query);
        self
    }

    /// Fail unless at least one of the two parts is present.
    pub fn validate(&self) -> DriverResult<()> {
        if self.search_query.is_none() && self.vector_search.is_none() {
            return Err(DriverError::invalid_argument(
                "search request must have one of search query or vector search",
            ));
        }
        Ok(())
    }

    /// Structured query JSON. Vector-only requests match nothing structurally.
    pub fn query_json(&self) -> DriverResult<Value> {
        self.search_query
            .as_ref()
            .unwrap_or(&SearchQuery::MatchNone)
            .to_json()
    }
}

// ============================================================================
// Sort / facets / highlight
// ============================================================================

/// Highlight markup style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighlightStyle {
    Html,
    Ansi,
}

impl HighlightStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Ansi => "ansi",
        }
    }
}

/// Sort order for search hits
#[derive(Debug, Clone, PartialEq)]
pub enum SearchSort {
    Score {
        descending: bool,
    },
    Id {
        descending: bool,
    },
    Field {
        field: String,
        kind: Option<String>,
        mode: Option<String>,
        missing: Option<String>,
        descending: bool,
    },
    GeoDistance {
        field: String,
        lon: f64,
        lat: f64,
        unit: Option<String>,
        descending: bool,
    },
}

impl SearchSort {
    pub fn field(field: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            kind: None,
            mode: None,
            missing: None,
            descending: false,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        match self {
            Self::Score { descending } => {
                obj.insert("by".into(), json!("score"));
                obj.insert("desc".into(), json!(descending));
            }
            Self::Id { descending } => {
                obj.insert("by".into(), json!("id"));
                obj.insert("desc".into(), json!(descending));
            }
            Self::Field {
                field,
                kind,
                mode,
                missing,
                descending,
            } => {
                obj.insert("by".into(), json!("field"));
                obj.insert("field".into(), json!(field));
                put(&mut obj, "type", kind);
                put(&mut obj, "mode", mode);
                put(&mut obj, "missing", missing);
                obj.insert("desc".into(), json!(descending));
            }
            Self::GeoDistance {
                field,
                lon,
                lat,
                unit,
                descending,
            } => {
                obj.insert("by".into(), json!("geo_distance"));
                obj.insert("field".into(), json!(field));
                obj.insert("location".into(), json!([lon, lat]));
                put(&mut obj, "unit", unit);
                obj.insert("desc".into(), json!(descending));
            }
        }
        Value::Object(obj)
    }
}

/// Named numeric bucket of a facet
#[derive(Debug, Clone, PartialEq)]
pub struct NumericRange {
    pub name: String,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

/// Named date bucket of a facet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub name: String,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Aggregation computed alongside the hits
#[derive(Debug, Clone, PartialEq)]
pub enum SearchFacet {
    Term {
        field: String,
        size: u32,
    },
    NumericRange {
        field: String,
        size: u32,
        ranges: Vec<NumericRange>,
    },
    DateRange {
        field: String,
        size: u32,
        ranges: Vec<DateRange>,
    },
}

impl SearchFacet {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Term { field, size } => json!({ "field": field, "size": size }),
            Self::NumericRange { field, size, ranges } => {
                let ranges: Vec<Value> = ranges
                    .iter()
                    .map(|r| {
                        let mut obj = Map::new();
                        obj.insert("name".into(), json!(r.name));
                        put(&mut obj, "min", &r.start);
                        put(&mut obj, "max", &r.end);
                        Value::Object(obj)
                    })
                    .collect();
                json!({ "field": field, "size": size, "numeric_ranges": ranges })
            }
            Self::DateRange { field, size, ranges } => {
                let ranges: Vec<Value> = ranges
                    .iter()
                    .map(|r| {
                        let mut obj = Map::new();
                        obj.insert("name".into(), json!(r.name));
                        put(&mut obj, "start", &r.start);
                        put(&mut obj, "end", &r.end);
                        Value::Object(obj)
                    })
                    .collect();
                json!({ "field": field, "size": size, "date_ranges": ranges })
            }
        }
    }
}
