//! Result Metadata
//!
//! Typed views over the trailing metadata envelope of each service, and the
//! search hit shape. Both transports produce the same envelope JSON, so the
//! parsing here is transport independent.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::error::{DriverError, DriverResult};

/// Parse the duration strings the query services emit, e.g. `"1m2.5s"`.
pub fn parse_duration(input: &str) -> DriverResult<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() || s.starts_with('-') {
        return Err(DriverError::decoding(format!("invalid duration '{}'", input)));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(DriverError::decoding(format!("invalid duration '{}'", input)));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| DriverError::decoding(format!("invalid duration '{}'", input)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => {
                return Err(DriverError::decoding(format!(
                    "unknown unit '{}' in duration '{}'",
                    unit, input
                )))
            }
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Render a duration in the form [`parse_duration`] reads.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        "0s".to_string()
    } else if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{}µs", nanos as f64 / 1e3)
    } else if nanos < 1_000_000_000 {
        format!("{}ms", nanos as f64 / 1e6)
    } else {
        format!("{}s", nanos as f64 / 1e9)
    }
}

fn opt_duration(raw: Option<String>) -> DriverResult<Duration> {
    raw.as_deref().map(parse_duration).transpose().map(Option::unwrap_or_default)
}

fn decode_envelope<'a, T: Deserialize<'a>>(bytes: &'a [u8], what: &str) -> DriverResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| DriverError::decoding(format!("failed to decode {} metadata: {}", what, e)))
}

/// Service warning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceWarning {
    pub code: u32,
    #[serde(alias = "msg")]
    pub message: String,
}

// ============================================================================
// Query
// ============================================================================

/// Query execution metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetrics {
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub mutation_count: u64,
    pub sort_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
}

/// Query metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMetaData {
    pub request_id: String,
    pub client_context_id: String,
    pub status: String,
    pub metrics: Option<QueryMetrics>,
    pub signature: Option<Value>,
    pub warnings: Vec<ServiceWarning>,
    pub profile: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQueryMetrics {
    elapsed_time: Option<String>,
    execution_time: Option<String>,
    #[serde(default)]
    result_count: u64,
    #[serde(default)]
    result_size: u64,
    #[serde(default)]
    mutation_count: u64,
    #[serde(default)]
    sort_count: u64,
    #[serde(default)]
    error_count: u64,
    #[serde(default)]
    warning_count: u64,
}

#[derive(Deserialize)]
struct RawQueryMetaData {
    #[serde(rename = "requestID", default)]
    request_id: String,
    #[serde(rename = "clientContextID", default)]
    client_context_id: String,
    #[serde(default)]
    status: String,
    metrics: Option<RawQueryMetrics>,
    signature: Option<Value>,
    #[serde(default)]
    warnings: Vec<ServiceWarning>,
    profile: Option<Value>,
}

impl QueryMetaData {
    pub fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        let raw: RawQueryMetaData = decode_envelope(bytes, "query")?;
        let metrics = match raw.metrics {
            Some(m) => Some(QueryMetrics {
                elapsed_time: opt_duration(m.elapsed_time)?,
                execution_time: opt_duration(m.execution_time)?,
                result_count: m.result_count,
                result_size: m.result_size,
                mutation_count: m.mutation_count,
                sort_count: m.sort_count,
                error_count: m.error_count,
                warning_count: m.warning_count,
            }),
            None => None,
        };
        Ok(Self {
            request_id: raw.request_id,
            client_context_id: raw.client_context_id,
            status: raw.status,
            metrics,
            signature: raw.signature,
            warnings: raw.warnings,
            profile: raw.profile,
        })
    }
}

// ============================================================================
// Analytics
// ============================================================================

/// Analytics execution metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyticsMetrics {
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub processed_objects: u64,
}

/// Analytics metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsMetaData {
    pub request_id: String,
    pub client_context_id: String,
    pub status: String,
    pub metrics: Option<AnalyticsMetrics>,
    pub signature: Option<Value>,
    pub warnings: Vec<ServiceWarning>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalyticsMetrics {
    elapsed_time: Option<String>,
    execution_time: Option<String>,
    #[serde(default)]
    result_count: u64,
    #[serde(default)]
    result_size: u64,
    #[serde(default)]
    error_count: u64,
    #[serde(default)]
    warning_count: u64,
    #[serde(default)]
    processed_objects: u64,
}

#[derive(Deserialize)]
struct RawAnalyticsMetaData {
    #[serde(rename = "requestID", default)]
    request_id: String,
    #[serde(rename = "clientContextID", default)]
    client_context_id: String,
    #[serde(default)]
    status: String,
    metrics: Option<RawAnalyticsMetrics>,
    signature: Option<Value>,
    #[serde(default)]
    warnings: Vec<ServiceWarning>,
}

impl AnalyticsMetaData {
    pub fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        let raw: RawAnalyticsMetaData = decode_envelope(bytes, "analytics")?;
        let metrics = match raw.metrics {
            Some(m) => Some(AnalyticsMetrics {
                elapsed_time: opt_duration(m.elapsed_time)?,
                execution_time: opt_duration(m.execution_time)?,
                result_count: m.result_count,
                result_size: m.result_size,
                error_count: m.error_count,
                warning_count: m.warning_count,
                processed_objects: m.processed_objects,
            }),
            None => None,
        };
        Ok(Self {
            request_id: raw.request_id,
            client_context_id: raw.client_context_id,
            status: raw.status,
            metrics,
            signature: raw.signature,
            warnings: raw.warnings,
        })
    }
}

// ============================================================================
// Search
// ============================================================================

/// Search execution metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchMetrics {
    pub took: Duration,
    pub total_rows: u64,
    pub max_score: f64,
    pub total_partition_count: u64,
    pub success_partition_count: u64,
    pub error_partition_count: u64,
}

/// One term bucket of a facet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TermFacetResult {
    pub term: String,
    pub count: u64,
}

/// One numeric bucket of a facet
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NumericRangeFacetResult {
    pub name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: u64,
}

/// One date bucket of a facet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DateRangeFacetResult {
    pub name: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub count: u64,
}

/// Facet aggregation result
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchFacetResult {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub missing: u64,
    #[serde(default)]
    pub other: u64,
    #[serde(default)]
    pub terms: Vec<TermFacetResult>,
    #[serde(default)]
    pub numeric_ranges: Vec<NumericRangeFacetResult>,
    #[serde(default)]
    pub date_ranges: Vec<DateRangeFacetResult>,
}

/// Search metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchMetaData {
    pub metrics: SearchMetrics,
    pub errors: HashMap<String, String>,
    pub facets: HashMap<String, SearchFacetResult>,
}

#[derive(Deserialize, Default)]
struct RawSearchStatus {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    failed: u64,
    #[serde(default)]
    successful: u64,
    #[serde(default)]
    errors: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawSearchMetaData {
    #[serde(default)]
    status: RawSearchStatus,
    #[serde(default)]
    total_hits: u64,
    #[serde(default)]
    max_score: f64,
    /// Nanoseconds
    #[serde(default)]
    took: u64,
    #[serde(default)]
    facets: HashMap<String, SearchFacetResult>,
}

impl SearchMetaData {
    pub fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        let raw: RawSearchMetaData = decode_envelope(bytes, "search")?;
        let facets = raw
            .facets
            .into_iter()
            .map(|(name, mut facet)| {
                facet.name = name.clone();
                (name, facet)
            })
            .collect();
        Ok(Self {
            metrics: SearchMetrics {
                took: Duration::from_nanos(raw.took),
                total_rows: raw.total_hits,
                max_score: raw.max_score,
                total_partition_count: raw.status.total,
                success_partition_count: raw.status.successful,
                error_partition_count: raw.status.failed,
            },
            errors: raw.status.errors,
            facets,
        })
    }
}

/// Position of a matched term inside a hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRowLocation {
    pub field: String,
    pub term: String,
    pub position: u32,
    pub start: u32,
    pub end: u32,
    pub array_positions: Vec<u32>,
}

#[derive(Deserialize)]
struct RawLocation {
    #[serde(default)]
    pos: u32,
    #[serde(default)]
    start: u32,
    #[serde(default)]
    end: u32,
    #[serde(default)]
    array_positions: Option<Vec<u32>>,
}

#[derive(Deserialize)]
struct RawSearchRow {
    #[serde(default)]
    index: String,
    id: String,
    #[serde(default)]
    score: f64,
    explanation: Option<Value>,
    #[serde(default)]
    locations: HashMap<String, HashMap<String, Vec<RawLocation>>>,
    #[serde(default)]
    fragments: HashMap<String, Vec<String>>,
    fields: Option<Value>,
}

/// One search hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub index: String,
    pub id: String,
    pub score: f64,
    pub explanation: Option<Value>,
    pub locations: Vec<SearchRowLocation>,
    pub fragments: HashMap<String, Vec<String>>,
    fields: Option<Value>,
}

impl SearchRow {
    pub fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        let raw: RawSearchRow = serde_json::from_slice(bytes)
            .map_err(|e| DriverError::decoding(format!("failed to decode search row: {}", e)))?;

        let mut locations: Vec<SearchRowLocation> = raw
            .locations
            .into_iter()
            .flat_map(|(field, terms)| {
                terms.into_iter().flat_map(move |(term, locs)| {
                    let field = field.clone();
                    locs.into_iter().map(move |l| SearchRowLocation {
                        field: field.clone(),
                        term: term.clone(),
                        position: l.pos,
                        start: l.start,
                        end: l.end,
                        array_positions: l.array_positions.unwrap_or_default(),
                    })
                })
            })
            .collect();
        locations.sort_by(|a, b| {
            (a.field.as_str(), a.term.as_str(), a.position)
                .cmp(&(b.field.as_str(), b.term.as_str(), b.position))
        });

        Ok(Self {
            index: raw.index,
            id: raw.id,
            score: raw.score,
            explanation: raw.explanation,
            locations,
            fragments: raw.fragments,
            fields: raw.fields,
        })
    }

    /// Decode the stored fields of the hit.
    pub fn fields<T: serde::de::DeserializeOwned>(&self) -> DriverResult<T> {
        let fields = self.fields.clone().ok_or(DriverError::NoResult)?;
        serde_json::from_value(fields)
            .map_err(|e| DriverError::decoding(format!("failed to decode search fields: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.5ms").unwrap(), Duration::from_micros(12_500));
        assert_eq!(parse_duration("1m2.5s").unwrap(), Duration::from_millis(62_500));
        assert_eq!(parse_duration("350µs").unwrap(), Duration::from_micros(350));
        assert_eq!(parse_duration("350us").unwrap(), Duration::from_micros(350));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("3days").is_err());
    }

    #[test]
    fn test_format_duration_parses_back() {
        for d in [
            Duration::from_millis(12),
            Duration::from_micros(250),
            Duration::from_secs(3),
            Duration::from_nanos(500),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_query_metadata() {
        let raw = br#"{
            "requestID": "r-1",
            "clientContextID": "c-1",
            "status": "success",
            "metrics": {"elapsedTime": "15.2ms", "executionTime": "14ms", "resultCount": 3, "resultSize": 90},
            "warnings": [{"code": 1, "msg": "careful"}]
        }"#;
        let meta = QueryMetaData::from_json(raw).unwrap();
        assert_eq!(meta.request_id, "r-1");
        assert_eq!(meta.client_context_id, "c-1");
        let metrics = meta.metrics.unwrap();
        assert_eq!(metrics.elapsed_time, Duration::from_micros(15_200));
        assert_eq!(metrics.result_count, 3);
        assert_eq!(meta.warnings[0].message, "careful");
    }

    #[test]
    fn test_analytics_metadata_bad_duration() {
        let raw = br#"{"requestID": "r", "metrics": {"elapsedTime": "soon"}}"#;
        assert!(matches!(
            AnalyticsMetaData::from_json(raw),
            Err(DriverError::Decoding(_))
        ));
    }

    #[test]
    fn test_search_metadata_and_row() {
        let raw = br#"{
            "status": {"total": 6, "failed": 1, "successful": 5, "errors": {"pindex_1": "timeout"}},
            "total_hits": 42, "max_score": 2.5, "took": 1500000,
            "facets": {"types": {"field": "type", "total": 4, "terms": [{"term": "hotel", "count": 4}]}}
        }"#;
        let meta = SearchMetaData::from_json(raw).unwrap();
        assert_eq!(meta.metrics.total_rows, 42);
        assert_eq!(meta.metrics.took, Duration::from_micros(1500));
        assert_eq!(meta.metrics.error_partition_count, 1);
        assert_eq!(meta.errors["pindex_1"], "timeout");
        assert_eq!(meta.facets["types"].name, "types");
        assert_eq!(meta.facets["types"].terms[0].count, 4);

        let row = br#"{
            "index": "idx", "id": "hotel_1", "score": 1.2,
            "locations": {"name": {"inn": [{"pos": 2, "start": 5, "end": 8}]}},
            "fields": {"name": "Some Inn"}
        }"#;
        let row = SearchRow::from_json(row).unwrap();
        assert_eq!(row.id, "hotel_1");
        assert_eq!(row.locations[0].term, "inn");
        assert_eq!(row.locations[0].position, 2);
        let fields: HashMap<String, String> = row.fields().unwrap();
        assert_eq!(fields["name"], "Some Inn");
    }
}
