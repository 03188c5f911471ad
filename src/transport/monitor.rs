//! Connection-pool collaborator used for health checks.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::TransportResult;

/// Sub-service an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreServiceType {
    KeyValue,
    Views,
    Query,
    Search,
    Analytics,
    Management,
}

/// Connection state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEndpointState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Local view of one open or pending connection.
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub service: CoreServiceType,
    pub id: String,
    pub local_address: String,
    pub remote_address: String,
    pub state: CoreEndpointState,
    pub last_activity: Option<DateTime<Utc>>,
    pub namespace: Option<String>,
}

/// Local view of every connection the pool holds.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    pub config_rev: i64,
    pub endpoints: Vec<EndpointSnapshot>,
}

/// Result of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Timeout,
    Error(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Timeout => f.write_str("timeout"),
            Self::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// One probe result.
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    pub id: String,
    pub local_address: String,
    pub remote_address: String,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
    pub namespace: Option<String>,
}

/// Connection-pool introspection and probing.
#[async_trait]
pub trait ConnectionMonitor: Send + Sync {
    /// Snapshot of current connections. No network round-trip.
    fn diagnostics(&self, bucket: Option<&str>) -> TransportResult<DiagnosticsSnapshot>;

    /// Probe every endpoint of `service`, giving up at `deadline`.
    async fn ping(
        &self,
        service: CoreServiceType,
        bucket: Option<&str>,
        deadline: Instant,
    ) -> TransportResult<Vec<EndpointProbe>>;
}
