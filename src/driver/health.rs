//! Diagnostics, ping and wait-until-ready.
//!
//! Diagnostics is a local snapshot of the connection pool. Ping probes every
//! requested service concurrently, each with its own deadline, and joins all
//! probes; one failing service never fails the others. Wait-until-ready polls
//! diagnostics until the desired state is reached, backing off through the
//! retry strategy with the `NotReady` reason.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use super::config::ClusterConfig;
use super::error::{DriverError, DriverResult, ErrorContext};
use super::normalize::normalize;
use super::retry::{RetryAction, RetryContext, RetryReason, RetryRequest, RetryStrategy};
use crate::transport::{
    ConnectionMonitor, CoreEndpointState, CoreServiceType, DiagnosticsSnapshot, EndpointProbe,
    ProbeOutcome,
};

/// Report schema version.
pub const REPORT_VERSION: u32 = 2;

// ============================================================================
// Types
// ============================================================================

/// Cluster sub-service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ServiceType {
    #[serde(rename = "kv")]
    KeyValue,
    #[serde(rename = "views")]
    Views,
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "analytics")]
    Analytics,
    #[serde(rename = "mgmt")]
    Management,
}

impl ServiceType {
    /// Every service, in report order.
    pub const ALL: [ServiceType; 6] = [
        ServiceType::KeyValue,
        ServiceType::Views,
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
        ServiceType::Management,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyValue => "kv",
            Self::Views => "views",
            Self::Query => "query",
            Self::Search => "search",
            Self::Analytics => "analytics",
            Self::Management => "mgmt",
        }
    }

    fn to_core(self) -> CoreServiceType {
        match self {
            Self::KeyValue => CoreServiceType::KeyValue,
            Self::Views => CoreServiceType::Views,
            Self::Query => CoreServiceType::Query,
            Self::Search => CoreServiceType::Search,
            Self::Analytics => CoreServiceType::Analytics,
            Self::Management => CoreServiceType::Management,
        }
    }

    fn from_core(service: CoreServiceType) -> Self {
        match service {
            CoreServiceType::KeyValue => Self::KeyValue,
            CoreServiceType::Views => Self::Views,
            CoreServiceType::Query => Self::Query,
            CoreServiceType::Search => Self::Search,
            CoreServiceType::Analytics => Self::Analytics,
            CoreServiceType::Management => Self::Management,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl From<CoreEndpointState> for EndpointState {
    fn from(state: CoreEndpointState) -> Self {
        match state {
            CoreEndpointState::Disconnected => Self::Disconnected,
            CoreEndpointState::Connecting => Self::Connecting,
            CoreEndpointState::Connected => Self::Connected,
            CoreEndpointState::Disconnecting => Self::Disconnecting,
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PingState {
    Ok,
    Timeout,
    Error,
}

/// Overall connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    #[default]
    Online,
    Degraded,
    Offline,
}

fn as_micros<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

fn to_json<T: Serialize>(value: &T) -> DriverResult<String> {
    serde_json::to_string(value)
        .map_err(|e| DriverError::decoding(format!("failed to encode report: {}", e)))
}

// ============================================================================
// Diagnostics report
// ============================================================================

/// One endpoint in a diagnostics report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointDiagnostics {
    pub id: String,
    #[serde(rename = "local")]
    pub local_address: String,
    #[serde(rename = "remote")]
    pub remote_address: String,
    pub state: EndpointState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Local connection snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub version: u32,
    pub id: String,
    pub sdk: String,
    pub config_rev: i64,
    pub state: ClusterState,
    pub services: BTreeMap<ServiceType, Vec<EndpointDiagnostics>>,
}

impl DiagnosticsReport {
    pub fn to_json(&self) -> DriverResult<String> {
        to_json(self)
    }
}

/// Diagnostics options
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsOptions {
    /// Report id; generated when absent
    pub report_id: Option<String>,
}

impl DiagnosticsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report_id(mut self, id: impl Into<String>) -> Self {
        self.report_id = Some(id.into());
        self
    }
}

// ============================================================================
// Ping report
// ============================================================================

/// One probed endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointPingReport {
    pub id: String,
    #[serde(rename = "local")]
    pub local_address: String,
    #[serde(rename = "remote")]
    pub remote_address: String,
    pub state: PingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "latency_us", serialize_with = "as_micros")]
    pub latency: Duration,
}

impl From<EndpointProbe> for EndpointPingReport {
    fn from(probe: EndpointProbe) -> Self {
        let (state, error) = match probe.outcome {
            ProbeOutcome::Ok => (PingState::Ok, None),
            ProbeOutcome::Timeout => (PingState::Timeout, None),
            ProbeOutcome::Error(msg) => (PingState::Error, Some(msg)),
        };
        Self {
            id: probe.id,
            local_address: probe.local_address,
            remote_address: probe.remote_address,
            state,
            error,
            namespace: probe.namespace,
            latency: probe.latency,
        }
    }
}

/// Active probe results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingReport {
    pub version: u32,
    pub id: String,
    pub sdk: String,
    pub services: BTreeMap<ServiceType, Vec<EndpointPingReport>>,
}

impl PingReport {
    pub fn to_json(&self) -> DriverResult<String> {
        to_json(self)
    }
}

/// Ping options
#[derive(Debug, Clone, Default)]
pub struct PingOptions {
    /// Services to probe; empty probes the scope's defaults
    pub service_types: Vec<ServiceType>,
    /// Report id; generated when absent
    pub report_id: Option<String>,
    /// Per-service deadline override
    pub timeout: Option<Duration>,
}

impl PingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_types(mut self, services: Vec<ServiceType>) -> Self {
        self.service_types = services;
        self
    }

    pub fn with_report_id(mut self, id: impl Into<String>) -> Self {
        self.report_id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// WaitUntilReady options
// ============================================================================

/// Wait-until-ready options
#[derive(Clone, Default)]
pub struct WaitUntilReadyOptions {
    /// State to wait for
    pub desired_state: ClusterState,
    /// Services considered; empty considers every endpoint
    pub service_types: Vec<ServiceType>,
    /// Backoff policy; the cluster default when absent
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    /// Caller cancellation
    pub cancellation: Option<CancellationToken>,
}

impl std::fmt::Debug for WaitUntilReadyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitUntilReadyOptions")
            .field("desired_state", &self.desired_state)
            .field("service_types", &self.service_types)
            .finish_non_exhaustive()
    }
}

impl WaitUntilReadyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_desired_state(mut self, state: ClusterState) -> Self {
        self.desired_state = state;
        self
    }

    pub fn with_service_types(mut self, services: Vec<ServiceType>) -> Self {
        self.service_types = services;
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
}

// ============================================================================
// HealthChecker
// ============================================================================

/// Health operations over one connection monitor.
#[derive(Clone)]
pub(crate) struct HealthChecker {
    monitor: Arc<dyn ConnectionMonitor>,
    config: Arc<ClusterConfig>,
}

fn report_id(id: &Option<String>) -> String {
    id.clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Connected endpoints against all endpoints of the selected services.
fn cluster_state(snapshot: &DiagnosticsSnapshot, services: &[ServiceType]) -> ClusterState {
    let selected = snapshot
        .endpoints
        .iter()
        .filter(|e| services.is_empty() || services.contains(&ServiceType::from_core(e.service)));
    let (mut total, mut connected) = (0usize, 0usize);
    for endpoint in selected {
        total += 1;
        if endpoint.state == CoreEndpointState::Connected {
            connected += 1;
        }
    }
    match connected {
        0 => ClusterState::Offline,
        n if n == total => ClusterState::Online,
        _ => ClusterState::Degraded,
    }
}

impl HealthChecker {
    pub(crate) fn new(monitor: Arc<dyn ConnectionMonitor>, config: Arc<ClusterConfig>) -> Self {
        Self { monitor, config }
    }

    /// Local connection snapshot.
    pub(crate) fn diagnostics(
        &self,
        bucket: Option<&str>,
        options: &DiagnosticsOptions,
    ) -> DriverResult<DiagnosticsReport> {
        let snapshot = self.monitor.diagnostics(bucket).map_err(normalize)?;
        let now = Utc::now();

        let mut services: BTreeMap<ServiceType, Vec<EndpointDiagnostics>> = BTreeMap::new();
        for endpoint in &snapshot.endpoints {
            let last_activity_us = endpoint.last_activity.map(|at| {
                (now - at).num_microseconds().unwrap_or(i64::MAX).max(0) as u64
            });
            services
                .entry(ServiceType::from_core(endpoint.service))
                .or_default()
                .push(EndpointDiagnostics {
                    id: endpoint.id.clone(),
                    local_address: endpoint.local_address.clone(),
                    remote_address: endpoint.remote_address.clone(),
                    state: endpoint.state.into(),
                    last_activity_us,
                    namespace: endpoint.namespace.clone(),
                });
        }

        Ok(DiagnosticsReport {
            version: REPORT_VERSION,
            id: report_id(&options.report_id),
            sdk: self.config.sdk.clone(),
            config_rev: snapshot.config_rev,
            state: cluster_state(&snapshot, &[]),
            services,
        })
    }

    /// Probe `options.service_types`, or `defaults` when none are given.
    pub(crate) async fn ping(
        &self,
        bucket: Option<&str>,
        options: &PingOptions,
        defaults: &[ServiceType],
    ) -> DriverResult<PingReport> {
        let services = if options.service_types.is_empty() {
            defaults.to_vec()
        } else {
            options.service_types.clone()
        };

        let probes = services.iter().map(|&service| {
            let timeout = options
                .timeout
                .unwrap_or_else(|| self.config.timeouts.for_service(service));
            let deadline = Instant::now() + timeout;
            async move {
                let probed = tokio::time::timeout_at(
                    tokio::time::Instant::from_std(deadline),
                    self.monitor.ping(service.to_core(), bucket, deadline),
                )
                .await;
                (service, timeout, probed)
            }
        });

        let mut report = BTreeMap::new();
        for (service, timeout, probed) in join_all(probes).await {
            let entries = match probed {
                Ok(Ok(probes)) => probes.into_iter().map(EndpointPingReport::from).collect(),
                Ok(Err(err)) => {
                    tracing::warn!(service = %service, error = %err, "ping failed");
                    vec![EndpointPingReport {
                        id: String::new(),
                        local_address: String::new(),
                        remote_address: String::new(),
                        state: PingState::Error,
                        error: Some(err.to_string()),
                        namespace: bucket.map(str::to_string),
                        latency: Duration::ZERO,
                    }]
                }
                Err(_) => {
                    tracing::warn!(service = %service, "ping timed out");
                    vec![EndpointPingReport {
                        id: String::new(),
                        local_address: String::new(),
                        remote_address: String::new(),
                        state: PingState::Timeout,
                        error: None,
                        namespace: bucket.map(str::to_string),
                        latency: timeout,
                    }]
                }
            };
            report.insert(service, entries);
        }

        Ok(PingReport {
            version: REPORT_VERSION,
            id: report_id(&options.report_id),
            sdk: self.config.sdk.clone(),
            services: report,
        })
    }

    /// Poll until the desired state is reached, the timeout expires or the
    /// caller cancels.
    pub(crate) async fn wait_until_ready(
        &self,
        bucket: Option<&str>,
        timeout: Duration,
        options: &WaitUntilReadyOptions,
    ) -> DriverResult<()> {
        let deadline = Instant::now() + timeout;
        let strategy = options
            .retry_strategy
            .clone()
            .unwrap_or_else(|| self.config.retry_strategy.clone());
        let caller = options.cancellation.clone().unwrap_or_default();
        let mut retry = RetryContext::new("wait_until_ready", true);

        loop {
            let snapshot = self.monitor.diagnostics(bucket).map_err(normalize)?;
            let state = cluster_state(&snapshot, &options.service_types);
            if state == options.desired_state {
                return Ok(());
            }

            let action = strategy.retry_after(&retry, RetryReason::NotReady);
            retry.record(RetryReason::NotReady);
            let delay = match action {
                RetryAction::RetryAfter(delay) => delay,
                RetryAction::Stop => {
                    return Err(DriverError::cancelled(
                        "retry strategy stopped waiting for the cluster",
                    ))
                }
            };
            tracing::debug!(
                attempt = retry.retry_attempts(),
                state = ?state,
                delay_ms = delay.as_millis() as u64,
                "cluster not ready"
            );

            let wake = (Instant::now() + delay).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
                _ = caller.cancelled() => {
                    return Err(DriverError::cancelled("wait until ready canceled by caller"));
                }
            }

            if Instant::now() >= deadline {
                let context = ErrorContext {
                    operation: Some("wait_until_ready".to_string()),
                    retry_reasons: retry.retry_reasons(),
                    retry_attempts: retry.retry_attempts(),
                    ..Default::default()
                };
                return Err(DriverError::timeout(
                    false,
                    format!("cluster did not reach state {:?} in time", options.desired_state),
                    context,
                ));
            }
        }
    }
}
