//! # Nimbus Driver
//!
//! Query, analytics, search and diagnostics layer of the Nimbus database
//! driver. One uniform API sits on either of two wire transports: a
//! binary-protocol agent with callback dispatch, or streaming RPC clients.
//!
//! ## Features
//!
//! - **Dual transport** - the same [`Cluster`] API over memd or gRPC
//! - **Streaming rows** - pull-based iteration with metadata after the last row
//! - **Error normalization** - one [`DriverError`] taxonomy with timeout disambiguation
//! - **Retry** - pluggable [`RetryStrategy`] bridged into the transport
//! - **Health** - ping, diagnostics and wait-until-ready reports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nimbus_driver::{Cluster, ClusterConfig, QueryOptions, Transport, WaitUntilReadyOptions};
//! # use nimbus_driver::transport::{ConnectionMonitor, MemdAgent};
//!
//! # async fn example(
//! #     agent: Arc<dyn MemdAgent>,
//! #     monitor: Arc<dyn ConnectionMonitor>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Cluster::connect(ClusterConfig::default(), Transport::Memd { agent, monitor })?;
//! cluster
//!     .wait_until_ready(Duration::from_secs(10), WaitUntilReadyOptions::default())
//!     .await?;
//!
//! let mut result = cluster
//!     .query("SELECT 1 AS n", QueryOptions::default().with_readonly(true))
//!     .await?;
//! let row: serde_json::Value = result.one().await?;
//! println!("{}", row["n"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust,no_run
//! # use nimbus_driver::DriverError;
//! # fn example(err: DriverError) {
//! match err {
//!     DriverError::AmbiguousTimeout { .. } => eprintln!("may have run, check before retrying"),
//!     DriverError::UnambiguousTimeout { .. } => eprintln!("did not run, safe to retry"),
//!     e => eprintln!("Error: {}", e),
//! }
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - Cluster, providers, row readers and health operations
//! - [`transport`] - Capability traits of the two wire transports
//!

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod driver;
pub mod transport;

// Re-exports for convenience
pub use driver::{
    AnalyticsOptions, AnalyticsResult, Bucket, Cluster, ClusterConfig, ClusterConfigBuilder,
    DiagnosticsOptions, DriverError, DriverResult, PingOptions, QueryOptions, QueryResult,
    RetryStrategy, Scope, SearchOptions, SearchQuery, SearchRequest, SearchResult, ServiceType,
    Transport, WaitUntilReadyOptions,
};

pub use transport::{TransportError, TransportResult};

/// Config alias for convenience
pub type Config = ClusterConfig;
