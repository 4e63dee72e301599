//! Peer telemetry collection for henyey.
//!
//! Nodes periodically want to know what the rest of the network looks like:
//! which software versions peers run, how far along their ledgers are, how
//! long they have been up. This crate gathers those per-peer metrics over the
//! network without flooding peers with duplicate requests:
//!
//! - **Coalescing** - any number of concurrent callers share one request round
//! - **Caching** - a completed round is served from cache for `cache_cutoff`
//! - **Timeouts** - silent peers are given up on after `cache_cutoff`
//! - **Idle cleanup** - per-peer state is dropped once no longer used
//!
//! # Architecture
//!
//! - [`Telemetry`] - Coordinator owning one batch coalescer for network-wide
//!   samples and one coalescer per individually queried peer; routes incoming
//!   reports to all of them
//! - [`RequestCoalescer`] - Cache and round engine for one scope
//! - [`PeerChannel`] / [`PeerSource`] - The transport and peer selection the
//!   node provides
//! - [`Alarm`] / [`Worker`] - Deferred execution, with tokio implementations
//!   in [`TokioAlarm`] and [`TokioWorker`]
//!
//! All results are delivered through callbacks, possibly on another thread.
//! [`Telemetry::random_sample`] and [`Telemetry::single_peer`] wrap them as
//! futures.
//!
//! # Example
//!
//! ```rust,no_run
//! use henyey_telemetry::{PeerSet, Telemetry, TelemetryConfig};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let peers = Arc::new(PeerSet::new());
//! let telemetry = Telemetry::with_tokio(TelemetryConfig::default(), peers.clone());
//!
//! // The network layer forwards every telemetry message it receives:
//! // telemetry.report(endpoint, data);
//!
//! let responses = telemetry.random_sample().await;
//! println!(
//!     "{} peers answered (complete: {})",
//!     responses.data.len(),
//!     responses.all_received
//! );
//!
//! telemetry.stop();
//! # }
//! ```

mod channel;
mod coalescer;
mod config;
mod coordinator;
mod data;
mod error;
mod metrics;
mod scheduler;

pub use channel::{
    sample_size, Endpoint, PeerChannel, PeerSet, PeerSource, SendCallback, TelemetryRequest,
};
pub use coalescer::{CoalescerStats, RequestCoalescer, ResponseCallback};
pub use config::{TelemetryConfig, DEFAULT_CACHE_CUTOFF_MS, TELEMETRY_PROTOCOL_VERSION_MIN};
pub use coordinator::{SingleResponseCallback, Telemetry, TelemetryStats};
pub use data::{TelemetryData, TelemetryResponse, TelemetryResponseSet};
pub use error::TelemetryError;
pub use metrics::{Counter, TelemetryMetrics, TelemetryMetricsSnapshot};
pub use scheduler::{Alarm, Task, TokioAlarm, TokioWorker, Worker};

/// Result type for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;
