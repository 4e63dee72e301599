//! Error types for telemetry collection.
//!
//! Defines the [`TelemetryError`] enum. Most failures in this crate never
//! cross the async boundary as errors: they are folded into the
//! `all_received` / `error` flags of the delivered results. The enum exists
//! for the places where a concrete error value is exchanged:
//!
//! - Send completions reported by a [`PeerChannel`](crate::PeerChannel)
//! - The reason a single-peer query is rejected (logged)
//! - Configuration loading and validation

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur during telemetry collection.
#[derive(Debug, Error)]
pub enum TelemetryError {
    // ===== Transport Errors =====
    /// The telemetry request could not be delivered to the peer.
    #[error("failed to send telemetry request to {endpoint}: {reason}")]
    SendFailed {
        /// Peer the request was addressed to.
        endpoint: SocketAddr,
        /// Transport-level description of the failure.
        reason: String,
    },

    // ===== Protocol Errors =====
    /// The peer speaks a protocol version that predates telemetry support.
    #[error("peer {endpoint} protocol version {version} is below minimum {min}")]
    UnsupportedVersion {
        /// Peer that was queried.
        endpoint: SocketAddr,
        /// Version the peer reported.
        version: u8,
        /// Minimum version accepted for telemetry.
        min: u8,
    },

    // ===== State Errors =====
    /// The telemetry coordinator has been stopped.
    #[error("telemetry is stopped")]
    Stopped,

    // ===== Configuration Errors =====
    /// A configuration value is out of range.
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file is not valid TOML for [`TelemetryConfig`](crate::TelemetryConfig).
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
