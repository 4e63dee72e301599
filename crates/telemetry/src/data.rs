//! Telemetry records and query results.

/// Metrics a peer reports about itself in reply to a telemetry request.
///
/// The collection machinery never looks inside this record; it is stored,
/// cached and handed back to callers as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TelemetryData {
    /// Number of blocks in the peer's ledger.
    pub block_count: u64,
    /// Number of blocks the peer has cemented.
    pub cemented_count: u64,
    /// Number of blocks waiting on dependencies.
    pub unchecked_count: u64,
    /// Number of accounts in the peer's ledger.
    pub account_count: u64,
    /// Outbound bandwidth limit in bytes per second (0 = unlimited).
    pub bandwidth_cap: u64,
    /// Number of peers the peer is connected to.
    pub peer_count: u32,
    /// Network protocol version the peer runs.
    pub protocol_version: u8,
    /// Major version of the peer's node software.
    pub vendor_version: u8,
    /// Seconds since the peer's node started.
    pub uptime: u64,
    /// Hash of the genesis block the peer is following.
    pub genesis_block: [u8; 32],
}

/// Result of a multi-peer telemetry query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryResponseSet {
    /// One record per peer that answered in the round.
    pub data: Vec<TelemetryData>,
    /// True if the result was served from cache without a new round.
    pub is_cached: bool,
    /// True if every peer asked in the round answered in time.
    pub all_received: bool,
}

impl TelemetryResponseSet {
    /// The result delivered when there is nobody to ask.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Result of a single-peer telemetry query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryResponse {
    /// The peer's metrics; default-valued when `error` is set.
    pub data: TelemetryData,
    /// True if the result was served from cache without a new round.
    pub is_cached: bool,
    /// True if no metrics could be obtained from the peer.
    pub error: bool,
}

impl TelemetryResponse {
    /// A failed single-peer result.
    pub fn error(is_cached: bool) -> Self {
        Self {
            data: TelemetryData::default(),
            is_cached,
            error: true,
        }
    }

    /// Interpret a one-peer round.
    ///
    /// Only a complete round carrying exactly one record is a success.
    pub fn from_single_round(responses: &TelemetryResponseSet) -> Self {
        match (responses.all_received, responses.data.as_slice()) {
            (true, [data]) => Self {
                data: data.clone(),
                is_cached: responses.is_cached,
                error: false,
            },
            _ => Self::error(responses.is_cached),
        }
    }
}
