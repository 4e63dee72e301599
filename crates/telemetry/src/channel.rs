//! Peer channel and peer sampling abstractions.
//!
//! The transport itself lives elsewhere in the node; this crate only needs to
//! know where a peer is, which protocol it speaks, and how to hand it a
//! [`TelemetryRequest`]. [`PeerSet`] is a simple in-memory [`PeerSource`]
//! suitable for wiring up a node or driving tests.

use crate::Result;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;

/// Network address identifying a peer.
pub type Endpoint = SocketAddr;

/// Completion notification for [`PeerChannel::send`].
///
/// Receives the number of bytes written, or the transport error.
pub type SendCallback = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// Request asking a peer to report its telemetry.
///
/// Carries no payload; the encoding is owned by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryRequest;

/// A connection to a single peer.
pub trait PeerChannel: Send + Sync {
    /// The peer's network address.
    fn endpoint(&self) -> Endpoint;

    /// Protocol version the peer announced.
    fn protocol_version(&self) -> u8;

    /// Queue `message` for delivery and report the outcome via `on_complete`.
    ///
    /// `on_complete` may run on any thread, including the calling one.
    fn send(&self, message: TelemetryRequest, on_complete: SendCallback);
}

/// Source of peers to sample for network-wide queries.
pub trait PeerSource: Send + Sync {
    /// Number of currently known peers.
    fn peer_count(&self) -> usize;

    /// Up to `count` distinct random peers at or above `min_protocol_version`.
    fn random_peers(&self, count: usize, min_protocol_version: u8) -> Vec<Arc<dyn PeerChannel>>;
}

/// Sample size for a network of `peer_count` peers: ceil(sqrt(n)).
pub fn sample_size(peer_count: usize) -> usize {
    (peer_count as f64).sqrt().ceil() as usize
}

/// In-memory [`PeerSource`].
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<Vec<Arc<dyn PeerChannel>>>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, replacing any existing peer with the same endpoint.
    pub fn insert(&self, channel: Arc<dyn PeerChannel>) {
        let endpoint = channel.endpoint();
        let mut peers = self.peers.write();
        peers.retain(|p| p.endpoint() != endpoint);
        peers.push(channel);
    }

    /// Remove the peer at `endpoint`. Returns true if it was present.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| &p.endpoint() != endpoint);
        peers.len() != before
    }

    /// Look up the peer at `endpoint`.
    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<dyn PeerChannel>> {
        self.peers
            .read()
            .iter()
            .find(|p| &p.endpoint() == endpoint)
            .cloned()
    }

    /// Returns true if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl PeerSource for PeerSet {
    fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn random_peers(&self, count: usize, min_protocol_version: u8) -> Vec<Arc<dyn PeerChannel>> {
        let peers = self.peers.read();
        let eligible: Vec<&Arc<dyn PeerChannel>> = peers
            .iter()
            .filter(|p| p.protocol_version() >= min_protocol_version)
            .collect();
        eligible
            .choose_multiple(&mut rand::thread_rng(), count)
            .map(|p| Arc::clone(*p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct StubChannel {
        endpoint: Endpoint,
        version: u8,
    }

    impl PeerChannel for StubChannel {
        fn endpoint(&self) -> Endpoint {
            self.endpoint
        }

        fn protocol_version(&self) -> u8 {
            self.version
        }

        fn send(&self, _message: TelemetryRequest, on_complete: SendCallback) {
            on_complete(Ok(0));
        }
    }

    fn make_channel(port: u16, version: u8) -> Arc<dyn PeerChannel> {
        Arc::new(StubChannel {
            endpoint: SocketAddr::from(([127, 0, 0, 1], port)),
            version,
        })
    }

    #[test]
    fn test_sample_size() {
        assert_eq!(sample_size(0), 0);
        assert_eq!(sample_size(1), 1);
        assert_eq!(sample_size(4), 2);
        assert_eq!(sample_size(5), 3);
        assert_eq!(sample_size(100), 10);
    }

    #[test]
    fn test_peer_set_insert_replaces() {
        let set = PeerSet::new();
        set.insert(make_channel(7075, 18));
        set.insert(make_channel(7075, 19));
        assert_eq!(set.peer_count(), 1);

        let endpoint = SocketAddr::from(([127, 0, 0, 1], 7075));
        assert_eq!(set.get(&endpoint).unwrap().protocol_version(), 19);
        assert!(set.remove(&endpoint));
        assert!(set.is_empty());
    }

    #[test]
    fn test_random_peers_filters_version() {
        let set = PeerSet::new();
        for port in 0..6 {
            set.insert(make_channel(7000 + port, 18));
        }
        set.insert(make_channel(8000, 17));

        let sample = set.random_peers(10, 18);
        assert_eq!(sample.len(), 6);
        assert!(sample.iter().all(|p| p.protocol_version() >= 18));

        let sample = set.random_peers(3, 18);
        let unique: HashSet<Endpoint> = sample.iter().map(|p| p.endpoint()).collect();
        assert_eq!(unique.len(), 3);
    }
}
