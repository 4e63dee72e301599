//! Integration tests for telemetry collection through the coordinator.

use henyey_telemetry::{
    Endpoint, PeerChannel, PeerSet, PeerSource, SendCallback, Telemetry, TelemetryConfig,
    TelemetryData, TelemetryError, TelemetryRequest, TelemetryResponse, TelemetryResponseSet,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const CUTOFF: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, PartialEq, Eq)]
enum PeerMode {
    /// Answers every request with its telemetry.
    Respond,
    /// Accepts requests but never answers.
    Silent,
    /// Fails every send.
    FailSend,
}

struct MockPeer {
    endpoint: Endpoint,
    data: TelemetryData,
    mode: PeerMode,
    sends: AtomicUsize,
    telemetry: Mutex<Weak<Telemetry>>,
    handle: Handle,
}

impl MockPeer {
    fn new(port: u16, mode: PeerMode) -> Arc<Self> {
        Arc::new(Self {
            endpoint: SocketAddr::from(([10, 0, 0, 1], port)),
            data: TelemetryData {
                block_count: port as u64,
                protocol_version: 18,
                ..Default::default()
            },
            mode,
            sends: AtomicUsize::new(0),
            telemetry: Mutex::new(Weak::new()),
            handle: Handle::current(),
        })
    }

    fn attach(&self, telemetry: &Arc<Telemetry>) {
        *self.telemetry.lock().unwrap() = Arc::downgrade(telemetry);
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl PeerChannel for MockPeer {
    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn protocol_version(&self) -> u8 {
        18
    }

    fn send(&self, _message: TelemetryRequest, on_complete: SendCallback) {
        self.sends.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            PeerMode::FailSend => on_complete(Err(TelemetryError::SendFailed {
                endpoint: self.endpoint,
                reason: "broken pipe".to_string(),
            })),
            PeerMode::Silent => on_complete(Ok(8)),
            PeerMode::Respond => {
                on_complete(Ok(8));
                // The reply arrives later, on the network side.
                let telemetry = self.telemetry.lock().unwrap().clone();
                let endpoint = self.endpoint;
                let data = self.data.clone();
                self.handle.spawn(async move {
                    if let Some(telemetry) = telemetry.upgrade() {
                        telemetry.report(endpoint, data);
                    }
                });
            }
        }
    }
}

/// Peer source that always hands out every peer.
struct AllPeers(Vec<Arc<MockPeer>>);

impl PeerSource for AllPeers {
    fn peer_count(&self) -> usize {
        self.0.len()
    }

    fn random_peers(&self, _count: usize, _min_protocol_version: u8) -> Vec<Arc<dyn PeerChannel>> {
        self.0
            .iter()
            .map(|p| p.clone() as Arc<dyn PeerChannel>)
            .collect()
    }
}

fn make_config() -> TelemetryConfig {
    TelemetryConfig::with_cache_cutoff(CUTOFF)
}

fn make_network(modes: &[PeerMode]) -> (Arc<Telemetry>, Vec<Arc<MockPeer>>) {
    let peers: Vec<Arc<MockPeer>> = modes
        .iter()
        .enumerate()
        .map(|(i, mode)| MockPeer::new(7000 + i as u16, *mode))
        .collect();
    let telemetry = Telemetry::with_tokio(make_config(), Arc::new(AllPeers(peers.clone())));
    for peer in &peers {
        peer.attach(&telemetry);
    }
    (telemetry, peers)
}

#[tokio::test(start_paused = true)]
async fn test_random_sample_all_respond() {
    let (telemetry, peers) = make_network(&[PeerMode::Respond; 3]);

    let responses = telemetry.random_sample().await;
    assert!(responses.all_received);
    assert!(!responses.is_cached);

    let mut block_counts: Vec<u64> = responses.data.iter().map(|d| d.block_count).collect();
    block_counts.sort_unstable();
    assert_eq!(block_counts, vec![7000, 7001, 7002]);
    assert!(peers.iter().all(|p| p.sends() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_random_sample_uses_sqrt_of_peer_set() {
    let peer_set = Arc::new(PeerSet::new());
    let telemetry = Telemetry::with_tokio(make_config(), peer_set.clone());
    let peers: Vec<Arc<MockPeer>> = (0..9)
        .map(|i| MockPeer::new(7000 + i, PeerMode::Respond))
        .collect();
    for peer in &peers {
        peer.attach(&telemetry);
        peer_set.insert(peer.clone());
    }

    let responses = telemetry.random_sample().await;
    assert!(responses.all_received);
    assert_eq!(responses.data.len(), 3);
    assert_eq!(peers.iter().map(|p| p.sends()).sum::<usize>(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_queries_coalesce() {
    let (telemetry, peers) = make_network(&[PeerMode::Silent; 3]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    for _ in 0..10 {
        let tx = tx.clone();
        telemetry.query_random_sample(Box::new(move |r: &TelemetryResponseSet| {
            let _ = tx.send(r.clone());
        }));
    }
    assert!(peers.iter().all(|p| p.sends() == 1));
    assert_eq!(telemetry.stats().batch_request.unwrap().pending_callbacks, 10);

    for peer in &peers {
        telemetry.report(peer.endpoint, peer.data.clone());
    }

    let first = rx.recv().await.unwrap();
    assert!(first.all_received);
    assert_eq!(first.data.len(), 3);
    for _ in 1..10 {
        assert_eq!(rx.recv().await.unwrap(), first);
    }
    assert_eq!(telemetry.metrics().rounds_started.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure() {
    let (telemetry, _peers) =
        make_network(&[PeerMode::Respond, PeerMode::FailSend, PeerMode::Respond]);

    let responses = telemetry.random_sample().await;
    assert!(!responses.all_received);
    assert_eq!(responses.data.len(), 2);
    assert_eq!(telemetry.metrics().send_failures.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let (telemetry, _peers) = make_network(&[PeerMode::Respond, PeerMode::Silent]);

    let start = tokio::time::Instant::now();
    let responses = telemetry.random_sample().await;
    assert!(start.elapsed() >= CUTOFF);
    assert!(!responses.all_received);
    assert_eq!(responses.data.len(), 1);
    assert_eq!(telemetry.metrics().timeouts.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_validity() {
    let (telemetry, peers) = make_network(&[PeerMode::Respond; 2]);

    let first = telemetry.random_sample().await;
    assert!(!first.is_cached);

    tokio::time::advance(CUTOFF / 2).await;
    let second = telemetry.random_sample().await;
    assert!(second.is_cached);
    assert_eq!(second.data, first.data);
    assert!(peers.iter().all(|p| p.sends() == 1));

    tokio::time::advance(CUTOFF).await;
    let third = telemetry.random_sample().await;
    assert!(!third.is_cached);
    assert!(peers.iter().all(|p| p.sends() == 2));
}

#[tokio::test(start_paused = true)]
async fn test_one_report_serves_batch_and_single() {
    let (telemetry, peers) = make_network(&[PeerMode::Silent]);
    let peer = peers[0].clone();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let (single_tx, mut single_rx) = mpsc::unbounded_channel();

    telemetry.query_random_sample(Box::new(move |r: &TelemetryResponseSet| {
        let _ = batch_tx.send(r.clone());
    }));
    telemetry.query_single(
        peer.clone(),
        Box::new(move |r: &TelemetryResponse| {
            let _ = single_tx.send(r.clone());
        }),
    );
    assert_eq!(peer.sends(), 2);

    telemetry.report(peer.endpoint, peer.data.clone());

    let batch = batch_rx.recv().await.unwrap();
    let single = single_rx.recv().await.unwrap();
    assert_eq!(batch.data, vec![peer.data.clone()]);
    assert!(!single.error);
    assert_eq!(single.data, peer.data);
    assert_eq!(telemetry.metrics().reports_accepted.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_callback_may_query_again() {
    let (telemetry, peers) = make_network(&[PeerMode::Respond]);
    let peer = peers[0].clone();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let inner = telemetry.clone();
    let inner_peer = peer.clone();
    telemetry.query_single(
        peer.clone(),
        Box::new(move |first: &TelemetryResponse| {
            let _ = tx.send(first.clone());
            let tx = tx.clone();
            inner.query_single(
                inner_peer,
                Box::new(move |second: &TelemetryResponse| {
                    let _ = tx.send(second.clone());
                }),
            );
        }),
    );

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(!first.error);
    assert!(!second.error);
    assert_eq!(second.data, peer.data);
    assert_eq!(peer.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_evicted_per_peer() {
    let (telemetry, peers) = make_network(&[PeerMode::Respond; 2]);

    assert!(!telemetry.single_peer(peers[0].clone()).await.error);
    tokio::time::advance(CUTOFF / 2).await;
    assert!(!telemetry.single_peer(peers[1].clone()).await.error);
    assert_eq!(telemetry.single_request_count(), 2);

    // Keep peer 1 busy while peer 0 goes idle.
    for _ in 0..4 {
        tokio::time::sleep(CUTOFF / 2).await;
        telemetry.single_peer(peers[1].clone()).await;
    }
    assert_eq!(telemetry.single_request_count(), 1);
    assert_eq!(telemetry.metrics().single_requests_evicted.get(), 1);

    tokio::time::sleep(CUTOFF * 3).await;
    assert_eq!(telemetry.single_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_disarms_cleanup() {
    let (telemetry, peers) = make_network(&[PeerMode::Respond]);

    telemetry.single_peer(peers[0].clone()).await;
    telemetry.stop();

    tokio::time::sleep(CUTOFF * 3).await;
    assert_eq!(telemetry.single_request_count(), 0);
    assert_eq!(telemetry.metrics().single_requests_evicted.get(), 0);

    telemetry.report(peers[0].endpoint, peers[0].data.clone());
    assert_eq!(telemetry.metrics().reports_accepted.get(), 1);
    assert_eq!(telemetry.telemetry_data_size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_single_queries() {
    let (telemetry, peers) = make_network(&[PeerMode::Respond; 8]);
    let mut tasks = JoinSet::new();

    for i in 0..64 {
        let telemetry = telemetry.clone();
        let peer = peers[i % peers.len()].clone();
        tasks.spawn(async move {
            let response = telemetry.single_peer(peer.clone()).await;
            (peer, response)
        });
    }

    while let Some(result) = tasks.join_next().await {
        let (peer, response) = result.unwrap();
        assert!(!response.error);
        assert_eq!(response.data, peer.data);
    }
    assert_eq!(telemetry.single_request_count(), 8);
    assert!(peers.iter().all(|p| p.sends() >= 1));
}
