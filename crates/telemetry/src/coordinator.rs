//! Node-level telemetry coordination.
//!
//! [`Telemetry`] owns the coalescers that talk to the network:
//!
//! - one batch [`RequestCoalescer`] shared by every "sample the network"
//!   query, living as long as the coordinator
//! - one private coalescer per peer that has been queried individually,
//!   created on first use and dropped again once idle
//!
//! Incoming telemetry reports are fanned out to all of them; each coalescer
//! keeps only the reports it is waiting for.
//!
//! # Idle Cleanup
//!
//! Every single-peer entry has a recurring cleanup alarm. When it fires it
//! removes the entry if the entry was last used more than `cache_cutoff`
//! ago and has no callbacks pending, and otherwise rearms itself. The alarm
//! holds weak references only, so [`Telemetry::stop`] (or dropping the
//! coordinator) disarms it.
//!
//! # Shutdown
//!
//! After [`Telemetry::stop`], queries complete immediately with an empty
//! (batch) or error (single) result and reports are ignored. Callbacks still
//! queued in the released coalescers are dropped without being invoked; the
//! awaitable wrappers turn that into the same empty/error result.

use crate::channel::{sample_size, Endpoint, PeerChannel, PeerSource};
use crate::coalescer::{CoalescerStats, RequestCoalescer, ResponseCallback};
use crate::config::TelemetryConfig;
use crate::data::{TelemetryData, TelemetryResponse, TelemetryResponseSet};
use crate::metrics::TelemetryMetrics;
use crate::scheduler::{Alarm, TokioAlarm, TokioWorker, Worker};
use crate::{Result, TelemetryError};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Continuation receiving the result of a single-peer query.
pub type SingleResponseCallback = Box<dyn FnOnce(&TelemetryResponse) + Send + 'static>;

/// Introspection counts for a [`Telemetry`] coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    /// Counts for the batch coalescer; `None` once stopped.
    pub batch_request: Option<CoalescerStats>,
    /// Number of live single-peer entries.
    pub single_requests: usize,
}

struct SingleRequestEntry {
    coalescer: Arc<RequestCoalescer>,
    last_updated: Instant,
}

#[derive(Default)]
struct TelemetryState {
    batch_request: Option<Arc<RequestCoalescer>>,
    single_requests: HashMap<Endpoint, SingleRequestEntry>,
    stopped: bool,
}

/// Telemetry coordinator for a node.
pub struct Telemetry {
    config: TelemetryConfig,
    peers: Arc<dyn PeerSource>,
    alarm: Arc<dyn Alarm>,
    worker: Arc<dyn Worker>,
    metrics: Arc<TelemetryMetrics>,
    state: Mutex<TelemetryState>,
    this: Weak<Telemetry>,
}

impl Telemetry {
    /// Create a coordinator with explicit scheduling collaborators.
    pub fn new(
        config: TelemetryConfig,
        peers: Arc<dyn PeerSource>,
        alarm: Arc<dyn Alarm>,
        worker: Arc<dyn Worker>,
    ) -> Arc<Self> {
        let metrics = Arc::new(TelemetryMetrics::new());
        let batch_request = RequestCoalescer::new(
            config.cache_cutoff(),
            alarm.clone(),
            worker.clone(),
            metrics.clone(),
        );

        Arc::new_cyclic(|this| Self {
            config,
            peers,
            alarm,
            worker,
            metrics,
            state: Mutex::new(TelemetryState {
                batch_request: Some(batch_request),
                ..Default::default()
            }),
            this: this.clone(),
        })
    }

    /// Create a coordinator scheduling on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn with_tokio(config: TelemetryConfig, peers: Arc<dyn PeerSource>) -> Arc<Self> {
        Self::new(
            config,
            peers,
            Arc::new(TokioAlarm::current()),
            Arc::new(TokioWorker::current()),
        )
    }

    /// The configuration this coordinator runs with.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Counters shared by all coalescers of this coordinator.
    pub fn metrics(&self) -> &TelemetryMetrics {
        &self.metrics
    }

    /// Stop accepting queries and reports and release all coalescers.
    pub fn stop(&self) {
        let (batch_request, single_requests) = {
            let mut state = self.state.lock();
            state.stopped = true;
            (
                state.batch_request.take(),
                std::mem::take(&mut state.single_requests),
            )
        };
        info!(
            single_requests = single_requests.len(),
            metrics = ?self.metrics.snapshot(),
            "Stopping telemetry"
        );
        // Dropped outside the lock: pending callbacks may own arbitrary state.
        drop(batch_request);
        drop(single_requests);
    }

    /// Returns true once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Route telemetry reported by `endpoint` to every live coalescer.
    pub fn report(&self, endpoint: Endpoint, data: TelemetryData) {
        let coalescers: Vec<Arc<RequestCoalescer>> = {
            let state = self.state.lock();
            if state.stopped {
                return;
            }
            state
                .batch_request
                .iter()
                .cloned()
                .chain(state.single_requests.values().map(|e| e.coalescer.clone()))
                .collect()
        };

        let mut accepted = false;
        for coalescer in coalescers {
            accepted |= coalescer.report(endpoint, data.clone());
        }

        if accepted {
            self.metrics.reports_accepted.inc();
        } else {
            trace!(%endpoint, "Ignoring unsolicited telemetry");
            self.metrics.reports_ignored.inc();
        }
    }

    /// Ask a random sample of the network for telemetry.
    ///
    /// The sample is ceil(sqrt(n)) of the known peers that support
    /// telemetry. With nobody to ask, or once stopped, `callback` receives
    /// an empty, incomplete result immediately.
    pub fn query_random_sample(&self, callback: ResponseCallback) {
        // Only used if no batch round is already in flight.
        let random_peers = self.peers.random_peers(
            sample_size(self.peers.peer_count()),
            self.config.min_protocol_version,
        );

        let batch_request = {
            let state = self.state.lock();
            if state.stopped || random_peers.is_empty() {
                None
            } else {
                state.batch_request.clone()
            }
        };

        match batch_request {
            Some(batch_request) => batch_request.query(&random_peers, callback),
            None => {
                trace!("No peers to sample for telemetry");
                callback(&TelemetryResponseSet::empty());
            }
        }
    }

    /// Awaitable form of [`query_random_sample`](Self::query_random_sample).
    pub async fn random_sample(&self) -> TelemetryResponseSet {
        let (tx, rx) = oneshot::channel();
        self.query_random_sample(Box::new(move |responses: &TelemetryResponseSet| {
            let _ = tx.send(responses.clone());
        }));
        rx.await.unwrap_or_default()
    }

    /// Ask one specific peer for telemetry.
    ///
    /// Peers below the minimum protocol version, and any query after
    /// [`stop`](Self::stop), get an error result immediately.
    pub fn query_single(&self, channel: Arc<dyn PeerChannel>, callback: SingleResponseCallback) {
        let endpoint = channel.endpoint();
        if let Err(err) = self.check_protocol_version(channel.as_ref()) {
            debug!(%endpoint, error = %err, "Rejecting single peer telemetry query");
            callback(&TelemetryResponse::error(false));
            return;
        }

        let (coalescer, is_new) = {
            let mut state = self.state.lock();
            if state.stopped {
                drop(state);
                let err = TelemetryError::Stopped;
                debug!(%endpoint, error = %err, "Rejecting single peer telemetry query");
                callback(&TelemetryResponse::error(false));
                return;
            }

            let now = Instant::now();
            match state.single_requests.entry(endpoint) {
                Entry::Occupied(mut entry) => {
                    let entry = entry.get_mut();
                    entry.last_updated = now;
                    (entry.coalescer.clone(), false)
                }
                Entry::Vacant(entry) => {
                    let coalescer = RequestCoalescer::new(
                        self.config.cache_cutoff(),
                        self.alarm.clone(),
                        self.worker.clone(),
                        self.metrics.clone(),
                    );
                    entry.insert(SingleRequestEntry {
                        coalescer: coalescer.clone(),
                        last_updated: now,
                    });
                    (coalescer, true)
                }
            }
        };

        if is_new {
            trace!(%endpoint, "Created single peer telemetry entry");
            self.schedule_single_request_cleanup(endpoint, Arc::downgrade(&coalescer));
        }

        coalescer.query(
            std::slice::from_ref(&channel),
            Box::new(move |responses: &TelemetryResponseSet| {
                callback(&TelemetryResponse::from_single_round(responses));
            }),
        );
    }

    /// Awaitable form of [`query_single`](Self::query_single).
    pub async fn single_peer(&self, channel: Arc<dyn PeerChannel>) -> TelemetryResponse {
        let (tx, rx) = oneshot::channel();
        self.query_single(
            channel,
            Box::new(move |response: &TelemetryResponse| {
                let _ = tx.send(response.clone());
            }),
        );
        rx.await.unwrap_or_else(|_| TelemetryResponse::error(false))
    }

    /// Responses accumulated in the current rounds of all coalescers.
    pub fn telemetry_data_size(&self) -> usize {
        let coalescers: Vec<Arc<RequestCoalescer>> = {
            let state = self.state.lock();
            state
                .batch_request
                .iter()
                .cloned()
                .chain(state.single_requests.values().map(|e| e.coalescer.clone()))
                .collect()
        };
        coalescers.iter().map(|c| c.telemetry_data_size()).sum()
    }

    /// Number of live single-peer entries.
    pub fn single_request_count(&self) -> usize {
        self.state.lock().single_requests.len()
    }

    /// Introspection counts.
    pub fn stats(&self) -> TelemetryStats {
        let (batch_request, single_requests) = {
            let state = self.state.lock();
            (state.batch_request.clone(), state.single_requests.len())
        };
        TelemetryStats {
            batch_request: batch_request.map(|b| b.stats()),
            single_requests,
        }
    }

    fn check_protocol_version(&self, channel: &dyn PeerChannel) -> Result<()> {
        let version = channel.protocol_version();
        let min = self.config.min_protocol_version;
        if version < min {
            return Err(TelemetryError::UnsupportedVersion {
                endpoint: channel.endpoint(),
                version,
                min,
            });
        }
        Ok(())
    }

    fn schedule_single_request_cleanup(&self, endpoint: Endpoint, coalescer: Weak<RequestCoalescer>) {
        let telemetry = self.this.clone();
        self.alarm.schedule_at(
            Instant::now() + self.config.cache_cutoff(),
            Box::new(move || {
                if let Some(telemetry) = telemetry.upgrade() {
                    telemetry.single_request_cleanup(endpoint, coalescer);
                }
            }),
        );
    }

    fn single_request_cleanup(&self, endpoint: Endpoint, coalescer_weak: Weak<RequestCoalescer>) {
        let Some(coalescer) = coalescer_weak.upgrade() else {
            return;
        };

        let removed = {
            let mut state = self.state.lock();
            let idle = match state.single_requests.get(&endpoint) {
                Some(entry) if Arc::ptr_eq(&entry.coalescer, &coalescer) => {
                    Instant::now().duration_since(entry.last_updated) > self.config.cache_cutoff()
                        && coalescer.pending_callbacks() == 0
                }
                _ => return,
            };
            if idle {
                state.single_requests.remove(&endpoint)
            } else {
                None
            }
        };

        match removed {
            Some(_entry) => {
                self.metrics.single_requests_evicted.inc();
                debug!(%endpoint, "Removed idle single peer telemetry entry");
            }
            None => self.schedule_single_request_cleanup(endpoint, coalescer_weak),
        }
    }
}
