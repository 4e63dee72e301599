//! Request coalescing for telemetry queries.
//!
//! A [`RequestCoalescer`] answers "what are the current metrics of these
//! peers?" for one scope: the whole network, or one specific peer.
//!
//! # Rounds
//!
//! Asking the network is done in rounds. A round sends one
//! [`TelemetryRequest`] to every peer in the query and records their
//! endpoints as required responses. The round closes when the last required
//! endpoint is processed, which happens when:
//!
//! 1. The peer reports its telemetry (see [`RequestCoalescer::report`])
//! 2. The send to the peer fails
//! 3. The peer's timeout fires (`cache_cutoff` after the round started)
//!
//! Cases 2 and 3 clear the round's `all_received` flag. When the round
//! closes, its responses become the cache and every waiting callback is
//! invoked.
//!
//! # Coalescing
//!
//! Only the first caller with nothing pending does any work. Everyone else
//! is appended to the pending callbacks and served by whatever is already
//! underway: a round in flight, a queued cache-hit delivery, or a flush that
//! is currently invoking callbacks.
//!
//! # Timeouts
//!
//! Timeouts and send completions carry the round number they belong to and
//! are ignored once the coalescer has moved on to another round.
//!
//! # Locking
//!
//! All state sits behind one mutex. The lock is never held while a peer
//! channel sends or while a result callback runs, so callbacks may query
//! the coalescer again.

use crate::channel::{Endpoint, PeerChannel, TelemetryRequest};
use crate::data::{TelemetryData, TelemetryResponseSet};
use crate::metrics::TelemetryMetrics;
use crate::scheduler::{Alarm, Worker};
use crate::TelemetryError;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Continuation receiving the result of a multi-peer query.
pub type ResponseCallback = Box<dyn FnOnce(&TelemetryResponseSet) + Send + 'static>;

/// Introspection counts for one coalescer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Callbacks waiting for a result.
    pub pending_callbacks: usize,
    /// Responses accumulated in the current round.
    pub current_responses: usize,
    /// Responses held in the cache.
    pub cached_responses: usize,
    /// Endpoints the current round is still waiting on.
    pub required_responses: usize,
}

#[derive(Default)]
struct CoalescerState {
    callbacks: Vec<ResponseCallback>,
    /// Set while a flush is invoking callbacks with the lock released.
    invoking: bool,
    required_responses: HashSet<Endpoint>,
    current_responses: Vec<TelemetryData>,
    cached_responses: Vec<TelemetryData>,
    last_time: Option<Instant>,
    all_received: bool,
    round: u64,
}

impl CoalescerState {
    fn cache_valid(&self, cache_cutoff: Duration, now: Instant) -> bool {
        self.last_time
            .map(|last| now < last + cache_cutoff)
            .unwrap_or(false)
    }
}

enum QueryAction {
    Coalesced,
    CacheHit,
    StartRound(u64),
}

/// Coalescing, caching telemetry requester for one scope.
///
/// Always handled through an `Arc`; scheduled tasks keep only a `Weak`
/// handle and become no-ops once the coalescer is dropped.
pub struct RequestCoalescer {
    cache_cutoff: Duration,
    alarm: Arc<dyn Alarm>,
    worker: Arc<dyn Worker>,
    metrics: Arc<TelemetryMetrics>,
    state: Mutex<CoalescerState>,
    this: Weak<RequestCoalescer>,
}

impl RequestCoalescer {
    /// Create a new coalescer.
    pub fn new(
        cache_cutoff: Duration,
        alarm: Arc<dyn Alarm>,
        worker: Arc<dyn Worker>,
        metrics: Arc<TelemetryMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            cache_cutoff,
            alarm,
            worker,
            metrics,
            state: Mutex::new(CoalescerState::default()),
            this: this.clone(),
        })
    }

    /// Duration governing cache validity and per-peer timeouts.
    pub fn cache_cutoff(&self) -> Duration {
        self.cache_cutoff
    }

    /// Ask `peers` for their telemetry, delivering the result to `callback`.
    ///
    /// The callback is never invoked on the calling thread's stack from the
    /// cache path; from the round path it runs on whichever thread closes the
    /// round. `peers` must not be empty.
    pub fn query(&self, peers: &[Arc<dyn PeerChannel>], callback: ResponseCallback) {
        debug_assert!(!peers.is_empty(), "telemetry query requires at least one peer");

        let action = {
            let mut state = self.state.lock();
            state.callbacks.push(callback);
            if state.callbacks.len() > 1 || state.invoking {
                trace!(
                    pending = state.callbacks.len(),
                    "Coalescing telemetry query onto pending result"
                );
                QueryAction::Coalesced
            } else if state.cache_valid(self.cache_cutoff, Instant::now()) {
                QueryAction::CacheHit
            } else {
                debug_assert!(state.required_responses.is_empty());
                state.all_received = true;
                state.required_responses = peers.iter().map(|p| p.endpoint()).collect();
                state.round += 1;
                QueryAction::StartRound(state.round)
            }
        };

        match action {
            QueryAction::Coalesced => {}
            QueryAction::CacheHit => {
                self.metrics.cache_hits.inc();
                trace!("Serving telemetry from cache");
                let this = self.this.clone();
                self.worker.submit(Box::new(move || {
                    if let Some(this) = this.upgrade() {
                        let state = this.state.lock();
                        this.flush_callbacks(state, true);
                    }
                }));
            }
            QueryAction::StartRound(round) => {
                self.metrics.rounds_started.inc();
                debug!(round, peers = peers.len(), "Starting telemetry round");
                self.fire_request_messages(peers, round);
            }
        }
    }

    /// Record telemetry reported by `endpoint`.
    ///
    /// Returns false if this coalescer was not waiting on `endpoint`.
    pub fn report(&self, endpoint: Endpoint, data: TelemetryData) -> bool {
        let mut state = self.state.lock();
        if !state.required_responses.contains(&endpoint) {
            return false;
        }

        state.current_responses.push(data);
        self.channel_processed(state, &endpoint);
        true
    }

    /// Number of callbacks waiting for a result.
    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Number of responses accumulated in the current round.
    pub fn telemetry_data_size(&self) -> usize {
        self.state.lock().current_responses.len()
    }

    /// Current round number (0 before the first round).
    pub fn round(&self) -> u64 {
        self.state.lock().round
    }

    /// Introspection counts.
    pub fn stats(&self) -> CoalescerStats {
        let state = self.state.lock();
        CoalescerStats {
            pending_callbacks: state.callbacks.len(),
            current_responses: state.current_responses.len(),
            cached_responses: state.cached_responses.len(),
            required_responses: state.required_responses.len(),
        }
    }

    fn fire_request_messages(&self, peers: &[Arc<dyn PeerChannel>], round: u64) {
        let deadline = Instant::now() + self.cache_cutoff;
        let mut sent = HashSet::with_capacity(peers.len());

        for channel in peers {
            let endpoint = channel.endpoint();
            if !sent.insert(endpoint) {
                continue;
            }

            let this = self.this.clone();
            self.metrics.requests_sent.inc();
            channel.send(
                TelemetryRequest,
                Box::new(move |result: crate::Result<usize>| {
                    if let (Err(err), Some(this)) = (result, this.upgrade()) {
                        this.on_send_failed(endpoint, round, &err);
                    }
                }),
            );

            // Give up on the peer if it has not answered by the deadline, but only
            // if the round it was asked in is still the current one.
            let this = self.this.clone();
            self.alarm.schedule_at(
                deadline,
                Box::new(move || {
                    if let Some(this) = this.upgrade() {
                        this.on_timeout(endpoint, round);
                    }
                }),
            );
        }
    }

    fn on_send_failed(&self, endpoint: Endpoint, round: u64, err: &TelemetryError) {
        let mut state = self.state.lock();
        if state.round != round || !state.required_responses.contains(&endpoint) {
            return;
        }

        warn!(%endpoint, round, error = %err, "Failed to send telemetry request");
        self.metrics.send_failures.inc();
        state.all_received = false;
        self.channel_processed(state, &endpoint);
    }

    fn on_timeout(&self, endpoint: Endpoint, round: u64) {
        let mut state = self.state.lock();
        if state.round != round || !state.required_responses.contains(&endpoint) {
            return;
        }

        debug!(%endpoint, round, "Telemetry request timed out");
        self.metrics.timeouts.inc();
        state.all_received = false;
        self.channel_processed(state, &endpoint);
    }

    fn channel_processed(&self, mut state: MutexGuard<'_, CoalescerState>, endpoint: &Endpoint) {
        if state.required_responses.remove(endpoint) && state.required_responses.is_empty() {
            state.cached_responses = state.current_responses.clone();
            state.last_time = Some(Instant::now());
            debug!(
                round = state.round,
                responses = state.cached_responses.len(),
                all_received = state.all_received,
                "Telemetry round complete"
            );
            self.flush_callbacks(state, false);
        }
    }

    /// Invoke every pending callback, including ones queued while invoking.
    fn flush_callbacks(&self, mut state: MutexGuard<'_, CoalescerState>, is_cached: bool) {
        state.invoking = true;
        while !state.callbacks.is_empty() {
            let callbacks = std::mem::take(&mut state.callbacks);
            let response = TelemetryResponseSet {
                data: state.cached_responses.clone(),
                is_cached,
                all_received: state.all_received,
            };
            state.current_responses.clear();

            MutexGuard::unlocked(&mut state, || {
                for callback in callbacks {
                    callback(&response);
                }
            });
        }
        state.invoking = false;
    }
}
