// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Admission control and per-tick byte-budget distribution.
//!
//! One worker task owns the map of live requests; everything else talks to
//! it through three bounded queues (admission, re-admission, discard). Once
//! per tick the worker:
//!
//! 1. reads the observed bandwidth (floored by a synthetic minimum so cold
//!    starts can admit) and the user's hard limit, and derives an admission
//!    target from the saturation fraction;
//! 2. admits queued requests, oldest first across the admission and
//!    re-admission queues, while the live set's assumed consumption stays
//!    under the target, signalling each admitted caller;
//! 3. with a hard limit set, distributes that many bytes across the live
//!    requests: a mercy pass first fully budgets everything that fits under
//!    the per-request average, then the rest share the remainder evenly.
//!
//! Without a hard limit, admission is the only pacing applied: live requests
//! self-allocate and run as fast as the transport allows.

use crate::config::{PacerConfig, SERVICE_MINIMUM_BANDWIDTH};
use crate::error::Error;
use crate::request::{PacedRequest, PacerLinks, Readmission};
use crate::ticket::{PaceMode, PacerTicket};
use blobflow_throughput::BandwidthRecorder;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// An admission request travelling from a caller to the worker.
struct Admission {
    /// Arrival position, shared with the re-admission queue so the tick can
    /// drain both in first-come order.
    seq: u64,
    request: Arc<PacedRequest>,
    /// Signalled when the tick admits the request. Dropping the receiver
    /// (caller cancelled) makes the worker skip the entry.
    ready: oneshot::Sender<()>,
}

/// The longest-waiting entry across the two queues, as picked by the tick.
enum Queued {
    Admit(Admission),
    Readmit(Readmission),
}

/// Counters shared between the worker and [`Pacer::report`].
#[derive(Default)]
struct PacerStats {
    live: AtomicUsize,
    admitted: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time snapshot of the pacer, for logs and progress displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerReport {
    /// Requests currently in the live map (as of the last tick).
    pub live_requests: usize,
    /// Admissions staged ahead of the next tick.
    pub queued_admissions: usize,
    /// Requests admitted since creation.
    pub admitted_total: u64,
    /// Requests discarded since creation.
    pub discarded_total: u64,
}

pub(crate) struct PacerShared {
    recorder: BandwidthRecorder,
    config: PacerConfig,
    links: Arc<PacerLinks>,
    admit_tx: mpsc::Sender<Admission>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    stats: Arc<PacerStats>,
}

/// Decides when pending requests may be sent and how many bytes each may
/// move per tick.
///
/// Cloning is cheap; all clones drive the same worker. The worker stops when
/// the supplied cancellation token fires, or once every handle is dropped
/// and the live set has drained.
#[derive(Clone)]
pub struct Pacer {
    shared: Arc<PacerShared>,
}

impl Pacer {
    /// Creates a pacer on top of `recorder` and spawns its worker task.
    ///
    /// Must be called from within a Tokio runtime. Cancelling `cancel` stops
    /// the worker after the current tick; in-flight waiters observe
    /// cancellation through their per-request tokens.
    #[must_use]
    pub fn new(recorder: BandwidthRecorder, config: PacerConfig, cancel: CancellationToken) -> Self {
        let config = config.sanitized();
        let (admit_tx, admit_rx) = mpsc::channel(config.queue_capacity);
        let (readmit_tx, readmit_rx) = mpsc::channel(config.queue_capacity);
        let (discard_tx, discard_rx) = mpsc::channel(config.queue_capacity);
        let links = PacerLinks::new(recorder.clone(), readmit_tx, discard_tx, &config);
        let stats = Arc::new(PacerStats::default());
        let worker = PacerWorker {
            recorder: recorder.clone(),
            config: config.clone(),
            admit_rx,
            readmit_rx,
            discard_rx,
            pending_admit: None,
            pending_readmit: None,
            live: HashMap::new(),
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            admit_closed: false,
        };
        let _ = tokio::spawn(worker.run());
        Pacer {
            shared: Arc::new(PacerShared {
                recorder,
                config,
                links,
                admit_tx,
                next_id: AtomicU64::new(1),
                cancel,
                stats,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<PacerShared>) -> Self {
        Pacer { shared }
    }

    /// The bandwidth recorder this pacer steers by.
    #[must_use]
    pub fn recorder(&self) -> &BandwidthRecorder {
        &self.shared.recorder
    }

    /// The sanitized configuration in effect.
    #[must_use]
    pub fn config(&self) -> &PacerConfig {
        &self.shared.config
    }

    /// Stops the worker after the current tick.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    /// Stages a request of `size` body bytes for admission and waits until a
    /// tick admits it. The returned request is live and ready to wrap its
    /// body stream.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when `cancel` fires before admission,
    /// [`Error::PacerClosed`] / [`Error::AdmissionAbandoned`] when the
    /// worker has shut down.
    pub async fn initiate_request(
        &self,
        size: u64,
        cancel: CancellationToken,
    ) -> Result<Arc<PacedRequest>, Error> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = PacedRequest::new(id, size, Arc::clone(&self.shared.links), cancel.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        self.shared
            .admit_tx
            .send(Admission {
                seq: self.shared.links.next_seq(),
                request: Arc::clone(&request),
                ready: ready_tx,
            })
            .await
            .map_err(|_| Error::PacerClosed)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled { id }),
            admitted = ready_rx => match admitted {
                Ok(()) => Ok(request),
                Err(_) => Err(Error::AdmissionAbandoned { id }),
            },
        }
    }

    /// Paces a server-to-server transfer whose bytes never traverse this
    /// process. The transfer is admitted like any other request and its
    /// budget is drained in one synthetic read loop, but the bytes are not
    /// recorded as observed bandwidth and the hard cap is only honored at
    /// tick granularity; this mode is incompatible with fine pacing.
    ///
    /// The returned channel yields the outcome once the drain completes.
    #[must_use]
    pub fn initiate_unpaceable(
        &self,
        size: u64,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (done_tx, done_rx) = oneshot::channel();
        let pacer = self.clone();
        let _ = tokio::spawn(async move {
            let _ = done_tx.send(pacer.drain_unpaceable(size, cancel).await);
        });
        done_rx
    }

    async fn drain_unpaceable(&self, size: u64, cancel: CancellationToken) -> Result<(), Error> {
        let request = self.initiate_request(size, cancel).await?;
        let mut remaining = size;
        let result = loop {
            if remaining == 0 {
                break Ok(());
            }
            match request.request_use(remaining).await {
                Ok(granted) => {
                    request.confirm_use(granted, false);
                    remaining = remaining.saturating_sub(granted);
                }
                Err(e) => break Err(e),
            }
        };
        request.discard();
        result
    }

    /// Stores a pacing ticket on an outbound request's extensions. The
    /// transport policy picks it up just before the socket and wraps the
    /// declared body direction.
    pub fn inject(
        &self,
        size: u64,
        mode: PaceMode,
        cancel: CancellationToken,
        extensions: &mut http::Extensions,
    ) {
        let _ = extensions.insert(PacerTicket::new(
            Arc::downgrade(&self.shared),
            size,
            mode,
            cancel,
        ));
    }

    /// Snapshot of the pacer state.
    #[must_use]
    pub fn report(&self) -> PacerReport {
        let queued = self
            .shared
            .admit_tx
            .max_capacity()
            .saturating_sub(self.shared.admit_tx.capacity());
        PacerReport {
            live_requests: self.shared.stats.live.load(Ordering::Relaxed),
            queued_admissions: queued,
            admitted_total: self.shared.stats.admitted.load(Ordering::Relaxed),
            discarded_total: self.shared.stats.discarded.load(Ordering::Relaxed),
        }
    }
}

/// The single task that owns the live map.
struct PacerWorker {
    recorder: BandwidthRecorder,
    config: PacerConfig,
    admit_rx: mpsc::Receiver<Admission>,
    readmit_rx: mpsc::Receiver<Readmission>,
    discard_rx: mpsc::Receiver<u64>,
    /// Buffered heads of the two queues, held between ticks so the merged
    /// first-come order never loses an already-popped entry.
    pending_admit: Option<Admission>,
    pending_readmit: Option<Readmission>,
    live: HashMap<u64, Arc<PacedRequest>>,
    cancel: CancellationToken,
    stats: Arc<PacerStats>,
    /// Every pacer handle has been dropped; quiesce once the live set drains.
    admit_closed: bool,
}

impl PacerWorker {
    async fn run(mut self) {
        let period = self.config.tick_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.on_tick();
                    if self.admit_closed
                        && self.live.is_empty()
                        && self.pending_admit.is_none()
                        && self.pending_readmit.is_none()
                    {
                        break;
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        self.drain_discards();

        let hard_limit = self.recorder.hard_limit();
        let observed = self
            .recorder
            .bandwidth()
            .bytes_per_second
            .max(self.config.pretend_bytes_per_second());
        let usable = hard_limit.map_or(observed, |h| observed.min(h));
        let target_bps = (usable as f64 * self.config.saturation_target) as u64;

        let admitted = self.admit_up_to(target_bps);

        // Without a hard limit, admission is the only pacing applied.
        if let Some(hard_bps) = hard_limit {
            self.distribute(self.config.budget_per_tick(hard_bps));
        }

        tracing::trace!(
            live = self.live.len(),
            admitted,
            target_bps,
            hard_limit,
            "allocation tick"
        );
        self.stats.live.store(self.live.len(), Ordering::Relaxed);
    }

    fn drain_discards(&mut self) {
        let mut removed = 0u64;
        while let Ok(id) = self.discard_rx.try_recv() {
            if self.live.remove(&id).is_some() {
                removed += 1;
            }
        }
        // A discard post is dropped when its queue is full; sweep the flag
        // so such requests still leave the live map.
        let before = self.live.len();
        self.live.retain(|_, req| !req.is_discarded());
        removed += (before - self.live.len()) as u64;
        if removed > 0 {
            let _ = self.stats.discarded.fetch_add(removed, Ordering::Relaxed);
        }
    }

    /// Admits queued requests while the live set's assumed minimum
    /// consumption stays under `target_bps`. Returns how many were admitted.
    ///
    /// First admissions and re-admissions are drained as one merged queue in
    /// arrival order: neither source class has priority, only how long an
    /// entry has been waiting.
    fn admit_up_to(&mut self, target_bps: u64) -> usize {
        let mut admitted = 0usize;
        let mut currently_allocated = self.live.len() as u64 * SERVICE_MINIMUM_BANDWIDTH;
        while currently_allocated < target_bps {
            let Some(next) = self.next_queued() else { break };
            let request = match next {
                Queued::Admit(Admission { request, ready, .. }) => {
                    // Discarded while buffered, or the caller cancelled
                    // while queued: nobody is waiting.
                    if request.is_discarded() || ready.send(()).is_err() {
                        continue;
                    }
                    let _ = self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                    request
                }
                Queued::Readmit(Readmission { request, .. }) => {
                    if request.is_discarded() {
                        continue;
                    }
                    request
                }
            };
            let _ = self.live.insert(request.id(), request);
            currently_allocated += SERVICE_MINIMUM_BANDWIDTH;
            admitted += 1;
        }
        admitted
    }

    /// Pops the longest-waiting entry across both queues, or `None` when
    /// both are empty.
    fn next_queued(&mut self) -> Option<Queued> {
        self.refill_queue_heads();
        let take_admit = match (self.pending_admit.as_ref(), self.pending_readmit.as_ref()) {
            (Some(admit), Some(readmit)) => admit.seq <= readmit.seq,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        if take_admit {
            self.pending_admit.take().map(Queued::Admit)
        } else {
            self.pending_readmit.take().map(Queued::Readmit)
        }
    }

    /// Fills the buffered queue heads, dropping entries whose request was
    /// already discarded while it waited.
    fn refill_queue_heads(&mut self) {
        while self.pending_admit.is_none() {
            match self.admit_rx.try_recv() {
                Ok(admission) if admission.request.is_discarded() => {}
                Ok(admission) => self.pending_admit = Some(admission),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.admit_closed = true;
                    break;
                }
            }
        }
        while self.pending_readmit.is_none() {
            match self.readmit_rx.try_recv() {
                Ok(readmission) if readmission.request.is_discarded() => {}
                Ok(readmission) => self.pending_readmit = Some(readmission),
                Err(_) => break,
            }
        }
    }

    /// Distributes `budget` bytes across the live requests for this tick.
    fn distribute(&mut self, mut budget: u64) {
        if self.live.is_empty() {
            return;
        }

        // Mercy pass: fully budget every request that fits under the
        // per-request average, so small requests finish in one tick instead
        // of trickling alongside large ones.
        let avg = budget / self.live.len() as u64;
        let small: Vec<u64> = self
            .live
            .iter()
            .filter(|(_, req)| req.remaining_allocations() <= avg)
            .map(|(id, _)| *id)
            .collect();
        for id in small {
            if let Some(req) = self.live.remove(&id) {
                let rem = req.remaining_allocations();
                let _ = req.issue_bytes(rem);
                req.mark_allocations_finished();
                budget = budget.saturating_sub(rem);
            }
        }
        if self.live.is_empty() {
            return;
        }

        let avg = budget / self.live.len() as u64;
        if avg == 0 {
            return;
        }
        let mut done = Vec::new();
        for (id, req) in &self.live {
            if req.issue_bytes(avg) == 0 {
                done.push(*id);
            }
        }
        for id in done {
            if let Some(req) = self.live.remove(&id) {
                req.mark_allocations_finished();
            }
        }
    }
}
