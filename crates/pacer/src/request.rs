// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! A single outstanding HTTP body and its byte-budget accounting.
//!
//! Every paced transfer is represented by one [`PacedRequest`] holding four
//! monotonic counters:
//!
//! - `requested`: bytes this request wants budgeted over its lifetime. Starts
//!   at the declared body size and only ever grows (retry rewinds enlarge it,
//!   nothing shrinks it).
//! - `allocated`: bytes the allocation tick (or, without a hard limit, the
//!   request itself) has issued so far.
//! - `used`: bytes actually moved through the wrapped stream.
//! - `read_head`: current position in the body; advances with reads and is
//!   rewritten by seeks without consuming budget.
//!
//! The counters are independently atomic and satisfy
//! `used <= allocated <= requested` only because exactly one stream wrapper
//! drives `request_use`/`confirm_use`; the wrappers in [`crate::stream`] are
//! single-consumer by construction. Because `requested` never shrinks, a
//! request that rewinds many times is slightly over-weighted in admission
//! accounting; that bias is accepted.

use crate::config::PacerConfig;
use crate::error::Error;
use blobflow_throughput::BandwidthRecorder;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Warn only once per process when a transport over-consumes its budget;
/// failing the transfer outright would fail otherwise-correct traffic.
static OVERDRAW_WARNING: Once = Once::new();

/// A request re-entering the allocator after a retry rewound its body.
///
/// Tagged with the same arrival sequence the admission queue uses, so the
/// tick can drain both queues in true first-come order.
pub(crate) struct Readmission {
    pub(crate) seq: u64,
    pub(crate) request: Arc<PacedRequest>,
}

/// Shared handles a request needs to talk back to its pacer.
///
/// The pacer's live map holds the strong reference to each request; requests
/// hold only these channel handles, so there is no reference cycle back to
/// the worker.
pub(crate) struct PacerLinks {
    pub(crate) recorder: BandwidthRecorder,
    pub(crate) readmit_tx: mpsc::Sender<Readmission>,
    pub(crate) discard_tx: mpsc::Sender<u64>,
    pub(crate) tick_period: Duration,
    /// Arrival order shared by the admission and re-admission queues.
    admission_seq: AtomicU64,
}

impl PacerLinks {
    pub(crate) fn new(
        recorder: BandwidthRecorder,
        readmit_tx: mpsc::Sender<Readmission>,
        discard_tx: mpsc::Sender<u64>,
        config: &PacerConfig,
    ) -> Arc<Self> {
        Arc::new(PacerLinks {
            recorder,
            readmit_tx,
            discard_tx,
            tick_period: config.tick_period,
            admission_seq: AtomicU64::new(0),
        })
    }

    /// Stamps the next queue entry with its arrival position.
    pub(crate) fn next_seq(&self) -> u64 {
        self.admission_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// One admitted transfer body, with its budget counters.
///
/// Created by the pacer on admission; owned jointly by the pacer's live map
/// and by the stream wrapper. Whichever holder observes closure first calls
/// [`discard`](Self::discard); the second call is a no-op.
pub struct PacedRequest {
    id: u64,
    body_size: u64,
    requested: AtomicU64,
    allocated: AtomicU64,
    used: AtomicU64,
    read_head: AtomicU64,
    /// Set when the allocator has stopped issuing to this request (fully
    /// budgeted, or discarded). A starved reader that finds this set asks
    /// for re-admission.
    allocations_finished: AtomicBool,
    discarded: AtomicBool,
    links: Arc<PacerLinks>,
    cancel: tokio_util::sync::CancellationToken,
}

impl PacedRequest {
    pub(crate) fn new(
        id: u64,
        body_size: u64,
        links: Arc<PacerLinks>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Arc<Self> {
        Arc::new(PacedRequest {
            id,
            body_size,
            requested: AtomicU64::new(body_size),
            allocated: AtomicU64::new(0),
            used: AtomicU64::new(0),
            read_head: AtomicU64::new(0),
            allocations_finished: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            links,
            cancel,
        })
    }

    /// Unique identifier of this request within its pacer.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The body size declared at admission.
    #[must_use]
    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    /// Lifetime byte budget this request wants. Never shrinks.
    #[must_use]
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    /// Bytes issued to this request so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Bytes actually moved through the wrapped stream.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Current position in the body.
    #[must_use]
    pub fn read_head(&self) -> u64 {
        self.read_head.load(Ordering::Relaxed)
    }

    /// Budget not yet issued: `requested - allocated`.
    #[must_use]
    pub fn remaining_allocations(&self) -> u64 {
        self.requested().saturating_sub(self.allocated())
    }

    /// Body bytes not yet read: `requested - read_head`.
    #[must_use]
    pub fn remaining_reads(&self) -> u64 {
        self.requested().saturating_sub(self.read_head())
    }

    /// Whether this request has been discarded.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Issued-but-unconsumed budget: `allocated - used`.
    fn available(&self) -> u64 {
        self.allocated().saturating_sub(self.used())
    }

    /// Issues up to `n` bytes of budget, clamped so `allocated` can never
    /// pass `requested`. Returns the new remaining allocations; 0 tells the
    /// allocator this request is fully budgeted.
    ///
    /// Called only from the pacer's allocation tick.
    pub(crate) fn issue_bytes(&self, n: u64) -> u64 {
        let grant = n.min(self.remaining_allocations());
        if grant > 0 {
            let _ = self.allocated.fetch_add(grant, Ordering::Relaxed);
        }
        self.remaining_allocations()
    }

    pub(crate) fn mark_allocations_finished(&self) {
        self.allocations_finished.store(true, Ordering::Relaxed);
    }

    /// Records a seek of the underlying body to `new_pos`.
    ///
    /// `requested` is never reduced, even when the seek moved forward:
    /// de-allocating mid-request could make the allocator drop this request
    /// while its stream still reads. A backward seek past already-used bytes
    /// grows `requested` by exactly the re-read shortfall so a retried body
    /// can be budgeted again.
    pub fn inform_seek(&self, new_pos: u64) {
        // Post-seek remaining reads exceed the outstanding budget
        // (requested - used) exactly when the seek rewound past already-used
        // bytes; the shortfall between the two is used - new_pos.
        let shortfall = self.used().saturating_sub(new_pos);
        if shortfall > 0 {
            let _ = self.requested.fetch_add(shortfall, Ordering::Relaxed);
        }
        self.read_head.store(new_pos, Ordering::Relaxed);
    }

    /// Makes sure the allocator has something left to issue while body bytes
    /// remain unread. Rewinds normally restore this through
    /// [`inform_seek`](Self::inform_seek); this is the backstop for a
    /// request revived in any other state.
    fn ensure_outstanding_budget(&self) {
        let remaining_reads = self.remaining_reads();
        if self.remaining_allocations() == 0 && remaining_reads > 0 {
            let _ = self.requested.fetch_add(remaining_reads, Ordering::Relaxed);
        }
    }

    /// Asks for permission to move up to `n` bytes, returning how many may
    /// actually be moved right now.
    ///
    /// Without a hard limit the request allocates to itself and never waits;
    /// once the self-allocation covers `requested` the request discards
    /// itself so the pacer can free its slot immediately. With a hard limit
    /// the caller waits, at allocation-tick granularity, until the allocator
    /// issues budget; if the allocator has already finished with this
    /// request (fully budgeted before a retry rewound the body), it asks for
    /// re-admission and keeps waiting.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when the request's cancellation token fires
    /// during the wait, [`Error::PacerClosed`] when the pacer worker is gone.
    pub async fn request_use(self: &Arc<Self>, n: u64) -> Result<u64, Error> {
        if n == 0 {
            return Ok(0);
        }
        if self.links.recorder.hard_limit().is_none() {
            let clamped = n.min(self.remaining_allocations());
            if clamped > 0 {
                let _ = self.allocated.fetch_add(clamped, Ordering::Relaxed);
            }
            if self.allocated() >= self.requested() {
                self.discard();
            }
            return Ok(n);
        }

        let tick = self.links.tick_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let available = self.available();
            if available > 0 {
                return Ok(available.min(n));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled { id: self.id });
                }
                _ = ticker.tick() => {
                    if self.available() == 0
                        && self.allocations_finished.load(Ordering::Relaxed)
                    {
                        self.reanimate().await?;
                    }
                }
            }
        }
    }

    /// Re-enters the allocator through the re-admission queue after the
    /// allocator finished with this request while bytes remain to read.
    async fn reanimate(self: &Arc<Self>) -> Result<(), Error> {
        self.ensure_outstanding_budget();
        if self.allocations_finished.swap(false, Ordering::Relaxed) {
            let readmission = Readmission {
                seq: self.links.next_seq(),
                request: Arc::clone(self),
            };
            self.links
                .readmit_tx
                .send(readmission)
                .await
                .map_err(|_| Error::PacerClosed)?;
        }
        Ok(())
    }

    /// Confirms that `k` bytes actually moved, advancing `used` and the read
    /// head. When `record` is set the bytes feed the bandwidth recorder;
    /// server-to-server traffic confirms without recording.
    ///
    /// A transport occasionally reads more than it was offered because of
    /// internal buffering; that overdraw is tolerated with a one-shot
    /// warning and the budget counters are grown to match.
    pub fn confirm_use(&self, k: u64, record: bool) {
        let _ = self.read_head.fetch_add(k, Ordering::Relaxed);
        let used = self.used.fetch_add(k, Ordering::Relaxed) + k;
        if used > self.allocated() {
            OVERDRAW_WARNING.call_once(|| {
                tracing::warn!(
                    request = self.id,
                    used,
                    "transport consumed more bytes than were allocated; growing the budget to match"
                );
            });
            let _ = self.allocated.fetch_max(used, Ordering::Relaxed);
            let _ = self.requested.fetch_max(used, Ordering::Relaxed);
        }
        if record {
            self.links.recorder.record(k);
        }
    }

    /// Marks this request as needing no further budget and queues it for
    /// removal from the pacer's live map. Safe to call from any holder;
    /// repeated calls are silent no-ops.
    pub fn discard(&self) {
        if self.discarded.swap(true, Ordering::Relaxed) {
            return;
        }
        self.allocations_finished.store(true, Ordering::Relaxed);
        let _ = self.links.discard_tx.try_send(self.id);
    }
}

impl std::fmt::Debug for PacedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacedRequest")
            .field("id", &self.id)
            .field("body_size", &self.body_size)
            .field("requested", &self.requested())
            .field("allocated", &self.allocated())
            .field("used", &self.used())
            .field("read_head", &self.read_head())
            .field("discarded", &self.is_discarded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobflow_throughput::BandwidthRecorder;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    const TICK: Duration = Duration::from_millis(10);

    struct Harness {
        links: Arc<PacerLinks>,
        readmit_rx: mpsc::Receiver<Readmission>,
        discard_rx: mpsc::Receiver<u64>,
    }

    fn harness(hard_limit_bps: u64) -> Harness {
        let recorder = BandwidthRecorder::with_rotation_tick(hard_limit_bps, 4, TICK);
        let (readmit_tx, readmit_rx) = mpsc::channel(16);
        let (discard_tx, discard_rx) = mpsc::channel(16);
        let config = PacerConfig {
            tick_period: TICK,
            ..PacerConfig::default()
        };
        Harness {
            links: PacerLinks::new(recorder, readmit_tx, discard_tx, &config),
            readmit_rx,
            discard_rx,
        }
    }

    fn request(h: &Harness, size: u64) -> Arc<PacedRequest> {
        PacedRequest::new(1, size, Arc::clone(&h.links), CancellationToken::new())
    }

    #[tokio::test]
    async fn issue_bytes_clamps_to_requested() {
        let h = harness(1000);
        let req = request(&h, 100);
        assert_eq!(req.issue_bytes(60), 40);
        assert_eq!(req.issue_bytes(60), 0);
        assert_eq!(req.allocated(), 100);
        assert_eq!(req.requested(), 100);
    }

    #[tokio::test]
    async fn counters_conserve_budget() {
        let h = harness(1000);
        let req = request(&h, 100);
        let _ = req.issue_bytes(50);
        req.confirm_use(30, false);
        assert!(req.used() <= req.allocated());
        assert!(req.allocated() <= req.requested());
        assert_eq!(req.read_head(), 30);
        assert_eq!(req.remaining_reads(), 70);
    }

    #[tokio::test]
    async fn request_use_without_limit_self_allocates_and_discards() {
        let mut h = harness(0);
        let req = request(&h, 100);
        let granted = req.request_use(100).await.expect("grant");
        assert_eq!(granted, 100);
        assert_eq!(req.allocated(), 100);
        // Fully self-allocated: the request frees its own slot.
        assert!(req.is_discarded());
        assert_eq!(h.discard_rx.recv().await, Some(req.id()));
    }

    #[tokio::test]
    async fn request_use_without_limit_never_overshoots_requested() {
        let h = harness(0);
        let req = request(&h, 100);
        let granted = req.request_use(64).await.expect("grant");
        assert_eq!(granted, 64);
        let granted = req.request_use(64).await.expect("grant");
        assert_eq!(granted, 64);
        // allocated is clamped at requested even though the grants overshoot.
        assert_eq!(req.allocated(), 100);
        assert!(req.is_discarded());
    }

    #[tokio::test]
    async fn request_use_with_limit_waits_for_issue() {
        let h = harness(1_000_000);
        let req = request(&h, 100);

        let waiter = {
            let req = Arc::clone(&req);
            tokio::spawn(async move { req.request_use(80).await })
        };
        // No budget yet: the waiter must still be parked after a few ticks.
        tokio::time::sleep(TICK * 3).await;
        assert!(!waiter.is_finished());

        let _ = req.issue_bytes(50);
        let granted = timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .expect("join")
            .expect("grant");
        assert_eq!(granted, 50);
    }

    #[tokio::test]
    async fn request_use_with_limit_grants_min_of_available_and_n() {
        let h = harness(1_000_000);
        let req = request(&h, 100);
        let _ = req.issue_bytes(100);
        assert_eq!(req.request_use(30).await.expect("grant"), 30);
        req.confirm_use(30, false);
        assert_eq!(req.request_use(100).await.expect("grant"), 70);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let h = harness(1_000_000);
        let cancel = CancellationToken::new();
        let req = PacedRequest::new(9, 100, Arc::clone(&h.links), cancel.clone());

        let waiter = {
            let req = Arc::clone(&req);
            tokio::spawn(async move { req.request_use(10).await })
        };
        cancel.cancel();
        let result = timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .expect("join");
        assert_eq!(result, Err(Error::Cancelled { id: 9 }));
    }

    #[tokio::test]
    async fn rewind_grows_requested_by_the_shortfall() {
        let h = harness(0);
        let req = request(&h, 8_000);
        // Read 5 000 bytes, then the retry rewinds to the start.
        let _ = req.request_use(5_000).await.expect("grant");
        req.confirm_use(5_000, false);
        req.inform_seek(0);

        assert_eq!(req.read_head(), 0);
        assert_eq!(req.requested(), 13_000);
        assert_eq!(req.remaining_reads(), 13_000);
    }

    #[tokio::test]
    async fn forward_seek_never_shrinks_requested() {
        let h = harness(1000);
        let req = request(&h, 8_000);
        req.inform_seek(6_000);
        assert_eq!(req.requested(), 8_000);
        assert_eq!(req.remaining_reads(), 2_000);
    }

    #[tokio::test]
    async fn overdraw_grows_budget_to_match() {
        let h = harness(1000);
        let req = request(&h, 100);
        let _ = req.issue_bytes(10);
        // Transport buffered ahead and consumed more than it was offered.
        req.confirm_use(25, false);
        assert_eq!(req.used(), 25);
        assert_eq!(req.allocated(), 25);
        assert!(req.requested() >= 100);
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let mut h = harness(1000);
        let req = request(&h, 100);
        req.discard();
        req.discard();
        assert_eq!(h.discard_rx.recv().await, Some(req.id()));
        // Second discard posted nothing.
        assert!(h.discard_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn starved_finished_request_asks_for_readmission() {
        let mut h = harness(1_000_000);
        let req = request(&h, 1_000);
        // Fully budget and consume the body, then finish the request the way
        // the allocator would.
        let _ = req.issue_bytes(1_000);
        req.confirm_use(1_000, false);
        req.mark_allocations_finished();
        // Retry rewinds to the start and reads again.
        req.inform_seek(0);

        let waiter = {
            let req = Arc::clone(&req);
            tokio::spawn(async move { req.request_use(500).await })
        };
        let revived = timeout(Duration::from_secs(5), h.readmit_rx.recv())
            .await
            .expect("readmission requested")
            .expect("queue open");
        assert_eq!(revived.request.id(), req.id());
        // Rewound past 1 000 used bytes: the lifetime budget grew to cover
        // the re-read.
        assert_eq!(req.requested(), 2_000);

        let _ = revived.request.issue_bytes(400);
        let granted = timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .expect("join")
            .expect("grant");
        assert_eq!(granted, 400);
    }
}
