// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Thread-safe bandwidth observation built on a [`BucketRotator`].
//!
//! A [`BandwidthRecorder`] owns one rotator and a background worker that
//! rotates it once per tick while observation is running. Transfers report
//! bytes through [`record`]; enumeration-only phases pause observation so
//! idle seconds do not drag the rolling average toward zero.
//!
//! [`record`]: BandwidthRecorder::record

use crate::bucket::BucketRotator;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Default rotation tick, matching the one-second sample buckets.
pub const DEFAULT_ROTATION_TICK: Duration = Duration::from_secs(1);

/// Capacity of the observation control channel. Start/pause messages are
/// tiny and idempotent, so a small buffer is plenty.
const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// Control messages driving the worker's {running, paused} state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObservationCmd {
    /// Resume rotation and reset the ticker phase.
    Start,
    /// Stop rotating until the next `Start`.
    Pause,
}

/// State shared between recorder handles and the rotation worker.
struct RecorderInner {
    rotator: BucketRotator,
    /// Monotonic total of every byte ever recorded.
    total: AtomicU64,
    /// User-requested ceiling in bytes per second; 0 means no hard limit.
    hard_limit: AtomicU64,
    /// Mirror of the worker's state machine, for reporting only.
    paused: AtomicBool,
}

/// Rolling observed bandwidth, as returned by [`BandwidthRecorder::bandwidth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    /// Mean bytes per second over the completed window samples.
    pub bytes_per_second: u64,
    /// True once the averaging window is full of real samples.
    pub average_ready: bool,
}

/// Point-in-time snapshot of the recorder, for logs and progress displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderReport {
    /// Observed rolling bandwidth.
    pub bandwidth: Bandwidth,
    /// Total bytes recorded since creation.
    pub total_traffic: u64,
    /// The requested hard limit, if any.
    pub hard_limit: Option<u64>,
    /// Whether observation is currently paused.
    pub paused: bool,
}

/// Records observed transfer bytes and reports a rolling average.
///
/// Cloning is cheap and every clone feeds the same window. All entry points
/// are total functions; none of them blocks.
#[derive(Clone)]
pub struct BandwidthRecorder {
    inner: Arc<RecorderInner>,
    ctrl_tx: mpsc::Sender<ObservationCmd>,
}

impl BandwidthRecorder {
    /// Creates a recorder averaging over the last `window_secs` seconds, with
    /// the default one-second rotation tick.
    ///
    /// `hard_limit_bps` of 0 means no hard limit. Observation starts in the
    /// running state. Must be called from within a Tokio runtime: the
    /// rotation worker is spawned here and exits when the last recorder
    /// handle is dropped.
    #[must_use]
    pub fn new(hard_limit_bps: u64, window_secs: usize) -> Self {
        Self::with_rotation_tick(hard_limit_bps, window_secs, DEFAULT_ROTATION_TICK)
    }

    /// Like [`new`](Self::new), with an explicit rotation tick.
    ///
    /// Shorter ticks mean each bucket covers less than a second; production
    /// uses [`DEFAULT_ROTATION_TICK`] and tests inject a few milliseconds to
    /// drive the window quickly.
    #[must_use]
    pub fn with_rotation_tick(hard_limit_bps: u64, window_secs: usize, tick: Duration) -> Self {
        let inner = Arc::new(RecorderInner {
            rotator: BucketRotator::new(window_secs),
            total: AtomicU64::new(0),
            hard_limit: AtomicU64::new(hard_limit_bps),
            paused: AtomicBool::new(false),
        });
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let worker = RotationWorker {
            inner: Arc::clone(&inner),
            ctrl_rx,
            tick,
        };
        let _ = tokio::spawn(worker.run());
        BandwidthRecorder { inner, ctrl_tx }
    }

    /// Adds `n` observed bytes to the current sample bucket and the running
    /// total. Non-blocking and O(1).
    pub fn record(&self, n: u64) {
        self.inner.rotator.add(n);
        let _ = self.inner.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Resumes observation and resets the rotation ticker. Idempotent.
    pub fn start_observation(&self) {
        let _ = self.ctrl_tx.try_send(ObservationCmd::Start);
    }

    /// Pauses observation so idle periods do not decay the average.
    /// Idempotent.
    pub fn pause_observation(&self) {
        let _ = self.ctrl_tx.try_send(ObservationCmd::Pause);
    }

    /// The rolling observed bandwidth and whether the window is full.
    #[must_use]
    pub fn bandwidth(&self) -> Bandwidth {
        Bandwidth {
            bytes_per_second: self.inner.rotator.average(),
            average_ready: self.inner.rotator.average_ready(),
        }
    }

    /// The requested hard limit in bytes per second, if one is set.
    #[must_use]
    pub fn hard_limit(&self) -> Option<u64> {
        match self.inner.hard_limit.load(Ordering::Relaxed) {
            0 => None,
            bps => Some(bps),
        }
    }

    /// Requests a hard limit. A value of 0 clears it.
    pub fn request_hard_limit(&self, bps: u64) {
        self.inner.hard_limit.store(bps, Ordering::Relaxed);
    }

    /// Removes the hard limit.
    pub fn clear_hard_limit(&self) {
        self.inner.hard_limit.store(0, Ordering::Relaxed);
    }

    /// Total bytes recorded since creation. Monotonic.
    #[must_use]
    pub fn total_traffic(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Resizes the averaging window while keeping the most recent samples.
    pub fn set_window(&self, window_secs: usize) {
        self.inner.rotator.set_size(window_secs);
    }

    /// Snapshot of the recorder state.
    #[must_use]
    pub fn report(&self) -> RecorderReport {
        RecorderReport {
            bandwidth: self.bandwidth(),
            total_traffic: self.total_traffic(),
            hard_limit: self.hard_limit(),
            paused: self.inner.paused.load(Ordering::Relaxed),
        }
    }
}

/// Background task owning the rotation ticker and the {running, paused}
/// state machine.
struct RotationWorker {
    inner: Arc<RecorderInner>,
    ctrl_rx: mpsc::Receiver<ObservationCmd>,
    tick: Duration,
}

impl RotationWorker {
    async fn run(mut self) {
        let mut running = true;
        let mut ticker = Self::fresh_ticker(self.tick);
        loop {
            tokio::select! {
                cmd = self.ctrl_rx.recv() => match cmd {
                    // All recorder handles dropped: nothing can record anymore.
                    None => break,
                    Some(ObservationCmd::Start) => {
                        running = true;
                        self.inner.paused.store(false, Ordering::Relaxed);
                        ticker = Self::fresh_ticker(self.tick);
                    }
                    Some(ObservationCmd::Pause) => {
                        running = false;
                        self.inner.paused.store(true, Ordering::Relaxed);
                    }
                },
                _ = ticker.tick(), if running => {
                    self.inner.rotator.rotate();
                }
            }
        }
    }

    fn fresh_ticker(tick: Duration) -> tokio::time::Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}
