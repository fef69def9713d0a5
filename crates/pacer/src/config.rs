// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Pacing constants and tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service-side minimum sustained throughput per request, in bytes per
/// second: 1 MiB over 60 seconds (a conservative doubling of the storage
/// service's published minimum-throughput timeout rule). Every live request
/// is assumed to consume at least this much, which is what gates admission.
pub const SERVICE_MINIMUM_BANDWIDTH: u64 = 1_048_576 / 60;

/// How many requests the pacer pretends are worth admitting even when the
/// observed bandwidth is zero (e.g. during enumeration lulls). Without this
/// floor a cold start would never admit anything.
pub const DEFAULT_PRETEND_REQUEST_COUNT: u64 = 10;

/// Default fraction of the usable bandwidth the admission policy tries to
/// keep outstanding.
pub const DEFAULT_SATURATION_TARGET: f64 = 0.35;

/// Bounds within which the saturation target is honored.
pub const SATURATION_TARGET_MIN: f64 = 0.35;
/// Upper bound of the saturation target.
pub const SATURATION_TARGET_MAX: f64 = 0.5;

/// Default capacity of the admission, re-admission and discard queues.
/// Bounds how many transfers may be staged ahead of the allocation tick.
pub const DEFAULT_QUEUE_CAPACITY: usize = 300;

/// Default allocation tick. Budgets are distributed in per-tick slices, so
/// one second keeps "bytes per tick" equal to "bytes per second".
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

/// Tunables for the [`Pacer`](crate::Pacer).
///
/// The defaults are production values; tests shrink `tick_period` to drive
/// the allocator quickly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Fraction (0–1) of the hard limit or observed bandwidth the admission
    /// policy keeps outstanding. Clamped into
    /// [[`SATURATION_TARGET_MIN`], [`SATURATION_TARGET_MAX`]] by
    /// [`sanitized`](Self::sanitized).
    pub saturation_target: f64,
    /// Capacity of the admission, re-admission and discard queues.
    pub queue_capacity: usize,
    /// Period of the allocation tick, and of the starvation wait inside
    /// `request_use`.
    #[serde(with = "humantime_serde")]
    pub tick_period: Duration,
    /// Request count used to synthesize a minimum observed bandwidth.
    pub pretend_request_count: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            saturation_target: DEFAULT_SATURATION_TARGET,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tick_period: DEFAULT_TICK_PERIOD,
            pretend_request_count: DEFAULT_PRETEND_REQUEST_COUNT,
        }
    }
}

impl PacerConfig {
    /// Returns a copy with every field forced into its supported range.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.saturation_target = self
            .saturation_target
            .clamp(SATURATION_TARGET_MIN, SATURATION_TARGET_MAX);
        self.queue_capacity = self.queue_capacity.max(1);
        self.tick_period = self.tick_period.max(Duration::from_millis(1));
        self.pretend_request_count = self.pretend_request_count.max(1);
        self
    }

    /// The synthetic observed-bandwidth floor, in bytes per second.
    ///
    /// Chosen so that `pretend_bps * saturation_target` admits exactly
    /// `pretend_request_count` requests at the per-request minimum, which
    /// prevents admission deadlock when nothing has been observed yet.
    #[must_use]
    pub fn pretend_bytes_per_second(&self) -> u64 {
        let floor =
            (SERVICE_MINIMUM_BANDWIDTH * self.pretend_request_count) as f64 / self.saturation_target;
        floor as u64
    }

    /// Bytes of hard-limit budget to distribute in one tick.
    #[must_use]
    pub fn budget_per_tick(&self, hard_limit_bps: u64) -> u64 {
        (hard_limit_bps as f64 * self.tick_period.as_secs_f64()) as u64
    }
}
