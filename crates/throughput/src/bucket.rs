// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Ring of per-second sample buckets used to compute a rolling byte rate.
//!
//! The ring holds `window + 1` slots: one "current" bucket that is still
//! accumulating, plus `window` completed samples. A caller-driven [`rotate`]
//! (once per second in production) completes the current bucket and reuses
//! the oldest slot, so the average never needs clock arithmetic on the hot
//! path.
//!
//! [`rotate`]: BucketRotator::rotate

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring storage plus the bookkeeping that [`BucketRotator::rotate`] and
/// [`BucketRotator::set_size`] mutate under the exclusive lock.
struct Ring {
    /// `window + 1` counters; `slots[current]` is still accumulating.
    slots: Vec<AtomicU64>,
    /// Index of the bucket currently receiving samples.
    current: usize,
    /// Number of completed buckets holding real samples, capped at the window.
    samples: usize,
}

impl Ring {
    /// Logical capacity: the number of completed samples the ring can hold.
    fn window(&self) -> usize {
        self.slots.len() - 1
    }
}

/// Fixed-size ring of non-negative counters yielding a rolling average.
///
/// `add` runs under the shared lock with an atomic add on the current slot,
/// so concurrent recorders never contend with each other. `rotate` and
/// `set_size` take the exclusive lock because they move the ring structure
/// itself.
pub struct BucketRotator {
    ring: RwLock<Ring>,
}

impl BucketRotator {
    /// Creates a rotator averaging over the last `window` completed samples.
    #[must_use]
    pub fn new(window: usize) -> Self {
        let slots = std::iter::repeat_with(|| AtomicU64::new(0))
            .take(window + 1)
            .collect();
        BucketRotator {
            ring: RwLock::new(Ring {
                slots,
                current: 0,
                samples: 0,
            }),
        }
    }

    /// Adds `v` to the bucket currently accumulating.
    pub fn add(&self, v: u64) {
        let ring = self.ring.read();
        let _ = ring.slots[ring.current].fetch_add(v, Ordering::Relaxed);
    }

    /// Completes the current bucket and starts accumulating into the next one.
    ///
    /// The newly current slot is zeroed; the completed-sample count grows
    /// until the ring is full.
    pub fn rotate(&self) {
        let mut ring = self.ring.write();
        ring.current = (ring.current + 1) % ring.slots.len();
        let current = ring.current;
        ring.slots[current].store(0, Ordering::Relaxed);
        ring.samples = (ring.samples + 1).min(ring.window());
    }

    /// Mean of the completed samples, skipping the still-accumulating bucket.
    ///
    /// Returns 0 while no bucket has completed yet.
    #[must_use]
    pub fn average(&self) -> u64 {
        let ring = self.ring.read();
        if ring.samples == 0 {
            return 0;
        }
        let len = ring.slots.len();
        let mut sum: u64 = 0;
        for age in 1..=ring.samples {
            let idx = (ring.current + len - age) % len;
            sum = sum.saturating_add(ring.slots[idx].load(Ordering::Relaxed));
        }
        sum / ring.samples as u64
    }

    /// True once every slot of the window holds a real sample.
    #[must_use]
    pub fn average_ready(&self) -> bool {
        let ring = self.ring.read();
        ring.window() > 0 && ring.samples == ring.window()
    }

    /// Current averaging window, in samples.
    #[must_use]
    pub fn size(&self) -> usize {
        self.ring.read().window()
    }

    /// Resizes the averaging window without losing the most recent samples.
    ///
    /// Growing splices zeroed slots immediately after the current bucket,
    /// where they age out first. Shrinking drops slots from the same stale
    /// side, so the surviving samples are always the most recent ones.
    pub fn set_size(&self, window: usize) {
        let mut ring = self.ring.write();
        let new_len = window + 1;
        let old_len = ring.slots.len();
        if new_len > old_len {
            let insert_at = ring.current + 1;
            let zeros = std::iter::repeat_with(|| AtomicU64::new(0)).take(new_len - old_len);
            let replaced: Vec<AtomicU64> = ring.slots.splice(insert_at..insert_at, zeros).collect();
            debug_assert!(replaced.is_empty());
        } else if new_len < old_len {
            for _ in 0..old_len - new_len {
                if ring.current + 1 < ring.slots.len() {
                    let idx = ring.current + 1;
                    let _ = ring.slots.remove(idx);
                } else {
                    // Current bucket sits at the end: the stale side wraps to
                    // the front, and removing there shifts every index down.
                    let _ = ring.slots.remove(0);
                    ring.current -= 1;
                }
            }
            ring.samples = ring.samples.min(window);
        }
    }
}
