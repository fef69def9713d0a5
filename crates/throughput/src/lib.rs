// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Rolling bandwidth observation for the transfer pipeline.
//!
//! The transfer scheduler needs one number to steer admission: how many
//! bytes per second the pipeline has actually been moving lately. This crate
//! provides it with two pieces:
//!
//! - [`BucketRotator`]: a fixed ring of per-second counters yielding a
//!   rolling mean without clock arithmetic on the record path.
//! - [`BandwidthRecorder`]: the shared, cloneable handle transfers report
//!   through, plus the background worker that rotates the ring and the
//!   user-requested hard-limit cell.
//!
//! Observation can be paused while the job is only enumerating sources, so
//! transfer-free seconds do not drag the average toward zero.

pub mod bucket;
pub mod recorder;

pub use bucket::BucketRotator;
pub use recorder::{Bandwidth, BandwidthRecorder, DEFAULT_ROTATION_TICK, RecorderReport};
