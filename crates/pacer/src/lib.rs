// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Request admission and byte-budget pacing for the outbound transfer
//! pipeline.
//!
//! The pacer sits between the job scheduler and the outbound HTTP client.
//! It decides when a pending upload or download may be sent and how fast its
//! body may be read, so that aggregate throughput tracks either the observed
//! available bandwidth or a user-requested hard cap, without starving any
//! single request past the storage service's minimum-throughput timeout.
//!
//! The moving parts:
//!
//! - [`Pacer`]: admission control plus the per-tick byte-budget allocator.
//! - [`PacedRequest`]: one outstanding body with its budget counters.
//! - [`PacedUpload`] / [`PacedDownload`]: stream wrappers that consult the
//!   request on every read and report moved bytes to the bandwidth recorder.
//! - [`PacerTicket`] + [`PacerLayer`]: how a request opts into pacing. The
//!   planner injects a ticket into the request's extensions, and the tower
//!   policy just before the socket does the admission and wrapping.
//!
//! Bandwidth observation itself lives in [`blobflow_throughput`].
//!
//! # Usage sketch
//!
//! ```ignore
//! let recorder = BandwidthRecorder::new(0, 30);
//! let pacer = Pacer::new(recorder.clone(), PacerConfig::default(), shutdown.clone());
//! recorder.start_observation();
//!
//! // Per upload:
//! let mut request = http::Request::new(body);
//! pacer.inject(body_len, PaceMode::RequestBody, job_cancel.clone(), request.extensions_mut());
//! let response = transport.call(request).await?;
//! ```

pub mod config;
pub mod error;
pub mod pacer;
pub mod policy;
pub mod request;
pub mod stream;
pub mod ticket;

pub use blobflow_throughput::{Bandwidth, BandwidthRecorder, RecorderReport};
pub use config::{PacerConfig, SERVICE_MINIMUM_BANDWIDTH};
pub use error::Error;
pub use pacer::{Pacer, PacerReport};
pub use policy::{PacerLayer, PacerService};
pub use request::PacedRequest;
pub use stream::{PacedDownload, PacedUpload};
pub use ticket::{PaceMode, PacerTicket};
