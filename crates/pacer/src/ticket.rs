// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! The pacing ticket carried on an outbound request's extensions.
//!
//! The planner decides which requests are paceable and in which direction;
//! the transport policy, sitting just before the socket, only reads the
//! ticket. Tickets hold a weak pacer handle: the pacer's lifetime is owned
//! by the job, not by stray requests still in flight after shutdown.

use crate::pacer::{Pacer, PacerShared};
use std::sync::Weak;
use tokio_util::sync::CancellationToken;

/// Which body of the HTTP exchange is byte-paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceMode {
    /// Pace the outgoing request body (upload).
    RequestBody,
    /// Pace the incoming response body (download).
    ResponseBody,
}

/// Value injected into [`http::Extensions`] by [`Pacer::inject`] and read by
/// the transport policy.
#[derive(Clone)]
pub struct PacerTicket {
    pacer: Weak<PacerShared>,
    size: u64,
    mode: PaceMode,
    cancel: CancellationToken,
}

impl PacerTicket {
    pub(crate) fn new(
        pacer: Weak<PacerShared>,
        size: u64,
        mode: PaceMode,
        cancel: CancellationToken,
    ) -> Self {
        PacerTicket {
            pacer,
            size,
            mode,
            cancel,
        }
    }

    /// The declared body size, in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Which body direction this ticket paces.
    #[must_use]
    pub fn mode(&self) -> PaceMode {
        self.mode
    }

    /// The cancellation token scoped to this request.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upgrades the weak pacer handle. Returns `None` when the pacer has
    /// already been dropped, in which case the policy forwards unpaced.
    #[must_use]
    pub fn pacer(&self) -> Option<Pacer> {
        self.pacer.upgrade().map(Pacer::from_shared)
    }
}

impl std::fmt::Debug for PacerTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacerTicket")
            .field("size", &self.size)
            .field("mode", &self.mode)
            .field("pacer_alive", &(self.pacer.strong_count() > 0))
            .finish()
    }
}
