// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors produced by the pacer.
//!
//! Note: everything here can surface through an I/O wrapper, so variants
//! carry only `Send + Sync` data.

/// All errors that can occur while pacing a request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request's cancellation token fired while it was waiting for
    /// admission or for byte budget.
    #[error("request {id} was cancelled while waiting for the pacer")]
    Cancelled {
        /// Identifier of the cancelled request.
        id: u64,
    },

    /// The pacer worker has shut down and no longer accepts requests.
    #[error("the pacer is shut down")]
    PacerClosed,

    /// The pacer dropped this request's admission signal without admitting
    /// it, which only happens while the worker is shutting down.
    #[error("admission of request {id} was abandoned by the pacer")]
    AdmissionAbandoned {
        /// Identifier of the abandoned request.
        id: u64,
    },
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Cancelled { .. } => std::io::Error::new(std::io::ErrorKind::Interrupted, value),
            Error::PacerClosed | Error::AdmissionAbandoned { .. } => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, value)
            }
        }
    }
}
