// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! I/O wrappers that consult a [`PacedRequest`] on every read.
//!
//! Two thin wrappers share one budget gate:
//!
//! - [`PacedUpload`] wraps a seekable request body. Seeks are forwarded to
//!   the underlying stream and reported to the request, so a retry that
//!   rewinds the body re-requests budget for the re-read.
//! - [`PacedDownload`] wraps a read-only response body.
//!
//! Each read first asks the request for an allocation, trims the read to
//! what was granted, and confirms the bytes that actually moved (which also
//! feeds the bandwidth recorder). Reads return EOF once the request's
//! remaining reads hit zero. Dropping a wrapper discards its request.
//!
//! Both wrappers also come in a passthrough flavor with no request attached,
//! used by the transport policy for traffic that carries no pacing ticket:
//! pure delegation, zero accounting.

use crate::request::PacedRequest;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// Budget acquisition progress for one wrapped stream.
enum BudgetState {
    /// No allocation in hand.
    Idle,
    /// Waiting on `request_use`.
    Requesting(BoxFuture<'static, Result<u64, crate::error::Error>>),
    /// Allocation granted but not yet consumed by a read.
    Granted(u64),
}

/// The budget logic shared by both wrappers.
struct BudgetGate {
    request: Option<Arc<PacedRequest>>,
    state: BudgetState,
    /// Scratch used when a read must be trimmed below the caller's buffer.
    scratch: Vec<u8>,
}

impl BudgetGate {
    fn paced(request: Arc<PacedRequest>) -> Self {
        BudgetGate {
            request: Some(request),
            state: BudgetState::Idle,
            scratch: Vec::new(),
        }
    }

    fn passthrough() -> Self {
        BudgetGate {
            request: None,
            state: BudgetState::Idle,
            scratch: Vec::new(),
        }
    }

    /// One budgeted read: request an allocation sized to the caller's
    /// buffer, read at most that many bytes from `inner`, confirm what
    /// actually moved.
    fn poll_read<R>(
        &mut self,
        inner: &mut R,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>>
    where
        R: AsyncRead + Unpin,
    {
        let Some(request) = self.request.as_ref() else {
            return Pin::new(inner).poll_read(cx, buf);
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if request.remaining_reads() == 0 {
            // Budget-exhausted EOF: nothing filled.
            return Poll::Ready(Ok(()));
        }
        loop {
            match &mut self.state {
                BudgetState::Idle => {
                    let request = Arc::clone(request);
                    let n = buf.remaining() as u64;
                    self.state = BudgetState::Requesting(
                        async move { request.request_use(n).await }.boxed(),
                    );
                }
                BudgetState::Requesting(wait) => match wait.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        self.state = BudgetState::Idle;
                        return Poll::Ready(Err(e.into()));
                    }
                    Poll::Ready(Ok(granted)) => {
                        self.state = BudgetState::Granted(granted);
                    }
                },
                BudgetState::Granted(granted) => {
                    let granted = *granted;
                    let moved = if granted as usize >= buf.remaining() {
                        let before = buf.filled().len();
                        match Pin::new(&mut *inner).poll_read(cx, buf) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(e)) => {
                                self.state = BudgetState::Idle;
                                return Poll::Ready(Err(e));
                            }
                            Poll::Ready(Ok(())) => buf.filled().len() - before,
                        }
                    } else {
                        // Trim the read to the grant through the scratch
                        // buffer; leftover budget stays available for the
                        // next read.
                        let want = granted as usize;
                        if self.scratch.len() < want {
                            self.scratch.resize(want, 0);
                        }
                        let mut trimmed = ReadBuf::new(&mut self.scratch[..want]);
                        match Pin::new(&mut *inner).poll_read(cx, &mut trimmed) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(e)) => {
                                self.state = BudgetState::Idle;
                                return Poll::Ready(Err(e));
                            }
                            Poll::Ready(Ok(())) => {
                                let filled = trimmed.filled();
                                buf.put_slice(filled);
                                filled.len()
                            }
                        }
                    };
                    self.state = BudgetState::Idle;
                    if moved > 0 {
                        request.confirm_use(moved as u64, true);
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }

    fn discard(&self) {
        if let Some(request) = &self.request {
            request.discard();
        }
    }
}

/// Paced wrapper around a seekable request body.
pub struct PacedUpload<R> {
    inner: R,
    gate: BudgetGate,
    /// A seek we initiated is waiting for completion.
    seek_in_flight: bool,
}

impl<R> PacedUpload<R> {
    pub(crate) fn paced(request: Arc<PacedRequest>, inner: R) -> Self {
        PacedUpload {
            inner,
            gate: BudgetGate::paced(request),
            seek_in_flight: false,
        }
    }

    /// Wraps `inner` without pacing: every call delegates untouched.
    #[must_use]
    pub fn passthrough(inner: R) -> Self {
        PacedUpload {
            inner,
            gate: BudgetGate::passthrough(),
            seek_in_flight: false,
        }
    }

    /// The request this wrapper draws budget from, if it is paced.
    #[must_use]
    pub fn request(&self) -> Option<&Arc<PacedRequest>> {
        self.gate.request.as_ref()
    }
}

impl<R> AsyncRead for PacedUpload<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.gate.poll_read(&mut this.inner, cx, buf)
    }
}

impl<R> AsyncSeek for PacedUpload<R>
where
    R: AsyncSeek + Unpin,
{
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).start_seek(position);
        if result.is_ok() {
            this.seek_in_flight = true;
        }
        result
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        let this = self.get_mut();
        let position = match Pin::new(&mut this.inner).poll_complete(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.seek_in_flight = false;
                return Poll::Ready(Err(e));
            }
            Poll::Ready(Ok(position)) => position,
        };
        if this.seek_in_flight {
            this.seek_in_flight = false;
            if let Some(request) = &this.gate.request {
                request.inform_seek(position);
            }
        }
        Poll::Ready(Ok(position))
    }
}

impl<R> Drop for PacedUpload<R> {
    fn drop(&mut self) {
        self.gate.discard();
    }
}

/// Paced wrapper around a read-only response body.
pub struct PacedDownload<R> {
    inner: R,
    gate: BudgetGate,
}

impl<R> PacedDownload<R> {
    pub(crate) fn paced(request: Arc<PacedRequest>, inner: R) -> Self {
        PacedDownload {
            inner,
            gate: BudgetGate::paced(request),
        }
    }

    /// Wraps `inner` without pacing: every call delegates untouched.
    #[must_use]
    pub fn passthrough(inner: R) -> Self {
        PacedDownload {
            inner,
            gate: BudgetGate::passthrough(),
        }
    }

    /// The request this wrapper draws budget from, if it is paced.
    #[must_use]
    pub fn request(&self) -> Option<&Arc<PacedRequest>> {
        self.gate.request.as_ref()
    }
}

impl<R> AsyncRead for PacedDownload<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.gate.poll_read(&mut this.inner, cx, buf)
    }
}

impl<R> Drop for PacedDownload<R> {
    fn drop(&mut self) {
        self.gate.discard();
    }
}

impl PacedRequest {
    /// Wraps an outgoing request body so every read draws on this request's
    /// budget.
    pub fn wrap_request_body<R>(self: &Arc<Self>, inner: R) -> PacedUpload<R>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        PacedUpload::paced(Arc::clone(self), inner)
    }

    /// Wraps an incoming response body so every read draws on this request's
    /// budget.
    pub fn wrap_response_body<R>(self: &Arc<Self>, inner: R) -> PacedDownload<R>
    where
        R: AsyncRead + Unpin,
    {
        PacedDownload::paced(Arc::clone(self), inner)
    }
}
