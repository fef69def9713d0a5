// Copyright The blobflow Authors
// SPDX-License-Identifier: Apache-2.0

//! Tower middleware applying pacing to outbound requests.
//!
//! Register [`PacerLayer`] in the outbound pipeline after the retry layer,
//! as close to the socket as possible, so a retried attempt passes through
//! it again with the body already rewound. The policy itself is stateless:
//! everything it needs rides on the request's extensions as a
//! [`PacerTicket`].
//!
//! Per request:
//! - no ticket → forward untouched (passthrough wrappers, zero accounting);
//! - ticket whose pacer has been dropped → one-shot warning, forward
//!   unpaced;
//! - upload ticket → wait for admission, wrap the request body, forward;
//! - download ticket → wait for admission, forward, and wrap the response
//!   body only when the response is a success (anything else frees the
//!   admission slot immediately).

use crate::error::Error;
use crate::stream::{PacedDownload, PacedUpload};
use crate::ticket::{PaceMode, PacerTicket};
use futures::future::BoxFuture;
use std::sync::Once;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek};
use tower::{Layer, Service};

/// Warn only once per process about tickets that outlived their pacer; the
/// traffic still flows, just unpaced.
static DEAD_TICKET_WARNING: Once = Once::new();

/// Layer producing [`PacerService`] middleware.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacerLayer;

impl PacerLayer {
    /// Creates the layer.
    #[must_use]
    pub fn new() -> Self {
        PacerLayer
    }
}

impl<S> Layer<S> for PacerLayer {
    type Service = PacerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PacerService { inner }
    }
}

/// Service that admits and wraps ticketed requests before delegating.
///
/// The inner service is cloned per request, which is the standard Tower
/// middleware pattern; admission happens inside the request future so the
/// service stays ready while requests queue.
#[derive(Debug, Clone)]
pub struct PacerService<S> {
    inner: S,
}

impl<S, B, D> Service<http::Request<B>> for PacerService<S>
where
    S: Service<http::Request<PacedUpload<B>>, Response = http::Response<D>>
        + Clone
        + Send
        + 'static,
    S::Error: From<Error> + Send,
    S::Future: Send,
    B: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    D: AsyncRead + Unpin + Send + 'static,
{
    type Response = http::Response<PacedDownload<D>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let ticket = request.extensions().get::<PacerTicket>().cloned();
            let Some(ticket) = ticket else {
                let response = inner.call(request.map(PacedUpload::passthrough)).await?;
                return Ok(response.map(PacedDownload::passthrough));
            };
            let Some(pacer) = ticket.pacer() else {
                DEAD_TICKET_WARNING.call_once(|| {
                    tracing::warn!("pacing ticket without a live pacer; forwarding unpaced");
                });
                let response = inner.call(request.map(PacedUpload::passthrough)).await?;
                return Ok(response.map(PacedDownload::passthrough));
            };

            let paced = pacer
                .initiate_request(ticket.size(), ticket.cancellation_token())
                .await
                .map_err(S::Error::from)?;
            match ticket.mode() {
                PaceMode::RequestBody => {
                    let request = request.map(|body| paced.wrap_request_body(body));
                    let response = inner.call(request).await?;
                    Ok(response.map(PacedDownload::passthrough))
                }
                PaceMode::ResponseBody => {
                    let response = inner.call(request.map(PacedUpload::passthrough)).await?;
                    if response.status().is_success() {
                        Ok(response.map(|body| paced.wrap_response_body(body)))
                    } else {
                        // Nothing will read this body under pacing: free the
                        // admission slot now.
                        paced.discard();
                        Ok(response.map(PacedDownload::passthrough))
                    }
                }
            }
        })
    }
}
