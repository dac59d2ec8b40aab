//! Forwarding to backends with a streamed response relay.
//!
//! The backend body is never buffered: it is relayed chunk by chunk as the
//! client reads it, so a slow client slows the backend read and a client
//! that disconnects drops the upstream stream and its connection.
//!
//! The service timeout bounds the wait for the response head only. Once the
//! body is flowing, stalls are caught by the client's per-read timeout.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tracing::Instrument;

use super::correlation::CORRELATION_HEADER;
use crate::auth::Principal;
use crate::registry::ServiceDescriptor;

/// Largest chunk handed to the client in one frame.
pub const RELAY_CHUNK_SIZE: usize = 8192;

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// Identity headers only the gateway may set.
const USER_CONTEXT_HEADERS: &[&str] = &["x-user-id", "x-user-role", "x-user-email"];

/// Backend response headers relayed to the client. Everything else is dropped.
const RESPONSE_HEADER_ALLOWLIST: &[&str] = &[
    "content-type",
    "content-length",
    "cache-control",
    "etag",
    "last-modified",
    CORRELATION_HEADER,
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("backend connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("backend request failed: {0}")]
    Other(#[source] reqwest::Error),
}

impl ForwardError {
    fn classify(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            ForwardError::Timeout(timeout)
        } else if e.is_connect() {
            ForwardError::Connect(e)
        } else {
            ForwardError::Other(e)
        }
    }
}

/// The parts of the inbound request that are replayed against the backend.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    /// Path relative to `/api/v1/`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Replay `inbound` against `service` and stream the backend's answer back.
    pub async fn forward(
        &self,
        service: &ServiceDescriptor,
        inbound: InboundRequest,
        principal: Option<&Principal>,
        correlation_id: &str,
    ) -> Result<Response, ForwardError> {
        let mut url = service.url_for(&inbound.path);
        if let Some(query) = inbound.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        let span = turbogate_tracing::backend_forward_span!(correlation_id, &service.name, &url);
        let start = Instant::now();

        let upstream = async {
            let mut req_builder = self.client.request(inbound.method.clone(), &url);

            for (name, value) in inbound.headers.iter() {
                let name_str = name.as_str();
                if HOP_BY_HOP_HEADERS.contains(&name_str)
                    || USER_CONTEXT_HEADERS.contains(&name_str)
                    || name_str == CORRELATION_HEADER
                {
                    continue;
                }
                // reqwest sets it from the actual body
                if name_str == "content-length" {
                    continue;
                }
                req_builder = req_builder.header(name, value);
            }

            if let Some(principal) = principal {
                req_builder = req_builder
                    .header("x-user-id", &principal.user_id)
                    .header("x-user-role", &principal.role)
                    .header("x-user-email", &principal.email);
            }

            let send = req_builder
                .header(CORRELATION_HEADER, correlation_id)
                .body(inbound.body)
                .send();
            let sent = match tokio::time::timeout(service.timeout, send).await {
                Ok(result) => result.map_err(|e| ForwardError::classify(e, service.timeout)),
                Err(_) => Err(ForwardError::Timeout(service.timeout)),
            };

            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency);

            match sent {
                Ok(resp) => {
                    tracing::Span::current().record("status", resp.status().as_u16());
                    tracing::info!(
                        service = %service.name,
                        target_url = %url,
                        status_code = resp.status().as_u16(),
                        latency_ms = latency,
                        "Request forwarded successfully"
                    );
                    Ok(resp)
                }
                Err(err) => {
                    tracing::error!(
                        service = %service.name,
                        target_url = %url,
                        error = %err,
                        latency_ms = latency,
                        "Error forwarding request"
                    );
                    Err(err)
                }
            }
        }
        .instrument(span.clone())
        .await?;

        Ok(relay_response(upstream, correlation_id, span, start))
    }
}

/// Build the client response: status, allow-listed headers, streamed body.
fn relay_response(
    upstream: reqwest::Response,
    correlation_id: &str,
    span: tracing::Span,
    start: Instant,
) -> Response {
    let mut response_builder = Response::builder().status(upstream.status());

    for name in RESPONSE_HEADER_ALLOWLIST {
        if let Some(value) = upstream.headers().get(*name) {
            response_builder = response_builder.header(*name, value);
        }
    }
    if !upstream.headers().contains_key(CORRELATION_HEADER) {
        response_builder = response_builder.header(
            CORRELATION_HEADER,
            HeaderValue::from_str(correlation_id)
                .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
        );
    }

    let body = RelayBody {
        inner: Box::pin(upstream.bytes_stream()),
        pending: Bytes::new(),
        span,
        start,
        relayed: 0,
        finished: false,
    };

    response_builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build response");
            let mut response = Response::new(Body::from("internal error"));
            *response.status_mut() = axum::http::StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}

/// Relays the backend byte stream in chunks of at most [`RELAY_CHUNK_SIZE`].
///
/// Records `bytes_relayed` and `total_duration_ms` on the forward span when
/// the backend stream ends.
struct RelayBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    /// Remainder of an oversized backend chunk.
    pending: Bytes,
    span: tracing::Span,
    start: Instant,
    relayed: u64,
    finished: bool,
}

impl Stream for RelayBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if !this.pending.is_empty() {
            let n = this.pending.len().min(RELAY_CHUNK_SIZE);
            let chunk = this.pending.split_to(n);
            this.relayed += n as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(mut chunk))) => {
                if chunk.len() > RELAY_CHUNK_SIZE {
                    this.pending = chunk.split_off(RELAY_CHUNK_SIZE);
                }
                this.relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let _guard = this.span.enter();
                tracing::warn!(error = %e, bytes_relayed = this.relayed, "Backend stream failed");
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.span.record("bytes_relayed", this.relayed);
                this.span
                    .record("total_duration_ms", this.start.elapsed().as_millis() as u64);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            let _guard = self.span.enter();
            tracing::debug!(
                bytes_relayed = self.relayed,
                "Client went away mid-stream, releasing backend connection"
            );
        }
    }
}
