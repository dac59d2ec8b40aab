//! Atomic gateway statistics counters.
//!
//! Lock-free counters for tracking request outcomes. All atomics use
//! `Relaxed` ordering: these are monotonic display counters with no
//! synchronization requirements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::GatewayError;

#[derive(Default)]
struct StatsInner {
    total_requests: AtomicU64,
    proxied: AtomicU64,
    rate_limited: AtomicU64,
    unauthorized: AtomicU64,
    unavailable: AtomicU64,
    not_found: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Thread-safe atomic gateway statistics. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct GatewayStats {
    inner: Arc<StatsInner>,
}

/// Snapshot of current stats values, serializable to JSON.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub proxied: u64,
    pub rate_limited: u64,
    pub unauthorized: u64,
    pub unavailable: u64,
    pub not_found: u64,
    pub upstream_errors: u64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_proxied(&self) {
        self.inner.proxied.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that ended in `err`.
    pub fn record_error(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::RateLimited { .. } => &self.inner.rate_limited,
            GatewayError::MissingAuthorization | GatewayError::InvalidToken => {
                &self.inner.unauthorized
            }
            GatewayError::ServiceDisabled(_) | GatewayError::ServiceUnhealthy(_) => {
                &self.inner.unavailable
            }
            GatewayError::ServiceNotFound(_) => &self.inner.not_found,
            GatewayError::UpstreamConnect(_)
            | GatewayError::UpstreamTimeout(_)
            | GatewayError::Internal(_) => &self.inner.upstream_errors,
            GatewayError::InvalidBody(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            total_requests: load(&self.inner.total_requests),
            proxied: load(&self.inner.proxied),
            rate_limited: load(&self.inner.rate_limited),
            unauthorized: load(&self.inner.unauthorized),
            unavailable: load(&self.inner.unavailable),
            not_found: load(&self.inner.not_found),
            upstream_errors: load(&self.inner.upstream_errors),
        }
    }
}
