//! Span builder helpers for gateway instrumentation.

/// Create a tracing span for one inbound request through the dispatch pipeline.
///
/// Usage: `let span = gateway_request_span!(correlation_id, method, path);`
///
/// Fields recorded later by the pipeline:
/// - `client`: rate-limit key of the caller
/// - `service`: backend chosen by route resolution
/// - `user_id`: authenticated subject, when the auth gate ran
/// - `status`: final status code
/// - `stage`: pipeline stage that terminated the request, when it failed
#[macro_export]
macro_rules! gateway_request_span {
    ($correlation_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "gateway_request",
            correlation_id = %$correlation_id,
            method = %$method,
            path = %$path,
            client = tracing::field::Empty,
            service = tracing::field::Empty,
            user_id = tracing::field::Empty,
            status = tracing::field::Empty,
            stage = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for the forward to a backend.
///
/// `bytes_relayed` and `total_duration_ms` are recorded by the relay body when
/// the backend stream ends.
#[macro_export]
macro_rules! backend_forward_span {
    ($correlation_id:expr, $service:expr, $url:expr) => {
        tracing::info_span!(
            "backend_forward",
            correlation_id = %$correlation_id,
            service = %$service,
            url = %$url,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            bytes_relayed = tracing::field::Empty,
            total_duration_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a single backend health probe.
#[macro_export]
macro_rules! health_probe_span {
    ($service:expr, $url:expr) => {
        tracing::debug_span!(
            "health_probe",
            service = %$service,
            url = %$url,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
