//! Shared fixtures for unit tests: in-process backends and token minting.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use jsonwebtoken::{encode, EncodingKey, Header};

use crate::config::{CounterBackend, GatewayConfig};

pub const TEST_SECRET: &str = "test-secret-key-for-testing-only";

/// Size of the body served by `/stream...`.
pub const STREAM_BODY_LEN: usize = 2_000_000;

/// Default configuration with the test secret, in-memory counters and the
/// given services enabled at the given base URLs.
pub fn test_config(enabled: &[(&str, &str)]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.secret_key = Some(TEST_SECRET.to_string());
    config.gateway.environment = "test".to_string();
    config.rate_limit.backend = CounterBackend::Memory;
    for (name, url) in enabled {
        let svc = config.services.get_mut(*name).unwrap();
        svc.base_url = url.to_string();
        svc.enabled = true;
        svc.timeout_secs = 1;
    }
    config
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Sign `claims` with HS256.
pub fn mint_token(secret: &str, claims: serde_json::Value) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

struct BackendState {
    health_status: StatusCode,
    health_delay_ms: AtomicU64,
    health_hits: AtomicUsize,
    proxy_hits: AtomicUsize,
    stream_dropped: AtomicBool,
}

/// Flags the backend when an `/endless` body is dropped by the server.
struct StreamGuard(Arc<BackendState>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.stream_dropped.store(true, Ordering::SeqCst);
    }
}

/// A fake microservice.
///
/// - `GET /health` answers with the configured status after an optional delay.
/// - `/slow...` sleeps two seconds before answering.
/// - `/big...` returns 20 000 bytes of `x`.
/// - `/stream...` returns [`STREAM_BODY_LEN`] bytes of `z`.
/// - `/endless...` streams 4 KiB every 10 ms until the connection goes away.
/// - everything else echoes method, path, query, headers and body as JSON.
pub struct TestBackend {
    pub url: String,
    state: Arc<BackendState>,
}

impl TestBackend {
    pub async fn spawn(health_status: StatusCode) -> Self {
        let state = Arc::new(BackendState {
            health_status,
            health_delay_ms: AtomicU64::new(0),
            health_hits: AtomicUsize::new(0),
            proxy_hits: AtomicUsize::new(0),
            stream_dropped: AtomicBool::new(false),
        });
        let app = Router::new()
            .route("/health", get(health))
            .fallback(echo)
            .with_state(state.clone());
        let url = spawn(app).await;
        Self { url, state }
    }

    pub fn set_health_delay_ms(&self, ms: u64) {
        self.state.health_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn health_hits(&self) -> usize {
        self.state.health_hits.load(Ordering::SeqCst)
    }

    pub fn proxy_hits(&self) -> usize {
        self.state.proxy_hits.load(Ordering::SeqCst)
    }

    /// Whether an `/endless` response body has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.state.stream_dropped.load(Ordering::SeqCst)
    }
}

async fn health(State(state): State<Arc<BackendState>>) -> StatusCode {
    state.health_hits.fetch_add(1, Ordering::SeqCst);
    let delay = state.health_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    state.health_status
}

async fn echo(State(state): State<Arc<BackendState>>, request: Request) -> Response {
    state.proxy_hits.fetch_add(1, Ordering::SeqCst);

    let path = request.uri().path().to_string();
    if path.starts_with("/slow") {
        tokio::time::sleep(Duration::from_secs(2)).await;
        return (StatusCode::OK, "finally").into_response();
    }
    if path.starts_with("/big") {
        return (StatusCode::OK, "x".repeat(20_000)).into_response();
    }
    if path.starts_with("/stream") {
        return (StatusCode::OK, vec![b'z'; STREAM_BODY_LEN]).into_response();
    }
    if path.starts_with("/endless") {
        let guard = StreamGuard(state.clone());
        let chunks = futures::stream::unfold(guard, |guard| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((Ok::<_, Infallible>(Bytes::from(vec![b'y'; 4096])), guard))
        });
        return Response::new(Body::from_stream(chunks));
    }

    let method = request.method().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let headers: BTreeMap<String, String> = request
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let request_id = headers.get("x-request-id").cloned().unwrap_or_default();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap();

    let mut response = (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "method": method,
            "path": path,
            "query": query,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        })),
    )
        .into_response();
    let h = response.headers_mut();
    h.insert("etag", "\"v1\"".parse().unwrap());
    h.insert("cache-control", "no-store".parse().unwrap());
    h.insert("x-internal-secret", "shh".parse().unwrap());
    if let Ok(value) = request_id.parse() {
        h.insert("x-request-id", value);
    }
    response
}
