//! Axum HTTP server: router, operator endpoints, CORS, graceful shutdown.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::{Json, Router};
use http::{header, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::GatewayConfig;
use crate::health::HealthReport;
use crate::pipeline::Dispatcher;
use crate::proxy::correlation::{self, CORRELATION_HEADER};
use crate::rate_limit::StoreStatus;
use crate::stats::StatsSnapshot;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            started_at: Instant::now(),
        }
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors.origins);

    Router::new()
        .route("/gateway/health", get(handle_gateway_health))
        .route("/health", get(handle_gateway_health))
        .route("/gateway/health/services", get(handle_services_health))
        .route("/gateway/info", get(handle_info))
        .route("/metrics", get(handle_metrics))
        .route("/api/v1", api_methods())
        .route("/api/v1/", api_methods())
        .route("/api/v1/{*path}", api_methods())
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(state)
}

/// Build and run the HTTP server.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let name = state.config.gateway.name.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, gateway = %name, "TurboGate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("TurboGate shut down gracefully");
    Ok(())
}

fn api_methods() -> MethodRouter<AppState> {
    get(handle_api)
        .post(handle_api)
        .put(handle_api)
        .delete(handle_api)
        .patch(handle_api)
        .options(handle_api)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let request_id = HeaderName::from_static(CORRELATION_HEADER);
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, request_id.clone()])
        .expose_headers([request_id])
        .max_age(Duration::from_secs(3600));

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Every method under `/api/v1/` goes through the dispatch pipeline.
async fn handle_api(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    state.dispatcher.dispatch(request, peer).await
}

/// GET /gateway/health: liveness of the gateway itself.
async fn handle_gateway_health(State(state): State<AppState>) -> Response {
    let redis = state.dispatcher.limiter().status().await;
    Json(json!({
        "gateway": state.config.gateway.name,
        "status": "healthy",
        "version": VERSION,
        "redis": redis.as_str(),
        "env": state.config.gateway.environment,
        "timestamp": unix_timestamp(),
    }))
    .into_response()
}

/// GET /gateway/health/services: probe every enabled backend.
async fn handle_services_health(State(state): State<AppState>) -> Response {
    let results = state.dispatcher.health().check_all().await;
    Json(HealthReport::from_results(&results)).into_response()
}

/// GET /gateway/info
async fn handle_info(State(state): State<AppState>) -> Response {
    let registry = state.dispatcher.registry();
    let environment = if state.config.is_debug() {
        "development"
    } else {
        "production"
    };
    Json(json!({
        "name": state.config.gateway.name,
        "version": VERSION,
        "api_version": state.config.gateway.api_version,
        "environment": environment,
        "enabled_services": registry.enabled_services(),
        "rate_limit": state.config.rate_limit.per_minute,
        "routes": registry.route_prefixes(),
    }))
    .into_response()
}

#[derive(Serialize)]
struct Metrics<'a> {
    gateway: &'a str,
    version: &'static str,
    uptime: f64,
    redis_connected: bool,
    services_health: BTreeMap<String, Option<bool>>,
    #[serde(flatten)]
    requests: StatsSnapshot,
}

/// GET /metrics
async fn handle_metrics(State(state): State<AppState>) -> Response {
    let redis_connected = state.dispatcher.limiter().status().await == StoreStatus::Connected;
    let services_health = state
        .dispatcher
        .health()
        .check_all()
        .await
        .into_iter()
        .map(|(name, health)| (name, health.as_report()))
        .collect();

    Json(Metrics {
        gateway: &state.config.gateway.name,
        version: VERSION,
        uptime: state.started_at.elapsed().as_secs_f64(),
        redis_connected,
        services_health,
        requests: state.dispatcher.stats().snapshot(),
    })
    .into_response()
}

async fn handle_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "message": "Endpoint not found",
            "request_id": correlation::generate_id(),
        })),
    )
        .into_response()
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
