//! The per-request dispatch pipeline.
//!
//! Stages run in a fixed order and the first failure ends the request:
//!
//! 1. preflight (`OPTIONS` is answered immediately)
//! 2. context init (correlation id, arrival time)
//! 3. rate check
//! 4. route resolution
//! 5. enablement check
//! 6. auth gate (skipped for public endpoints)
//! 7. health gate
//! 8. forward
//!
//! Nothing is retried. Every failure is rendered as a JSON error carrying the
//! request's correlation id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::Instrument;

use crate::auth::{bearer_token, AuthValidator, Principal};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::health::{Health, HealthChecker};
use crate::proxy::correlation;
use crate::proxy::forward::{ForwardError, Forwarder, InboundRequest};
use crate::rate_limit::{self, RateDecision, RateLimiter};
use crate::registry::{ServiceDescriptor, ServiceRegistry};
use crate::stats::GatewayStats;

/// Mount point of the proxied API. Routing sees the path after it.
pub const API_PREFIX: &str = "/api/v1/";

const MAX_USER_AGENT_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RateCheck,
    Route,
    Enablement,
    Auth,
    Health,
    Forward,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::RateCheck => "rate_check",
            Stage::Route => "route",
            Stage::Enablement => "enablement",
            Stage::Auth => "auth",
            Stage::Health => "health",
            Stage::Forward => "forward",
        }
    }
}

/// State owned by one request for as long as it is being dispatched.
#[derive(Debug)]
pub struct RequestContext {
    pub correlation_id: String,
    pub arrived_at: Instant,
    pub principal: Option<Principal>,
    stage: Stage,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: correlation::generate_id(),
            arrived_at: Instant::now(),
            principal: None,
            stage: Stage::RateCheck,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.arrived_at.elapsed()
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Path relative to [`API_PREFIX`]. Empty for the bare mount point.
pub fn relative_path(uri_path: &str) -> &str {
    uri_path
        .strip_prefix(API_PREFIX)
        .or_else(|| uri_path.strip_prefix("/api/v1"))
        .unwrap_or(uri_path)
        .trim_start_matches('/')
}

/// Runs inbound API requests through the stages. Shared by all requests.
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    limiter: Arc<RateLimiter>,
    auth: AuthValidator,
    health: Arc<HealthChecker>,
    forwarder: Forwarder,
    stats: GatewayStats,
    max_body_bytes: usize,
}

impl Dispatcher {
    /// Wire the pipeline from configuration. `client` is the shared backend
    /// HTTP client used for forwarding, health probes and remote auth.
    pub fn new(
        config: &GatewayConfig,
        client: reqwest::Client,
        limiter: Arc<RateLimiter>,
        stats: GatewayStats,
    ) -> Self {
        let registry = Arc::new(ServiceRegistry::from_config(config));
        let auth = AuthValidator::new(
            config.secret_key(),
            registry.clone(),
            config.auth.remote_service.clone(),
            client.clone(),
        );
        let health = Arc::new(HealthChecker::new(client.clone(), registry.clone()));
        Self {
            registry,
            limiter,
            auth,
            health,
            forwarder: Forwarder::new(client),
            stats,
            max_body_bytes: config.server.max_body_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Dispatch one request under `/api/v1/`. `peer` is the socket address of
    /// the caller, used when no `X-Forwarded-For` is present.
    pub async fn dispatch(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        if request.method() == Method::OPTIONS {
            return (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response();
        }

        let mut ctx = RequestContext::new();
        let path = relative_path(request.uri().path()).to_string();
        let client = rate_limit::client_key(request.headers(), peer);

        let span = turbogate_tracing::gateway_request_span!(
            &ctx.correlation_id,
            request.method(),
            &path
        );
        span.record("client", client.as_str());
        self.stats.inc_requests();

        async {
            tracing::info!(
                method = %request.method(),
                path = %request.uri().path(),
                client = %client,
                user_agent = %user_agent(request.headers()),
                "Request started"
            );

            let response = match self.run(&mut ctx, &client, &path, request).await {
                Ok(response) => {
                    self.stats.inc_proxied();
                    response
                }
                Err(err) => {
                    self.stats.record_error(&err);
                    tracing::Span::current().record("stage", ctx.stage.as_str());
                    log_failure(&err, ctx.stage);
                    err.with_request_id(ctx.correlation_id.as_str())
                        .into_response()
                }
            };

            let status = response.status().as_u16();
            tracing::Span::current().record("status", status);
            tracing::info!(
                status_code = status,
                duration_ms = ctx.elapsed().as_millis() as u64,
                "Request completed"
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        client: &str,
        path: &str,
        request: Request,
    ) -> GatewayResult<Response> {
        ctx.enter(Stage::RateCheck);
        self.check_rate(client).await?;

        ctx.enter(Stage::Route);
        let service = self.resolve_route(path)?;
        tracing::Span::current().record("service", service.name.as_str());

        ctx.enter(Stage::Enablement);
        self.check_enabled(service)?;

        if !self.registry.is_public(path) {
            ctx.enter(Stage::Auth);
            let principal = self.authenticate(request.headers()).await?;
            tracing::Span::current().record("user_id", principal.user_id.as_str());
            ctx.principal = Some(principal);
        }

        ctx.enter(Stage::Health);
        self.check_health(service).await?;

        ctx.enter(Stage::Forward);
        self.forward(ctx, service, path, request).await
    }

    async fn check_rate(&self, client: &str) -> GatewayResult<()> {
        match self.limiter.allow(client).await {
            RateDecision::Allowed => Ok(()),
            RateDecision::Denied { retry_after_secs } => Err(GatewayError::RateLimited {
                limit: self.limiter.limit(),
                retry_after_secs,
            }),
        }
    }

    fn resolve_route(&self, path: &str) -> GatewayResult<&ServiceDescriptor> {
        let name = self
            .registry
            .route_for(path)
            .ok_or_else(|| GatewayError::ServiceNotFound(path.to_string()))?;
        self.registry
            .resolve(name)
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    fn check_enabled(&self, service: &ServiceDescriptor) -> GatewayResult<()> {
        if service.enabled {
            Ok(())
        } else {
            Err(GatewayError::ServiceDisabled(service.name.clone()))
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<Principal> {
        let token = bearer_token(headers).ok_or(GatewayError::MissingAuthorization)?;
        self.auth.validate(token).await.map_err(|e| {
            tracing::debug!(error = %e, "Bearer token rejected");
            GatewayError::InvalidToken
        })
    }

    async fn check_health(&self, service: &ServiceDescriptor) -> GatewayResult<()> {
        match self.health.check_one(&service.name).await {
            Health::Healthy => Ok(()),
            Health::Unhealthy | Health::NotApplicable => {
                Err(GatewayError::ServiceUnhealthy(service.name.clone()))
            }
        }
    }

    async fn forward(
        &self,
        ctx: &RequestContext,
        service: &ServiceDescriptor,
        path: &str,
        request: Request,
    ) -> GatewayResult<Response> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| GatewayError::InvalidBody(e.to_string()))?;

        let inbound = InboundRequest {
            method: parts.method,
            path: path.to_string(),
            query: parts.uri.query().map(String::from),
            headers: parts.headers,
            body,
        };

        self.forwarder
            .forward(
                service,
                inbound,
                ctx.principal.as_ref(),
                &ctx.correlation_id,
            )
            .await
            .map_err(|e| match e {
                ForwardError::Timeout(_) => GatewayError::UpstreamTimeout(service.name.clone()),
                ForwardError::Connect(_) => GatewayError::UpstreamConnect(service.name.clone()),
                ForwardError::Other(e) => GatewayError::Internal(e.to_string()),
            })
    }
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .chars()
        .take(MAX_USER_AGENT_LEN)
        .collect()
}

fn log_failure(err: &GatewayError, stage: Stage) {
    match err {
        GatewayError::Internal(detail) | GatewayError::InvalidBody(detail) => {
            tracing::error!(stage = stage.as_str(), error = %err, detail = %detail, "Request failed");
        }
        GatewayError::UpstreamConnect(_) | GatewayError::UpstreamTimeout(_) => {
            tracing::error!(stage = stage.as_str(), error = %err, "Request failed");
        }
        _ => {
            tracing::warn!(stage = stage.as_str(), error = %err, "Request rejected");
        }
    }
}
