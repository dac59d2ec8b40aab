//! turbogate: API gateway routing, authenticating and rate-limiting requests
//! to backend microservices.

mod auth;
mod config;
mod error;
mod health;
mod pipeline;
mod proxy;
mod rate_limit;
mod registry;
mod server;
mod stats;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use config::GatewayConfig;
use pipeline::Dispatcher;
use rate_limit::RateLimiter;
use server::AppState;
use stats::GatewayStats;

const DEFAULT_GATEWAY_URL: &str = "http://localhost:5000";

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();

    if args.get(1).map(String::as_str) == Some("health") {
        let url = flag_value(&args, "--url").unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());
        let healthy = check_gateway(&url)?;
        if !healthy {
            std::process::exit(1);
        }
        return Ok(());
    }

    let config_path = flag_value(&args, "--config")
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("TURBOGATE_CONFIG").ok())
        .unwrap_or_else(|| "turbogate.toml".to_string());

    let config = GatewayConfig::load(&config_path)?;

    // Build the tokio runtime first, the gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = turbogate_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            environment = %config.gateway.environment,
            services = config.services.values().filter(|s| s.enabled).count(),
            otlp_export = tracing_guard.exporting(),
            "Starting TurboGate"
        );

        run(config).await
    })
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    // One pooled client for forwarding, health probes and remote auth.
    // Each service timeout bounds the wait for response headers; a streamed
    // body only fails when a single read stalls for longer than this.
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(90))
        .read_timeout(config.backend_read_timeout())
        .connect_timeout(Duration::from_secs(5))
        .build()?;

    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit).await);
    let dispatcher = Dispatcher::new(&config, client, limiter, GatewayStats::new());
    let state = AppState::new(config, dispatcher);

    server::run(state).await
}

/// `turbogate health`: probe a running gateway and print the outcome.
fn check_gateway(base_url: &str) -> anyhow::Result<bool> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let url = format!("{}/gateway/health", base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        match client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                println!("Gateway is healthy");
                println!("Status: {body}");
                Ok(true)
            }
            Ok(resp) => {
                println!("Gateway unhealthy: {}", resp.status().as_u16());
                Ok(false)
            }
            Err(e) => {
                println!("Gateway unreachable: {e}");
                Ok(false)
            }
        }
    })
}
