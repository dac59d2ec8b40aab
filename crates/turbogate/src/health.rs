//! Backend health probing.
//!
//! Results are never cached: every dispatch probes its backend again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;

use crate::registry::{ServiceDescriptor, ServiceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    /// Service is disabled and was not probed. Only reported by `check_all`.
    NotApplicable,
}

impl Health {
    /// Operator-facing form: `null` for disabled services.
    pub fn as_report(self) -> Option<bool> {
        match self {
            Health::Healthy => Some(true),
            Health::Unhealthy => Some(false),
            Health::NotApplicable => None,
        }
    }
}

pub struct HealthChecker {
    client: reqwest::Client,
    registry: Arc<ServiceRegistry>,
}

impl HealthChecker {
    pub fn new(client: reqwest::Client, registry: Arc<ServiceRegistry>) -> Self {
        Self { client, registry }
    }

    /// Probe one service. Disabled and unknown services are not probed and
    /// count as unhealthy.
    pub async fn check_one(&self, name: &str) -> Health {
        match self.registry.resolve(name) {
            Ok(service) if service.enabled => self.probe(service).await,
            _ => Health::Unhealthy,
        }
    }

    /// Probe every enabled service concurrently.
    pub async fn check_all(&self) -> BTreeMap<String, Health> {
        let probes = self.registry.services().map(|service| async move {
            let health = if service.enabled {
                self.probe(service).await
            } else {
                Health::NotApplicable
            };
            (service.name.clone(), health)
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    async fn probe(&self, service: &ServiceDescriptor) -> Health {
        let url = service.url_for(&service.health_path);
        let span = turbogate_tracing::health_probe_span!(&service.name, &url);
        let start = Instant::now();

        async {
            let result = self
                .client
                .get(&url)
                .timeout(service.timeout)
                .send()
                .await;
            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency);

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    tracing::Span::current().record("status", status.as_u16());
                    let healthy = status == reqwest::StatusCode::OK;
                    tracing::debug!(
                        service = %service.name,
                        healthy = healthy,
                        "Health check complete"
                    );
                    if healthy {
                        Health::Healthy
                    } else {
                        Health::Unhealthy
                    }
                }
                Err(e) => {
                    tracing::error!(
                        service = %service.name,
                        error = %e,
                        timeout = e.is_timeout(),
                        "Health check failed"
                    );
                    Health::Unhealthy
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Aggregate health of all configured services.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: &'static str,
    pub services: BTreeMap<String, Option<bool>>,
    pub enabled_count: usize,
    pub healthy_count: usize,
}

impl HealthReport {
    pub fn from_results(results: &BTreeMap<String, Health>) -> Self {
        let services: BTreeMap<String, Option<bool>> = results
            .iter()
            .map(|(name, health)| (name.clone(), health.as_report()))
            .collect();
        let enabled_count = services.values().filter(|v| v.is_some()).count();
        let healthy_count = services.values().filter(|v| **v == Some(true)).count();

        let status = if enabled_count == 0 {
            "no_services"
        } else if healthy_count == enabled_count {
            "healthy"
        } else {
            "degraded"
        };

        Self {
            status,
            services,
            enabled_count,
            healthy_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::test_support::TestBackend;
    use axum::http::StatusCode;

    fn checker(services: &[(&str, &str, bool, u64)]) -> HealthChecker {
        let mut config = GatewayConfig::default();
        for (name, url, enabled, timeout_secs) in services {
            let svc = config.services.get_mut(*name).unwrap();
            svc.base_url = url.to_string();
            svc.enabled = *enabled;
            svc.timeout_secs = *timeout_secs;
        }
        let registry = Arc::new(ServiceRegistry::from_config(&config));
        HealthChecker::new(reqwest::Client::new(), registry)
    }

    #[tokio::test]
    async fn test_healthy_backend() {
        let backend = TestBackend::spawn(StatusCode::OK).await;
        let hc = checker(&[("jobs", &backend.url, true, 5)]);
        assert_eq!(hc.check_one("jobs").await, Health::Healthy);
        assert_eq!(backend.health_hits(), 1);
        // No caching between checks.
        assert_eq!(hc.check_one("jobs").await, Health::Healthy);
        assert_eq!(backend.health_hits(), 2);
    }

    #[tokio::test]
    async fn test_non_200_is_unhealthy() {
        let backend = TestBackend::spawn(StatusCode::SERVICE_UNAVAILABLE).await;
        let hc = checker(&[("jobs", &backend.url, true, 5)]);
        assert_eq!(hc.check_one("jobs").await, Health::Unhealthy);

        let backend = TestBackend::spawn(StatusCode::NO_CONTENT).await;
        let hc = checker(&[("jobs", &backend.url, true, 5)]);
        assert_eq!(hc.check_one("jobs").await, Health::Unhealthy);
    }

    #[tokio::test]
    async fn test_timeout_is_unhealthy() {
        let backend = TestBackend::spawn(StatusCode::OK).await;
        backend.set_health_delay_ms(1_500);
        let hc = checker(&[("jobs", &backend.url, true, 1)]);
        assert_eq!(hc.check_one("jobs").await, Health::Unhealthy);
    }

    #[tokio::test]
    async fn test_unreachable_is_unhealthy() {
        let hc = checker(&[("jobs", "http://127.0.0.1:1", true, 1)]);
        assert_eq!(hc.check_one("jobs").await, Health::Unhealthy);
    }

    #[tokio::test]
    async fn test_disabled_never_probed() {
        let backend = TestBackend::spawn(StatusCode::OK).await;
        let hc = checker(&[("jobs", &backend.url, false, 5)]);
        assert_eq!(hc.check_one("jobs").await, Health::Unhealthy);
        assert_eq!(hc.check_one("no-such-service").await, Health::Unhealthy);

        let all = hc.check_all().await;
        assert_eq!(all["jobs"], Health::NotApplicable);
        assert_eq!(backend.health_hits(), 0);
    }

    #[tokio::test]
    async fn test_check_all_and_report() {
        let up = TestBackend::spawn(StatusCode::OK).await;
        let down = TestBackend::spawn(StatusCode::INTERNAL_SERVER_ERROR).await;
        let hc = checker(&[
            ("jobs", &up.url, true, 5),
            ("payments", &down.url, true, 5),
        ]);

        let all = hc.check_all().await;
        assert_eq!(all.len(), 6);
        assert_eq!(all["jobs"], Health::Healthy);
        assert_eq!(all["payments"], Health::Unhealthy);
        assert_eq!(all["auth"], Health::NotApplicable);

        let report = HealthReport::from_results(&all);
        assert_eq!(report.status, "degraded");
        assert_eq!(report.enabled_count, 2);
        assert_eq!(report.healthy_count, 1);
        assert_eq!(report.services["auth"], None);
        assert_eq!(report.services["jobs"], Some(true));
    }

    #[test]
    fn test_report_status_values() {
        let mut results = BTreeMap::new();
        results.insert("a".to_string(), Health::NotApplicable);
        assert_eq!(HealthReport::from_results(&results).status, "no_services");

        results.insert("b".to_string(), Health::Healthy);
        assert_eq!(HealthReport::from_results(&results).status, "healthy");

        let json = serde_json::to_value(HealthReport::from_results(&results)).unwrap();
        assert_eq!(json["services"]["a"], serde_json::Value::Null);
        assert_eq!(json["services"]["b"], true);
    }
}
