//! Service registry: backend descriptors, the prefix route table and the
//! public endpoint set. Built once from configuration, read-only afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::config::GatewayConfig;

/// Immutable description of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    pub timeout: Duration,
    pub enabled: bool,
}

impl ServiceDescriptor {
    /// Join `path` onto the base URL with exactly one `/` between them.
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.strip_suffix('/').unwrap_or(&self.base_url);
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{base}/{path}")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service '{0}' is not configured")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDescriptor>,
    /// (prefix, service name) in declaration order.
    routes: Vec<(String, String)>,
    public_endpoints: Vec<String>,
}

impl ServiceRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let services = config
            .services
            .iter()
            .map(|(name, svc)| {
                let descriptor = ServiceDescriptor {
                    name: name.clone(),
                    base_url: svc.base_url.clone(),
                    health_path: svc.health_path.clone(),
                    timeout: svc.timeout(),
                    enabled: svc.enabled,
                };
                (name.clone(), descriptor)
            })
            .collect();

        let routes = config
            .routes
            .iter()
            .map(|rule| (rule.prefix.clone(), rule.service.clone()))
            .collect();

        Self {
            services,
            routes,
            public_endpoints: config.public_endpoints.clone(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<&ServiceDescriptor, RegistryError> {
        self.services
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// First route whose prefix starts `path` wins. `path` is relative to
    /// `/api/v1/`.
    pub fn route_for(&self, path: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, service)| service.as_str())
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_endpoints
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Unknown services are reported as disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.services.get(name).is_some_and(|svc| svc.enabled)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub fn enabled_services(&self) -> Vec<&str> {
        self.services
            .values()
            .filter(|svc| svc.enabled)
            .map(|svc| svc.name.as_str())
            .collect()
    }

    pub fn route_prefixes(&self) -> Vec<&str> {
        self.routes.iter().map(|(prefix, _)| prefix.as_str()).collect()
    }
}
