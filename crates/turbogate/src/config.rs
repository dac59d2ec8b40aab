//! Configuration types and loading logic.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use turbogate_tracing::TracingConfig;

/// Minimum accepted length of the token signing secret.
pub const MIN_SECRET_LEN: usize = 16;

/// Fallback secret for `dev` and `test` environments only.
pub const DEV_SECRET_KEY: &str = "dev-secret-key-change-in-production";

/// Top-level gateway configuration. Built once at startup, then shared
/// read-only behind an `Arc` for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub gateway: GatewayInfoConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub cors: CorsConfig,
    pub services: BTreeMap<String, ServiceConfig>,
    /// Ordered prefix table. Declaration order decides which rule wins.
    pub routes: Vec<RouteRule>,
    pub public_endpoints: Vec<String>,
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_address: String,
    /// Largest inbound request body buffered for forwarding.
    pub max_body_bytes: usize,
}

/// Identity reported by the info and health endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInfoConfig {
    pub name: String,
    pub api_version: String,
    /// One of `dev`, `test`, `prod`.
    pub environment: String,
}

/// Bearer token verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the auth backend.
    pub secret_key: Option<String>,
    /// File holding the secret. Takes precedence over `secret_key`.
    pub secret_key_file: Option<PathBuf>,
    /// Registry name of the backend used as the remote validation authority.
    pub remote_service: String,
}

/// Where rate-limit counters live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    Redis,
    Memory,
}

/// Per-client rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: CounterBackend,
    pub redis_url: String,
    /// Optional file holding the Redis password, injected into `redis_url`.
    pub redis_password_file: Option<PathBuf>,
    pub per_minute: u64,
    pub store_timeout_ms: u64,
}

/// Allowed CORS origins. `*` allows any origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub origins: Vec<String>,
}

/// One backend microservice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub base_url: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

/// Maps a path prefix (relative to `/api/v1/`) to a service name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub service: String,
}

fn default_service_timeout() -> u64 {
    30
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ServiceConfig {
    fn local(port: u16) -> Self {
        Self {
            base_url: format!("http://localhost:{port}"),
            enabled: false,
            timeout_secs: default_service_timeout(),
            health_path: default_health_path(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:5000".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for GatewayInfoConfig {
    fn default() -> Self {
        Self {
            name: "TurboGate".to_string(),
            api_version: "v1".to_string(),
            environment: "dev".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            secret_key_file: None,
            remote_service: "auth".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CounterBackend::Redis,
            redis_url: "redis://localhost:6379/0".to_string(),
            redis_password_file: None,
            per_minute: 100,
            store_timeout_ms: 500,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

fn default_services() -> BTreeMap<String, ServiceConfig> {
    let mut services = BTreeMap::new();
    services.insert("auth".to_string(), ServiceConfig::local(5001));
    services.insert("jobs".to_string(), ServiceConfig::local(5002));
    services.insert("partners".to_string(), ServiceConfig::local(5003));
    services.insert(
        "documents".to_string(),
        ServiceConfig {
            // File transfers need longer than the default.
            timeout_secs: 60,
            ..ServiceConfig::local(5004)
        },
    );
    services.insert("payments".to_string(), ServiceConfig::local(5005));
    services.insert("communication".to_string(), ServiceConfig::local(5006));
    services
}

fn default_routes() -> Vec<RouteRule> {
    [
        ("auth", "auth"),
        ("users", "auth"),
        ("jobs", "jobs"),
        ("assignments", "jobs"),
        ("partners", "partners"),
        ("onboarding", "partners"),
        ("documents", "documents"),
        ("uploads", "documents"),
        ("payments", "payments"),
        ("billing", "payments"),
        ("escrow", "payments"),
        ("messages", "communication"),
        ("notifications", "communication"),
        ("chat", "communication"),
    ]
    .into_iter()
    .map(|(prefix, service)| RouteRule {
        prefix: prefix.to_string(),
        service: service.to_string(),
    })
    .collect()
}

fn default_public_endpoints() -> Vec<String> {
    [
        "auth/login",
        "auth/register",
        "auth/forgot_password",
        "auth/reset_password",
        "health",
        "metrics",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayInfoConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            services: default_services(),
            routes: default_routes(),
            public_endpoints: default_public_endpoints(),
            tracing: TracingConfig::default(),
        }
    }
}

/// Legacy per-service environment variables: (service, url var, enabled var).
const SERVICE_ENV_VARS: &[(&str, &str, &str)] = &[
    ("auth", "AUTH_SERVICE_URL", "AUTH_SERVICE_ENABLED"),
    ("jobs", "JOB_SERVICE_URL", "JOB_SERVICE_ENABLED"),
    ("partners", "PARTNER_SERVICE_URL", "PARTNER_SERVICE_ENABLED"),
    ("documents", "DOCUMENT_SERVICE_URL", "DOCUMENT_SERVICE_ENABLED"),
    ("payments", "PAYMENT_SERVICE_URL", "PAYMENT_SERVICE_ENABLED"),
    (
        "communication",
        "COMMUNICATION_SERVICE_URL",
        "COMMUNICATION_SERVICE_ENABLED",
    ),
];

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
}

impl GatewayConfig {
    /// Load configuration from defaults, a TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Direct environment overrides (`SECRET_KEY`, `REDIS_URL`, `AUTH_SERVICE_URL`, ...)
    /// 2. Environment variables (TURBOGATE_ prefix, __ for nesting)
    /// 3. TOML config file
    /// 4. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("TURBOGATE_").split("__"));
        Self::from_figment(figment)
    }

    /// Extract, apply direct env overrides, resolve secrets and validate.
    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: GatewayConfig = figment.extract()?;
        config.apply_env_overrides();
        config.resolve_secrets()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("SECRET_KEY") {
            self.auth.secret_key = Some(key);
        }
        if let Ok(path) = std::env::var("SECRET_KEY_FILE") {
            self.auth.secret_key_file = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.rate_limit.redis_url = url;
        }
        if let Ok(path) = std::env::var("REDIS_PASSWORD_FILE") {
            self.rate_limit.redis_password_file = Some(PathBuf::from(path));
        }
        if let Some(enabled) = env_flag("REDIS_ENABLED") {
            self.rate_limit.enabled = enabled;
        }
        if let Some(limit) = std::env::var("RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            self.rate_limit.per_minute = limit;
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            self.cors.origins = origins.split(',').map(|o| o.trim().to_string()).collect();
        }
        for (name, url_var, enabled_var) in SERVICE_ENV_VARS {
            let Some(service) = self.services.get_mut(*name) else {
                continue;
            };
            if let Ok(url) = std::env::var(url_var) {
                service.base_url = url;
            }
            if let Some(enabled) = env_flag(enabled_var) {
                service.enabled = enabled;
            }
        }
    }

    fn resolve_secrets(&mut self) -> anyhow::Result<()> {
        if let Some(path) = &self.auth.secret_key_file {
            if path.exists() {
                let secret = std::fs::read_to_string(path).with_context(|| {
                    format!("could not read secret key from file {}", path.display())
                })?;
                self.auth.secret_key = Some(secret.trim().to_string());
            }
        }

        if self.auth.secret_key.as_deref().map_or(true, str::is_empty) {
            match self.gateway.environment.as_str() {
                "dev" | "test" => {
                    self.auth.secret_key = Some(DEV_SECRET_KEY.to_string());
                }
                _ => bail!("no secret key configured; set SECRET_KEY or auth.secret_key"),
            }
        }

        if let Some(path) = &self.rate_limit.redis_password_file {
            match std::fs::read_to_string(path) {
                Ok(password) => {
                    let password = password.trim();
                    let url = &self.rate_limit.redis_url;
                    if !password.is_empty() && url.starts_with("redis://") && !url.contains('@') {
                        self.rate_limit.redis_url =
                            url.replacen("redis://", &format!("redis://:{password}@"), 1);
                    }
                }
                Err(e) => {
                    eprintln!(
                        "Could not read Redis password from {}: {e}",
                        path.display()
                    );
                }
            }
        }

        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        let secret = self.secret_key();
        if secret.len() < MIN_SECRET_LEN {
            bail!("secret key must be at least {MIN_SECRET_LEN} characters long");
        }
        if self.gateway.environment == "prod" && secret == DEV_SECRET_KEY {
            bail!("the development secret key cannot be used in production");
        }

        for (name, service) in &self.services {
            if service.enabled && service.base_url.trim().is_empty() {
                bail!("service '{name}' is enabled but has no base_url");
            }
        }

        for rule in &self.routes {
            if !self.services.contains_key(&rule.service) {
                bail!(
                    "route prefix '{}' points at unknown service '{}'",
                    rule.prefix,
                    rule.service
                );
            }
        }

        if self.rate_limit.per_minute == 0 {
            bail!("rate_limit.per_minute must be greater than zero");
        }

        Ok(())
    }

    /// The resolved signing secret. Always present after loading.
    pub fn secret_key(&self) -> &str {
        self.auth.secret_key.as_deref().unwrap_or_default()
    }

    /// Longest gap allowed between two reads of a backend response: the
    /// largest service timeout.
    pub fn backend_read_timeout(&self) -> Duration {
        self.services
            .values()
            .map(ServiceConfig::timeout)
            .max()
            .unwrap_or_else(|| Duration::from_secs(default_service_timeout()))
    }

    pub fn is_debug(&self) -> bool {
        self.gateway.environment != "prod"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load_in(jail: &Jail) -> anyhow::Result<GatewayConfig> {
        let path = jail.directory().join("turbogate.toml");
        GatewayConfig::load(path.to_str().unwrap())
    }

    #[test]
    fn test_default_service_table() {
        let config = GatewayConfig::default();
        assert_eq!(config.services.len(), 6);
        assert_eq!(config.services["documents"].timeout_secs, 60);
        assert_eq!(config.services["jobs"].timeout_secs, 30);
        assert_eq!(config.routes.len(), 14);
        assert_eq!(config.routes[0].prefix, "auth");
        assert_eq!(config.rate_limit.per_minute, 100);
        assert!(config.public_endpoints.contains(&"auth/login".to_string()));
    }

    #[test]
    fn test_backend_read_timeout_is_largest_service_timeout() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.backend_read_timeout(), Duration::from_secs(60));
        config.services.clear();
        assert_eq!(config.backend_read_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_toml_merges_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "turbogate.toml",
                r#"
                [auth]
                secret_key = "a-very-long-test-secret"

                [services.jobs]
                base_url = "http://jobs.internal:8080"
                enabled = true

                [rate_limit]
                per_minute = 5
                "#,
            )?;
            let config = load_in(jail).map_err(|e| e.to_string())?;
            assert_eq!(config.services["jobs"].base_url, "http://jobs.internal:8080");
            assert!(config.services["jobs"].enabled);
            // Untouched services keep their defaults.
            assert_eq!(config.services["documents"].timeout_secs, 60);
            assert_eq!(config.rate_limit.per_minute, 5);
            assert_eq!(config.secret_key(), "a-very-long-test-secret");
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_env_and_legacy_env_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("TURBOGATE_GATEWAY__NAME", "EdgeGate");
            jail.set_env("PAYMENT_SERVICE_URL", "http://payments:9000");
            jail.set_env("PAYMENT_SERVICE_ENABLED", "true");
            jail.set_env("RATE_LIMIT_PER_MINUTE", "42");
            jail.set_env("SECRET_KEY", "env-provided-secret-key");
            let config = load_in(jail).map_err(|e| e.to_string())?;
            assert_eq!(config.gateway.name, "EdgeGate");
            assert_eq!(config.services["payments"].base_url, "http://payments:9000");
            assert!(config.services["payments"].enabled);
            assert_eq!(config.rate_limit.per_minute, 42);
            assert_eq!(config.secret_key(), "env-provided-secret-key");
            Ok(())
        });
    }

    #[test]
    fn test_secret_file_takes_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file("secret.txt", "  secret-from-a-file-123  \n")?;
            jail.create_file(
                "turbogate.toml",
                r#"
                [auth]
                secret_key = "inline-secret-is-ignored"
                secret_key_file = "secret.txt"
                "#,
            )?;
            let config = load_in(jail).map_err(|e| e.to_string())?;
            assert_eq!(config.secret_key(), "secret-from-a-file-123");
            Ok(())
        });
    }

    #[test]
    fn test_short_secret_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("SECRET_KEY", "short");
            let err = load_in(jail).unwrap_err();
            assert!(err.to_string().contains("at least 16"));
            Ok(())
        });
    }

    #[test]
    fn test_prod_requires_real_secret() {
        Jail::expect_with(|jail| {
            jail.set_env("TURBOGATE_GATEWAY__ENVIRONMENT", "prod");
            assert!(load_in(jail).is_err());

            jail.set_env("SECRET_KEY", DEV_SECRET_KEY);
            let err = load_in(jail).unwrap_err();
            assert!(err.to_string().contains("production"));

            jail.set_env("SECRET_KEY", "a-real-production-secret");
            assert!(load_in(jail).is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_route_to_unknown_service_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "turbogate.toml",
                r#"
                routes = [{ prefix = "ghosts", service = "ghost" }]
                "#,
            )?;
            let err = load_in(jail).unwrap_err();
            assert!(err.to_string().contains("unknown service"));
            Ok(())
        });
    }

    #[test]
    fn test_enabled_service_needs_base_url() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "turbogate.toml",
                r#"
                [services.jobs]
                base_url = ""
                enabled = true
                "#,
            )?;
            assert!(load_in(jail).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_redis_password_file_injected() {
        Jail::expect_with(|jail| {
            jail.create_file("redis.pw", "hunter2\n")?;
            jail.set_env("REDIS_PASSWORD_FILE", "redis.pw");
            jail.set_env("REDIS_URL", "redis://cache:6379/0");
            let config = load_in(jail).map_err(|e| e.to_string())?;
            assert_eq!(config.rate_limit.redis_url, "redis://:hunter2@cache:6379/0");
            Ok(())
        });
    }
}
