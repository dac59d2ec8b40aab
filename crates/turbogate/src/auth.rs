//! Bearer token validation.
//!
//! Tokens are first verified locally (HS256 with the shared secret, expiry
//! enforced). Anything that fails locally is handed to the remote auth
//! service when one is enabled, which stays authoritative for tokens the
//! gateway cannot verify itself (rotated keys, other issuers). Local
//! verification cannot see server-side revocation.

use std::sync::Arc;

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::registry::ServiceRegistry;

/// Identity claims carried by a validated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub role: String,
    pub email: String,
    pub exp: Option<u64>,
}

impl Principal {
    /// Build a principal from decoded claims. The subject is read from
    /// `user_id`, falling back to `sub`, and may be a string or a number.
    pub fn from_claims(claims: &Value) -> Option<Self> {
        let claims = claims.as_object()?;
        let text = |key: &str| match claims.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let user_id = match claims.get("user_id") {
            Some(Value::String(_) | Value::Number(_)) => text("user_id"),
            _ => text("sub"),
        };
        Some(Self {
            user_id,
            role: text("role"),
            email: text("email"),
            exp: claims.get("exp").and_then(Value::as_u64),
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token failed local verification: {0}")]
    Local(#[source] jsonwebtoken::errors::Error),

    #[error("auth service rejected token with status {0}")]
    RemoteRejected(u16),

    #[error("auth service returned a malformed principal")]
    RemoteMalformed,

    #[error("auth service call failed: {0}")]
    Remote(#[from] reqwest::Error),
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub struct AuthValidator {
    key: DecodingKey,
    validation: Validation,
    client: reqwest::Client,
    registry: Arc<ServiceRegistry>,
    remote_service: String,
}

impl AuthValidator {
    pub fn new(
        secret: &str,
        registry: Arc<ServiceRegistry>,
        remote_service: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            client,
            registry,
            remote_service: remote_service.into(),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<Principal, AuthError> {
        let local_err = match self.validate_locally(token) {
            Ok(principal) => {
                tracing::debug!(user_id = %principal.user_id, "Token validated locally");
                return Ok(principal);
            }
            Err(e) => e,
        };

        if !self.registry.is_enabled(&self.remote_service) {
            tracing::warn!(error = %local_err, "Auth service not enabled, token validation failed");
            return Err(AuthError::Local(local_err));
        }

        match self.validate_remotely(token).await {
            Ok(principal) => {
                tracing::debug!(user_id = %principal.user_id, "Token validated by auth service");
                Ok(principal)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Auth service token validation failed");
                Err(e)
            }
        }
    }

    fn validate_locally(&self, token: &str) -> Result<Principal, jsonwebtoken::errors::Error> {
        let data = decode::<Value>(token, &self.key, &self.validation)?;
        Principal::from_claims(&data.claims)
            .ok_or_else(|| jsonwebtoken::errors::ErrorKind::InvalidToken.into())
    }

    async fn validate_remotely(&self, token: &str) -> Result<Principal, AuthError> {
        let service = self
            .registry
            .resolve(&self.remote_service)
            .map_err(|_| AuthError::RemoteMalformed)?;
        let url = format!("{}/validate-token", service.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .timeout(service.timeout)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(AuthError::RemoteRejected(status.as_u16()));
        }

        let claims: Value = response.json().await?;
        Principal::from_claims(&claims).ok_or(AuthError::RemoteMalformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::test_support::{mint_token, now_secs, spawn, TEST_SECRET};
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_auth(url: &str, enabled: bool) -> Arc<ServiceRegistry> {
        let mut config = GatewayConfig::default();
        let auth = config.services.get_mut("auth").unwrap();
        auth.base_url = url.to_string();
        auth.enabled = enabled;
        Arc::new(ServiceRegistry::from_config(&config))
    }

    fn validator(registry: Arc<ServiceRegistry>) -> AuthValidator {
        AuthValidator::new(TEST_SECRET, registry, "auth", reqwest::Client::new())
    }

    /// Auth backend accepting only the token "opaque-token".
    async fn spawn_auth_backend(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/validate-token",
            post(move |Json(body): Json<Value>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if body["token"] == "opaque-token" {
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({
                                "user_id": 7,
                                "role": "partner",
                                "email": "p@example.com",
                            })),
                        )
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(serde_json::json!({ "error": "bad token" })),
                        )
                    }
                }
            }),
        );
        spawn(app).await
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let v = validator(registry_with_auth("http://localhost:1", false));
        let exp = now_secs() + 600;
        let token = mint_token(
            TEST_SECRET,
            serde_json::json!({
                "user_id": "u-1", "role": "admin", "email": "a@example.com", "exp": exp
            }),
        );
        let principal = v.validate(&token).await.unwrap();
        assert_eq!(
            principal,
            Principal {
                user_id: "u-1".into(),
                role: "admin".into(),
                email: "a@example.com".into(),
                exp: Some(exp),
            }
        );
    }

    #[tokio::test]
    async fn test_numeric_sub_claim_accepted() {
        let v = validator(registry_with_auth("http://localhost:1", false));
        let token = mint_token(
            TEST_SECRET,
            serde_json::json!({ "sub": 99, "exp": now_secs() + 60 }),
        );
        let principal = v.validate(&token).await.unwrap();
        assert_eq!(principal.user_id, "99");
        assert_eq!(principal.role, "");
    }

    #[tokio::test]
    async fn test_wrong_secret_invalid_without_remote() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_auth_backend(hits.clone()).await;
        let v = validator(registry_with_auth(&url, false));
        let token = mint_token(
            "some-other-secret-entirely",
            serde_json::json!({ "user_id": "u-1", "exp": now_secs() + 600 }),
        );
        assert!(matches!(v.validate(&token).await, Err(AuthError::Local(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_invalid() {
        let v = validator(registry_with_auth("http://localhost:1", false));
        let token = mint_token(
            TEST_SECRET,
            serde_json::json!({ "user_id": "u-1", "exp": now_secs() - 3600 }),
        );
        assert!(v.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_fallback_accepts_opaque_token() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_auth_backend(hits.clone()).await;
        let v = validator(registry_with_auth(&url, true));

        let principal = v.validate("opaque-token").await.unwrap();
        assert_eq!(principal.user_id, "7");
        assert_eq!(principal.role, "partner");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_rejection_is_invalid() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_auth_backend(hits.clone()).await;
        let v = validator(registry_with_auth(&url, true));

        assert!(matches!(
            v.validate("garbage").await,
            Err(AuthError::RemoteRejected(401))
        ));
    }

    #[tokio::test]
    async fn test_valid_local_token_skips_remote() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_auth_backend(hits.clone()).await;
        let v = validator(registry_with_auth(&url, true));
        let token = mint_token(
            TEST_SECRET,
            serde_json::json!({ "user_id": "u-2", "exp": now_secs() + 600 }),
        );
        assert!(v.validate(&token).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_invalid() {
        let v = validator(registry_with_auth("http://127.0.0.1:1", true));
        assert!(matches!(
            v.validate("opaque-token").await,
            Err(AuthError::Remote(_))
        ));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }
}
