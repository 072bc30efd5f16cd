use http::Extensions;
use reqwest::{header::HeaderValue, Request, Response};
use reqwest_middleware::{Middleware, Next};
use std::sync::Arc;

pub const INSTALLATIONS_AUTH_HEADER: &str = "x-goog-firebase-installations-auth";

/// Source of Firebase installations auth tokens.
///
/// Token issuance lives outside this crate; anything that can hand out a bearer
/// string asynchronously can back the downloader.
#[async_trait::async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, anyhow::Error>;
}

/// Hands out the same token every time. Handy for emulators and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, anyhow::Error> {
        Ok(self.token.clone())
    }
}

/// Marker carried inside `reqwest_middleware::Error::Middleware` when the token
/// provider fails, so callers can tell it apart from transport errors.
#[derive(Debug, thiserror::Error)]
#[error("failed to get auth token: {0}")]
pub struct AuthTokenError(pub String);

/// Attaches the installations auth token to every outgoing request.
#[derive(Clone)]
pub struct InstallationsAuthMiddleware {
    provider: Arc<dyn AuthTokenProvider>,
}

impl InstallationsAuthMiddleware {
    pub fn new(provider: Arc<dyn AuthTokenProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Middleware for InstallationsAuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self.provider.token().await.map_err(|e| {
            tracing::debug!(error = %e, "auth token provider failed");
            reqwest_middleware::Error::Middleware(AuthTokenError(e.to_string()).into())
        })?;

        let value = HeaderValue::from_str(&token).map_err(|e| {
            reqwest_middleware::Error::Middleware(AuthTokenError(e.to_string()).into())
        })?;
        req.headers_mut().insert(INSTALLATIONS_AUTH_HEADER, value);

        next.run(req, extensions).await
    }
}

/// Returns true when a middleware error came from the token provider.
pub fn is_auth_token_error(err: &reqwest_middleware::Error) -> bool {
    if let reqwest_middleware::Error::Middleware(e) = err {
        e.downcast_ref::<AuthTokenError>().is_some()
    } else {
        false
    }
}
