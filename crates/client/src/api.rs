//! Remote cart API client.
//!
//! # Endpoints
//!
//! - `POST /cart/sync` - `{ items, mode: "partial" | "full" }`
//! - `POST /cart/merge` - `{ guestItems }`, called once at login
//! - `GET /cart` - `{ items: [{ itemId, quantity }] }`
//!
//! [`CartApi`] is the seam the engine is written against; [`HttpCartApi`]
//! implements it with `reqwest`.

use std::future::Future;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use cart_sync_core::{CartResponse, MergeRequest, SyncRequest};

/// Errors that can occur when calling the cart API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Server rejected the credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// Rate limited by the server.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Endpoint URL could not be built.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Operations the engine needs from the remote cart service.
pub trait CartApi: Send + Sync + 'static {
    /// `POST /cart/sync`.
    fn sync(
        &self,
        token: &SecretString,
        request: &SyncRequest,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// `POST /cart/merge`.
    fn merge(
        &self,
        token: &SecretString,
        request: &MergeRequest,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// `GET /cart`.
    fn fetch_cart(
        &self,
        token: &SecretString,
    ) -> impl Future<Output = Result<CartResponse, ApiError>> + Send;

    /// Fire-and-forget `POST /cart/sync` for the teardown path.
    ///
    /// Must not block. Returns whether the transmission was queued; delivery
    /// is never reported.
    fn send_beacon(&self, token: &SecretString, request: &SyncRequest) -> bool;
}

/// `reqwest`-backed [`CartApi`].
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct HttpCartApi {
    inner: Arc<HttpCartApiInner>,
}

struct HttpCartApiInner {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCartApi {
    /// Create a client resolving endpoints against `base_url`.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            inner: Arc::new(HttpCartApiInner {
                client: reqwest::Client::new(),
                base_url,
            }),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.inner.base_url.join(path)?)
    }

    async fn post_json<B: Serialize + Sync>(
        &self,
        path: &str,
        token: &SecretString,
        body: &B,
    ) -> Result<String, ApiError> {
        let request = self
            .inner
            .client
            .post(self.endpoint(path)?)
            .bearer_auth(token.expose_secret())
            .json(body);
        execute(request).await
    }
}

impl CartApi for HttpCartApi {
    #[instrument(skip_all, fields(mode = ?request.mode, items = request.items.len()))]
    async fn sync(&self, token: &SecretString, request: &SyncRequest) -> Result<(), ApiError> {
        self.post_json("cart/sync", token, request).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(items = request.guest_items.len()))]
    async fn merge(&self, token: &SecretString, request: &MergeRequest) -> Result<(), ApiError> {
        self.post_json("cart/merge", token, request).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn fetch_cart(&self, token: &SecretString) -> Result<CartResponse, ApiError> {
        let request = self
            .inner
            .client
            .get(self.endpoint("cart")?)
            .bearer_auth(token.expose_secret());
        let body = execute(request).await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn send_beacon(&self, token: &SecretString, request: &SyncRequest) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let Ok(url) = self.endpoint("cart/sync") else {
            return false;
        };
        let pending = self
            .inner
            .client
            .post(url)
            .bearer_auth(token.expose_secret())
            .json(request);
        handle.spawn(async move {
            if let Err(e) = pending.send().await {
                debug!(error = %e, "Beacon delivery failed");
            }
        });
        true
    }
}

/// Send a request and return the body of a successful response.
async fn execute(request: reqwest::RequestBuilder) -> Result<String, ApiError> {
    let response = request.send().await?;
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(1);
        return Err(ApiError::RateLimited(retry_after));
    }

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let body = response.text().await?;

    if !status.is_success() {
        tracing::warn!(
            status = %status,
            body = %body.chars().take(500).collect::<String>(),
            "Cart API returned non-success status"
        );
        return Err(ApiError::Status {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }

    Ok(body)
}

/// Pull the server's `message` field out of an error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| "Something went wrong".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_from_json() {
        assert_eq!(error_message(r#"{"message":"Cart not found"}"#), "Cart not found");
    }

    #[test]
    fn test_error_message_fallback() {
        assert_eq!(error_message("<html>502</html>"), "Something went wrong");
        assert_eq!(error_message(r#"{"error":1}"#), "Something went wrong");
    }

    #[test]
    fn test_endpoints_resolve_under_base() {
        let api = HttpCartApi::new(Url::parse("https://shop.example/api/").unwrap());
        assert_eq!(
            api.endpoint("cart/merge").unwrap().as_str(),
            "https://shop.example/api/cart/merge"
        );
        assert_eq!(api.endpoint("cart").unwrap().as_str(), "https://shop.example/api/cart");
    }

    #[test]
    fn test_beacon_without_runtime_is_not_queued() {
        let api = HttpCartApi::new(Url::parse("https://shop.example/").unwrap());
        let token = SecretString::from("t");
        let request = SyncRequest::partial(cart_sync_core::DirtyItems::new());
        assert!(!api.send_beacon(&token, &request));
    }

    #[test]
    fn test_status_error_display() {
        let err = ApiError::Status {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 500: boom");
    }
}
