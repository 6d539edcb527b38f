//! Remote theme asset API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Destination;
use crate::role::AssetKey;

const TOKEN_HEADER: &str = "X-Shopify-Access-Token";

/// Delivery failures. Cloneable so terminal outcomes can be reported to callers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error: {status}")]
    ServerError { status: u16, body: String },

    #[error("client error: {status}")]
    ClientError { status: u16, body: String },
}

impl DeliveryError {
    /// Server-requested delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Request(e.to_string())
        }
    }
}

/// Upsert/delete operations on one destination's theme assets
#[async_trait]
pub trait AssetApi: Send + Sync {
    /// Create or replace `key` with base64 `attachment`
    async fn put(
        &self,
        destination: &Destination,
        key: &AssetKey,
        attachment: &str,
    ) -> Result<(), DeliveryError>;

    async fn delete(&self, destination: &Destination, key: &AssetKey) -> Result<(), DeliveryError>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("theme-sync/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 10,
        }
    }
}

#[derive(Serialize)]
struct AssetBody<'a> {
    asset: AssetPayload<'a>,
}

#[derive(Serialize)]
struct AssetPayload<'a> {
    key: &'a str,
    attachment: &'a str,
}

/// `AssetApi` over the store's REST assets endpoint
#[derive(Debug, Clone)]
pub struct ThemeClient {
    inner: Client,
}

impl ThemeClient {
    pub fn new() -> Result<Self, DeliveryError> {
        Self::with_config(HttpConfig::default())
    }

    pub fn with_config(config: HttpConfig) -> Result<Self, DeliveryError> {
        let inner = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| DeliveryError::ClientBuild(e.to_string()))?;
        Ok(Self { inner })
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
        destination: &Destination,
    ) -> reqwest::RequestBuilder {
        match &destination.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    /// Check response status and convert errors.
    pub async fn check_response(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DeliveryError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

            return Err(DeliveryError::RateLimited { retry_after });
        }

        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            Err(DeliveryError::ServerError {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(DeliveryError::ClientError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl AssetApi for ThemeClient {
    async fn put(
        &self,
        destination: &Destination,
        key: &AssetKey,
        attachment: &str,
    ) -> Result<(), DeliveryError> {
        debug!(destination = %destination.id, key = %key, "PUT {}", destination.endpoint);
        let body = AssetBody {
            asset: AssetPayload {
                key: key.as_str(),
                attachment,
            },
        };
        let request = self.authorized(self.inner.put(&destination.endpoint), destination);
        let response = request.json(&body).send().await?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn delete(&self, destination: &Destination, key: &AssetKey) -> Result<(), DeliveryError> {
        debug!(destination = %destination.id, key = %key, "DELETE {}", destination.endpoint);
        let request = self
            .authorized(self.inner.delete(&destination.endpoint), destination)
            .query(&[("asset[key]", key.as_str())]);
        let response = request.send().await?;
        Self::check_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn destination(server: &MockServer) -> Destination {
        Destination::new("acme", 7, "dev")
            .with_endpoint(format!("{}/admin/api/2023-04/themes/7/assets.json", server.uri()))
            .with_token("shpat_test")
    }

    // ==================== HttpConfig tests ====================

    #[test]
    fn test_default_config() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("theme-sync/"));
    }

    #[test]
    fn test_error_display() {
        let err = DeliveryError::ServerError {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert!(err.to_string().contains("502"));

        let err = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    // ==================== ThemeClient tests ====================

    #[tokio::test]
    async fn test_put_sends_asset_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/admin/api/2023-04/themes/7/assets.json"))
            .and(header("X-Shopify-Access-Token", "shpat_test"))
            .and(body_json(serde_json::json!({
                "asset": { "key": "assets/main.css", "attachment": "LmF7fQ==" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ThemeClient::new().unwrap();
        client
            .put(&destination(&server), &AssetKey::new("assets/main.css"), "LmF7fQ==")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_sends_key_query() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(query_param("asset[key]", "snippets/icon.liquid"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ThemeClient::new().unwrap();
        client
            .delete(&destination(&server), &AssetKey::new("snippets/icon.liquid"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2.0"))
            .mount(&server)
            .await;

        let client = ThemeClient::new().unwrap();
        let err = client
            .put(&destination(&server), &AssetKey::new("assets/a.js"), "")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[tokio::test]
    async fn test_client_error_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(422).set_body_string("{\"errors\":\"bad\"}"))
            .mount(&server)
            .await;

        let client = ThemeClient::new().unwrap();
        let err = client
            .put(&destination(&server), &AssetKey::new("layout/theme.liquid"), "")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeliveryError::ClientError { status: 422, ref body } if body.contains("bad")
        ));
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = ThemeClient::new().unwrap();
        let err = client
            .delete(&destination(&server), &AssetKey::new("assets/a.js"))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::ServerError { status: 503, .. }));
    }
}
