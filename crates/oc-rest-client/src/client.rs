//! Request/response client for the opencode server

use reqwest::{Method, Request, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::auth::{AuthMethod, AuthenticatingTransport};
use crate::config::{append_path, ClientConfig};
use crate::error::{RestClientError, RestClientResult};
use crate::retry::RetryingTransport;
use crate::sse::EventStreamClient;
use crate::transport::{HttpTransport, Transport};

/// Path used as a lightweight liveness check
pub const HEALTH_PATH: &str = "/config";

/// REST client; every call goes through authentication and retry
#[derive(Clone)]
pub struct RestClient {
    transport: Arc<dyn Transport>,
    http: Arc<dyn Transport>,
    base_url: Url,
    config: ClientConfig,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}

impl RestClient {
    /// Create a new REST client
    pub fn new(config: ClientConfig) -> RestClientResult<Self> {
        config.validate()?;
        let http = HttpTransport::with_timeout(config.timeout)?;
        Self::with_transport(config, Arc::new(http))
    }

    /// Create a client from a base URL string with default settings
    pub fn from_url(base_url: &str, auth: AuthMethod) -> RestClientResult<Self> {
        let mut config = ClientConfig::new(base_url);
        if let AuthMethod::Bearer(token) = auth {
            config.auth_token = Some(token);
        }
        Self::new(config)
    }

    /// Build the chain `auth -> retry -> transport` over a custom innermost transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> RestClientResult<Self> {
        let base_url = config.base_url()?;
        let chain = Self::chain(&config, Arc::clone(&transport), None);

        Ok(Self {
            transport: chain,
            http: transport,
            base_url,
            config,
        })
    }

    /// Abort retry backoff waits with [`RestClientError::Cancelled`] once
    /// `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.transport = Self::chain(&self.config, Arc::clone(&self.http), Some(token));
        self
    }

    fn chain(
        config: &ClientConfig,
        http: Arc<dyn Transport>,
        cancel: Option<CancellationToken>,
    ) -> Arc<dyn Transport> {
        let mut retrying = RetryingTransport::new(config.retry_policy(), http);
        if let Some(token) = cancel {
            retrying = retrying.with_cancellation(token);
        }
        Arc::new(AuthenticatingTransport::new(config.auth(), retrying))
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Event stream client for the same server and credential
    pub fn event_stream(&self) -> RestClientResult<EventStreamClient> {
        EventStreamClient::new(self.config.sse_config())
    }

    /// Check that the server answers at all
    pub async fn ping(&self) -> RestClientResult<()> {
        let request = Request::new(Method::GET, self.url(HEALTH_PATH)?);
        let response = self.execute(request).await?;
        Self::check_status(response).await.map(drop)
    }

    /// Send a prepared request through the transport chain.
    ///
    /// The response is returned whatever its status.
    pub async fn execute(&self, request: Request) -> RestClientResult<Response> {
        debug!(method = %request.method(), url = %request.url(), "sending request");
        self.transport.execute(request).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> RestClientResult<T> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> RestClientResult<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> RestClientResult<T> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> RestClientResult<T> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> RestClientResult<T> {
        self.request(Method::DELETE, path, None::<&()>).await
    }

    /// Send a request with an optional JSON body and decode a JSON reply
    pub async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> RestClientResult<T> {
        let mut request = Request::new(method, self.url(path)?);

        if let Some(body) = body {
            let bytes = serde_json::to_vec(body)?;
            request.headers_mut().insert(
                reqwest::header::CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/json"),
            );
            *request.body_mut() = Some(bytes.into());
        }

        let response = self.execute(request).await?;
        self.handle_response(response).await
    }

    fn url(&self, path: &str) -> RestClientResult<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            Ok(Url::parse(path)?)
        } else {
            Ok(append_path(&self.base_url, path))
        }
    }

    async fn check_status(response: Response) -> RestClientResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RestClientError::ServerError { status, body })
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> RestClientResult<T> {
        let response = Self::check_status(response).await?;
        let text = response.text().await?;
        // Empty bodies decode as `null`, so `()` and `Option<T>` work for 204s.
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(RestClientError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let base_url = "http://localhost:4096";
        let client = RestClient::from_url(base_url, AuthMethod::None).unwrap();

        assert_eq!(client.base_url().to_string(), format!("{}/", base_url));
    }

    #[test]
    fn test_url_resolution() {
        let client = RestClient::new(ClientConfig::new("http://localhost:4096/")).unwrap();

        assert_eq!(
            client.url("/session/abc").unwrap().as_str(),
            "http://localhost:4096/session/abc"
        );
        assert_eq!(
            client.url("https://other.host/x").unwrap().as_str(),
            "https://other.host/x"
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = RestClient::new(ClientConfig::new("http://localhost:4096").with_timeout(Default::default()))
            .unwrap_err();
        assert!(matches!(err, RestClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_event_stream_shares_server() {
        let client = RestClient::new(ClientConfig::new("http://localhost:4096").with_auth_token("t")).unwrap();
        let stream = client.event_stream().unwrap();

        assert_eq!(stream.config().base_url, "http://localhost:4096");
        assert_eq!(stream.config().auth_token.as_deref(), Some("t"));
    }
}
