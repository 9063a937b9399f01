//! Transport abstraction the request decorators are layered on

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Request, Response};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RestClientResult;

/// User agent sent with every request
pub const USER_AGENT: &str = concat!("oc-rest-client/", env!("CARGO_PKG_VERSION"));

/// Executes a single HTTP request.
///
/// Decorators (authentication, retry) wrap another `Transport` and delegate to
/// it, so the final chain is built by nesting them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: Request) -> RestClientResult<Response>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: Request) -> RestClientResult<Response> {
        (**self).execute(request).await
    }
}

/// The innermost transport: a plain `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    /// Wrap an already configured `reqwest` client
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// Build a client whose every request is bounded by `timeout`
    pub fn with_timeout(timeout: Duration) -> RestClientResult<Self> {
        let client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self::new(client))
    }

    /// Build a client for long-lived streams.
    ///
    /// Only connection establishment is bounded; a total request timeout would
    /// cut the stream off mid-body.
    pub fn for_streaming(connect_timeout: Duration) -> RestClientResult<Self> {
        let client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: Request) -> RestClientResult<Response> {
        Ok(self.client.execute(request).await?)
    }
}
