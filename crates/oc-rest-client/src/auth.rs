//! Authentication for outbound requests

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Request, Response};

use crate::error::{RestClientError, RestClientResult};
use crate::transport::Transport;

/// Authentication methods supported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthMethod {
    /// Bearer token (`Authorization: Bearer <token>`)
    Bearer(String),
    /// No authentication
    #[default]
    None,
}

impl AuthMethod {
    /// Bearer authentication from a token; an empty token means no authentication
    pub fn bearer(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.is_empty() {
            Self::None
        } else {
            Self::Bearer(token)
        }
    }

    /// Build from an optional configured token
    pub fn from_token(token: Option<&str>) -> Self {
        token.map(Self::bearer).unwrap_or_default()
    }

    /// Apply authentication headers, replacing any existing `Authorization`
    pub fn apply_to_headers(&self, headers: &mut HeaderMap) -> RestClientResult<()> {
        match self {
            AuthMethod::Bearer(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| RestClientError::Auth(e.to_string()))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            AuthMethod::None => {}
        }
        Ok(())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, AuthMethod::None)
    }
}

/// Transport decorator injecting the configured credential into every request.
///
/// Only the outgoing request is touched; responses pass through untouched.
#[derive(Debug, Clone)]
pub struct AuthenticatingTransport<T> {
    auth: AuthMethod,
    inner: T,
}

impl<T> AuthenticatingTransport<T> {
    pub fn new(auth: AuthMethod, inner: T) -> Self {
        Self { auth, inner }
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for AuthenticatingTransport<T> {
    async fn execute(&self, mut request: Request) -> RestClientResult<Response> {
        self.auth.apply_to_headers(request.headers_mut())?;
        self.inner.execute(request).await
    }
}
