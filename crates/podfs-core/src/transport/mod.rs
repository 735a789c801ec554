//! Transport codec: HTTP requests and responses against the remote store.
//!
//! The codec is split in two layers. [`HttpBackend`] is the pluggable
//! exchange primitive: one request in, one response out, no policy. The
//! production implementation is [`ReqwestBackend`]; tests substitute an
//! in-memory Pod. [`Transport`] sits on top and owns the cross-cutting
//! policy: common headers, bearer credential attachment, and the single
//! re-authentication retry on an unauthorized response.

mod reqwest_backend;

pub use reqwest_backend::ReqwestBackend;

use crate::auth::CredentialManager;
use crate::error::PodResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// HTTP methods the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

/// One request against the remote store.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds a header, replacing any existing header of the same name.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// One response from the remote store.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

/// Pluggable HTTP exchange primitive.
///
/// Implementations perform exactly one request/response exchange.
/// Transport-level failures (refused connection, timeout, malformed
/// response) surface as [`PodError::Transport`]; HTTP error statuses are
/// returned as ordinary responses for the caller to interpret.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> PodResult<HttpResponse>;
}

/// Policy layer over an [`HttpBackend`].
///
/// Attaches the session headers and bearer credential to every request
/// and performs the single re-authentication retry when the store
/// rejects a request despite a cached token (clock skew, server-side
/// revocation). A second unauthorized response is returned as-is; the
/// dispatcher maps it to a permission error.
pub struct Transport {
    backend: Arc<dyn HttpBackend>,
    auth: CredentialManager,
    session_id: String,
    user_agent: String,
}

impl Transport {
    pub fn new(backend: Arc<dyn HttpBackend>, auth: CredentialManager) -> Self {
        Self {
            backend,
            auth,
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            user_agent: format!("podfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Identifier correlating every request of this mount in server logs.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sends a request with session headers and credentials attached.
    pub async fn send(&self, request: HttpRequest) -> PodResult<HttpResponse> {
        let prepared = self.prepare(request.clone()).await?;
        let method = prepared.method;
        let url = prepared.url.clone();

        debug!(method = method.as_str(), url = %url, "sending request");
        let response = self.backend.execute(prepared).await?;
        debug!(
            method = method.as_str(),
            url = %url,
            status = response.status,
            "response"
        );

        if response.is_unauthorized() && self.auth.is_configured() {
            warn!(url = %url, status = response.status, "unauthorized with cached token, re-authenticating");
            self.auth.invalidate().await;
            let retried = self.prepare(request).await?;
            let response = self.backend.execute(retried).await?;
            debug!(
                method = method.as_str(),
                url = %url,
                status = response.status,
                "response after re-authentication"
            );
            return Ok(response);
        }

        Ok(response)
    }

    async fn prepare(&self, request: HttpRequest) -> PodResult<HttpRequest> {
        let mut request = request
            .header("User-Agent", self.user_agent.clone())
            .header("Session-Identifier", self.session_id.clone());
        if let Some(token) = self.auth.bearer().await? {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        Ok(request)
    }
}
