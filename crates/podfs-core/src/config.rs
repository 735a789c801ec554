//! Mount configuration for the Pod filesystem.
//!
//! The configuration is assembled once by the CLI and treated as an
//! immutable snapshot for the life of the mount.

use std::time::Duration;
use url::Url;

/// Default freshness window for cached metadata and listings.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Default timeout for a single network operation.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Safety margin subtracted from a token's lifetime before it is
/// considered expired.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Client-credentials grant material for the token endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
}

/// Which HTTP client implements the transport codec.
///
/// The codec itself is backend-agnostic; this only selects the
/// production implementation. Tests inject their own backend directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpBackendKind {
    #[default]
    Reqwest,
}

/// Configuration options for a Pod mount.
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// Base URL of the remote store; the root container lives here.
    /// Always stored with a trailing slash.
    pub base_url: Url,

    /// Optional client-credentials grant. Without it all requests are
    /// sent unauthenticated.
    pub credentials: Option<Credentials>,

    /// Whether bodies and listings may be served from cache within the
    /// freshness window. When false every read goes to the network.
    pub content_caching: bool,

    /// Notification gateway for websocket change subscriptions.
    /// `None` disables the change listener.
    pub notification_gateway: Option<Url>,

    /// Freshness window for cached metadata and container listings.
    pub cache_ttl: Duration,

    /// Timeout for individual network operations.
    pub io_timeout: Duration,

    /// Production HTTP client selection.
    pub http_backend: HttpBackendKind,
}

impl PodConfig {
    /// Creates a configuration for the given store, normalizing the base
    /// URL to end with a slash so member URLs concatenate cleanly.
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            credentials: None,
            content_caching: true,
            notification_gateway: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            http_backend: HttpBackendKind::default(),
        }
    }

    /// Sets the client-credentials grant material.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Enables or disables content caching.
    #[must_use]
    pub fn content_caching(mut self, enabled: bool) -> Self {
        self.content_caching = enabled;
        self
    }

    /// Sets the websocket notification gateway.
    #[must_use]
    pub fn notification_gateway(mut self, gateway: Url) -> Self {
        self.notification_gateway = Some(gateway);
        self
    }

    /// Sets the cache freshness window.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the per-operation network timeout.
    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}
