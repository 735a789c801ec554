//! Credential manager: OAuth2 client-credentials tokens for the store.
//!
//! A mount lives arbitrarily long, so the access token is minted lazily,
//! cached with its expiry, and re-minted when the expiry (minus a safety
//! margin) passes or when [`CredentialManager::invalidate`] is called
//! after the store rejects a request. All mutation happens behind one
//! async mutex, so concurrent operations hitting an expired token
//! trigger exactly one mint and the rest wait for it.

use crate::config::{Credentials, TOKEN_EXPIRY_MARGIN};
use crate::error::{PodError, PodResult};
use crate::transport::{HttpBackend, HttpRequest, HttpResponse, Method};
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Response shape of a client-credentials token exchange.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        Instant::now() + TOKEN_EXPIRY_MARGIN >= self.expires_at
    }
}

struct AuthInner {
    credentials: Credentials,
    backend: Arc<dyn HttpBackend>,
    // Serializes mint/refresh/invalidate; also de-duplicates concurrent
    // refreshes, since waiters observe the token the winner minted.
    token: Mutex<Option<CachedToken>>,
}

/// Process-wide credential component, constructor-injected rather than
/// ambient global state so lifecycle and test doubles stay explicit.
///
/// Cloning is cheap; clones share the cached token.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Option<Arc<AuthInner>>,
}

impl CredentialManager {
    /// Manager that attaches nothing; all requests go out unauthenticated.
    pub fn unauthenticated() -> Self {
        Self { inner: None }
    }

    /// Manager minting tokens from the given grant via the given backend.
    pub fn new(credentials: Credentials, backend: Arc<dyn HttpBackend>) -> Self {
        Self {
            inner: Some(Arc::new(AuthInner {
                credentials,
                backend,
                token: Mutex::new(None),
            })),
        }
    }

    /// Whether a grant is configured at all.
    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns a valid bearer token, minting or refreshing as needed.
    ///
    /// `Ok(None)` means no credentials are configured. Blocks the calling
    /// operation while a mint is in flight, which is acceptable because
    /// filesystem operations already block on network I/O.
    pub async fn bearer(&self) -> PodResult<Option<String>> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };

        let mut guard = inner.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(Some(token.value.clone()));
            }
            debug!("cached token expired, re-minting");
        }

        let minted = mint(&inner.credentials, inner.backend.as_ref()).await?;
        let value = minted.value.clone();
        *guard = Some(minted);
        Ok(Some(value))
    }

    /// Forces the next [`bearer`](Self::bearer) call to mint a fresh token.
    pub async fn invalidate(&self) {
        if let Some(inner) = &self.inner {
            *inner.token.lock().await = None;
        }
    }
}

async fn mint(credentials: &Credentials, backend: &dyn HttpBackend) -> PodResult<CachedToken> {
    let time_before_request = Instant::now();
    let basic = base64::engine::general_purpose::STANDARD.encode(format!(
        "{}:{}",
        credentials.client_id, credentials.client_secret
    ));

    let request = HttpRequest::new(Method::Post, credentials.token_url.clone())
        .header("Authorization", format!("Basic {basic}"))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(Bytes::from_static(b"grant_type=client_credentials"));

    debug!(
        client_id = %credentials.client_id,
        token_url = %credentials.token_url,
        "requesting access token"
    );
    let response = backend.execute(request).await?;
    let parsed = parse_token_response(&response)?;

    info!(
        token_type = parsed.token_type.as_deref().unwrap_or("Bearer"),
        scope = parsed.scope.as_deref().unwrap_or(""),
        expires_in = parsed.expires_in,
        "minted access token"
    );
    Ok(CachedToken {
        value: parsed.access_token,
        expires_at: time_before_request + std::time::Duration::from_secs(parsed.expires_in),
    })
}

fn parse_token_response(response: &HttpResponse) -> PodResult<TokenResponse> {
    if !response.is_success() {
        return Err(PodError::Auth(format!(
            "token endpoint answered {}: {}",
            response.status,
            String::from_utf8_lossy(&response.body)
        )));
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| PodError::Auth(format!("malformed token response: {e}")))
}
