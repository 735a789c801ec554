//! Cache manager: freshness policy and conditional refresh.
//!
//! Container listings and resource bodies share one mechanism. A handle
//! fetched with an etag is refreshed by a conditional request carrying
//! `If-None-Match`; a 304 leaves the cached facet untouched and only
//! bumps the freshness timestamp, anything else replaces etag, metadata,
//! and content. When content caching is disabled the freshness window is
//! ignored entirely and every access refetches, which is what makes
//! external writers' changes visible without remount.

use crate::config::PodConfig;
use crate::error::{PodError, PodResult};
use crate::hierarchy::SharedHandle;
use crate::resource::ResourceHandle;
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Accept header for container listings.
const ACCEPT_CONTAINER: &str = "text/turtle";

/// Accept header for opaque resource content.
const ACCEPT_ANY: &str = "*/*";

/// Decides when cached state is fresh enough and refreshes it otherwise.
pub struct CacheManager {
    transport: Arc<Transport>,
    ttl: Duration,
    content_caching: bool,
}

impl CacheManager {
    pub fn new(transport: Arc<Transport>, config: &PodConfig) -> Self {
        Self {
            transport,
            ttl: config.cache_ttl,
            content_caching: config.content_caching,
        }
    }

    pub fn content_caching(&self) -> bool {
        self.content_caching
    }

    /// Whether the handle's cached facets may be served without a round
    /// trip. Always false when content caching is disabled.
    pub fn is_fresh(&self, handle: &ResourceHandle) -> bool {
        if !self.content_caching {
            return false;
        }
        handle
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Refreshes metadata only, via HEAD. Used by getattr on handles
    /// that were never fetched (or have gone stale) when the body itself
    /// is not needed.
    pub async fn refresh_metadata(&self, shared: &SharedHandle) -> PodResult<()> {
        let (url, path) = {
            let guard = shared.read().await;
            if self.is_fresh(&guard) && guard.ever_fetched() {
                return Ok(());
            }
            (guard.url.clone(), guard.path.clone())
        };

        let request = HttpRequest::new(Method::Head, url.clone()).header("Accept", ACCEPT_ANY);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(PodError::from_status(response.status, url.as_str()));
        }

        let mut guard = shared.write().await;
        apply_metadata(&mut guard, &response);
        guard.fetched_at = Some(Instant::now());
        trace!(path, "metadata refreshed");
        Ok(())
    }

    /// Returns the resource body, from cache when fresh, otherwise via
    /// (conditional) GET. The whole body is fetched at once; the remote
    /// protocol offers no partial-content guarantee the driver could
    /// rely on for every resource kind.
    pub async fn ensure_body(&self, shared: &SharedHandle) -> PodResult<Bytes> {
        let (url, etag, cached_body) = {
            let guard = shared.read().await;
            if let Some(body) = &guard.body {
                if self.is_fresh(&guard) {
                    trace!(path = guard.path, size = body.len(), "body served from cache");
                    return Ok(body.clone());
                }
            }
            (guard.url.clone(), guard.etag.clone(), guard.body.clone())
        };

        let mut request = HttpRequest::new(Method::Get, url.clone()).header("Accept", ACCEPT_ANY);
        if let (Some(etag), Some(_)) = (&etag, &cached_body) {
            request = request.header("If-None-Match", etag.clone());
        }

        let response = self.transport.send(request).await?;
        match response.status {
            304 => {
                let mut guard = shared.write().await;
                guard.fetched_at = Some(Instant::now());
                debug!(path = guard.path, "not modified, cache retained");
                cached_body.ok_or_else(|| {
                    PodError::Transport(format!("304 without cached content for {url}"))
                })
            }
            _ if response.is_success() => {
                let body = response.body.clone();
                let mut guard = shared.write().await;
                apply_metadata(&mut guard, &response);
                guard.size = body.len() as u64;
                guard.body = self.content_caching.then(|| body.clone());
                guard.fetched_at = Some(Instant::now());
                debug!(path = guard.path, size = body.len(), "body fetched");
                Ok(body)
            }
            status => Err(PodError::from_status(status, url.as_str())),
        }
    }

    /// Fetches a container's own document for listing. Returns `None`
    /// on 304 (the recorded listing is still valid) or the Turtle body
    /// to parse.
    ///
    /// Listings are never considered fresh from the local timer alone:
    /// every listing issues the conditional round trip to the container
    /// itself, which is what keeps other writers' membership changes
    /// observable. The etag makes the unchanged case cheap.
    pub async fn fetch_listing(&self, shared: &SharedHandle) -> PodResult<Option<String>> {
        let (url, etag, listed) = {
            let guard = shared.read().await;
            (guard.url.clone(), guard.etag.clone(), guard.children.is_some())
        };

        let mut request =
            HttpRequest::new(Method::Get, url.clone()).header("Accept", ACCEPT_CONTAINER);
        if let (Some(etag), true) = (&etag, listed) {
            request = request.header("If-None-Match", etag.clone());
        }

        let response = self.transport.send(request).await?;
        match response.status {
            304 => {
                let mut guard = shared.write().await;
                guard.fetched_at = Some(Instant::now());
                debug!(path = guard.path, "listing not modified");
                Ok(None)
            }
            _ if response.is_success() => {
                let mut guard = shared.write().await;
                apply_metadata(&mut guard, &response);
                guard.fetched_at = Some(Instant::now());
                debug!(path = guard.path, size = response.body.len(), "listing fetched");
                Ok(Some(String::from_utf8_lossy(&response.body).into_owned()))
            }
            status => Err(PodError::from_status(status, url.as_str())),
        }
    }
}

/// Applies response headers to a handle's metadata fields.
///
/// Surfaced headers: ETag, Content-Type, Content-Length, Last-Modified,
/// and WAC-Allow (the store's access modes, folded into owner-only
/// permission bits).
pub fn apply_metadata(handle: &mut ResourceHandle, response: &HttpResponse) {
    if let Some(etag) = response.header("ETag") {
        handle.etag = Some(etag.to_string());
    }
    if let Some(content_type) = response.header("Content-Type") {
        handle.content_type = Some(content_type.to_string());
    }
    if let Some(length) = response.header("Content-Length") {
        if let Ok(length) = length.parse::<u64>() {
            handle.size = length;
        }
    }
    if let Some(last_modified) = response.header("Last-Modified") {
        if let Some(parsed) = parse_http_date(last_modified) {
            handle.last_modified = Some(parsed);
        }
    }
    if let Some(allow) = response.header("WAC-Allow") {
        handle.mode = wac_allow_to_mode(allow, handle.kind.is_container());
    }
}

/// Parses an HTTP date (IMF-fixdate) into a UTC timestamp.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Maps a `WAC-Allow` header to permission bits.
///
/// Only the `user` access modes matter for the mounting owner; group and
/// other stay closed. Containers keep the search bit so traversal works
/// whenever reading does.
fn wac_allow_to_mode(allow: &str, is_container: bool) -> u16 {
    let mut user_modes = "";
    for part in allow.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("user=") {
            user_modes = rest.trim_matches('"');
        }
    }

    let mut mode = 0o000;
    if user_modes.split_whitespace().any(|m| m == "read") {
        mode |= 0o400;
        if is_container {
            mode |= 0o100;
        }
    }
    if user_modes.split_whitespace().any(|m| m == "write") {
        mode |= 0o200;
    }
    mode
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceHandle, ResourceKind};
    use url::Url;

    fn handle(kind: ResourceKind) -> ResourceHandle {
        ResourceHandle::new(
            &Url::parse("https://pod.example/data/").unwrap(),
            "/x",
            kind,
        )
    }

    fn response(headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_apply_metadata() {
        let mut h = handle(ResourceKind::Resource);
        apply_metadata(
            &mut h,
            &response(&[
                ("ETag", "\"abc\""),
                ("Content-Type", "text/plain"),
                ("Content-Length", "12"),
                ("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ]),
        );
        assert_eq!(h.etag.as_deref(), Some("\"abc\""));
        assert_eq!(h.content_type.as_deref(), Some("text/plain"));
        assert_eq!(h.size, 12);
        assert!(h.last_modified.is_some());
    }

    #[test]
    fn test_http_date_parsing() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(parsed.timestamp(), 1445412480);
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn test_wac_allow_modes() {
        assert_eq!(wac_allow_to_mode("user=\"read write\"", false), 0o600);
        assert_eq!(wac_allow_to_mode("user=\"read\"", false), 0o400);
        assert_eq!(wac_allow_to_mode("user=\"read write\"", true), 0o700);
        assert_eq!(
            wac_allow_to_mode("user=\"read\",public=\"read\"", true),
            0o500
        );
        assert_eq!(wac_allow_to_mode("public=\"read\"", false), 0o000);
        // Append and control grant no POSIX bits.
        assert_eq!(wac_allow_to_mode("user=\"append control\"", false), 0o000);
    }

    #[test]
    fn test_wac_allow_applies_to_mode() {
        let mut h = handle(ResourceKind::Container);
        apply_metadata(&mut h, &response(&[("WAC-Allow", "user=\"read write\"")]));
        assert_eq!(h.mode, 0o700);
    }
}
