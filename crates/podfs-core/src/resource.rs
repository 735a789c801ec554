//! In-memory model of one remote Pod entity.
//!
//! A [`ResourceHandle`] records everything the engine knows about a single
//! remote resource: its identity (path and derived URL), its kind, the
//! validator and metadata from the last fetch, and optionally cached
//! content or a cached member listing. Handles are owned exclusively by
//! the [`HierarchyIndex`](crate::hierarchy::HierarchyIndex).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Instant;
use url::Url;

/// The two shapes the remote protocol recognizes.
///
/// A container behaves as a directory, a non-RDF resource as a regular
/// file. A path never changes kind in place; the engine models kind
/// changes as delete-then-create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Resource,
}

impl ResourceKind {
    pub fn is_container(self) -> bool {
        matches!(self, ResourceKind::Container)
    }
}

/// Splits a path into parent path and final name.
///
/// Returns `None` for the root. `"/a/b.txt"` → `("/a", "b.txt")`,
/// `"/a"` → `("/", "a")`.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" || path.is_empty() {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, &trimmed[idx + 1..]))
}

/// Joins a parent path and child name into a normalized child path.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Decodes percent-encoded bytes in a URL path segment.
///
/// Member URLs arrive percent-encoded on the wire while hierarchy keys
/// are plain UTF-8. Invalid escapes are passed through untouched rather
/// than rejected, matching how lenient servers treat them.
pub fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        // Work on raw bytes: a `%` may be followed by non-ASCII input
        // (websocket frames carry arbitrary text), so slicing the str at
        // byte offsets is not safe here.
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Derives the remote URL for a filesystem path.
///
/// The URL is the base URL plus the path segments, percent-encoded by the
/// `url` crate; containers always carry a trailing slash.
pub fn url_for_path(base: &Url, path: &str, kind: ResourceKind) -> Url {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .expect("base URL is always a valid http(s) base");
        segments.pop_if_empty();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            segments.push(part);
        }
        if kind.is_container() {
            // Trailing slash is how the protocol distinguishes containers.
            segments.push("");
        }
    }
    url
}

/// Identity, metadata, and cached state for one remote resource.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    /// Filesystem path, the unique key in the hierarchy index.
    pub path: String,
    /// Remote URL derived from the path.
    pub url: Url,
    /// Container or non-RDF resource; fixed for the handle's lifetime.
    pub kind: ResourceKind,
    /// Opaque validator from the last successful fetch.
    pub etag: Option<String>,
    /// Content type reported by (or chosen for) the resource.
    pub content_type: Option<String>,
    /// Size in bytes of the resource content, as last observed.
    pub size: u64,
    /// Last-Modified from the most recent response.
    pub last_modified: Option<DateTime<Utc>>,
    /// POSIX permission bits, refined from WAC-Allow when available.
    pub mode: u16,
    /// Cached body for non-RDF resources; absent until first read.
    pub body: Option<Bytes>,
    /// Member names for containers; `None` until listed at least once.
    pub children: Option<BTreeSet<String>>,
    /// When metadata was last confirmed against the remote store.
    pub fetched_at: Option<Instant>,
}

/// Conservative owner-only mode for files with no native mode concept.
pub const DEFAULT_FILE_MODE: u16 = 0o600;

/// Conservative owner-only mode for containers (searchable).
pub const DEFAULT_DIR_MODE: u16 = 0o700;

impl ResourceHandle {
    /// Creates a handle with no cached state.
    pub fn new(base: &Url, path: impl Into<String>, kind: ResourceKind) -> Self {
        let path = path.into();
        let url = url_for_path(base, &path, kind);
        Self {
            path,
            url,
            kind,
            etag: None,
            content_type: None,
            size: 0,
            last_modified: None,
            mode: match kind {
                ResourceKind::Container => DEFAULT_DIR_MODE,
                ResourceKind::Resource => DEFAULT_FILE_MODE,
            },
            body: None,
            children: None,
            fetched_at: None,
        }
    }

    /// Marks every cached facet stale so the next access refetches.
    pub fn invalidate(&mut self) {
        self.fetched_at = None;
        self.body = None;
        self.children = None;
    }

    /// Records the cached body, keeping size in sync.
    pub fn set_body(&mut self, body: Bytes) {
        self.size = body.len() as u64;
        self.body = Some(body);
    }

    /// Whether this handle has ever been confirmed against the store.
    pub fn ever_fetched(&self) -> bool {
        self.fetched_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://pod.example/data/").unwrap()
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_path("/"), None);
        assert_eq!(split_path("/a"), Some(("/", "a")));
        assert_eq!(split_path("/a/b/c.txt"), Some(("/a/b", "c.txt")));
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a/b", "c.txt"), "/a/b/c.txt");
    }

    #[test]
    fn test_url_derivation() {
        let url = url_for_path(&base(), "/notes/todo.txt", ResourceKind::Resource);
        assert_eq!(url.as_str(), "https://pod.example/data/notes/todo.txt");

        let url = url_for_path(&base(), "/notes", ResourceKind::Container);
        assert_eq!(url.as_str(), "https://pod.example/data/notes/");

        let url = url_for_path(&base(), "/", ResourceKind::Container);
        assert_eq!(url.as_str(), "https://pod.example/data/");
    }

    #[test]
    fn test_url_derivation_encodes_segments() {
        let url = url_for_path(&base(), "/my notes/a b.txt", ResourceKind::Resource);
        assert_eq!(
            url.as_str(),
            "https://pod.example/data/my%20notes/a%20b.txt"
        );
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b.txt"), "a b.txt");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
        // Invalid escapes pass through
        assert_eq!(percent_decode("bad%zzescape"), "bad%zzescape");
        assert_eq!(percent_decode("trailing%2"), "trailing%2");
    }

    #[test]
    fn test_percent_decode_tolerates_raw_non_ascii() {
        // A `%` directly before a multi-byte character must not split it.
        assert_eq!(percent_decode("%aé"), "%aé");
        assert_eq!(percent_decode("é%41"), "éA");
        assert_eq!(percent_decode("%é"), "%é");
    }

    #[test]
    fn test_handle_defaults() {
        let h = ResourceHandle::new(&base(), "/a.txt", ResourceKind::Resource);
        assert_eq!(h.mode, DEFAULT_FILE_MODE);
        assert!(h.etag.is_none());
        assert!(!h.ever_fetched());

        let d = ResourceHandle::new(&base(), "/dir", ResourceKind::Container);
        assert_eq!(d.mode, DEFAULT_DIR_MODE);
        assert!(d.url.as_str().ends_with('/'));
    }

    #[test]
    fn test_invalidate_clears_cached_facets() {
        let mut h = ResourceHandle::new(&base(), "/a.txt", ResourceKind::Resource);
        h.set_body(Bytes::from_static(b"hello"));
        h.fetched_at = Some(Instant::now());
        assert_eq!(h.size, 5);

        h.invalidate();
        assert!(h.body.is_none());
        assert!(h.fetched_at.is_none());
        // Size survives invalidation; it is metadata, not cache.
        assert_eq!(h.size, 5);
    }
}
