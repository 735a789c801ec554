//! In-memory Pod for tests.
//!
//! [`FakePod`] implements [`HttpBackend`] over a map of URL-keyed
//! entries and speaks just enough of the store's contract to exercise
//! the engine end to end: Turtle container listings, etags with
//! `If-None-Match` revalidation, LDP type links on PUT, and a
//! client-credentials token endpoint. Any request outside the base URL
//! is routed to the token endpoint, which answers 500 until
//! [`FakePod::serve_tokens`] arms it.
//!
//! The fake also records traffic (`last_request_headers`,
//! `request_count`) and supports fault injection (`fail_deletes`,
//! `require_token`) so tests can drive the unhappy paths.

use crate::error::PodResult;
use crate::resource::{url_for_path, ResourceKind};
use crate::transport::{HttpBackend, HttpRequest, HttpResponse, Method};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Clone)]
struct Entry {
    kind: ResourceKind,
    body: Vec<u8>,
    content_type: String,
    etag: String,
    last_modified: String,
    wac_allow: Option<String>,
}

impl Entry {
    fn container(etag: String) -> Self {
        Self {
            kind: ResourceKind::Container,
            body: Vec::new(),
            content_type: "text/turtle".to_string(),
            etag,
            last_modified: http_date_now(),
            wac_allow: None,
        }
    }
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    token: Option<(String, u64)>,
    token_requests: usize,
    require_token: bool,
    fail_deletes: bool,
    last_headers: Vec<(String, String)>,
    log: Vec<(String, Url)>,
    etag_counter: u64,
}

/// An in-memory Pod behind the transport codec.
pub struct FakePod {
    base: Url,
    state: Mutex<State>,
}

impl FakePod {
    /// Creates a pod whose root container lives at `base` (which must
    /// end with a slash).
    pub fn new(base: &str) -> Self {
        let base = Url::parse(base).expect("valid base url");
        assert!(base.path().ends_with('/'), "base url must end with a slash");
        let pod = Self {
            base,
            state: Mutex::new(State::default()),
        };
        {
            let mut state = pod.state.lock();
            let etag = next_etag(&mut state);
            let key = pod.base.as_str().to_string();
            state.entries.insert(key, Entry::container(etag));
        }
        pod
    }

    /// Seeds (or externally overwrites) a resource, creating missing
    /// ancestor containers. Each call issues a fresh etag, so this also
    /// simulates another client changing content behind the mount.
    pub fn put_resource(&self, path: &str, body: &[u8], content_type: &str) {
        let key = url_for_path(&self.base, path, ResourceKind::Resource)
            .as_str()
            .to_string();
        let mut state = self.state.lock();
        let created = !state.entries.contains_key(&key);
        ensure_parents(&mut state, self.base.as_str(), &key);
        let etag = next_etag(&mut state);
        state.entries.insert(
            key.clone(),
            Entry {
                kind: ResourceKind::Resource,
                body: body.to_vec(),
                content_type: content_type.to_string(),
                etag,
                last_modified: http_date_now(),
                wac_allow: None,
            },
        );
        if created {
            touch_parent(&mut state, self.base.as_str(), &key);
        }
    }

    /// Seeds a container, creating missing ancestors.
    pub fn put_container(&self, path: &str) {
        let key = url_for_path(&self.base, path, ResourceKind::Container)
            .as_str()
            .to_string();
        let mut state = self.state.lock();
        let created = !state.entries.contains_key(&key);
        ensure_parents(&mut state, self.base.as_str(), &key);
        let etag = next_etag(&mut state);
        state.entries.insert(key.clone(), Entry::container(etag));
        if created {
            touch_parent(&mut state, self.base.as_str(), &key);
        }
    }

    /// Deletes an entry out-of-band, as another client would.
    pub fn remove(&self, path: &str) {
        let mut state = self.state.lock();
        for kind in [ResourceKind::Resource, ResourceKind::Container] {
            let key = url_for_path(&self.base, path, kind).as_str().to_string();
            if state.entries.remove(&key).is_some() {
                touch_parent(&mut state, self.base.as_str(), &key);
            }
        }
    }

    /// Sets the `WAC-Allow` header served for a path.
    pub fn set_wac_allow(&self, path: &str, value: &str) {
        let mut state = self.state.lock();
        for kind in [ResourceKind::Resource, ResourceKind::Container] {
            let key = url_for_path(&self.base, path, kind).as_str().to_string();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.wac_allow = Some(value.to_string());
            }
        }
    }

    /// Makes every DELETE fail with a server error.
    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().fail_deletes = fail;
    }

    /// Requires a bearer token matching the currently served one on
    /// every in-base request; stale tokens get 401.
    pub fn require_token(&self, require: bool) {
        self.state.lock().require_token = require;
    }

    /// Arms the token endpoint. Until called it answers 500.
    pub fn serve_tokens(&self, token: &str, expires_in: u64) {
        self.state.lock().token = Some((token.to_string(), expires_in));
    }

    /// Number of token exchanges performed so far.
    pub fn token_requests(&self) -> usize {
        self.state.lock().token_requests
    }

    /// Headers of the most recent request, token exchanges included.
    pub fn last_request_headers(&self) -> Vec<(String, String)> {
        self.state.lock().last_headers.clone()
    }

    /// Counts requests whose method matches and whose URL path ends
    /// with the given suffix.
    pub fn request_count(&self, method: &str, path_suffix: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(m, u)| m == method && u.path().ends_with(path_suffix))
            .count()
    }

    /// Current remote content of a resource.
    pub fn resource_body(&self, path: &str) -> Option<Vec<u8>> {
        let key = url_for_path(&self.base, path, ResourceKind::Resource)
            .as_str()
            .to_string();
        self.state.lock().entries.get(&key).map(|e| e.body.clone())
    }

    /// Whether any entry (resource or container) exists for the path.
    pub fn contains(&self, path: &str) -> bool {
        let state = self.state.lock();
        [ResourceKind::Resource, ResourceKind::Container]
            .into_iter()
            .any(|kind| {
                let key = url_for_path(&self.base, path, kind).as_str().to_string();
                state.entries.contains_key(&key)
            })
    }
}

#[async_trait]
impl HttpBackend for FakePod {
    async fn execute(&self, request: HttpRequest) -> PodResult<HttpResponse> {
        let mut state = self.state.lock();
        state.last_headers = request.headers.clone();
        state
            .log
            .push((request.method.as_str().to_string(), request.url.clone()));

        if !request.url.as_str().starts_with(self.base.as_str()) {
            return Ok(token_endpoint(&mut state, &request));
        }
        if state.require_token && !authorized(&state, &request) {
            return Ok(plain(401, "unauthorized"));
        }

        let key = request.url.as_str().to_string();
        let response = match request.method {
            Method::Get => get(&mut state, &key, &request, true),
            Method::Head => get(&mut state, &key, &request, false),
            Method::Put => put(&mut state, self.base.as_str(), &key, &request),
            Method::Delete => delete(&mut state, self.base.as_str(), &key),
            Method::Post => plain(404, "not found"),
        };
        Ok(response)
    }
}

fn token_endpoint(state: &mut State, request: &HttpRequest) -> HttpResponse {
    if request.method != Method::Post {
        return plain(404, "not found");
    }
    state.token_requests += 1;
    match &state.token {
        Some((token, expires_in)) => {
            let body = format!(
                "{{\"access_token\":\"{token}\",\"token_type\":\"Bearer\",\"expires_in\":{expires_in}}}"
            );
            HttpResponse {
                status: 200,
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: Bytes::from(body),
            }
        }
        None => plain(500, "token endpoint unavailable"),
    }
}

fn authorized(state: &State, request: &HttpRequest) -> bool {
    let Some((token, _)) = &state.token else {
        return false;
    };
    let expected = format!("Bearer {token}");
    header(request, "Authorization") == Some(expected.as_str())
}

fn get(state: &mut State, key: &str, request: &HttpRequest, with_body: bool) -> HttpResponse {
    let Some(entry) = state.entries.get(key).cloned() else {
        return plain(404, "not found");
    };
    if header(request, "If-None-Match") == Some(entry.etag.as_str()) {
        return HttpResponse {
            status: 304,
            headers: vec![("ETag".to_string(), entry.etag)],
            body: Bytes::new(),
        };
    }

    let body = if entry.kind.is_container() {
        listing(&state.entries, key)
    } else {
        entry.body
    };
    let mut headers = vec![
        ("ETag".to_string(), entry.etag),
        ("Content-Type".to_string(), entry.content_type),
        ("Content-Length".to_string(), body.len().to_string()),
        ("Last-Modified".to_string(), entry.last_modified),
    ];
    if let Some(wac) = entry.wac_allow {
        headers.push(("WAC-Allow".to_string(), wac));
    }
    HttpResponse {
        status: 200,
        headers,
        body: if with_body { Bytes::from(body) } else { Bytes::new() },
    }
}

/// Renders a container's direct members as a Turtle listing.
fn listing(entries: &BTreeMap<String, Entry>, container_key: &str) -> Vec<u8> {
    let mut members = Vec::new();
    for key in entries.keys() {
        let Some(rest) = key.strip_prefix(container_key) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let segment = rest.strip_suffix('/').unwrap_or(rest);
        if segment.is_empty() || segment.contains('/') {
            continue;
        }
        members.push(format!("<{rest}>"));
    }

    let mut turtle =
        String::from("@prefix ldp: <http://www.w3.org/ns/ldp#>.\n<> a ldp:BasicContainer");
    if members.is_empty() {
        turtle.push_str(" .\n");
    } else {
        turtle.push_str(" ;\n    ldp:contains ");
        turtle.push_str(&members.join(", "));
        turtle.push_str(" .\n");
    }
    turtle.into_bytes()
}

fn put(state: &mut State, base: &str, key: &str, request: &HttpRequest) -> HttpResponse {
    let is_container = key.ends_with('/')
        || header(request, "Link").is_some_and(|l| l.contains("BasicContainer"));
    let content_type = header(request, "Content-Type")
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = request.body.clone().map(|b| b.to_vec()).unwrap_or_default();

    let created = !state.entries.contains_key(key);
    ensure_parents(state, base, key);
    let etag = next_etag(state);
    state.entries.insert(
        key.to_string(),
        Entry {
            kind: if is_container {
                ResourceKind::Container
            } else {
                ResourceKind::Resource
            },
            body,
            content_type,
            etag: etag.clone(),
            last_modified: http_date_now(),
            wac_allow: None,
        },
    );
    if created {
        touch_parent(state, base, key);
    }
    HttpResponse {
        status: if created { 201 } else { 204 },
        headers: vec![("ETag".to_string(), etag)],
        body: Bytes::new(),
    }
}

fn delete(state: &mut State, base: &str, key: &str) -> HttpResponse {
    if state.fail_deletes {
        return plain(500, "delete failed");
    }
    let Some(entry) = state.entries.get(key) else {
        return plain(404, "not found");
    };
    if entry.kind.is_container() {
        let populated = state
            .entries
            .keys()
            .any(|k| k != key && k.starts_with(key));
        if populated {
            return plain(409, "container not empty");
        }
    }
    state.entries.remove(key);
    touch_parent(state, base, key);
    plain(204, "")
}

/// Materializes the intermediate containers of a URL key, the way real
/// stores do on PUT.
fn ensure_parents(state: &mut State, base: &str, key: &str) {
    let rest = &key[base.len()..];
    let segments: Vec<&str> = rest.split('/').collect();
    let mut prefix = String::from(base);
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if segment.is_empty() {
            continue;
        }
        prefix.push_str(segment);
        prefix.push('/');
        if !state.entries.contains_key(&prefix) {
            let etag = next_etag(state);
            state.entries.insert(prefix.clone(), Entry::container(etag));
        }
    }
}

/// Rotates the direct parent container's validator after a membership
/// change, the way real stores do when a container's listing changes.
fn touch_parent(state: &mut State, base: &str, key: &str) {
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    let Some(idx) = trimmed.rfind('/') else {
        return;
    };
    let parent = &trimmed[..=idx];
    if parent.len() < base.len() {
        return;
    }
    let etag = next_etag(state);
    let stamp = http_date_now();
    if let Some(entry) = state.entries.get_mut(parent) {
        entry.etag = etag;
        entry.last_modified = stamp;
    }
}

fn next_etag(state: &mut State) -> String {
    state.etag_counter += 1;
    format!("\"v{}\"", state.etag_counter)
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn plain(status: u16, message: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: Vec::new(),
        body: Bytes::copy_from_slice(message.as_bytes()),
    }
}
