//! Change listener: websocket subscriptions invalidating cached state.
//!
//! Containers are subscribed at a notification gateway: a POST naming
//! the container URL as topic negotiates a websocket endpoint (and
//! subprotocol), and every frame received on that socket marks the
//! container stale so the next access revalidates. This narrows the
//! window in which another client's changes stay invisible; without it
//! the mount still converges through conditional refresh, just no
//! faster than the freshness window.
//!
//! Subscriptions reconnect with capped exponential backoff. After too
//! many consecutive failures the subscription gives up for the life of
//! the mount rather than hammering a broken gateway.

use crate::error::{PodError, PodResult};
use crate::hierarchy::HierarchyIndex;
use crate::resource::percent_decode;
use crate::transport::{HttpRequest, Method, Transport};
use bytes::Bytes;
use dashmap::DashSet;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Consecutive failures after which a subscription stops retrying.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Ceiling for the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Gateway answer to a subscription request.
#[derive(Debug, Deserialize)]
struct Subscription {
    endpoint: String,
    #[serde(default)]
    subprotocol: Option<String>,
}

/// Subscribes containers at the notification gateway and invalidates
/// them when change frames arrive.
pub struct ChangeListener {
    gateway: Url,
    transport: Arc<Transport>,
    index: Arc<HierarchyIndex>,
    watched: DashSet<String>,
}

impl ChangeListener {
    pub fn new(gateway: Url, transport: Arc<Transport>, index: Arc<HierarchyIndex>) -> Self {
        Self {
            gateway,
            transport,
            index,
            watched: DashSet::new(),
        }
    }

    /// Number of containers with a subscription started.
    pub fn watched(&self) -> usize {
        self.watched.len()
    }

    /// Starts watching a container. Idempotent per path; the actual
    /// subscription runs on a background task and never blocks the
    /// calling operation.
    pub fn watch(&self, path: &str, url: &Url) {
        if !self.watched.insert(path.to_string()) {
            return;
        }
        let gateway = self.gateway.clone();
        let transport = Arc::clone(&self.transport);
        let index = Arc::clone(&self.index);
        let path = path.to_string();
        let topic = url.clone();
        tokio::spawn(async move {
            run_subscription(gateway, transport, index, path, topic).await;
        });
    }
}

async fn run_subscription(
    gateway: Url,
    transport: Arc<Transport>,
    index: Arc<HierarchyIndex>,
    path: String,
    topic: Url,
) {
    let mut failures = 0u32;
    loop {
        match subscribe_once(&gateway, &transport, &index, &path, &topic).await {
            Ok(()) => {
                failures = 0;
                debug!(path, "notification stream closed, reconnecting");
            }
            Err(e) => {
                failures += 1;
                warn!(path, error = %e, failures, "notification subscription failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!(path, "giving up on change notifications, relying on conditional refresh");
                    return;
                }
            }
        }
        sleep(backoff(failures)).await;
    }
}

/// One full subscription: negotiate, connect, pump frames until the
/// stream ends. Returns Ok on orderly close.
async fn subscribe_once(
    gateway: &Url,
    transport: &Transport,
    index: &HierarchyIndex,
    path: &str,
    topic: &Url,
) -> PodResult<()> {
    let negotiated = negotiate(gateway, transport, topic).await?;

    let mut request = negotiated
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| PodError::Transport(format!("bad notification endpoint: {e}")))?;
    if let Some(subprotocol) = &negotiated.subprotocol {
        let value = HeaderValue::from_str(subprotocol)
            .map_err(|_| PodError::Transport(format!("bad subprotocol: {subprotocol}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", value);
    }

    let (mut stream, _) = connect_async(request)
        .await
        .map_err(|e| PodError::Transport(format!("websocket connect: {e}")))?;
    info!(path, endpoint = negotiated.endpoint, "subscribed to change notifications");

    while let Some(message) = stream.next().await {
        let message =
            message.map_err(|e| PodError::Transport(format!("websocket read: {e}")))?;
        match message {
            Message::Text(frame) => handle_frame(index, path, &frame).await,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Negotiates the websocket endpoint for a topic at the gateway. Goes
/// through the transport so credentials are attached.
async fn negotiate(gateway: &Url, transport: &Transport, topic: &Url) -> PodResult<Subscription> {
    let body = serde_json::json!({ "topic": topic.as_str() });
    let request = HttpRequest::new(Method::Post, gateway.clone())
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .body(Bytes::from(body.to_string()));

    let response = transport.send(request).await?;
    if !response.is_success() {
        return Err(PodError::from_status(response.status, gateway.as_str()));
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| PodError::Transport(format!("malformed subscription response: {e}")))
}

/// A frame means something under the container changed: the container
/// goes stale, and so does the changed member when the frame names one
/// the index knows.
async fn handle_frame(index: &HierarchyIndex, container_path: &str, frame: &str) {
    debug!(path = container_path, "change notification received");
    index.invalidate(container_path).await;
    if let Some(changed) = changed_url(frame) {
        if let Some(member_path) = path_under_base(index.base_url(), &changed) {
            index.invalidate(&member_path).await;
        }
    }
}

/// Pulls the changed resource URL out of a notification frame. Frames
/// vary by gateway; both the bare-string and the object form of the
/// activity's `object` field are accepted.
fn changed_url(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    match value.get("object")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Maps a resource URL back to its mount path, if it is under the base.
fn path_under_base(base: &Url, changed: &str) -> Option<String> {
    let rest = changed.strip_prefix(base.as_str())?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Some("/".to_string());
    }
    Some(format!("/{}", percent_decode(rest)))
}

fn backoff(failures: u32) -> Duration {
    let secs = 1u64 << failures.min(6);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialManager;
    use crate::testing::FakePod;

    #[test]
    fn test_changed_url_accepts_both_frame_shapes() {
        assert_eq!(
            changed_url(r#"{"object": "https://pod.example/data/a.txt"}"#).as_deref(),
            Some("https://pod.example/data/a.txt")
        );
        assert_eq!(
            changed_url(r#"{"object": {"id": "https://pod.example/data/b.txt"}}"#).as_deref(),
            Some("https://pod.example/data/b.txt")
        );
        assert_eq!(changed_url("not json"), None);
        assert_eq!(changed_url(r#"{"type": "Update"}"#), None);
    }

    #[test]
    fn test_path_under_base() {
        let base = Url::parse("https://pod.example/data/").unwrap();
        assert_eq!(
            path_under_base(&base, "https://pod.example/data/a.txt").as_deref(),
            Some("/a.txt")
        );
        assert_eq!(
            path_under_base(&base, "https://pod.example/data/dir/").as_deref(),
            Some("/dir")
        );
        assert_eq!(
            path_under_base(&base, "https://pod.example/data/").as_deref(),
            Some("/")
        );
        assert_eq!(
            path_under_base(&base, "https://pod.example/data/my%20file.txt").as_deref(),
            Some("/my file.txt")
        );
        assert!(path_under_base(&base, "https://elsewhere.example/x").is_none());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff(1) < backoff(3));
        assert!(backoff(3) < backoff(6));
        assert_eq!(backoff(6), backoff(20));
        assert!(backoff(20) <= MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_watch_is_idempotent_per_path() {
        let pod = Arc::new(FakePod::new("https://pod.example/data/"));
        let transport = Arc::new(Transport::new(
            pod.clone(),
            CredentialManager::unauthenticated(),
        ));
        let index = Arc::new(HierarchyIndex::new(
            Url::parse("https://pod.example/data/").unwrap(),
        ));
        let listener = ChangeListener::new(
            Url::parse("https://gateway.example/subscriptions").unwrap(),
            transport,
            Arc::clone(&index),
        );

        let url = Url::parse("https://pod.example/data/dir/").unwrap();
        listener.watch("/dir", &url);
        listener.watch("/dir", &url);
        assert_eq!(listener.watched(), 1);
    }
}
