//! Hierarchy index: the filesystem's view of the remote tree.
//!
//! Maps filesystem paths to [`ResourceHandle`]s and is the single owner
//! of all handles. The map itself is a `DashMap`, so operations on
//! different paths proceed in parallel; each handle sits behind its own
//! async `RwLock`, so operations on the same path observe a consistent
//! before/after state even while one of them is suspended on network I/O.
//!
//! Invariant: a non-root path is only present while its parent path is
//! present, and a container is not removed while it has recorded
//! children. Mutating operations uphold this locally; the dispatcher
//! only calls them after the corresponding remote call succeeded.

use crate::error::{PodError, PodResult};
use crate::resource::{join_path, split_path, ResourceHandle, ResourceKind};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

/// Shared, lockable handle as stored in the index.
pub type SharedHandle = Arc<RwLock<ResourceHandle>>;

/// Path-keyed index of every resource the mount knows about.
pub struct HierarchyIndex {
    base_url: Url,
    handles: DashMap<String, SharedHandle>,
}

impl HierarchyIndex {
    /// Creates an index holding only the root container.
    pub fn new(base_url: Url) -> Self {
        let index = Self {
            base_url,
            handles: DashMap::new(),
        };
        let root = ResourceHandle::new(&index.base_url, "/", ResourceKind::Container);
        index.handles.insert("/".to_string(), Arc::new(RwLock::new(root)));
        index
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Local lookup; never touches the network.
    pub fn get(&self, path: &str) -> Option<SharedHandle> {
        self.handles.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of known paths, root included.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Local resolve: the handle, or NotFound without a network call.
    pub fn resolve(&self, path: &str) -> PodResult<SharedHandle> {
        self.get(path)
            .ok_or_else(|| PodError::NotFound(path.to_string()))
    }

    /// Inserts a handle for `path`, materializing it under its parent.
    ///
    /// The parent must already be present and be a container; the new
    /// name is recorded in the parent's member set if that set has been
    /// listed. Returns the existing handle unchanged if the path is
    /// already known (kind mismatch is an error: kind never mutates in
    /// place).
    pub async fn insert(&self, path: &str, kind: ResourceKind) -> PodResult<SharedHandle> {
        if path == "/" {
            return self.resolve("/");
        }
        let (parent_path, name) = split_path(path)
            .ok_or_else(|| PodError::InvalidPath(path.to_string()))?;
        let parent = self
            .get(parent_path)
            .ok_or_else(|| PodError::NotFound(parent_path.to_string()))?;

        {
            let mut parent_guard = parent.write().await;
            if !parent_guard.kind.is_container() {
                return Err(PodError::NotAContainer(parent_path.to_string()));
            }
            if let Some(children) = parent_guard.children.as_mut() {
                children.insert(name.to_string());
            }
        }

        if let Some(existing) = self.get(path) {
            let existing_kind = existing.read().await.kind;
            if existing_kind != kind {
                return Err(PodError::AlreadyExists(path.to_string()));
            }
            return Ok(existing);
        }

        let handle = Arc::new(RwLock::new(ResourceHandle::new(&self.base_url, path, kind)));
        self.handles.insert(path.to_string(), Arc::clone(&handle));
        trace!(path, ?kind, "materialized handle");
        Ok(handle)
    }

    /// Removes a path from the index and from its parent's member set.
    ///
    /// Containers with recorded children are refused; the dispatcher
    /// must empty them (or fail the operation) first.
    pub async fn remove(&self, path: &str) -> PodResult<()> {
        if path == "/" {
            return Err(PodError::NotSupported("removing the root".to_string()));
        }
        let handle = self
            .get(path)
            .ok_or_else(|| PodError::NotFound(path.to_string()))?;
        {
            let guard = handle.read().await;
            if let Some(children) = &guard.children {
                if !children.is_empty() {
                    return Err(PodError::NotEmpty(path.to_string()));
                }
            }
        }

        self.handles.remove(path);
        if let Some((parent_path, name)) = split_path(path) {
            if let Some(parent) = self.get(parent_path) {
                let mut parent_guard = parent.write().await;
                if let Some(children) = parent_guard.children.as_mut() {
                    children.remove(name);
                }
            }
        }
        trace!(path, "removed handle");
        Ok(())
    }

    /// Index-side half of rename: moves the handle's cached state from
    /// `old_path` to `new_path`.
    ///
    /// Called only after the remote copy and delete both succeeded, so
    /// the index never shows two live handles for one remote identity
    /// on a successful rename.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> PodResult<()> {
        let old = self
            .get(old_path)
            .ok_or_else(|| PodError::NotFound(old_path.to_string()))?;
        let kind = old.read().await.kind;

        let new_handle = self.insert(new_path, kind).await?;
        {
            let old_guard = old.read().await;
            let mut new_guard = new_handle.write().await;
            new_guard.content_type = old_guard.content_type.clone();
            new_guard.size = old_guard.size;
            new_guard.body = old_guard.body.clone();
            new_guard.mode = old_guard.mode;
            // The new resource has its own etag and timestamps.
            new_guard.etag = None;
            new_guard.fetched_at = None;
        }
        self.remove(old_path).await
    }

    /// Records a container listing, materializing handles for members
    /// that are not yet known and pruning members that disappeared.
    pub async fn record_listing(
        &self,
        container_path: &str,
        members: Vec<(String, ResourceKind)>,
    ) -> PodResult<()> {
        let container = self
            .get(container_path)
            .ok_or_else(|| PodError::NotFound(container_path.to_string()))?;

        let mut names = BTreeSet::new();
        for (name, kind) in &members {
            names.insert(name.clone());
            let child_path = join_path(container_path, name);
            if self.get(&child_path).is_none() {
                let handle = ResourceHandle::new(&self.base_url, &child_path, *kind);
                self.handles
                    .insert(child_path.clone(), Arc::new(RwLock::new(handle)));
                trace!(path = child_path, "discovered member");
            }
        }

        // Prune paths whose member vanished remotely, but keep entries
        // with a pending local creation (never fetched, not yet listed).
        let mut vanished = Vec::new();
        {
            let mut guard = container.write().await;
            if !guard.kind.is_container() {
                return Err(PodError::NotAContainer(container_path.to_string()));
            }
            if let Some(previous) = guard.children.replace(names.clone()) {
                for name in previous.difference(&names) {
                    vanished.push(join_path(container_path, name));
                }
            }
        }
        for path in vanished {
            if let Some(handle) = self.get(&path) {
                if handle.read().await.ever_fetched() {
                    self.handles.remove(&path);
                    trace!(path, "pruned vanished member");
                } else {
                    // Locally created, not flushed yet: keep it listed.
                    let name = split_path(&path).map(|(_, n)| n.to_string());
                    if let Some(name) = name {
                        container
                            .write()
                            .await
                            .children
                            .get_or_insert_with(BTreeSet::new)
                            .insert(name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Marks a path stale so the next access refreshes it. Unknown paths
    /// are ignored; the listener may race with local removal.
    pub async fn invalidate(&self, path: &str) {
        if let Some(handle) = self.get(path) {
            handle.write().await.invalidate();
            trace!(path, "invalidated");
        }
    }
}
