//! Operation dispatcher: POSIX filesystem calls over the Pod.
//!
//! [`PodFs`] implements each filesystem call as a short-lived
//! transaction over the hierarchy index, cache manager, and transport.
//! The transport bridge (FUSE) calls into this API with plain paths and
//! handle ids; nothing here depends on the kernel interface.
//!
//! Mutating operations update the index only after the remote call
//! succeeded, so a failed operation leaves the last-known-good state.
//! The single documented exception is [`PodFs::rename`], which is
//! copy-then-delete and can leave both paths live remotely when the
//! delete half fails.

use crate::auth::CredentialManager;
use crate::cache::{apply_metadata, CacheManager};
use crate::config::{HttpBackendKind, PodConfig};
use crate::error::{validate_path, PodError, PodResult};
use crate::handles::{OpenFile, OpenFileTable, PendingWrite};
use crate::hierarchy::{HierarchyIndex, SharedHandle};
use crate::ldp;
use crate::notify::ChangeListener;
use crate::resource::{split_path, ResourceKind};
use crate::transport::{HttpBackend, HttpRequest, Method, ReqwestBackend, Transport};
use crate::xattr::PodAttr;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// LDP type link sent when creating a plain resource.
const LINK_RESOURCE: &str = "<http://www.w3.org/ns/ldp#Resource>; rel=\"type\"";

/// LDP type link sent when creating a container.
const LINK_CONTAINER: &str = "<http://www.w3.org/ns/ldp#BasicContainer>; rel=\"type\"";

/// Fallback content type when nothing better is known.
const OCTET_STREAM: &str = "application/octet-stream";

/// Attributes surfaced to the kernel for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAttr {
    pub kind: ResourceKind,
    pub size: u64,
    pub mode: u16,
    pub mtime: Option<DateTime<Utc>>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: ResourceKind,
}

/// The Pod filesystem engine.
pub struct PodFs {
    config: PodConfig,
    index: Arc<HierarchyIndex>,
    cache: CacheManager,
    transport: Arc<Transport>,
    open_files: OpenFileTable,
    /// Current buffer size per path with an open write handle. getattr
    /// must report these, not the remote size, while writes are pending.
    pending_sizes: DashMap<String, u64>,
    listener: Option<ChangeListener>,
}

impl PodFs {
    /// Builds the engine with the production HTTP backend selected by
    /// the configuration.
    pub fn new(config: PodConfig) -> PodResult<Arc<Self>> {
        let backend: Arc<dyn HttpBackend> = match config.http_backend {
            HttpBackendKind::Reqwest => Arc::new(ReqwestBackend::new(config.io_timeout)?),
        };
        Ok(Self::with_backend(config, backend))
    }

    /// Builds the engine over an explicit backend. Tests use this to
    /// substitute an in-memory Pod.
    pub fn with_backend(config: PodConfig, backend: Arc<dyn HttpBackend>) -> Arc<Self> {
        let auth = match config.credentials.clone() {
            Some(credentials) => CredentialManager::new(credentials, Arc::clone(&backend)),
            None => CredentialManager::unauthenticated(),
        };
        let transport = Arc::new(Transport::new(backend, auth));
        let index = Arc::new(HierarchyIndex::new(config.base_url.clone()));
        let cache = CacheManager::new(Arc::clone(&transport), &config);
        let listener = config.notification_gateway.clone().map(|gateway| {
            ChangeListener::new(gateway, Arc::clone(&transport), Arc::clone(&index))
        });

        info!(
            base_url = %config.base_url,
            content_caching = config.content_caching,
            notifications = listener.is_some(),
            session = transport.session_id(),
            "pod engine ready"
        );
        Arc::new(Self {
            config,
            index,
            cache,
            transport,
            open_files: OpenFileTable::new(),
            pending_sizes: DashMap::new(),
            listener,
        })
    }

    pub fn config(&self) -> &PodConfig {
        &self.config
    }

    /// Number of open file handles (for shutdown diagnostics).
    pub fn open_handles(&self) -> usize {
        self.open_files.len()
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    /// Resolves a path to its handle, materializing ancestors by listing
    /// containers on the way down.
    ///
    /// A path whose parent is not a known container fails as NotFound
    /// without probing the store for the path itself; this prevents
    /// speculative lookups from fanning out across the network.
    async fn resolve_path(&self, path: &str) -> PodResult<SharedHandle> {
        validate_path(path)?;
        if let Some(handle) = self.index.get(path) {
            return Ok(handle);
        }

        let mut current = "/".to_string();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let container = self.index.resolve(&current)?;
            if !container.read().await.kind.is_container() {
                return Err(PodError::NotAContainer(current));
            }
            let next = crate::resource::join_path(&current, part);
            if self.index.get(&next).is_none() {
                let members = self.list_container(&current).await?;
                if !members.contains(part) {
                    return Err(PodError::NotFound(path.to_string()));
                }
            }
            current = next;
        }
        self.index.resolve(path)
    }

    /// Lists a container, refreshing through the cache manager, and
    /// returns the recorded member names.
    async fn list_container(&self, path: &str) -> PodResult<BTreeSet<String>> {
        let handle = self.index.resolve(path)?;
        {
            let guard = handle.read().await;
            if !guard.kind.is_container() {
                return Err(PodError::NotAContainer(path.to_string()));
            }
        }

        let first_listing = handle.read().await.children.is_none();
        if let Some(turtle) = self.cache.fetch_listing(&handle).await? {
            let url = handle.read().await.url.clone();
            let members = ldp::parse_members(&url, &turtle)
                .into_iter()
                .map(|m| (m.name, m.kind))
                .collect();
            self.index.record_listing(path, members).await?;
            if first_listing {
                if let Some(listener) = &self.listener {
                    listener.watch(path, &url);
                }
            }
        }

        let guard = handle.read().await;
        Ok(guard.children.clone().unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Metadata operations
    // ------------------------------------------------------------------

    /// getattr: kind, size, mode, and mtime for a path.
    #[instrument(level = "debug", skip(self))]
    pub async fn getattr(&self, path: &str) -> PodResult<ResourceAttr> {
        let handle = self.resolve_path(path).await?;

        // A path with an open write buffer reports the buffer, not the
        // store: the resource may not even exist remotely yet.
        if let Some(size) = self.pending_sizes.get(path) {
            let guard = handle.read().await;
            return Ok(ResourceAttr {
                kind: guard.kind,
                size: *size,
                mode: guard.mode,
                mtime: guard.last_modified,
            });
        }

        if !self.cache.is_fresh(&*handle.read().await) {
            match self.cache.refresh_metadata(&handle).await {
                Ok(()) => {}
                Err(PodError::NotFound(_)) => {
                    // Confirmed gone remotely; drop our record of it.
                    let _ = self.index.remove(path).await;
                    return Err(PodError::NotFound(path.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        let guard = handle.read().await;
        Ok(ResourceAttr {
            kind: guard.kind,
            size: guard.size,
            mode: guard.mode,
            mtime: guard.last_modified,
        })
    }

    /// readdir: the members of a container, ordered by name.
    #[instrument(level = "debug", skip(self))]
    pub async fn readdir(&self, path: &str) -> PodResult<Vec<DirEntry>> {
        let handle = self.resolve_path(path).await?;
        if !handle.read().await.kind.is_container() {
            return Err(PodError::NotAContainer(path.to_string()));
        }

        let names = self.list_container(path).await?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child_path = crate::resource::join_path(path, &name);
            let kind = match self.index.get(&child_path) {
                Some(child) => child.read().await.kind,
                None => ResourceKind::Resource,
            };
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // File I/O
    // ------------------------------------------------------------------

    /// open: returns a handle id. `write` opens for update (seeding the
    /// pending buffer with current content), `truncate` discards the
    /// current content instead.
    #[instrument(level = "debug", skip(self))]
    pub async fn open(&self, path: &str, write: bool, truncate: bool) -> PodResult<u64> {
        let handle = self.resolve_path(path).await?;
        let (kind, content_type) = {
            let guard = handle.read().await;
            (guard.kind, guard.content_type.clone())
        };
        if kind.is_container() {
            return Err(PodError::IsAContainer(path.to_string()));
        }

        let pending = if write {
            let content_type = content_type.unwrap_or_else(|| OCTET_STREAM.to_string());
            let buffer = if truncate {
                PendingWrite::for_create(content_type)
            } else {
                let body = self.cache.ensure_body(&handle).await?;
                PendingWrite::from_existing(body.to_vec(), content_type)
            };
            self.pending_sizes.insert(path.to_string(), buffer.len());
            Some(buffer)
        } else {
            None
        };

        let fh = self.open_files.insert(OpenFile {
            path: path.to_string(),
            pending,
        });
        debug!(path, fh, write, truncate, "opened");
        Ok(fh)
    }

    /// create: allocates the resource locally with an empty dirty buffer;
    /// nothing is uploaded until flush/release.
    #[instrument(level = "debug", skip(self))]
    pub async fn create(&self, path: &str) -> PodResult<u64> {
        validate_path(path)?;
        let (parent, name) =
            split_path(path).ok_or_else(|| PodError::InvalidPath(path.to_string()))?;
        let parent_handle = self.resolve_path(parent).await?;
        if !parent_handle.read().await.kind.is_container() {
            return Err(PodError::NotAContainer(parent.to_string()));
        }
        if let Some(existing) = self.index.get(path) {
            if existing.read().await.kind.is_container() {
                return Err(PodError::IsAContainer(path.to_string()));
            }
        }

        // The path is fixed at creation, so the extension is the best
        // available guess until real content arrives.
        let content_type = mime_guess::from_path(name)
            .first_raw()
            .unwrap_or(OCTET_STREAM)
            .to_string();

        let handle = self.index.insert(path, ResourceKind::Resource).await?;
        handle.write().await.content_type = Some(content_type.clone());

        let fh = self.open_files.insert(OpenFile {
            path: path.to_string(),
            pending: Some(PendingWrite::for_create(content_type)),
        });
        self.pending_sizes.insert(path.to_string(), 0);
        debug!(path, fh, "created");
        Ok(fh)
    }

    /// read: serves `[offset, offset+size)` from the open handle.
    ///
    /// Handles opened for writing read their own buffer; read-only
    /// handles read the (cached) remote body. Offsets past end-of-file
    /// yield an empty read, never an error.
    pub async fn read(&self, fh: u64, offset: u64, size: usize) -> PodResult<Bytes> {
        let path = {
            let file = self
                .open_files
                .get(fh)
                .ok_or_else(|| PodError::NotFound(format!("handle {fh}")))?;
            if let Some(pending) = &file.pending {
                return Ok(Bytes::copy_from_slice(pending.read(offset, size)));
            }
            file.path.clone()
        };

        let handle = self.index.resolve(&path)?;
        let body = self.cache.ensure_body(&handle).await?;
        #[allow(clippy::cast_possible_truncation)]
        let start = (offset as usize).min(body.len());
        let end = start.saturating_add(size).min(body.len());
        Ok(body.slice(start..end))
    }

    /// write: buffers into the pending write; no network traffic.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> PodResult<u32> {
        let mut file = self
            .open_files
            .get_mut(fh)
            .ok_or_else(|| PodError::NotFound(format!("handle {fh}")))?;
        let path = file.path.clone();
        let pending = file
            .pending
            .as_mut()
            .ok_or_else(|| PodError::NotSupported("write on read-only handle".to_string()))?;

        let written = pending.write(offset, data);
        self.pending_sizes.insert(path, pending.len());
        #[allow(clippy::cast_possible_truncation)]
        Ok(written as u32)
    }

    /// flush: uploads the pending buffer if dirty, keeping the handle
    /// open. Called on every close() of a duplicated descriptor.
    #[instrument(level = "debug", skip(self))]
    pub async fn flush(&self, fh: u64) -> PodResult<()> {
        let upload = {
            let mut file = match self.open_files.get_mut(fh) {
                Some(file) => file,
                None => return Ok(()),
            };
            let path = file.path.clone();
            match file.pending.as_mut() {
                Some(pending) if pending.is_dirty() => {
                    let payload = Bytes::copy_from_slice(pending.content());
                    let content_type = pending.content_type().to_string();
                    pending.mark_clean();
                    Some((path, payload, content_type))
                }
                _ => None,
            }
        };

        if let Some((path, payload, content_type)) = upload {
            if let Err(e) = self.upload(&path, payload, &content_type).await {
                // Keep the buffer dirty so a later flush retries.
                if let Some(mut file) = self.open_files.get_mut(fh) {
                    if let Some(pending) = file.pending.as_mut() {
                        pending.mark_dirty();
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// release: final close of a handle; uploads outstanding writes and
    /// discards the buffer.
    #[instrument(level = "debug", skip(self))]
    pub async fn release(&self, fh: u64) -> PodResult<()> {
        let Some(file) = self.open_files.remove(fh) else {
            return Ok(());
        };
        self.pending_sizes.remove(&file.path);

        if let Some(pending) = file.pending {
            if pending.is_dirty() {
                let payload = Bytes::copy_from_slice(pending.content());
                self.upload(&file.path, payload, pending.content_type())
                    .await?;
            }
        }
        Ok(())
    }

    /// truncate: adjusts size through the open buffer when one exists,
    /// otherwise read-modify-write against the store.
    #[instrument(level = "debug", skip(self))]
    pub async fn truncate(&self, path: &str, size: u64) -> PodResult<()> {
        validate_path(path)?;

        // An open write handle owns the truth about this path's content.
        for mut entry in self.open_files.iter_mut() {
            if entry.path == path {
                if let Some(pending) = entry.pending.as_mut() {
                    pending.truncate(size);
                    let len = pending.len();
                    drop(entry);
                    self.pending_sizes.insert(path.to_string(), len);
                    return Ok(());
                }
            }
        }

        let handle = self.resolve_path(path).await?;
        if handle.read().await.kind.is_container() {
            return Err(PodError::IsAContainer(path.to_string()));
        }
        let body = self.cache.ensure_body(&handle).await?;
        if body.len() as u64 == size {
            return Ok(());
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut content = body.to_vec();
        content.resize(size as usize, 0);
        let content_type = handle
            .read()
            .await
            .content_type
            .clone()
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        self.upload(path, Bytes::from(content), &content_type).await
    }

    /// Uploads a full resource body via PUT and records the result.
    async fn upload(&self, path: &str, payload: Bytes, content_type: &str) -> PodResult<()> {
        let handle = self.index.resolve(path)?;
        let url = handle.read().await.url.clone();

        let request = HttpRequest::new(Method::Put, url.clone())
            .header("Link", LINK_RESOURCE)
            .header("Content-Type", content_type)
            .body(payload.clone());
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            warn!(path, status = response.status, "upload rejected");
            return Err(PodError::from_status(response.status, url.as_str()));
        }

        let mut guard = handle.write().await;
        apply_metadata(&mut guard, &response);
        guard.content_type = Some(content_type.to_string());
        guard.size = payload.len() as u64;
        guard.body = self.cache.content_caching().then(|| payload.clone());
        guard.fetched_at = Some(Instant::now());
        debug!(path, size = payload.len(), "uploaded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Namespace operations
    // ------------------------------------------------------------------

    /// mkdir: creates an empty container.
    #[instrument(level = "debug", skip(self))]
    pub async fn mkdir(&self, path: &str) -> PodResult<()> {
        validate_path(path)?;
        let (parent, _) =
            split_path(path).ok_or_else(|| PodError::InvalidPath(path.to_string()))?;
        let parent_handle = self.resolve_path(parent).await?;
        if !parent_handle.read().await.kind.is_container() {
            return Err(PodError::NotAContainer(parent.to_string()));
        }
        if self.index.get(path).is_some() {
            return Err(PodError::AlreadyExists(path.to_string()));
        }

        let url = crate::resource::url_for_path(
            self.index.base_url(),
            path,
            ResourceKind::Container,
        );
        let request = HttpRequest::new(Method::Put, url.clone())
            .header("Link", LINK_CONTAINER)
            .header("Content-Type", "text/turtle");
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(PodError::from_status(response.status, url.as_str()));
        }

        let handle = self.index.insert(path, ResourceKind::Container).await?;
        let mut guard = handle.write().await;
        apply_metadata(&mut guard, &response);
        guard.content_type = Some("text/turtle".to_string());
        // A container we just made is known empty; no listing needed.
        guard.children = Some(BTreeSet::new());
        guard.fetched_at = Some(Instant::now());
        info!(path, "container created");
        Ok(())
    }

    /// rmdir: deletes an empty container; NotEmpty otherwise.
    #[instrument(level = "debug", skip(self))]
    pub async fn rmdir(&self, path: &str) -> PodResult<()> {
        let handle = self.resolve_path(path).await?;
        if !handle.read().await.kind.is_container() {
            return Err(PodError::NotAContainer(path.to_string()));
        }
        let members = self.list_container(path).await?;
        if !members.is_empty() {
            return Err(PodError::NotEmpty(path.to_string()));
        }

        self.delete_remote(&handle).await?;
        self.index.remove(path).await?;
        info!(path, "container removed");
        Ok(())
    }

    /// unlink: deletes a non-RDF resource.
    #[instrument(level = "debug", skip(self))]
    pub async fn unlink(&self, path: &str) -> PodResult<()> {
        let handle = self.resolve_path(path).await?;
        if handle.read().await.kind.is_container() {
            return Err(PodError::IsAContainer(path.to_string()));
        }

        self.delete_remote(&handle).await?;
        self.index.remove(path).await?;
        info!(path, "resource removed");
        Ok(())
    }

    async fn delete_remote(&self, handle: &SharedHandle) -> PodResult<()> {
        let url = handle.read().await.url.clone();
        let response = self
            .transport
            .send(HttpRequest::new(Method::Delete, url.clone()))
            .await?;
        // 202 would mean deferred deletion; treat as not yet supported.
        if !response.is_success() || response.status == 202 {
            return Err(PodError::from_status(response.status, url.as_str()));
        }
        Ok(())
    }

    /// rename: copy-then-delete, because the remote protocol has no
    /// atomic move.
    ///
    /// Resources are fetched in full, uploaded at the new URL, and the
    /// old URL deleted; empty containers are re-created and deleted the
    /// same way. Containers with members are rejected outright. A crash
    /// or failure between the upload and the delete leaves both paths
    /// live remotely; the index keeps the old path until the delete
    /// succeeds, so it never shows two live handles on success.
    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, old_path: &str, new_path: &str) -> PodResult<()> {
        validate_path(old_path)?;
        validate_path(new_path)?;
        let old_handle = self.resolve_path(old_path).await?;
        let kind = old_handle.read().await.kind;

        if let Some(existing) = self.index.get(new_path) {
            if existing.read().await.kind.is_container() {
                return Err(PodError::IsAContainer(new_path.to_string()));
            }
        }

        match kind {
            ResourceKind::Container => {
                let members = self.list_container(old_path).await?;
                if !members.is_empty() {
                    return Err(PodError::NotSupported(format!(
                        "renaming a non-empty container: {old_path}"
                    )));
                }
                self.mkdir(new_path).await?;
                if let Err(e) = self.rmdir(old_path).await {
                    warn!(old_path, new_path, "rename delete failed; both containers exist");
                    return Err(e);
                }
            }
            ResourceKind::Resource => {
                let body = self.cache.ensure_body(&old_handle).await?;
                let content_type = old_handle
                    .read()
                    .await
                    .content_type
                    .clone()
                    .unwrap_or_else(|| OCTET_STREAM.to_string());

                let new_url = crate::resource::url_for_path(
                    self.index.base_url(),
                    new_path,
                    ResourceKind::Resource,
                );
                let request = HttpRequest::new(Method::Put, new_url.clone())
                    .header("Link", LINK_RESOURCE)
                    .header("Content-Type", content_type.clone())
                    .body(body.clone());
                let response = self.transport.send(request).await?;
                if !response.is_success() {
                    return Err(PodError::from_status(response.status, new_url.as_str()));
                }

                if let Err(e) = self.delete_remote(&old_handle).await {
                    // Upload succeeded, delete did not: both live. Record
                    // the new path so it is at least reachable; keep the
                    // old one, which still exists remotely.
                    warn!(old_path, new_path, "rename delete failed; both resources exist");
                    let new_handle = self.index.insert(new_path, ResourceKind::Resource).await?;
                    let mut guard = new_handle.write().await;
                    guard.content_type = Some(content_type);
                    guard.size = body.len() as u64;
                    guard.body = self.cache.content_caching().then(|| body.clone());
                    return Err(e);
                }
                self.index.rename(old_path, new_path).await?;
            }
        }
        info!(old_path, new_path, "renamed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extended attributes
    // ------------------------------------------------------------------

    /// getxattr: values for the fixed attribute namespace.
    #[instrument(level = "debug", skip(self))]
    pub async fn getxattr(&self, path: &str, name: &str) -> PodResult<String> {
        let attr = PodAttr::parse(name)
            .ok_or_else(|| PodError::NotSupported(format!("attribute {name}")))?;
        let handle = self.resolve_path(path).await?;

        // Header-mirror attributes need the headers at least once.
        if !handle.read().await.ever_fetched() && self.pending_sizes.get(path).is_none() {
            self.cache.refresh_metadata(&handle).await?;
        }

        let guard = handle.read().await;
        attr.value(&guard)
            .ok_or_else(|| PodError::NoAttr(name.to_string()))
    }

    /// setxattr: only the mime-type attribute, only before the first
    /// upload fixes the content type remotely.
    #[instrument(level = "debug", skip(self, value))]
    pub async fn setxattr(&self, path: &str, name: &str, value: &str) -> PodResult<()> {
        let attr = PodAttr::parse(name)
            .ok_or_else(|| PodError::NotSupported(format!("attribute {name}")))?;
        if !attr.is_writable() {
            return Err(PodError::PermissionDenied(format!(
                "attribute {name} is read-only"
            )));
        }

        let handle = self.resolve_path(path).await?;
        if handle.read().await.kind.is_container() {
            return Err(PodError::IsAContainer(path.to_string()));
        }

        // Writable only while an un-flushed create buffer exists: the
        // content type goes out with the first upload and is immutable
        // afterwards.
        let mut applied = false;
        for mut entry in self.open_files.iter_mut() {
            if entry.path == path {
                if let Some(pending) = entry.pending.as_mut() {
                    pending.set_content_type(value.to_string());
                    applied = true;
                }
            }
        }
        if !applied {
            return Err(PodError::PermissionDenied(format!(
                "mime type of {path} is settable only at create time"
            )));
        }
        handle.write().await.content_type = Some(value.to_string());
        Ok(())
    }

    /// listxattr: the fixed attribute names.
    pub fn listxattr(&self, path: &str) -> PodResult<Vec<&'static str>> {
        validate_path(path)?;
        Ok(PodAttr::ALL.iter().map(|a| a.name()).collect())
    }
}
