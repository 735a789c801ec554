//! Core engine translating POSIX filesystem calls into Solid Pod (LDP)
//! HTTP operations.
//!
//! This crate is the kernel-agnostic half of podfs: it knows about
//! paths, containers, resources, and HTTP, but nothing about FUSE. The
//! FUSE adapter crate drives [`PodFs`] with plain paths and handle ids.
//!
//! # Features
//!
//! - Lazy hierarchy discovery through container listings
//! - Etag-based conditional refresh with a configurable freshness window
//! - Write batching: random-access writes buffer locally and upload once
//! - OAuth2 client-credentials authentication with token caching
//! - Optional websocket change notifications for cache invalidation
//! - Pluggable HTTP backend, with an in-memory Pod for tests
//!
//! # Usage
//!
//! ```ignore
//! use podfs_core::{PodConfig, PodFs};
//!
//! let config = PodConfig::new(url::Url::parse("https://pod.example/data/")?);
//! let fs = PodFs::new(config)?;
//! let attr = fs.getattr("/notes/todo.txt").await?;
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod handles;
pub mod hierarchy;
pub mod ldp;
pub mod notify;
pub mod resource;
pub mod testing;
pub mod transport;
pub mod xattr;

pub use config::{Credentials, HttpBackendKind, PodConfig};
pub use error::{validate_path, PodError, PodResult};
pub use fs::{DirEntry, PodFs, ResourceAttr};
pub use handles::{OpenFile, OpenFileTable, PendingWrite};
pub use hierarchy::{HierarchyIndex, SharedHandle};
pub use notify::ChangeListener;
pub use resource::{ResourceHandle, ResourceKind};
pub use transport::{HttpBackend, HttpRequest, HttpResponse, Method, Transport};
pub use xattr::PodAttr;
