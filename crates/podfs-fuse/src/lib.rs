//! FUSE adapter for the Pod engine.
//!
//! Bridges fuser's synchronous callback model onto the async
//! [`PodFs`](podfs_core::PodFs) engine: an inode table maps kernel
//! inode numbers onto engine paths, and a runtime bridge runs each
//! operation with a deadline.

pub mod bridge;
pub mod filesystem;
pub mod inode;

pub use bridge::{BridgeError, BridgeStats};
pub use filesystem::PodFilesystem;
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
