//! Inode management for the FUSE adapter.
//!
//! The engine speaks paths; the kernel speaks inode numbers. This table
//! owns the bidirectional mapping, with `nlookup` reference counting so
//! entries are only evicted once the kernel sends `forget` for every
//! reference it took.

use dashmap::DashMap;
use podfs_core::ResourceKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Filesystem path of this inode.
    pub path: String,
    /// Container or resource, as last observed.
    pub kind: ResourceKind,
    /// Lookup count for `forget()` handling. The kernel holds this many
    /// references to the inode.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: String, kind: ResourceKind, nlookup: u64) -> Self {
        Self {
            path,
            kind,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    fn inc_nlookup(&self) {
        self.nlookup.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements by `count`; returns the remaining references.
    fn dec_nlookup(&self, count: u64) -> u64 {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        old.saturating_sub(count)
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe path↔inode table.
pub struct InodeTable {
    by_ino: DashMap<u64, Arc<InodeEntry>>,
    by_path: DashMap<String, u64>,
    next: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_ino.insert(
            ROOT_INODE,
            Arc::new(InodeEntry::new("/".to_string(), ResourceKind::Container, 1)),
        );
        table.by_path.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Returns the inode for a path, allocating one if needed, and
    /// increments `nlookup`. Used by lookup, create, and mkdir, which
    /// per the FUSE contract hand the kernel a new reference.
    pub fn get_or_insert(&self, path: &str, kind: ResourceKind) -> u64 {
        if let Some(ino) = self.by_path.get(path).map(|e| *e.value()) {
            if let Some(entry) = self.by_ino.get(&ino) {
                entry.inc_nlookup();
            }
            return ino;
        }
        self.insert_new(path, kind, 1)
    }

    /// Like [`get_or_insert`](Self::get_or_insert) but without touching
    /// `nlookup`. readdir entries must not take kernel references.
    pub fn get_or_insert_no_lookup_inc(&self, path: &str, kind: ResourceKind) -> u64 {
        if let Some(ino) = self.by_path.get(path).map(|e| *e.value()) {
            return ino;
        }
        self.insert_new(path, kind, 0)
    }

    fn insert_new(&self, path: &str, kind: ResourceKind, nlookup: u64) -> u64 {
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_ino.insert(
            ino,
            Arc::new(InodeEntry::new(path.to_string(), kind, nlookup)),
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Looks up an entry by inode number.
    pub fn get(&self, ino: u64) -> Option<Arc<InodeEntry>> {
        self.by_ino.get(&ino).map(|e| Arc::clone(e.value()))
    }

    /// The path behind an inode, if the inode is live.
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.get(ino).map(|e| e.path.clone())
    }

    /// Looks up an inode by path.
    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|e| *e.value())
    }

    /// Releases `nlookup` kernel references; evicts the entry when the
    /// count reaches zero. The root is never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let Some(entry) = self.get(ino) else {
            return false;
        };
        if entry.dec_nlookup(nlookup) == 0 {
            self.by_ino.remove(&ino);
            // Only drop the path mapping if it still points at us; a
            // rename may have reassigned the path meanwhile.
            self.by_path.remove_if(&entry.path, |_, v| *v == ino);
            return true;
        }
        false
    }

    /// Removes the path→inode mapping after a delete. The inode entry
    /// itself stays until the kernel forgets it; the kernel may still
    /// send operations with the cached inode number.
    pub fn invalidate_path(&self, path: &str) {
        self.by_path.remove(path);
    }

    /// Re-keys an inode after a rename.
    pub fn update_path(&self, ino: u64, old_path: &str, new_path: &str) {
        self.by_path.remove_if(old_path, |_, v| *v == ino);
        self.by_path.insert(new_path.to_string(), ino);
        if let Some(mut entry) = self.by_ino.get_mut(&ino) {
            let kind = entry.kind;
            let nlookup = entry.nlookup();
            *entry.value_mut() = Arc::new(InodeEntry::new(new_path.to_string(), kind, nlookup));
        }
    }

    /// Number of live inodes, root included.
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
