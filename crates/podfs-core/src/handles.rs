//! Open-file handles and write buffering.
//!
//! The remote protocol replaces resource content wholesale on PUT, so
//! random-access writes cannot be sent as they arrive. A
//! [`PendingWrite`] accumulates them in memory and the dispatcher
//! uploads the full buffer once, on flush/release. This batches small
//! sequential writes (an `rsync --inplace` run, an editor save) into a
//! single request.
//!
//! Buffers are owned exclusively by the open-file context that created
//! them and are never read by other operations.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory buffer for a resource opened for writing.
#[derive(Debug)]
pub struct PendingWrite {
    /// The buffered content, full resource body.
    content: Vec<u8>,
    /// Whether the buffer must be uploaded even if untouched (create).
    dirty: bool,
    /// Content type to use for the upload.
    content_type: String,
}

impl PendingWrite {
    /// Buffer seeded with existing remote content (open for update).
    pub fn from_existing(content: Vec<u8>, content_type: String) -> Self {
        Self {
            content,
            dirty: false,
            content_type,
        }
    }

    /// Empty buffer for a freshly created resource. Dirty from the
    /// start: even an untouched create must upload to exist remotely.
    pub fn for_create(content_type: String) -> Self {
        Self {
            content: Vec::new(),
            dirty: true,
            content_type,
        }
    }

    /// Writes at the given offset, zero-filling any gap and growing the
    /// buffer as needed. Returns the number of bytes written.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as usize;
        let end = offset + data.len();
        if end > self.content.len() {
            if end > self.content.capacity() {
                // Geometric growth keeps sequential small writes O(n).
                let target = (self.content.capacity().saturating_mul(3) / 2).max(end);
                self.content.reserve(target - self.content.len());
            }
            self.content.resize(end, 0);
        }
        self.content[offset..end].copy_from_slice(data);
        self.dirty = true;
        data.len()
    }

    /// Reads back from the buffer; past-end reads return empty.
    pub fn read(&self, offset: u64, size: usize) -> &[u8] {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (offset as usize).min(self.content.len());
        let end = offset.saturating_add(size).min(self.content.len());
        &self.content[offset..end]
    }

    /// Cuts or zero-extends the buffer to the given size.
    pub fn truncate(&mut self, size: u64) {
        #[allow(clippy::cast_possible_truncation)]
        self.content.resize(size as usize, 0);
        self.dirty = true;
    }

    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the buffer clean after a successful upload.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Re-marks the buffer dirty, used when an upload failed after the
    /// buffer was optimistically marked clean.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Changes the upload content type. Only meaningful before the first
    /// flush; the dispatcher enforces that rule.
    pub fn set_content_type(&mut self, content_type: String) {
        self.content_type = content_type;
    }
}

/// One open file as seen by the kernel.
#[derive(Debug)]
pub struct OpenFile {
    /// Path the handle was opened on. Stays valid even if the path is
    /// unlinked while open.
    pub path: String,
    /// Present when the handle was opened for writing.
    pub pending: Option<PendingWrite>,
}

/// Thread-safe table of open files with auto-incrementing handle ids.
#[derive(Debug, Default)]
pub struct OpenFileTable {
    files: DashMap<u64, OpenFile>,
    next_id: AtomicU64,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts an open file and returns its handle id.
    pub fn insert(&self, file: OpenFile) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.files.insert(id, file);
        id
    }

    pub fn get_mut(&self, id: u64) -> Option<dashmap::mapref::one::RefMut<'_, u64, OpenFile>> {
        self.files.get_mut(&id)
    }

    pub fn get(&self, id: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, OpenFile>> {
        self.files.get(&id)
    }

    /// Removes and returns the open file; called on release.
    pub fn remove(&self, id: u64) -> Option<OpenFile> {
        self.files.remove(&id).map(|(_, file)| file)
    }

    /// Iterates over open files with mutable access.
    pub fn iter_mut(&self) -> dashmap::iter::IterMut<'_, u64, OpenFile> {
        self.files.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_grows_and_zero_fills() {
        let mut buf = PendingWrite::for_create("text/plain".into());
        buf.write(0, b"hello");
        assert_eq!(buf.len(), 5);

        buf.write(8, b"world");
        assert_eq!(buf.len(), 13);
        assert_eq!(buf.content(), b"hello\0\0\0world");
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut buf = PendingWrite::from_existing(b"hello world".to_vec(), "text/plain".into());
        assert!(!buf.is_dirty());
        buf.write(6, b"there");
        assert!(buf.is_dirty());
        assert_eq!(buf.content(), b"hello there");
    }

    #[test]
    fn test_read_past_end_is_empty() {
        let buf = PendingWrite::from_existing(b"abc".to_vec(), "text/plain".into());
        assert_eq!(buf.read(0, 3), b"abc");
        assert_eq!(buf.read(1, 10), b"bc");
        assert_eq!(buf.read(10, 5), b"");
        assert_eq!(buf.read(3, 0), b"");
    }

    #[test]
    fn test_truncate_both_directions() {
        let mut buf = PendingWrite::from_existing(b"abcdef".to_vec(), "text/plain".into());
        buf.truncate(3);
        assert_eq!(buf.content(), b"abc");
        buf.truncate(5);
        assert_eq!(buf.content(), b"abc\0\0");
    }

    #[test]
    fn test_create_buffer_is_dirty_when_empty() {
        let buf = PendingWrite::for_create("application/octet-stream".into());
        assert!(buf.is_dirty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_open_file_table_ids_are_unique() {
        let table = OpenFileTable::new();
        let a = table.insert(OpenFile {
            path: "/a".into(),
            pending: None,
        });
        let b = table.insert(OpenFile {
            path: "/b".into(),
            pending: None,
        });
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        let removed = table.remove(a).unwrap();
        assert_eq!(removed.path, "/a");
        assert!(table.get(a).is_none());
    }
}
