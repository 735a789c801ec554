//! fuser [`Filesystem`] implementation over the Pod engine.
//!
//! Each callback resolves the inode to a path, bridges into the async
//! engine, and maps the result onto the kernel reply. All shared state
//! lives behind the engine and the inode table, so callbacks never hold
//! locks across the bridge.

use crate::bridge::{self, BridgeStats};
use crate::inode::{InodeTable, ROOT_INODE};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use podfs_core::{resource, PodConfig, PodFs, PodResult, ResourceAttr, ResourceKind};
use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

/// How long the kernel may cache attributes and entries. Kept short:
/// the store is shared, and staleness beyond the engine's own freshness
/// window compounds.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Block size reported to the kernel.
const BLOCK_SIZE: u32 = 4096;

/// Slack added on top of the engine's own I/O timeout, so the engine's
/// error surfaces before the bridge cuts the operation off.
const BRIDGE_GRACE: Duration = Duration::from_secs(5);

/// The FUSE adapter: owns the runtime, the inode table, and the engine.
pub struct PodFilesystem {
    engine: Arc<PodFs>,
    inodes: InodeTable,
    handle: Handle,
    _runtime: Runtime,
    timeout: Duration,
    stats: Arc<BridgeStats>,
    uid: u32,
    gid: u32,
}

impl PodFilesystem {
    /// Builds the adapter with its own multi-threaded runtime and the
    /// production HTTP backend.
    pub fn new(config: PodConfig) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("podfs-worker")
            .build()?;
        let timeout = config.io_timeout + BRIDGE_GRACE;
        let engine = PodFs::new(config)?;
        Ok(Self::assemble(engine, runtime, timeout))
    }

    /// Builds the adapter over an existing engine. Tests use this with
    /// an in-memory backend.
    pub fn with_engine(engine: Arc<PodFs>) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("podfs-worker")
            .build()?;
        let timeout = engine.config().io_timeout + BRIDGE_GRACE;
        Ok(Self::assemble(engine, runtime, timeout))
    }

    fn assemble(engine: Arc<PodFs>, runtime: Runtime, timeout: Duration) -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            engine,
            inodes: InodeTable::new(),
            handle: runtime.handle().clone(),
            _runtime: runtime,
            timeout,
            stats: Arc::new(BridgeStats::new()),
            uid,
            gid,
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Bridges one engine call, flattening bridge and engine failures
    /// into an errno.
    fn exec<F, T>(&self, future: F) -> Result<T, i32>
    where
        F: Future<Output = PodResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        match bridge::execute(&self.handle, self.timeout, Some(&self.stats), future) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_errno()),
            Err(e) => Err(e.to_errno()),
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }

    /// Joins a directory inode and an entry name into an engine path.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(resource::join_path(&parent_path, name))
    }

    fn make_attr(&self, ino: u64, attr: &ResourceAttr) -> FileAttr {
        let mtime = attr
            .mtime
            .map_or(UNIX_EPOCH, SystemTime::from);
        let is_dir = attr.kind.is_container();
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: file_type(attr.kind),
            perm: attr.mode,
            nlink: if is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// getattr for a known path, allocating the inode on success.
    fn lookup_path(&self, path: String) -> Result<(u64, FileAttr), i32> {
        let engine = Arc::clone(&self.engine);
        let attr = {
            let path = path.clone();
            self.exec(async move { engine.getattr(&path).await })?
        };
        let ino = self.inodes.get_or_insert(&path, attr.kind);
        Ok((ino, self.make_attr(ino, &attr)))
    }
}

fn file_type(kind: ResourceKind) -> FileType {
    if kind.is_container() {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

/// Implements the getxattr/listxattr size protocol: a zero-size probe
/// gets the length, a too-small buffer gets ERANGE.
fn reply_xattr_buf(reply: ReplyXattr, size: u32, data: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;
    if size == 0 {
        reply.size(len);
    } else if size < len {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

impl Filesystem for PodFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!(base_url = %self.engine.config().base_url, "filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            open_handles = self.engine.open_handles(),
            operations = self.stats.started(),
            timed_out = self.stats.timed_out(),
            "filesystem shutting down"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.lookup_path(path) {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.getattr(&path).await }) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.make_attr(ino, &attr)),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        // Size is the only attribute with a remote counterpart. Mode,
        // ownership, and timestamps are store-controlled; accept and
        // ignore them so tools like cp and rsync keep working.
        if let Some(size) = size {
            let engine = Arc::clone(&self.engine);
            let truncate_path = path.clone();
            if let Err(errno) =
                self.exec(async move { engine.truncate(&truncate_path, size).await })
            {
                return reply.error(errno);
            }
        }

        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.getattr(&path).await }) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.make_attr(ino, &attr)),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let engine = Arc::clone(&self.engine);
        let mkdir_path = path.clone();
        if let Err(errno) = self.exec(async move { engine.mkdir(&mkdir_path).await }) {
            return reply.error(errno);
        }
        match self.lookup_path(path) {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let engine = Arc::clone(&self.engine);
        let unlink_path = path.clone();
        match self.exec(async move { engine.unlink(&unlink_path).await }) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let engine = Arc::clone(&self.engine);
        let rmdir_path = path.clone();
        match self.exec(async move { engine.rmdir(&rmdir_path).await }) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE / RENAME_EXCHANGE semantics are not
        // expressible over the remote protocol.
        if flags != 0 {
            return reply.error(libc::EINVAL);
        }
        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };

        let engine = Arc::clone(&self.engine);
        let (from, to) = (old_path.clone(), new_path.clone());
        match self.exec(async move { engine.rename(&from, &to).await }) {
            Ok(()) => {
                if let Some(ino) = self.inodes.get_inode(&old_path) {
                    self.inodes.update_path(ino, &old_path, &new_path);
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let truncate = (flags & libc::O_TRUNC) != 0;

        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.open(&path, write, truncate).await }) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        let engine = Arc::clone(&self.engine);
        let create_path = path.clone();
        let fh = match self.exec(async move { engine.create(&create_path).await }) {
            Ok(fh) => fh,
            Err(errno) => return reply.error(errno),
        };
        match self.lookup_path(path) {
            Ok((_, attr)) => reply.created(&ATTR_TTL, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.read(fh, offset, size as usize).await }) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        let payload = data.to_vec();
        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.write(fh, offset, &payload).await }) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.flush(fh).await }) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.release(fh).await }) {
            Ok(()) => reply.ok(),
            Err(errno) => {
                // The handle is gone either way; the error tells the
                // caller their last writes may not have landed.
                warn!(fh, errno, "release failed to upload pending writes");
                reply.error(errno);
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let engine = Arc::clone(&self.engine);
        let list_path = path.clone();
        let entries = match self.exec(async move { engine.readdir(&list_path).await }) {
            Ok(entries) => entries,
            Err(errno) => return reply.error(errno),
        };

        let parent_ino = match resource::split_path(&path) {
            Some((parent, _)) => self.inodes.get_inode(parent).unwrap_or(ROOT_INODE),
            None => ROOT_INODE,
        };
        let mut listing: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let child = resource::join_path(&path, &entry.name);
            let child_ino = self.inodes.get_or_insert_no_lookup_inc(&child, entry.kind);
            listing.push((child_ino, file_type(entry.kind), entry.name));
        }

        #[allow(clippy::cast_sign_loss)]
        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(offset as usize) {
            // Offsets are 1-based positions of the next entry.
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
        debug!(path, "readdir served");
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // The store exposes no quota; report a roomy synthetic volume.
        let blocks = 1 << 30;
        reply.statfs(
            blocks,
            blocks / 2,
            blocks / 2,
            1 << 20,
            1 << 20,
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let Some(name) = name.to_str().map(str::to_string) else {
            return reply.error(libc::EINVAL);
        };
        let Ok(value) = String::from_utf8(value.to_vec()) else {
            return reply.error(libc::EINVAL);
        };

        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.setxattr(&path, &name, &value).await }) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let Some(name) = name.to_str().map(str::to_string) else {
            return reply.error(libc::EINVAL);
        };

        let engine = Arc::clone(&self.engine);
        match self.exec(async move { engine.getxattr(&path, &name).await }) {
            Ok(value) => reply_xattr_buf(reply, size, value.as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let names = match self.engine.listxattr(&path) {
            Ok(names) => names,
            Err(e) => return reply.error(e.to_errno()),
        };

        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        reply_xattr_buf(reply, size, &buf);
    }
}
