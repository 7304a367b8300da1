#![forbid(unsafe_code)]
//! FUSE adapter for morosfs.
//!
//! A thin translation layer: kernel FUSE requests arrive via the `fuser`
//! crate, get forwarded to a [`PathOps`] implementation (from
//! `morosfs-core`), and errors are mapped through [`MorosError::to_errno`].
//!
//! The on-disk format has no inode concept — the reader is path-based — so
//! the adapter keeps a per-mount inode table that assigns stable inode
//! numbers to paths as the kernel first observes them. The table is mount
//! session state only and never touches the image.
//!
//! The mount is read-only by design. Every mutating callback funnels
//! through a single unsupported-operation path instead of per-operation
//! stubs, so the rejection policy lives in one place.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use morosfs_core::{Attributes, PathOps};
use morosfs_error::MorosError;
use morosfs_ondisk::{EntryKind, BLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for cached attributes and entries.
///
/// The image is immutable for the lifetime of the mount, so a generous TTL
/// is safe.
const ATTR_TTL: Duration = Duration::from_secs(60);

/// Inode number of the root directory.
const ROOT_INO: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Inode table ─────────────────────────────────────────────────────────────

/// Bidirectional inode-number ↔ path map for one mount session.
///
/// Inode numbers are assigned on first observation and stay stable until
/// unmount. The root is always inode 1 ↔ `/`.
#[derive(Debug)]
struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, "/".to_owned());
        table.inos.insert("/".to_owned(), ROOT_INO);
        table
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_owned());
        self.inos.insert(path.to_owned(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }
}

/// Join a child name onto an absolute directory path.
fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Absolute path of the parent directory.
fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(at) => path[..at].to_owned(),
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[derive(Debug, Default)]
pub struct MountMetrics {
    requests_ok: AtomicU64,
    requests_err: AtomicU64,
    bytes_read: AtomicU64,
}

impl MountMetrics {
    fn record_ok(&self) {
        self.requests_ok.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_err.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_ok: self.requests_ok.load(Ordering::Relaxed),
            requests_err: self.requests_err.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`MountMetrics`] (all plain `u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
    }
}

/// Convert reader [`Attributes`] to `fuser::FileAttr`.
///
/// The format carries no timestamps or ownership: everything is the epoch
/// and root, matching what the on-disk entries can actually express.
fn to_file_attr(ino: u64, attr: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: to_file_type(attr.kind),
        perm: attr.perm,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("morosfs".to_owned()),
        MountOption::Subtype("moros".to_owned()),
        MountOption::RO,
        MountOption::NoAtime,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates all read operations to a [`PathOps`]
/// implementation and rejects all write operations uniformly.
pub struct MorosFuse {
    ops: Arc<dyn PathOps>,
    inodes: Mutex<InodeTable>,
    metrics: Arc<MountMetrics>,
}

impl std::fmt::Debug for MorosFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MorosFuse")
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

impl MorosFuse {
    #[must_use]
    pub fn new(ops: Box<dyn PathOps>) -> Self {
        Self {
            ops: Arc::from(ops),
            inodes: Mutex::new(InodeTable::new()),
            metrics: Arc::new(MountMetrics::default()),
        }
    }

    /// Shared request counters for this mount.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MountMetrics> {
        &self.metrics
    }

    /// Log an operation failure and return the errno for the reply.
    ///
    /// ENOENT during resolution is normal traffic — log at trace instead of
    /// warn.
    fn log_errno(&self, error: &MorosError, operation: &'static str, ino: u64) -> c_int {
        self.metrics.record_err();
        let errno = error.to_errno();
        if errno == libc::ENOENT {
            trace!(op = operation, ino, errno, error = %error, "FUSE op returned ENOENT");
        } else {
            warn!(op = operation, ino, errno, error = %error, "FUSE op failed");
        }
        errno
    }

    /// Uniform rejection path for every mutating operation.
    fn unsupported(&self, operation: &'static str, ino: u64) -> c_int {
        let error = MorosError::Unsupported(operation);
        self.metrics.record_err();
        debug!(op = operation, ino, "rejecting write operation on read-only mount");
        error.to_errno()
    }

    fn path_of(&self, ino: u64) -> Result<String, MorosError> {
        self.inodes
            .lock()
            .path_of(ino)
            .ok_or_else(|| MorosError::NotFound(format!("inode {ino}")))
    }

    fn getattr_at(&self, path: &str) -> Result<FileAttr, MorosError> {
        let attr = self.ops.getattr(path)?;
        let ino = self.inodes.lock().ino_for(path);
        Ok(to_file_attr(ino, &attr))
    }
}

impl Filesystem for MorosFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("morosfs mount initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let snap = self.metrics.snapshot();
        info!(
            requests_ok = snap.requests_ok,
            requests_err = snap.requests_err,
            bytes_read = snap.bytes_read,
            "morosfs unmounted"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = (|| {
            let parent = self.path_of(parent)?;
            // Entry names are UTF-8 on disk; anything else cannot exist.
            let name = name
                .to_str()
                .ok_or_else(|| MorosError::NotFound("non-UTF-8 name".to_owned()))?;
            self.getattr_at(&child_path(&parent, name))
        })();
        match result {
            Ok(attr) => {
                self.metrics.record_ok();
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(e) => reply.error(self.log_errno(&e, "lookup", parent)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.path_of(ino).and_then(|path| self.getattr_at(&path));
        match result {
            Ok(attr) => {
                self.metrics.record_ok();
                reply.attr(&ATTR_TTL, &attr);
            }
            Err(e) => reply.error(self.log_errno(&e, "getattr", ino)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open: no file handles to track.
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        let result = self
            .path_of(ino)
            .and_then(|path| self.ops.read(&path, size, byte_offset));
        match result {
            Ok(data) => {
                self.metrics.record_ok();
                self.metrics
                    .record_bytes_read(u64::try_from(data.len()).unwrap_or(u64::MAX));
                reply.data(&data);
            }
            Err(e) => reply.error(self.log_errno(&e, "read", ino)),
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
            Err(e) => {
                reply.error(self.log_errno(&e, "readdir", ino));
                return;
            }
        };
        let names = match self.ops.list_dir(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(self.log_errno(&e, "readdir", ino));
                return;
            }
        };

        let start = usize::try_from(offset).unwrap_or(0);
        for (index, name) in names.iter().enumerate().skip(start) {
            let (child_ino, file_type) = match name.as_str() {
                "." => (ino, FileType::Directory),
                ".." => {
                    let parent = parent_path(&path);
                    (self.inodes.lock().ino_for(&parent), FileType::Directory)
                }
                other => {
                    let child = child_path(&path, other);
                    // No cache by design: the kind costs one more chain walk.
                    let kind = self
                        .ops
                        .getattr(&child)
                        .map_or(FileType::RegularFile, |attr| to_file_type(attr.kind));
                    (self.inodes.lock().ino_for(&child), kind)
                }
            };
            let next_offset = i64::try_from(index + 1).unwrap_or(i64::MAX);
            if reply.add(child_ino, next_offset, file_type, name) {
                break;
            }
        }
        self.metrics.record_ok();
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        // The format has no symlinks.
        let e = MorosError::Format("symlinks do not exist in this format".to_owned());
        reply.error(self.log_errno(&e, "readlink", ino));
    }

    // ── Write operations: uniformly unsupported ──────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
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
        reply.error(self.unsupported("setattr", ino));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.unsupported("mknod", parent));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.unsupported("mkdir", parent));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.unsupported("unlink", parent));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.unsupported("rmdir", parent));
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(self.unsupported("symlink", parent));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.unsupported("rename", parent));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(self.unsupported("link", ino));
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(self.unsupported("write", ino));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(self.unsupported("create", parent));
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.unsupported("setxattr", ino));
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.unsupported("removexattr", ino));
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.unsupported("fallocate", ino));
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Mount a morosfs image at the given mountpoint (blocking, foreground).
///
/// Returns when the filesystem is unmounted.
pub fn mount(
    ops: Box<dyn PathOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = MorosFuse::new(ops);
    info!(mountpoint = %mountpoint.display(), "mounting morosfs read-only");
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}
