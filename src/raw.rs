//! The raw filesystem interface.
//!
//! One method per kernel opcode, keyed on the node ids exchanged with the
//! kernel. Every method takes a [`Context`] carrying the caller's
//! credentials and a cooperative cancellation flag, and returns the
//! opcode's output or an [`Errno`]. Unimplemented methods answer `ENOSYS`.
//!
//! Most users want the tree layer (see [`crate::tree`]) instead and never
//! implement this trait directly.

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use crate::ll::abi::{FopenFlags, InitFlags};
use crate::ll::reply::{DirEntryList, DirEntryPlusList};
use crate::ll::{Errno, FileHandle, Generation, LockOwner, NodeId, RequestId, TimeOrNow, Version};
use crate::{FileAttr, MountOptions};

/// Per-request context: the kernel's correlation id, caller credentials,
/// and the cancellation flag an `INTERRUPT` sets.
#[derive(Debug, Clone)]
pub struct Context {
    /// The kernel's unique id for this request.
    pub unique: RequestId,
    /// The node the operation applies to.
    pub node_id: NodeId,
    /// Uid of the calling process.
    pub uid: u32,
    /// Gid of the calling process.
    pub gid: u32,
    /// Pid of the calling process.
    pub pid: u32,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl Context {
    /// True once the kernel has interrupted this request. Handlers may
    /// check this and bail out with `EINTR`; ignoring it is also fine, the
    /// kernel discards the late reply.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn test_stub() -> Context {
        Context {
            unique: RequestId(0),
            node_id: NodeId::ROOT,
            uid: 0,
            gid: 0,
            pid: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Negotiated kernel connection parameters, handed to
/// [`RawFileSystem::init`] for inspection and adjustment.
#[derive(Debug)]
pub struct KernelConfig {
    pub(crate) capabilities: InitFlags,
    pub(crate) requested: InitFlags,
    pub(crate) max_readahead: u32,
    pub(crate) max_write: u32,
    pub(crate) max_background: u16,
    pub(crate) congestion_threshold: u16,
    pub(crate) kernel: Version,
}

impl KernelConfig {
    pub(crate) fn new(capabilities: InitFlags, max_readahead: u32, kernel: Version, options: &MountOptions) -> Self {
        let mut requested = InitFlags::FUSE_ASYNC_READ
            | InitFlags::FUSE_BIG_WRITES
            | InitFlags::FUSE_ATOMIC_O_TRUNC
            | InitFlags::FUSE_PARALLEL_DIROPS
            | InitFlags::FUSE_DO_READDIRPLUS
            | InitFlags::FUSE_READDIRPLUS_AUTO;
        if capabilities.contains(InitFlags::FUSE_MAX_PAGES) {
            requested |= InitFlags::FUSE_MAX_PAGES;
        }
        let max_readahead = if options.max_readahead > 0 {
            max_readahead.min(options.max_readahead)
        } else {
            max_readahead
        };
        KernelConfig {
            capabilities,
            requested,
            max_readahead,
            max_write: options.effective_max_write(),
            max_background: options.max_background,
            congestion_threshold: options.congestion_threshold,
            kernel,
        }
    }

    /// What the kernel offered.
    pub fn capabilities(&self) -> InitFlags {
        self.capabilities
    }

    /// The kernel's protocol version.
    pub fn kernel_version(&self) -> Version {
        self.kernel
    }

    /// Request additional capability flags. Flags the kernel did not offer
    /// are returned as the error.
    pub fn add_capabilities(&mut self, flags: InitFlags) -> Result<(), InitFlags> {
        if !self.capabilities.contains(flags) {
            return Err(flags & !self.capabilities);
        }
        self.requested |= flags;
        Ok(())
    }

    pub(crate) fn reply_flags(&self) -> InitFlags {
        self.capabilities & self.requested
    }

    pub(crate) fn effective_congestion_threshold(&self) -> u16 {
        if self.congestion_threshold == 0 || self.congestion_threshold > self.max_background {
            (u32::from(self.max_background) * 3 / 4) as u16
        } else {
            self.congestion_threshold
        }
    }

    pub(crate) fn max_pages(&self) -> u16 {
        ((self.max_write.max(self.max_readahead) as usize - 1) / page_size::get()) as u16 + 1
    }
}

/// Reply to a lookup-like operation: a node id plus cached attributes.
#[derive(Debug, Clone)]
pub struct EntryOut {
    /// Node id the kernel will use for this inode from now on. Zero encodes
    /// a cacheable negative entry.
    pub node_id: NodeId,
    /// Generation paired with the node id.
    pub generation: Generation,
    /// How long the kernel may cache the name -> node id binding.
    pub entry_timeout: Duration,
    /// How long the kernel may cache the attributes.
    pub attr_timeout: Duration,
    /// The inode's attributes.
    pub attr: FileAttr,
}

/// Reply to GETATTR/SETATTR.
#[derive(Debug, Clone)]
pub struct AttrOut {
    /// How long the kernel may cache the attributes.
    pub attr_timeout: Duration,
    /// The inode's attributes.
    pub attr: FileAttr,
}

/// Reply to OPEN/OPENDIR.
#[derive(Debug, Clone, Copy)]
pub struct OpenOut {
    /// Handle echoed back on every subsequent operation on this open file.
    pub fh: FileHandle,
    /// Open-response flags (direct-io, keep-cache, non-seekable).
    pub flags: FopenFlags,
}

/// Reply to CREATE: MKNOD + LOOKUP + OPEN in one.
#[derive(Debug, Clone)]
pub struct CreateOut {
    /// The created entry.
    pub entry: EntryOut,
    /// The open handle.
    pub open: OpenOut,
}

/// Reply to STATFS.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Reply to GETXATTR/LISTXATTR: either the data, or just its size when the
/// caller passed a zero-sized probe buffer.
#[derive(Debug, Clone)]
pub enum XattrOut {
    /// Size of the attribute data, for a zero-sized probe.
    Size(u32),
    /// The attribute data itself.
    Data(Vec<u8>),
}

/// The decoded SETATTR valid-bitmask: only `Some` fields are to be applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
    pub fh: Option<FileHandle>,
    pub lock_owner: Option<LockOwner>,
}

/// One entry of a BATCH_FORGET request.
#[derive(Debug, Clone, Copy)]
pub struct ForgetOne {
    /// Node to forget.
    pub node_id: NodeId,
    /// How many lookups to drop.
    pub nlookup: u64,
}

/// The callback surface implemented by user code for each opcode.
///
/// Defaults answer `ENOSYS` (or succeed trivially where the kernel expects
/// that), so implementations override only what they support.
#[allow(unused_variables)]
pub trait RawFileSystem: Send + Sync + 'static {
    /// Called once after INIT negotiation, before any other method.
    fn init(&self, ctx: &Context, config: &mut KernelConfig) -> Result<(), Errno> {
        Ok(())
    }

    /// Called on unmount. No further methods run afterwards.
    fn destroy(&self) {}

    /// Look up a name under a parent. A successful reply transfers one
    /// kernel reference on the returned node id (see `forget`).
    fn lookup(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<EntryOut, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Drop `nlookup` kernel references from a node. No reply is sent.
    fn forget(&self, node_id: NodeId, nlookup: u64) {}

    /// Batched forget. The default forwards to `forget`.
    fn batch_forget(&self, nodes: &[ForgetOne]) {
        for node in nodes {
            self.forget(node.node_id, node.nlookup);
        }
    }

    fn getattr(&self, ctx: &Context, node_id: NodeId, fh: Option<FileHandle>) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Apply the fields flagged in `req`; unflagged fields stay untouched.
    fn setattr(&self, ctx: &Context, node_id: NodeId, req: &SetAttrRequest) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, ctx: &Context, node_id: NodeId) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn mknod(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<EntryOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<EntryOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn symlink(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<EntryOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn rename(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn link(
        &self,
        ctx: &Context,
        node_id: NodeId,
        new_parent: NodeId,
        new_name: &OsStr,
    ) -> Result<EntryOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn open(&self, ctx: &Context, node_id: NodeId, flags: u32) -> Result<OpenOut, Errno> {
        // Zero-message open: stateless filesystems need no handle.
        Ok(OpenOut {
            fh: FileHandle(0),
            flags: FopenFlags::empty(),
        })
    }

    /// Read `size` bytes at `offset`. Short reads signal EOF.
    fn read(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Write `data` at `offset`; returns the number of bytes accepted.
    fn write(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        flags: u32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    fn flush(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        lock_owner: LockOwner,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn release(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, flags: u32) -> Result<(), Errno> {
        Ok(())
    }

    fn fsync(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn opendir(&self, ctx: &Context, node_id: NodeId, flags: u32) -> Result<OpenOut, Errno> {
        Ok(OpenOut {
            fh: FileHandle(0),
            flags: FopenFlags::empty(),
        })
    }

    /// List entries starting at `offset`, appending to `out` until it
    /// refuses more.
    fn readdir(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        out: &mut DirEntryList,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Like `readdir`, but every accepted entry also transfers a kernel
    /// reference exactly as a lookup reply would.
    fn readdirplus(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        out: &mut DirEntryPlusList,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn releasedir(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, flags: u32) -> Result<(), Errno> {
        Ok(())
    }

    fn fsyncdir(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, ctx: &Context, node_id: NodeId) -> Result<StatfsOut, Errno> {
        Ok(StatfsOut {
            bsize: 512,
            namelen: 255,
            ..StatfsOut::default()
        })
    }

    fn access(&self, ctx: &Context, node_id: NodeId, mask: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        flags: u32,
        mode: u32,
        umask: u32,
    ) -> Result<CreateOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn getxattr(
        &self,
        ctx: &Context,
        node_id: NodeId,
        name: &OsStr,
        size: u32,
    ) -> Result<XattrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        node_id: NodeId,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn listxattr(&self, ctx: &Context, node_id: NodeId, size: u32) -> Result<XattrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    fn removexattr(&self, ctx: &Context, node_id: NodeId, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn fallocate(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: i64,
        length: i64,
        mode: i32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn lseek(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: i64,
        whence: u32,
    ) -> Result<i64, Errno> {
        Err(Errno::ENOSYS)
    }

    fn copy_file_range(
        &self,
        ctx: &Context,
        node_in: NodeId,
        fh_in: FileHandle,
        offset_in: i64,
        node_out: NodeId,
        fh_out: FileHandle,
        offset_out: i64,
        len: u64,
        flags: u64,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }
}

/// Whole-filesystem serialization for the `single_threaded` option: every
/// callback runs under one mutex.
pub(crate) struct SerializedFs<FS> {
    inner: FS,
    lock: parking_lot::ReentrantMutex<()>,
}

impl<FS: RawFileSystem> SerializedFs<FS> {
    pub(crate) fn new(inner: FS) -> Self {
        SerializedFs {
            inner,
            lock: parking_lot::ReentrantMutex::new(()),
        }
    }
}

macro_rules! serialized {
    ($self:ident, $body:expr) => {{
        let _guard = $self.lock.lock();
        $body
    }};
}

impl<FS: RawFileSystem> RawFileSystem for SerializedFs<FS> {
    fn init(&self, ctx: &Context, config: &mut KernelConfig) -> Result<(), Errno> {
        serialized!(self, self.inner.init(ctx, config))
    }
    fn destroy(&self) {
        serialized!(self, self.inner.destroy())
    }
    fn lookup(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<EntryOut, Errno> {
        serialized!(self, self.inner.lookup(ctx, parent, name))
    }
    fn forget(&self, node_id: NodeId, nlookup: u64) {
        serialized!(self, self.inner.forget(node_id, nlookup))
    }
    fn batch_forget(&self, nodes: &[ForgetOne]) {
        serialized!(self, self.inner.batch_forget(nodes))
    }
    fn getattr(&self, ctx: &Context, node_id: NodeId, fh: Option<FileHandle>) -> Result<AttrOut, Errno> {
        serialized!(self, self.inner.getattr(ctx, node_id, fh))
    }
    fn setattr(&self, ctx: &Context, node_id: NodeId, req: &SetAttrRequest) -> Result<AttrOut, Errno> {
        serialized!(self, self.inner.setattr(ctx, node_id, req))
    }
    fn readlink(&self, ctx: &Context, node_id: NodeId) -> Result<Vec<u8>, Errno> {
        serialized!(self, self.inner.readlink(ctx, node_id))
    }
    fn mknod(&self, ctx: &Context, parent: NodeId, name: &OsStr, mode: u32, umask: u32, rdev: u32) -> Result<EntryOut, Errno> {
        serialized!(self, self.inner.mknod(ctx, parent, name, mode, umask, rdev))
    }
    fn mkdir(&self, ctx: &Context, parent: NodeId, name: &OsStr, mode: u32, umask: u32) -> Result<EntryOut, Errno> {
        serialized!(self, self.inner.mkdir(ctx, parent, name, mode, umask))
    }
    fn unlink(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        serialized!(self, self.inner.unlink(ctx, parent, name))
    }
    fn rmdir(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        serialized!(self, self.inner.rmdir(ctx, parent, name))
    }
    fn symlink(&self, ctx: &Context, parent: NodeId, name: &OsStr, target: &OsStr) -> Result<EntryOut, Errno> {
        serialized!(self, self.inner.symlink(ctx, parent, name, target))
    }
    fn rename(&self, ctx: &Context, parent: NodeId, name: &OsStr, new_parent: NodeId, new_name: &OsStr, flags: u32) -> Result<(), Errno> {
        serialized!(self, self.inner.rename(ctx, parent, name, new_parent, new_name, flags))
    }
    fn link(&self, ctx: &Context, node_id: NodeId, new_parent: NodeId, new_name: &OsStr) -> Result<EntryOut, Errno> {
        serialized!(self, self.inner.link(ctx, node_id, new_parent, new_name))
    }
    fn open(&self, ctx: &Context, node_id: NodeId, flags: u32) -> Result<OpenOut, Errno> {
        serialized!(self, self.inner.open(ctx, node_id, flags))
    }
    fn read(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        serialized!(self, self.inner.read(ctx, node_id, fh, offset, size))
    }
    fn write(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, offset: u64, data: &[u8], flags: u32) -> Result<u32, Errno> {
        serialized!(self, self.inner.write(ctx, node_id, fh, offset, data, flags))
    }
    fn flush(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, lock_owner: LockOwner) -> Result<(), Errno> {
        serialized!(self, self.inner.flush(ctx, node_id, fh, lock_owner))
    }
    fn release(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, flags: u32) -> Result<(), Errno> {
        serialized!(self, self.inner.release(ctx, node_id, fh, flags))
    }
    fn fsync(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        serialized!(self, self.inner.fsync(ctx, node_id, fh, datasync))
    }
    fn opendir(&self, ctx: &Context, node_id: NodeId, flags: u32) -> Result<OpenOut, Errno> {
        serialized!(self, self.inner.opendir(ctx, node_id, flags))
    }
    fn readdir(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, offset: u64, out: &mut DirEntryList) -> Result<(), Errno> {
        serialized!(self, self.inner.readdir(ctx, node_id, fh, offset, out))
    }
    fn readdirplus(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, offset: u64, out: &mut DirEntryPlusList) -> Result<(), Errno> {
        serialized!(self, self.inner.readdirplus(ctx, node_id, fh, offset, out))
    }
    fn releasedir(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, flags: u32) -> Result<(), Errno> {
        serialized!(self, self.inner.releasedir(ctx, node_id, fh, flags))
    }
    fn fsyncdir(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        serialized!(self, self.inner.fsyncdir(ctx, node_id, fh, datasync))
    }
    fn statfs(&self, ctx: &Context, node_id: NodeId) -> Result<StatfsOut, Errno> {
        serialized!(self, self.inner.statfs(ctx, node_id))
    }
    fn access(&self, ctx: &Context, node_id: NodeId, mask: u32) -> Result<(), Errno> {
        serialized!(self, self.inner.access(ctx, node_id, mask))
    }
    fn create(&self, ctx: &Context, parent: NodeId, name: &OsStr, flags: u32, mode: u32, umask: u32) -> Result<CreateOut, Errno> {
        serialized!(self, self.inner.create(ctx, parent, name, flags, mode, umask))
    }
    fn getxattr(&self, ctx: &Context, node_id: NodeId, name: &OsStr, size: u32) -> Result<XattrOut, Errno> {
        serialized!(self, self.inner.getxattr(ctx, node_id, name, size))
    }
    fn setxattr(&self, ctx: &Context, node_id: NodeId, name: &OsStr, value: &[u8], flags: u32) -> Result<(), Errno> {
        serialized!(self, self.inner.setxattr(ctx, node_id, name, value, flags))
    }
    fn listxattr(&self, ctx: &Context, node_id: NodeId, size: u32) -> Result<XattrOut, Errno> {
        serialized!(self, self.inner.listxattr(ctx, node_id, size))
    }
    fn removexattr(&self, ctx: &Context, node_id: NodeId, name: &OsStr) -> Result<(), Errno> {
        serialized!(self, self.inner.removexattr(ctx, node_id, name))
    }
    fn fallocate(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, offset: i64, length: i64, mode: i32) -> Result<(), Errno> {
        serialized!(self, self.inner.fallocate(ctx, node_id, fh, offset, length, mode))
    }
    fn lseek(&self, ctx: &Context, node_id: NodeId, fh: FileHandle, offset: i64, whence: u32) -> Result<i64, Errno> {
        serialized!(self, self.inner.lseek(ctx, node_id, fh, offset, whence))
    }
    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(&self, ctx: &Context, node_in: NodeId, fh_in: FileHandle, offset_in: i64, node_out: NodeId, fh_out: FileHandle, offset_out: i64, len: u64, flags: u64) -> Result<u32, Errno> {
        serialized!(
            self,
            self.inner
                .copy_file_range(ctx, node_in, fh_in, offset_in, node_out, fh_out, offset_out, len, flags)
        )
    }
}
