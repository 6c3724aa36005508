//! The user-facing node interface.
//!
//! A [`Node`] is the behavior of one inode. The connector resolves kernel
//! node ids to [`super::Inode`]s and calls these methods; new inodes enter
//! the tree when a node's `lookup`/`mkdir`/`create` attaches children via
//! [`super::Inode::new_child`].

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use crate::ll::Errno;
use crate::raw::{SetAttrRequest, StatfsOut};
use crate::{Context, FileAttr, FileType};

use super::file::File;
use super::inode::Inode;

/// One directory entry as produced by [`Node::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name, unique within the directory.
    pub name: OsString,
    /// Entry type.
    pub kind: FileType,
    /// Inode number reported to readers; 0 lets the connector substitute
    /// a placeholder.
    pub ino: u64,
}

impl DirEntry {
    pub fn new(name: impl Into<OsString>, kind: FileType) -> DirEntry {
        DirEntry {
            name: name.into(),
            kind,
            ino: 0,
        }
    }
}

/// Filesystem behavior of a single inode.
///
/// Methods that produce new entries return the child [`Inode`] (created
/// with [`Inode::new_child`]) together with its attributes; the connector
/// does the kernel-side accounting. Defaults answer `ENOSYS`, except where
/// the protocol expects something friendlier.
#[allow(unused_variables)]
pub trait Node: Send + Sync + 'static {
    /// Whether a fully-forgotten inode for this node may be dropped from
    /// the tree. Saying `false` keeps the inode cached for re-lookup.
    fn deletable(&self) -> bool {
        true
    }

    /// Called when the inode has been dropped from the tree.
    fn on_forget(&self) {}

    /// Resolve `name` to a child. Return the existing child inode when one
    /// is attached, or attach a fresh one.
    fn lookup(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        Err(Errno::ENOENT)
    }

    fn getattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        file: Option<&Arc<dyn File>>,
    ) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn setattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        file: Option<&Arc<dyn File>>,
        req: &SetAttrRequest,
    ) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn access(&self, ctx: &Context, inode: &Arc<Inode>, mask: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn open(&self, ctx: &Context, inode: &Arc<Inode>, flags: u32) -> Result<Arc<dyn File>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        flags: u32,
        mode: u32,
    ) -> Result<(Arc<Inode>, Arc<dyn File>, FileAttr), Errno> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        mode: u32,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        Err(Errno::ENOSYS)
    }

    fn mknod(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        Err(Errno::ENOSYS)
    }

    fn symlink(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Create a hard link to `target` under this directory. The connector
    /// replies with `target`'s node id; the tree keeps `target` attached at
    /// its original location.
    fn link(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        target: &Arc<Inode>,
    ) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Move `name` to `new_name` under `new_parent`. Both directories are
    /// in the same mount; the connector rejects cross-mount renames with
    /// `EXDEV` before calling this.
    fn rename(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        new_parent: &Arc<Inode>,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// List the directory. The default lists the attached children, which
    /// suits tree-shaped filesystems that materialize eagerly.
    fn readdir(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<Vec<DirEntry>, Errno> {
        Ok(inode
            .children()
            .into_iter()
            .map(|(name, child)| {
                let kind = child
                    .node()
                    .getattr(ctx, &child, None)
                    .map(|attr| attr.kind)
                    .unwrap_or(FileType::RegularFile);
                DirEntry::new(name, kind)
            })
            .collect())
    }

    fn getxattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
    ) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// All extended attribute names, NUL-separated on the wire.
    fn listxattr(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<Vec<OsString>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn removexattr(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Filesystem statistics; `None` yields an all-zero statfs.
    fn statfs(&self, ctx: &Context, inode: &Arc<Inode>) -> Option<StatfsOut> {
        None
    }
}

/// A whole filesystem of nodes, mountable at the connector root or as a
/// submount.
#[allow(unused_variables)]
pub trait NodeFileSystem: Send + Sync + 'static {
    /// The root node. Called once when the filesystem is mounted.
    fn root(&self) -> Arc<dyn Node>;

    /// Called after the filesystem's root inode has been attached.
    fn on_mount(&self, connector: &super::Connector) {}

    /// Called when the filesystem has been unmounted.
    fn on_unmount(&self) {}

    /// Short name for debug logs.
    fn name(&self) -> String {
        "nodefs".to_string()
    }
}
