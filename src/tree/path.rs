//! Path-keyed filesystem adapter.
//!
//! [`PathFileSystem`] lets user code think in path strings instead of
//! inodes. [`PathNodeFs`] bridges it onto the node layer: every inode
//! carries a stateless path node, and the path for each call is rebuilt
//! from the inode's position in the tree, so renames keep working without
//! the filesystem tracking anything.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ll::Errno;
use crate::raw::{SetAttrRequest, StatfsOut};
use crate::{Context, FileAttr};

use super::file::File;
use super::inode::Inode;
use super::node::{DirEntry, Node, NodeFileSystem};

/// A filesystem keyed by paths relative to its mountpoint. Defaults answer
/// `ENOSYS`; only `getattr` is mandatory.
#[allow(unused_variables)]
pub trait PathFileSystem: Send + Sync + 'static {
    fn getattr(&self, ctx: &Context, path: &Path) -> Result<FileAttr, Errno>;

    fn setattr(
        &self,
        ctx: &Context,
        path: &Path,
        req: &SetAttrRequest,
    ) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn readdir(&self, ctx: &Context, path: &Path) -> Result<Vec<DirEntry>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn open(&self, ctx: &Context, path: &Path, flags: u32) -> Result<Arc<dyn File>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        ctx: &Context,
        path: &Path,
        flags: u32,
        mode: u32,
    ) -> Result<(Arc<dyn File>, FileAttr), Errno> {
        Err(Errno::ENOSYS)
    }

    fn mkdir(&self, ctx: &Context, path: &Path, mode: u32) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn mknod(&self, ctx: &Context, path: &Path, mode: u32, rdev: u32) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn symlink(&self, ctx: &Context, path: &Path, target: &OsStr) -> Result<FileAttr, Errno> {
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, ctx: &Context, path: &Path) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, ctx: &Context, path: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, ctx: &Context, path: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn rename(&self, ctx: &Context, from: &Path, to: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn access(&self, ctx: &Context, path: &Path, mask: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn getxattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn listxattr(&self, ctx: &Context, path: &Path) -> Result<Vec<OsString>, Errno> {
        Err(Errno::ENOSYS)
    }

    fn removexattr(&self, ctx: &Context, path: &Path, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn statfs(&self, path: &Path) -> Option<StatfsOut> {
        None
    }

    /// Called when the filesystem is attached to the tree.
    fn on_mount(&self) {}

    /// Called when the filesystem is detached.
    fn on_unmount(&self) {}
}

/// Bridge from [`PathFileSystem`] to the node layer; mount this with
/// [`super::mount`] or [`Connector::mount`](super::Connector::mount).
pub struct PathNodeFs {
    fs: Arc<dyn PathFileSystem>,
    root: Arc<PathNode>,
}

impl PathNodeFs {
    pub fn new(fs: Arc<dyn PathFileSystem>) -> Arc<PathNodeFs> {
        let root = Arc::new(PathNode { fs: fs.clone() });
        Arc::new(PathNodeFs { fs, root })
    }
}

impl std::fmt::Debug for PathNodeFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathNodeFs")
    }
}

impl NodeFileSystem for PathNodeFs {
    fn root(&self) -> Arc<dyn Node> {
        self.root.clone()
    }

    fn on_mount(&self, _connector: &super::Connector) {
        self.fs.on_mount();
    }

    fn on_unmount(&self) {
        self.fs.on_unmount();
    }

    fn name(&self) -> String {
        "pathfs".to_string()
    }
}

/// One inode's view of a [`PathFileSystem`]. Stateless; the path is
/// recomputed from the tree position on every call.
struct PathNode {
    fs: Arc<dyn PathFileSystem>,
}

impl PathNode {
    fn child_node(&self) -> Arc<dyn Node> {
        Arc::new(PathNode {
            fs: self.fs.clone(),
        })
    }

    fn child_path(&self, inode: &Arc<Inode>, name: &OsStr) -> PathBuf {
        inode.path().join(name)
    }
}

impl Node for PathNode {
    fn lookup(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        let attr = self.fs.getattr(ctx, &self.child_path(inode, name))?;
        let child = inode.new_child(name, self.child_node());
        Ok((child, attr))
    }

    fn getattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        _file: Option<&Arc<dyn File>>,
    ) -> Result<FileAttr, Errno> {
        self.fs.getattr(ctx, &inode.path())
    }

    fn setattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        file: Option<&Arc<dyn File>>,
        req: &SetAttrRequest,
    ) -> Result<FileAttr, Errno> {
        if let Some(file) = file {
            match file.setattr(req) {
                Ok(()) => return self.fs.getattr(ctx, &inode.path()),
                Err(errno) if errno == Errno::ENOSYS => {}
                Err(errno) => return Err(errno),
            }
        }
        self.fs.setattr(ctx, &inode.path(), req)
    }

    fn readlink(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<Vec<u8>, Errno> {
        self.fs.readlink(ctx, &inode.path())
    }

    fn access(&self, ctx: &Context, inode: &Arc<Inode>, mask: u32) -> Result<(), Errno> {
        self.fs.access(ctx, &inode.path(), mask)
    }

    fn open(&self, ctx: &Context, inode: &Arc<Inode>, flags: u32) -> Result<Arc<dyn File>, Errno> {
        self.fs.open(ctx, &inode.path(), flags)
    }

    fn create(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        flags: u32,
        mode: u32,
    ) -> Result<(Arc<Inode>, Arc<dyn File>, FileAttr), Errno> {
        let (file, attr) = self.fs.create(ctx, &self.child_path(inode, name), flags, mode)?;
        let child = inode.new_child(name, self.child_node());
        Ok((child, file, attr))
    }

    fn mkdir(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        mode: u32,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        let attr = self.fs.mkdir(ctx, &self.child_path(inode, name), mode)?;
        let child = inode.new_child(name, self.child_node());
        Ok((child, attr))
    }

    fn mknod(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        let attr = self.fs.mknod(ctx, &self.child_path(inode, name), mode, rdev)?;
        let child = inode.new_child(name, self.child_node());
        Ok((child, attr))
    }

    fn symlink(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        let attr = self.fs.symlink(ctx, &self.child_path(inode, name), target)?;
        let child = inode.new_child(name, self.child_node());
        Ok((child, attr))
    }

    fn unlink(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        self.fs.unlink(ctx, &self.child_path(inode, name))
    }

    fn rmdir(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        self.fs.rmdir(ctx, &self.child_path(inode, name))
    }

    fn rename(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        new_parent: &Arc<Inode>,
        new_name: &OsStr,
        _flags: u32,
    ) -> Result<(), Errno> {
        let from = self.child_path(inode, name);
        let to = new_parent.path().join(new_name);
        self.fs.rename(ctx, &from, &to)
    }

    fn readdir(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<Vec<DirEntry>, Errno> {
        self.fs.readdir(ctx, &inode.path())
    }

    fn getxattr(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.fs.getxattr(ctx, &inode.path(), name)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        self.fs.setxattr(ctx, &inode.path(), name, value, flags)
    }

    fn listxattr(&self, ctx: &Context, inode: &Arc<Inode>) -> Result<Vec<OsString>, Errno> {
        self.fs.listxattr(ctx, &inode.path())
    }

    fn removexattr(&self, ctx: &Context, inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        self.fs.removexattr(ctx, &inode.path(), name)
    }

    fn statfs(&self, _ctx: &Context, inode: &Arc<Inode>) -> Option<StatfsOut> {
        self.fs.statfs(&inode.path())
    }
}
