//! Raw-opcode bridge for the inode tree.
//!
//! Implements [`RawFileSystem`] on `Arc<Connector>`: node ids resolve to
//! inodes, handlers call the user [`super::Node`] methods, and the
//! connector's accounting keeps the kernel's reference counts honest.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::ll::reply::{DirEntryList, DirEntryPlusList};
use crate::ll::{Errno, FileHandle, Generation, LockOwner, NodeId};
use crate::raw::{
    AttrOut, Context, CreateOut, EntryOut, KernelConfig, OpenOut, RawFileSystem, SetAttrRequest,
    StatfsOut, XattrOut,
};
use crate::{FileAttr, FileType};

use super::apply_owner;
use super::connector::{Connector, FsMount, TreeOptions};
use super::file::{OpenFile, OpenKind};
use super::inode::Inode;

/// Inode number reported when the filesystem does not supply one.
const UNKNOWN_INO: u64 = 0xffff_ffff;

fn zero_attr() -> FileAttr {
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
    }
}

impl Connector {
    fn finish_attr(&self, options: &TreeOptions, inode: &Arc<Inode>, attr: &mut FileAttr) {
        apply_owner(attr, options.owner);
        if attr.ino == 0 {
            attr.ino = inode.node_id().map(|id| id.0).unwrap_or(UNKNOWN_INO);
        }
    }

    fn attr_out(&self, inode: &Arc<Inode>, mut attr: FileAttr) -> AttrOut {
        let mount = inode.tree_mount();
        self.finish_attr(&mount.options, inode, &mut attr);
        AttrOut {
            attr_timeout: mount.options.attr_timeout,
            attr,
        }
    }

    /// Lookup with accounting: resolves through the attached child when
    /// one exists, otherwise asks the parent node; the kernel reference
    /// is recorded before the reply goes out.
    fn internal_lookup(
        &self,
        ctx: &Context,
        parent: &Arc<Inode>,
        name: &OsStr,
    ) -> Result<EntryOut, Errno> {
        let mount = parent.tree_mount();
        let options = mount.options.clone();
        let resolved = match parent.child(name) {
            Some(child) => {
                let node = child.node().clone();
                node.getattr(ctx, &child, None).map(|attr| (child, attr))
            }
            None => {
                let node = parent.node().clone();
                node.lookup(ctx, parent, name)
            }
        };
        match resolved {
            Ok((child, mut attr)) => {
                let node_id = self.lookup_update(&child);
                self.finish_attr(&options, &child, &mut attr);
                Ok(EntryOut {
                    node_id,
                    generation: Generation(0),
                    entry_timeout: options.entry_timeout,
                    attr_timeout: options.attr_timeout,
                    attr,
                })
            }
            Err(errno)
                if errno == Errno::ENOENT && !options.negative_timeout.is_zero() =>
            {
                // A zero node id with a timeout caches the absence.
                Ok(EntryOut {
                    node_id: NodeId(0),
                    generation: Generation(0),
                    entry_timeout: options.negative_timeout,
                    attr_timeout: options.negative_timeout,
                    attr: zero_attr(),
                })
            }
            Err(errno) => Err(errno),
        }
    }

    /// Wrap a freshly created child (mkdir/mknod/symlink/create) into an
    /// entry reply.
    fn child_entry(
        &self,
        parent: &Arc<Inode>,
        child: Arc<Inode>,
        mut attr: FileAttr,
    ) -> EntryOut {
        let options = parent.tree_mount().options.clone();
        let node_id = self.lookup_update(&child);
        self.finish_attr(&options, &child, &mut attr);
        EntryOut {
            node_id,
            generation: Generation(0),
            entry_timeout: options.entry_timeout,
            attr_timeout: options.attr_timeout,
            attr,
        }
    }

    fn open_file(&self, mount: &Arc<FsMount>, fh: FileHandle) -> Arc<OpenFile> {
        mount.open_files.decode(fh.0)
    }

    fn register_open(
        &self,
        mount: &Arc<FsMount>,
        inode: &Arc<Inode>,
        flags: u32,
        kind: OpenKind,
    ) -> FileHandle {
        let open = Arc::new(OpenFile {
            inode: inode.clone(),
            flags,
            kind,
        });
        let fh = mount.open_files.register(&open);
        inode.track_open(fh);
        FileHandle(fh)
    }

    fn release_open(&self, mount: &Arc<FsMount>, fh: FileHandle) {
        // An fh the map does not know is an accounting bug; decode inside
        // forget panics on it.
        let (forgotten, open) = mount.open_files.forget(fh.0, 1);
        assert!(forgotten, "open handle still referenced after release");
        open.inode.untrack_open(fh.0);
        if let OpenKind::File(file) = &open.kind {
            file.release();
        }
    }
}

impl RawFileSystem for Arc<Connector> {
    fn init(&self, _ctx: &Context, _config: &mut KernelConfig) -> Result<(), Errno> {
        Ok(())
    }

    fn lookup(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<EntryOut, Errno> {
        let parent = self.to_inode(parent);
        self.internal_lookup(ctx, &parent, name)
    }

    fn forget(&self, node_id: NodeId, nlookup: u64) {
        self.forget_update(node_id, nlookup);
    }

    fn getattr(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: Option<FileHandle>,
    ) -> Result<AttrOut, Errno> {
        let inode = self.to_inode(node_id);
        let mount = inode.tree_mount();
        let open = fh.map(|fh| self.open_file(&mount, fh));
        if let Some(open) = &open {
            if let OpenKind::File(file) = &open.kind {
                if let Some(attr) = file.getattr()? {
                    return Ok(self.attr_out(&inode, attr));
                }
            }
        }
        let file = open.as_ref().and_then(|open| match &open.kind {
            OpenKind::File(file) => Some(file.clone()),
            OpenKind::Dir(_) => None,
        });
        let node = inode.node().clone();
        let attr = node.getattr(ctx, &inode, file.as_ref())?;
        Ok(self.attr_out(&inode, attr))
    }

    fn setattr(
        &self,
        ctx: &Context,
        node_id: NodeId,
        req: &SetAttrRequest,
    ) -> Result<AttrOut, Errno> {
        let inode = self.to_inode(node_id);
        let mount = inode.tree_mount();
        let file = req
            .fh
            .map(|fh| self.open_file(&mount, fh))
            .and_then(|open| match &open.kind {
                OpenKind::File(file) => Some(file.clone()),
                OpenKind::Dir(_) => None,
            });
        let node = inode.node().clone();
        let attr = node.setattr(ctx, &inode, file.as_ref(), req)?;
        Ok(self.attr_out(&inode, attr))
    }

    fn readlink(&self, ctx: &Context, node_id: NodeId) -> Result<Vec<u8>, Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        node.readlink(ctx, &inode)
    }

    fn mknod(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
    ) -> Result<EntryOut, Errno> {
        let parent = self.to_inode(parent);
        let node = parent.node().clone();
        let (child, attr) = node.mknod(ctx, &parent, name, mode, rdev)?;
        Ok(self.child_entry(&parent, child, attr))
    }

    fn mkdir(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> Result<EntryOut, Errno> {
        let parent = self.to_inode(parent);
        let node = parent.node().clone();
        let (child, attr) = node.mkdir(ctx, &parent, name, mode)?;
        Ok(self.child_entry(&parent, child, attr))
    }

    fn unlink(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        let parent = self.to_inode(parent);
        let node = parent.node().clone();
        node.unlink(ctx, &parent, name)?;
        let mount = parent.tree_mount();
        let _tree = mount.tree_lock.write();
        self.detach_entry(&parent, name);
        Ok(())
    }

    fn rmdir(&self, ctx: &Context, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        let parent = self.to_inode(parent);
        if let Some(child) = parent.child(name) {
            if child.is_mount_point() {
                return Err(Errno::EBUSY);
            }
        }
        let node = parent.node().clone();
        node.rmdir(ctx, &parent, name)?;
        let mount = parent.tree_mount();
        let _tree = mount.tree_lock.write();
        self.detach_entry(&parent, name);
        Ok(())
    }

    fn symlink(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<EntryOut, Errno> {
        let parent = self.to_inode(parent);
        let node = parent.node().clone();
        let (child, attr) = node.symlink(ctx, &parent, name, target)?;
        Ok(self.child_entry(&parent, child, attr))
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
        let parent = self.to_inode(parent);
        let new_parent = self.to_inode(new_parent);
        let mount = parent.tree_mount();
        if !Arc::ptr_eq(&mount, &new_parent.tree_mount()) {
            return Err(Errno::EXDEV);
        }
        if let Some(child) = parent.child(name) {
            if child.is_mount_point() {
                return Err(Errno::EBUSY);
            }
        }
        let node = parent.node().clone();
        node.rename(ctx, &parent, name, &new_parent, new_name, flags)?;

        let _tree = mount.tree_lock.write();
        // Whatever sat at the destination is gone now.
        self.detach_entry(&new_parent, new_name);
        let moved = parent.state.lock().children.remove(name);
        if let Some(moved) = moved {
            {
                let mut state = moved.state.lock();
                state.name = new_name.to_os_string();
                state.parent = Arc::downgrade(&new_parent);
            }
            new_parent
                .state
                .lock()
                .children
                .insert(new_name.to_os_string(), moved);
        }
        Ok(())
    }

    fn link(
        &self,
        ctx: &Context,
        node_id: NodeId,
        new_parent: NodeId,
        new_name: &OsStr,
    ) -> Result<EntryOut, Errno> {
        let target = self.to_inode(node_id);
        let parent = self.to_inode(new_parent);
        if !Arc::ptr_eq(&parent.tree_mount(), &target.tree_mount()) {
            return Err(Errno::EXDEV);
        }
        let node = parent.node().clone();
        let attr = node.link(ctx, &parent, new_name, &target)?;
        // The reply aliases the target's id; the tree keeps the target at
        // its original position.
        Ok(self.child_entry(&parent, target, attr))
    }

    fn open(&self, ctx: &Context, node_id: NodeId, flags: u32) -> Result<OpenOut, Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        let file = node.open(ctx, &inode, flags)?;
        let mount = inode.tree_mount();
        let fh = self.register_open(&mount, &inode, flags, OpenKind::File(file));
        Ok(OpenOut {
            fh,
            flags: Default::default(),
        })
    }

    fn read(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        open.file()?.read(offset, size)
    }

    fn write(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _flags: u32,
    ) -> Result<u32, Errno> {
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        open.file()?.write(offset, data)
    }

    fn flush(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        _lock_owner: LockOwner,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        open.file()?.flush()
    }

    fn release(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        _flags: u32,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        self.release_open(&inode.tree_mount(), fh);
        Ok(())
    }

    fn fsync(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        datasync: bool,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        open.file()?.fsync(datasync)
    }

    fn opendir(&self, ctx: &Context, node_id: NodeId, flags: u32) -> Result<OpenOut, Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        let entries = node.readdir(ctx, &inode)?;
        let mount = inode.tree_mount();
        let fh = self.register_open(
            &mount,
            &inode,
            flags,
            OpenKind::Dir(parking_lot::Mutex::new(entries)),
        );
        Ok(OpenOut {
            fh,
            flags: Default::default(),
        })
    }

    fn readdir(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        out: &mut DirEntryList,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        let entries = open.dir()?.lock();
        for entry in entries.iter().skip(offset as usize) {
            let ino = if entry.ino == 0 { UNKNOWN_INO } else { entry.ino };
            if !out.add(ino, entry.kind, &entry.name) {
                break;
            }
        }
        Ok(())
    }

    fn readdirplus(
        &self,
        ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: u64,
        out: &mut DirEntryPlusList,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        let entries: Vec<_> = open.dir()?.lock().clone();
        for entry in entries.iter().skip(offset as usize) {
            if entry.name == "." || entry.name == ".." {
                let mut plain = EntryOut {
                    node_id: NodeId(0),
                    generation: Generation(0),
                    entry_timeout: Default::default(),
                    attr_timeout: Default::default(),
                    attr: zero_attr(),
                };
                plain.attr.ino = if entry.ino == 0 { UNKNOWN_INO } else { entry.ino };
                plain.attr.kind = entry.kind;
                if !out.add(&plain, &entry.name) {
                    break;
                }
                continue;
            }
            match self.internal_lookup(ctx, &inode, &entry.name) {
                Ok(looked_up) => {
                    if !out.add(&looked_up, &entry.name) {
                        // The entry did not fit; the kernel never saw the
                        // node id, so take the reference back.
                        if looked_up.node_id.0 != 0 {
                            self.forget_update(looked_up.node_id, 1);
                        }
                        break;
                    }
                }
                // Raced with a concurrent remove; drop the stale entry.
                Err(_) => continue,
            }
        }
        Ok(())
    }

    fn releasedir(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        _flags: u32,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        self.release_open(&inode.tree_mount(), fh);
        Ok(())
    }

    fn fsyncdir(
        &self,
        _ctx: &Context,
        _node_id: NodeId,
        _fh: FileHandle,
        _datasync: bool,
    ) -> Result<(), Errno> {
        Ok(())
    }

    fn statfs(&self, ctx: &Context, node_id: NodeId) -> Result<StatfsOut, Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        Ok(node.statfs(ctx, &inode).unwrap_or_default())
    }

    fn access(&self, ctx: &Context, node_id: NodeId, mask: u32) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        node.access(ctx, &inode, mask)
    }

    fn create(
        &self,
        ctx: &Context,
        parent: NodeId,
        name: &OsStr,
        flags: u32,
        mode: u32,
        _umask: u32,
    ) -> Result<CreateOut, Errno> {
        let parent = self.to_inode(parent);
        let node = parent.node().clone();
        let (child, file, attr) = node.create(ctx, &parent, name, flags, mode)?;
        let mount = parent.tree_mount();
        let fh = self.register_open(&mount, &child, flags, OpenKind::File(file));
        let entry = self.child_entry(&parent, child, attr);
        Ok(CreateOut {
            entry,
            open: OpenOut {
                fh,
                flags: Default::default(),
            },
        })
    }

    fn getxattr(
        &self,
        ctx: &Context,
        node_id: NodeId,
        name: &OsStr,
        size: u32,
    ) -> Result<XattrOut, Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        let data = node.getxattr(ctx, &inode, name)?;
        if size == 0 {
            Ok(XattrOut::Size(data.len() as u32))
        } else {
            Ok(XattrOut::Data(data))
        }
    }

    fn setxattr(
        &self,
        ctx: &Context,
        node_id: NodeId,
        name: &OsStr,
        value: &[u8],
        flags: u32,
    ) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        node.setxattr(ctx, &inode, name, value, flags)
    }

    fn listxattr(&self, ctx: &Context, node_id: NodeId, size: u32) -> Result<XattrOut, Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        let names = node.listxattr(ctx, &inode)?;
        let mut data = Vec::new();
        for name in names {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        if size == 0 {
            Ok(XattrOut::Size(data.len() as u32))
        } else {
            Ok(XattrOut::Data(data))
        }
    }

    fn removexattr(&self, ctx: &Context, node_id: NodeId, name: &OsStr) -> Result<(), Errno> {
        let inode = self.to_inode(node_id);
        let node = inode.node().clone();
        node.removexattr(ctx, &inode, name)
    }

    fn fallocate(
        &self,
        _ctx: &Context,
        node_id: NodeId,
        fh: FileHandle,
        offset: i64,
        length: i64,
        mode: i32,
    ) -> Result<(), Errno> {
        if offset < 0 || length < 0 {
            return Err(Errno::EINVAL);
        }
        let inode = self.to_inode(node_id);
        let open = self.open_file(&inode.tree_mount(), fh);
        open.file()?.allocate(offset as u64, length as u64, mode as u32)
    }
}
