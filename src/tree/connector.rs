//! The inode-tree connector.
//!
//! Owns the mapping between kernel node ids and inodes, enforces the
//! lookup/forget contract, and composes multiple node filesystems into one
//! tree through submounts. All structural changes happen under the owning
//! mount's tree lock; user callbacks run outside it.

use std::ffi::OsStr;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::Owner;
use crate::handle::{HandleMap, HandleMode};
use crate::ll::{Errno, NodeId};
use crate::notify::Notifier;
use crate::raw::Context;

use super::file::OpenFile;
use super::inode::Inode;
use super::node::NodeFileSystem;

/// Tree-layer options: cache timeouts communicated to the kernel with
/// every reply, the attr owner override, and the handle-map mode.
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// How long the kernel may cache name lookups.
    pub entry_timeout: Duration,
    /// How long the kernel may cache attributes.
    pub attr_timeout: Duration,
    /// How long the kernel may cache a *failed* lookup. Zero disables
    /// negative caching and failed lookups report `ENOENT`.
    pub negative_timeout: Duration,
    /// When set, every attr reply carries this uid/gid.
    pub owner: Option<Owner>,
    /// Use the indexed handle-map mode instead of pointer-derived ids.
    pub portable_inodes: bool,
    /// Log tree operations.
    pub debug: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        TreeOptions {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            negative_timeout: Duration::ZERO,
            owner: None,
            portable_inodes: true,
            debug: false,
        }
    }
}

/// One mounted node filesystem: its options, its open-files table, and the
/// lock guarding the structure of its inodes.
pub(crate) struct FsMount {
    pub(crate) fs: Arc<dyn NodeFileSystem>,
    pub(crate) options: TreeOptions,
    /// Guards parent/children edges of every inode in this mount.
    pub(crate) tree_lock: RwLock<()>,
    pub(crate) open_files: HandleMap<OpenFile>,
}

impl FsMount {
    fn new(fs: Arc<dyn NodeFileSystem>, options: TreeOptions) -> Arc<FsMount> {
        let mode = if options.portable_inodes {
            HandleMode::Indexed
        } else {
            HandleMode::Pointer
        };
        Arc::new(FsMount {
            fs,
            options,
            tree_lock: RwLock::new(()),
            open_files: HandleMap::new(mode),
        })
    }
}

/// The tree connector: maps kernel node ids to inodes, keeps the
/// lookup/forget accounting honest, and routes notify-out.
pub struct Connector {
    inodes: HandleMap<Inode>,
    root: Arc<Inode>,
    options: TreeOptions,
    notifier: OnceLock<Notifier>,
}

impl Connector {
    /// Build a connector serving `fs` at the root.
    pub fn new(fs: Arc<dyn NodeFileSystem>, options: TreeOptions) -> Arc<Connector> {
        let mode = if options.portable_inodes {
            HandleMode::Indexed
        } else {
            HandleMode::Pointer
        };
        let mount = FsMount::new(fs.clone(), options.clone());
        let root = Inode::new(fs.root(), mount.clone(), Default::default(), Weak::new());
        root.state.lock().mount_point = Some(mount);
        root.set_node_id(NodeId::ROOT.0);
        // The kernel implicitly holds the root from the moment of mount.
        root.add_lookup_count(1);
        let connector = Arc::new(Connector {
            inodes: HandleMap::new(mode),
            root,
            options,
            notifier: OnceLock::new(),
        });
        fs.on_mount(&connector);
        connector
    }

    /// Wire up the server's notifier; required before the notify methods
    /// and submount unmounting can talk to the kernel.
    pub fn set_notifier(&self, notifier: Notifier) {
        self.notifier.set(notifier).ok();
    }

    /// The root inode.
    pub fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    /// Number of inodes the kernel currently holds references on,
    /// including the root.
    pub fn live_inode_count(&self) -> usize {
        self.inodes.count() + 1
    }

    /// Resolve a kernel node id. The root id bypasses the handle map; any
    /// other unknown id is a protocol-accounting bug and panics.
    pub(crate) fn to_inode(&self, node_id: NodeId) -> Arc<Inode> {
        if node_id == NodeId::ROOT {
            self.root.clone()
        } else {
            self.inodes.decode(node_id.0)
        }
    }

    /// Record one kernel reference on `inode`, registering it in the
    /// handle map the first time, and return its node id. Runs under the
    /// inode's tree lock; called before the reply carrying the id is
    /// written.
    pub(crate) fn lookup_update(&self, inode: &Arc<Inode>) -> NodeId {
        let mount = inode.tree_mount();
        let _tree = mount.tree_lock.write();
        inode.add_lookup_count(1);
        match inode.node_id() {
            Some(id) => id,
            None => {
                let id = NodeId(self.inodes.register(inode));
                inode.set_node_id(id.0);
                id
            }
        }
    }

    /// Process a FORGET: drop `delta` kernel references and reap whatever
    /// became unreachable.
    pub(crate) fn forget_update(&self, node_id: NodeId, delta: u64) {
        if node_id == NodeId::ROOT {
            // The root is never dropped; the kernel only forgets it while
            // tearing the mount down.
            let root_mount = self.root.tree_mount();
            let _tree = root_mount.tree_lock.write();
            let count = self.root.lookup_count();
            self.root.sub_lookup_count(delta.min(count));
            return;
        }
        if !self.inodes.has(node_id.0) {
            // Protocol decay after unmount; nothing to account.
            warn!("FORGET for unknown node id {node_id}");
            return;
        }
        let inode = self.inodes.decode(node_id.0);
        let mount = inode.tree_mount();
        let mut dropped = false;
        {
            let _tree = mount.tree_lock.write();
            if inode.sub_lookup_count(delta) > 0 {
                return;
            }
            if self.recursive_consider_drop(&inode) {
                self.detach_from_parent(&inode);
                self.unregister(&inode);
                dropped = true;
            }
        }
        if dropped && mount.options.debug {
            debug!("dropped inode {node_id} ({:?})", inode.name());
        }
    }

    /// Depth-first reap of a fully-forgotten subtree. Returns whether
    /// `inode` itself may be dropped. Caller holds the tree write lock.
    fn recursive_consider_drop(&self, inode: &Arc<Inode>) -> bool {
        if inode.is_mount_point() {
            // Submounts pin their mountpoint; their own forgets reap them.
            return false;
        }
        let children = {
            let state = inode.state.lock();
            state
                .children
                .iter()
                .map(|(name, child)| (name.clone(), child.clone()))
                .collect::<Vec<_>>()
        };
        for (name, child) in children {
            if self.recursive_consider_drop(&child) {
                inode.state.lock().children.remove(&name);
                child.state.lock().parent = Weak::new();
                self.unregister(&child);
            }
        }
        let state = inode.state.lock();
        state.children.is_empty()
            && inode.lookup_count() == 0
            && state.open_files.is_empty()
            && !Arc::ptr_eq(inode, &self.root)
            && inode.node().deletable()
    }

    fn detach_from_parent(&self, inode: &Arc<Inode>) {
        let (parent, name) = {
            let state = inode.state.lock();
            (state.parent.upgrade(), state.name.clone())
        };
        if let Some(parent) = parent {
            let mut parent_state = parent.state.lock();
            if let Some(attached) = parent_state.children.get(&name) {
                if Arc::ptr_eq(attached, inode) {
                    parent_state.children.remove(&name);
                }
            }
        }
        inode.state.lock().parent = Weak::new();
    }

    /// Remove an inode from the handle map once nothing references it.
    fn unregister(&self, inode: &Arc<Inode>) {
        if let Some(id) = inode.node_id() {
            let (forgotten, _) = self.inodes.forget(id.0, 1);
            assert!(forgotten, "inode map entry outlived its registration");
            inode.set_node_id(0);
            inode.node().on_forget();
        }
    }

    /// Mark a tree entry deleted and detach it (unlink/rmdir/rename-over).
    /// Caller holds the tree write lock.
    pub(crate) fn detach_entry(&self, parent: &Arc<Inode>, name: &OsStr) -> Option<Arc<Inode>> {
        let child = parent.state.lock().children.remove(name)?;
        {
            let mut state = child.state.lock();
            state.parent = Weak::new();
            state.deleted = true;
        }
        Some(child)
    }

    // ---- mount composition -------------------------------------------

    /// Mount `fs` on the directory inode `parent`/`name`.
    pub fn mount(
        &self,
        parent: &Arc<Inode>,
        name: &OsStr,
        fs: Arc<dyn NodeFileSystem>,
        options: Option<TreeOptions>,
    ) -> Result<(), Errno> {
        let options = options.unwrap_or_else(|| self.options.clone());
        let parent_mount = parent.tree_mount();
        let mount = FsMount::new(fs.clone(), options);
        {
            let _tree = parent_mount.tree_lock.write();
            let mut parent_state = parent.state.lock();
            if parent_state.children.contains_key(name) {
                return Err(Errno::EBUSY);
            }
            let root = Inode::new(
                fs.root(),
                parent_mount.clone(),
                name.to_os_string(),
                Arc::downgrade(parent),
            );
            root.state.lock().mount_point = Some(mount);
            parent_state.children.insert(name.to_os_string(), root);
        }
        if let Some(notifier) = self.notifier.get() {
            let _ = parent
                .node_id()
                .map(|id| notifier.inval_entry(id, name));
        }
        fs.on_mount(self);
        debug!("mounted {} at {name:?}", fs.name());
        Ok(())
    }

    /// Unmount the filesystem rooted at `inode`.
    ///
    /// Fails with `EINVAL` if `inode` is not a mountpoint and `EBUSY`
    /// while the mount still has open files or kernel-referenced entries
    /// below its root.
    pub fn unmount(&self, inode: &Arc<Inode>) -> Result<(), Errno> {
        let mount = match inode.state.lock().mount_point.clone() {
            Some(mount) => mount,
            None => return Err(Errno::EINVAL),
        };
        if Arc::ptr_eq(inode, &self.root) {
            // The connector root belongs to the server lifecycle, not to
            // submount composition.
            return Err(Errno::EINVAL);
        }
        {
            let _tree = mount.tree_lock.read();
            if mount.open_files.count() > 0 || self.has_live_entries(inode) {
                return Err(Errno::EBUSY);
            }
        }

        let parent = inode.parent();
        let name = inode.name();
        if let (Some(notifier), Some(parent)) = (self.notifier.get(), parent.as_ref()) {
            if let (Some(parent_id), Some(child_id)) = (parent.node_id(), inode.node_id()) {
                let result = if notifier.supports_delete() {
                    notifier.delete(parent_id, child_id, &name)
                } else {
                    notifier.inval_entry(parent_id, &name)
                };
                if let Err(err) = result {
                    warn!("unmount notify failed: {err}");
                }
                self.wait_for_forget(inode);
            }
        }

        mount.fs.on_unmount();
        {
            let parent_mount = inode.mount.clone();
            let _tree = parent_mount.tree_lock.write();
            inode.state.lock().mount_point = None;
            self.detach_from_parent(inode);
            self.unregister(inode);
        }
        debug!("unmounted {name:?}");
        Ok(())
    }

    /// Bounded wait for the kernel to FORGET the submount root after the
    /// delete notification. Exponential backoff, capped at one second per
    /// sleep; gives up after that and finalizes anyway.
    fn wait_for_forget(&self, inode: &Arc<Inode>) {
        let mut delay = Duration::from_millis(1);
        let cap = Duration::from_secs(1);
        while inode.lookup_count() > 0 {
            if delay >= cap {
                warn!("kernel did not forget submount root in time");
                return;
            }
            std::thread::sleep(delay);
            delay *= 2;
        }
    }

    /// Whether any kernel-visible entry below `root` (excluding `root`
    /// itself) is still referenced or open.
    fn has_live_entries(&self, root: &Arc<Inode>) -> bool {
        let children = {
            let state = root.state.lock();
            state.children.values().cloned().collect::<Vec<_>>()
        };
        children.iter().any(|child| {
            child.lookup_count() > 0
                || child.open_file_count() > 0
                || self.has_live_entries(child)
        })
    }

    // ---- path resolution ---------------------------------------------

    /// Follow `path` through attached children only. Returns the deepest
    /// reachable inode and the unresolved tail components.
    pub fn node(&self, parent: &Arc<Inode>, path: &str) -> (Arc<Inode>, Vec<String>) {
        let mut current = parent.clone();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (i, component) in components.iter().enumerate() {
            match current.child(OsStr::new(component)) {
                Some(child) => current = child,
                None => {
                    return (
                        current,
                        components[i..].iter().map(|s| s.to_string()).collect(),
                    );
                }
            }
        }
        (current, Vec::new())
    }

    /// Resolve `path` with kernel-style lookups, invoking the node
    /// `lookup` callback for unattached components. `None` on any failure.
    pub fn lookup_node(&self, parent: &Arc<Inode>, path: &str) -> Option<Arc<Inode>> {
        let ctx = internal_context();
        let mut current = parent.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let name = OsStr::new(component);
            let next = match current.child(name) {
                Some(child) => child,
                None => {
                    let node = current.node().clone();
                    match node.lookup(&ctx, &current, name) {
                        Ok((child, _attr)) => child,
                        Err(_) => return None,
                    }
                }
            };
            current = next;
        }
        Some(current)
    }

    // ---- notify-out ---------------------------------------------------

    /// Invalidate the kernel's cached data/attributes for `inode`.
    pub fn file_notify(&self, inode: &Arc<Inode>, offset: i64, length: i64) -> io::Result<()> {
        let notifier = self.notifier()?;
        match inode.node_id() {
            Some(id) => notifier.inval_inode(id, offset, length),
            None => Ok(()),
        }
    }

    /// Invalidate the kernel's cached `inode`/`name` entry.
    pub fn entry_notify(&self, inode: &Arc<Inode>, name: &OsStr) -> io::Result<()> {
        let notifier = self.notifier()?;
        match inode.node_id() {
            Some(id) => notifier.inval_entry(id, name),
            None => Ok(()),
        }
    }

    /// Tell the kernel `dir`/`name` was deleted. Downgrades to an entry
    /// invalidation for kernels that predate delete notifications.
    pub fn delete_notify(
        &self,
        dir: &Arc<Inode>,
        child: &Arc<Inode>,
        name: &OsStr,
    ) -> io::Result<()> {
        let notifier = self.notifier()?;
        let (dir_id, child_id) = match (dir.node_id(), child.node_id()) {
            (Some(d), Some(c)) => (d, c),
            _ => return Ok(()),
        };
        if notifier.supports_delete() {
            notifier.delete(dir_id, child_id, name)
        } else {
            notifier.inval_entry(dir_id, name)
        }
    }

    fn notifier(&self) -> io::Result<&Notifier> {
        self.notifier.get().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connector has no server notifier")
        })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("live_inodes", &self.live_inode_count())
            .finish()
    }
}

/// Context for lookups the library performs on its own behalf (path
/// resolution), outside any kernel request.
pub(crate) fn internal_context() -> Context {
    Context {
        unique: crate::ll::RequestId(0),
        node_id: NodeId::ROOT,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        pid: std::process::id(),
        cancelled: Arc::new(AtomicBool::new(false)),
    }
}
