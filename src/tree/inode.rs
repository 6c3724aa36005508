//! The inode graph.
//!
//! An inode binds a user [`super::Node`] to a position in the tree: a
//! parent, a name, named children, and the kernel-side accounting state
//! (node id, lookup count, open handles). Structural fields are mutated
//! under the owning mount's tree lock; each inode additionally guards its
//! own fields with a short-lived mutex that is never held across user
//! callbacks.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::ll::NodeId;

use super::connector::FsMount;
use super::node::Node;

pub(crate) struct InodeState {
    pub(crate) name: OsString,
    pub(crate) parent: Weak<Inode>,
    pub(crate) children: HashMap<OsString, Arc<Inode>>,
    /// Set when this inode is the root of a submount layered over it.
    pub(crate) mount_point: Option<Arc<FsMount>>,
    /// Handles of open files hanging off this inode.
    pub(crate) open_files: Vec<u64>,
    /// Detached by unlink/rmdir/rename-over; kept alive only by the
    /// kernel's outstanding references.
    pub(crate) deleted: bool,
}

/// A node's position in the tree plus its kernel accounting state.
pub struct Inode {
    /// Kernel-visible id; 0 while the kernel holds no reference.
    node_id: AtomicU64,
    /// Outstanding kernel references. Mutated under the tree lock.
    lookup_count: AtomicU64,
    node: Arc<dyn Node>,
    /// The mount this inode belongs to. Fixed for the inode's lifetime;
    /// cross-mount renames are rejected with `EXDEV` instead.
    pub(crate) mount: Arc<FsMount>,
    pub(crate) state: Mutex<InodeState>,
    /// Back-reference handed to children as their parent pointer.
    weak_self: Weak<Inode>,
}

impl Inode {
    pub(crate) fn new(
        node: Arc<dyn Node>,
        mount: Arc<FsMount>,
        name: OsString,
        parent: Weak<Inode>,
    ) -> Arc<Inode> {
        Arc::new_cyclic(|weak_self| Inode {
            node_id: AtomicU64::new(0),
            lookup_count: AtomicU64::new(0),
            node,
            mount,
            state: Mutex::new(InodeState {
                name,
                parent,
                children: HashMap::new(),
                mount_point: None,
                open_files: Vec::new(),
                deleted: false,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// The user node behind this inode.
    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    /// The id the kernel currently knows this inode by, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self.node_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(NodeId(id)),
        }
    }

    pub(crate) fn set_node_id(&self, id: u64) {
        self.node_id.store(id, Ordering::Release);
    }

    pub(crate) fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_lookup_count(&self, delta: u64) -> u64 {
        self.lookup_count.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub(crate) fn sub_lookup_count(&self, delta: u64) -> u64 {
        let previous = self.lookup_count.fetch_sub(delta, Ordering::AcqRel);
        assert!(previous >= delta, "lookup count underflow ({previous} - {delta})");
        previous - delta
    }

    /// The mount whose tree lock guards this inode's children: the
    /// submount when this inode is a mountpoint, its own mount otherwise.
    pub(crate) fn tree_mount(&self) -> Arc<FsMount> {
        let state = self.state.lock();
        state
            .mount_point
            .clone()
            .unwrap_or_else(|| self.mount.clone())
    }

    /// Name under the parent. Root inodes have an empty name.
    pub fn name(&self) -> OsString {
        self.state.lock().name.clone()
    }

    /// Parent inode, `None` for the root or a detached inode.
    pub fn parent(&self) -> Option<Arc<Inode>> {
        self.state.lock().parent.upgrade()
    }

    /// The attached child of the given name.
    pub fn child(&self, name: &OsStr) -> Option<Arc<Inode>> {
        let mount = self.tree_mount();
        let _tree = mount.tree_lock.read();
        self.state.lock().children.get(name).cloned()
    }

    /// Snapshot of all attached children.
    pub fn children(&self) -> Vec<(OsString, Arc<Inode>)> {
        let mount = self.tree_mount();
        let _tree = mount.tree_lock.read();
        self.state
            .lock()
            .children
            .iter()
            .map(|(name, child)| (name.clone(), child.clone()))
            .collect()
    }

    /// True if a filesystem is mounted on this inode.
    pub fn is_mount_point(&self) -> bool {
        self.state.lock().mount_point.is_some()
    }

    /// True once the entry was removed from its parent by unlink, rmdir,
    /// or rename-over. The inode lives on while the kernel references it.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Attach a child inode for `name`, creating it with `node` if no
    /// child of that name exists yet. Returns the attached inode.
    pub fn new_child(&self, name: &OsStr, node: Arc<dyn Node>) -> Arc<Inode> {
        let mount = self.tree_mount();
        let _tree = mount.tree_lock.write();
        let mut state = self.state.lock();
        if let Some(existing) = state.children.get(name) {
            return existing.clone();
        }
        let child = Inode::new(node, mount.clone(), name.to_os_string(), self.weak_self.clone());
        state.children.insert(name.to_os_string(), child.clone());
        child
    }

    /// Number of open handles on this inode.
    pub fn open_file_count(&self) -> usize {
        self.state.lock().open_files.len()
    }

    pub(crate) fn track_open(&self, fh: u64) {
        self.state.lock().open_files.push(fh);
    }

    pub(crate) fn untrack_open(&self, fh: u64) {
        let mut state = self.state.lock();
        if let Some(pos) = state.open_files.iter().position(|&h| h == fh) {
            state.open_files.swap_remove(pos);
        }
    }

    /// Path of this inode relative to the connector root, built by walking
    /// parent references. Detached inodes yield the path of the fragment
    /// that remains reachable.
    pub fn path(&self) -> PathBuf {
        let mut segments: Vec<OsString> = Vec::new();
        let mut current = self.state.lock().parent.upgrade();
        segments.push(self.state.lock().name.clone());
        while let Some(inode) = current {
            let state = inode.state.lock();
            if !state.name.is_empty() {
                segments.push(state.name.clone());
            }
            current = state.parent.upgrade();
        }
        let mut path = PathBuf::new();
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        path
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Inode")
            .field("name", &state.name)
            .field("node_id", &self.node_id.load(Ordering::Relaxed))
            .field("lookup_count", &self.lookup_count.load(Ordering::Relaxed))
            .field("children", &state.children.len())
            .field("mount_point", &state.mount_point.is_some())
            .field("deleted", &state.deleted)
            .finish()
    }
}
