//! Tree-layer tests: lookup/forget accounting, attachment invariants, and
//! mount composition, driven through the raw bridge the way the dispatch
//! loop would.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ll::{Errno, NodeId};
use crate::raw::{Context, RawFileSystem};
use crate::{FileAttr, FileType, Owner};

use super::file::{DataFile, File};
use super::inode::Inode;
use super::node::{Node, NodeFileSystem};
use super::{Connector, TreeOptions};

#[derive(Clone)]
enum Entry {
    Dir,
    File(Vec<u8>),
}

/// A tiny in-memory filesystem: each directory node holds a map of entry
/// descriptions, enough to exercise the connector.
struct MemDir {
    entries: Mutex<HashMap<OsString, Entry>>,
}

impl MemDir {
    fn new(entries: &[(&str, Entry)]) -> Arc<MemDir> {
        Arc::new(MemDir {
            entries: Mutex::new(
                entries
                    .iter()
                    .map(|(name, entry)| (OsString::from(name), entry.clone()))
                    .collect(),
            ),
        })
    }
}

fn dir_attr() -> FileAttr {
    FileAttr::new(FileType::Directory, 0o755)
}

fn file_attr(size: u64) -> FileAttr {
    let mut attr = FileAttr::new(FileType::RegularFile, 0o644);
    attr.size = size;
    attr
}

struct MemFile {
    content: Vec<u8>,
}

impl Node for MemFile {
    fn getattr(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        _file: Option<&Arc<dyn File>>,
    ) -> Result<FileAttr, Errno> {
        Ok(file_attr(self.content.len() as u64))
    }

    fn open(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        _flags: u32,
    ) -> Result<Arc<dyn File>, Errno> {
        Ok(DataFile::new(self.content.clone()))
    }
}

impl Node for MemDir {
    fn getattr(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        _file: Option<&Arc<dyn File>>,
    ) -> Result<FileAttr, Errno> {
        Ok(dir_attr())
    }

    fn lookup(
        &self,
        _ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        let entries = self.entries.lock();
        match entries.get(name) {
            Some(Entry::Dir) => {
                let child = inode.new_child(name, MemDir::new(&[]));
                Ok((child, dir_attr()))
            }
            Some(Entry::File(content)) => {
                let attr = file_attr(content.len() as u64);
                let child = inode.new_child(
                    name,
                    Arc::new(MemFile {
                        content: content.clone(),
                    }),
                );
                Ok((child, attr))
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn unlink(&self, _ctx: &Context, _inode: &Arc<Inode>, name: &OsStr) -> Result<(), Errno> {
        match self.entries.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Errno::ENOENT),
        }
    }

    fn rename(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        name: &OsStr,
        _new_parent: &Arc<Inode>,
        new_name: &OsStr,
        _flags: u32,
    ) -> Result<(), Errno> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(name).ok_or(Errno::ENOENT)?;
        entries.insert(new_name.to_os_string(), entry);
        Ok(())
    }
}

struct MemFs {
    root: Arc<MemDir>,
}

impl MemFs {
    fn new(entries: &[(&str, Entry)]) -> Arc<MemFs> {
        Arc::new(MemFs {
            root: MemDir::new(entries),
        })
    }
}

impl NodeFileSystem for MemFs {
    fn root(&self) -> Arc<dyn Node> {
        self.root.clone()
    }
}

fn new_connector(entries: &[(&str, Entry)], options: TreeOptions) -> Arc<Connector> {
    Connector::new(MemFs::new(entries), options)
}

fn lookup(fs: &Arc<Connector>, parent: NodeId, name: &str) -> Result<NodeId, Errno> {
    let ctx = Context::test_stub();
    fs.lookup(&ctx, parent, OsStr::new(name)).map(|e| e.node_id)
}

#[test]
fn lookup_forget_accounting_balances() {
    let fs = new_connector(&[("foo", Entry::Dir)], TreeOptions::default());
    assert_eq!(fs.live_inode_count(), 1);

    let node_id = lookup(&fs, NodeId::ROOT, "foo").unwrap();
    assert_ne!(node_id, NodeId::ROOT);
    assert_eq!(fs.live_inode_count(), 2);

    // A second lookup reuses the id and stacks a reference.
    assert_eq!(lookup(&fs, NodeId::ROOT, "foo").unwrap(), node_id);
    assert_eq!(fs.live_inode_count(), 2);

    fs.forget(node_id, 1);
    assert_eq!(fs.live_inode_count(), 2);
    fs.forget(node_id, 1);
    assert_eq!(fs.live_inode_count(), 1);
}

#[test]
fn forget_reaps_forgotten_subtrees() {
    let fs = new_connector(&[("a", Entry::Dir)], TreeOptions::default());
    let a = lookup(&fs, NodeId::ROOT, "a").unwrap();
    assert_eq!(lookup(&fs, a, "b"), Err(Errno::ENOENT));

    // Attach a never-looked-up child below "a"; reaping "a" must take it
    // along depth-first.
    let a_inode = fs.root().child(OsStr::new("a")).unwrap();
    let b_inode = a_inode.new_child(OsStr::new("b"), MemDir::new(&[]));
    assert!(Arc::ptr_eq(&b_inode.parent().unwrap(), &a_inode));

    fs.forget(a, 1);
    assert_eq!(fs.live_inode_count(), 1);
    assert!(fs.root().child(OsStr::new("a")).is_none());
    assert!(b_inode.parent().is_none());
}

#[test]
fn attachment_invariant_holds() {
    let fs = new_connector(&[("dir", Entry::Dir)], TreeOptions::default());
    let ctx = Context::test_stub();
    fs.lookup(&ctx, NodeId::ROOT, OsStr::new("dir")).unwrap();

    let child = fs.root().child(OsStr::new("dir")).unwrap();
    let parent = child.parent().unwrap();
    assert!(Arc::ptr_eq(&parent, fs.root()));
    assert_eq!(child.name(), "dir");
    assert!(!child.is_deleted());
}

#[test]
fn unlink_detaches_but_keeps_referenced_inode() {
    let fs = new_connector(&[("gone", Entry::File(b"x".to_vec()))], TreeOptions::default());
    let ctx = Context::test_stub();
    let node_id = lookup(&fs, NodeId::ROOT, "gone").unwrap();
    let inode = fs.root().child(OsStr::new("gone")).unwrap();

    fs.unlink(&ctx, NodeId::ROOT, OsStr::new("gone")).unwrap();
    assert!(fs.root().child(OsStr::new("gone")).is_none());
    assert!(inode.is_deleted());
    assert!(inode.parent().is_none());
    // The kernel still holds a reference; the inode stays decodable.
    assert_eq!(fs.live_inode_count(), 2);

    fs.forget(node_id, 1);
    assert_eq!(fs.live_inode_count(), 1);
}

#[test]
fn rename_moves_the_attachment() {
    let fs = new_connector(
        &[("old", Entry::File(b"data".to_vec()))],
        TreeOptions::default(),
    );
    let ctx = Context::test_stub();
    lookup(&fs, NodeId::ROOT, "old").unwrap();
    let inode = fs.root().child(OsStr::new("old")).unwrap();

    fs.rename(
        &ctx,
        NodeId::ROOT,
        OsStr::new("old"),
        NodeId::ROOT,
        OsStr::new("new"),
        0,
    )
    .unwrap();

    assert!(fs.root().child(OsStr::new("old")).is_none());
    let moved = fs.root().child(OsStr::new("new")).unwrap();
    assert!(Arc::ptr_eq(&moved, &inode));
    assert_eq!(inode.name(), "new");
    assert!(Arc::ptr_eq(&inode.parent().unwrap(), fs.root()));
}

#[test]
fn negative_lookup_caches_when_enabled() {
    let options = TreeOptions {
        negative_timeout: std::time::Duration::from_secs(5),
        ..TreeOptions::default()
    };
    let fs = new_connector(&[], options);
    let ctx = Context::test_stub();
    let entry = fs.lookup(&ctx, NodeId::ROOT, OsStr::new("missing")).unwrap();
    assert_eq!(entry.node_id, NodeId(0));
    assert_eq!(entry.entry_timeout, std::time::Duration::from_secs(5));

    let strict = new_connector(&[], TreeOptions::default());
    assert_eq!(
        lookup(&strict, NodeId::ROOT, "missing"),
        Err(Errno::ENOENT)
    );
}

#[test]
fn owner_override_applies_to_every_attr() {
    let options = TreeOptions {
        owner: Some(Owner { uid: 42, gid: 43 }),
        ..TreeOptions::default()
    };
    let fs = new_connector(&[("f", Entry::File(b"abc".to_vec()))], options);
    let ctx = Context::test_stub();

    let entry = fs.lookup(&ctx, NodeId::ROOT, OsStr::new("f")).unwrap();
    assert_eq!(entry.attr.uid, 42);
    assert_eq!(entry.attr.gid, 43);

    let attr = fs.getattr(&ctx, NodeId::ROOT, None).unwrap();
    assert_eq!(attr.attr.uid, 42);
    assert_eq!(attr.attr.gid, 43);
}

#[test]
fn mount_on_occupied_name_is_busy() {
    let fs = new_connector(&[("dir", Entry::Dir)], TreeOptions::default());
    lookup(&fs, NodeId::ROOT, "dir").unwrap();

    let sub = MemFs::new(&[]);
    let err = fs
        .mount(fs.root(), OsStr::new("dir"), sub.clone(), None)
        .unwrap_err();
    assert_eq!(err, Errno::EBUSY);

    fs.mount(fs.root(), OsStr::new("sub"), sub, None).unwrap();
    assert!(fs.root().child(OsStr::new("sub")).unwrap().is_mount_point());
}

#[test]
fn unmount_of_non_mountpoint_is_invalid() {
    let fs = new_connector(&[("dir", Entry::Dir)], TreeOptions::default());
    lookup(&fs, NodeId::ROOT, "dir").unwrap();
    let plain = fs.root().child(OsStr::new("dir")).unwrap();
    assert_eq!(fs.unmount(&plain), Err(Errno::EINVAL));
    assert_eq!(fs.unmount(fs.root()), Err(Errno::EINVAL));
}

#[test]
fn unmount_with_open_files_is_busy() {
    let fs = new_connector(&[], TreeOptions::default());
    let ctx = Context::test_stub();
    let sub = MemFs::new(&[("f", Entry::File(b"hello".to_vec()))]);
    fs.mount(fs.root(), OsStr::new("sub"), sub, None).unwrap();
    let sub_root = fs.root().child(OsStr::new("sub")).unwrap();

    let sub_id = lookup(&fs, NodeId::ROOT, "sub").unwrap();
    let f_id = lookup(&fs, sub_id, "f").unwrap();
    let open = fs.open(&ctx, f_id, 0).unwrap();

    assert_eq!(fs.unmount(&sub_root), Err(Errno::EBUSY));

    fs.release(&ctx, f_id, open.fh, 0).unwrap();
    // Entries under the submount still referenced by the kernel keep the
    // mount busy too.
    assert_eq!(fs.unmount(&sub_root), Err(Errno::EBUSY));
    fs.forget(f_id, 1);
    fs.unmount(&sub_root).unwrap();
    assert!(fs.root().child(OsStr::new("sub")).is_none());
}

#[test]
fn read_through_open_file() {
    let fs = new_connector(&[("f", Entry::File(b"hello world".to_vec()))], TreeOptions::default());
    let ctx = Context::test_stub();
    let f_id = lookup(&fs, NodeId::ROOT, "f").unwrap();
    let open = fs.open(&ctx, f_id, 0).unwrap();
    assert_eq!(fs.read(&ctx, f_id, open.fh, 6, 5).unwrap(), b"world");
    assert_eq!(fs.read(&ctx, f_id, open.fh, 6, 64).unwrap(), b"world");
    fs.release(&ctx, f_id, open.fh, 0).unwrap();
}

#[test]
#[should_panic(expected = "unknown handle")]
fn release_of_unknown_handle_panics() {
    let fs = new_connector(&[], TreeOptions::default());
    let ctx = Context::test_stub();
    let _ = fs.release(&ctx, NodeId::ROOT, crate::FileHandle(0x7001_0000_0000_0001), 0);
}

#[test]
fn pointer_mode_inode_ids() {
    let options = TreeOptions {
        portable_inodes: false,
        ..TreeOptions::default()
    };
    let fs = new_connector(&[("foo", Entry::Dir)], options);
    let node_id = lookup(&fs, NodeId::ROOT, "foo").unwrap();
    assert_ne!(node_id.0, 0);
    fs.forget(node_id, 1);
    assert_eq!(fs.live_inode_count(), 1);
}

#[test]
fn path_resolution_walks_and_reports_tail() {
    let fs = new_connector(&[("a", Entry::Dir)], TreeOptions::default());
    lookup(&fs, NodeId::ROOT, "a").unwrap();

    let (deepest, rest) = fs.node(fs.root(), "a/b/c");
    assert_eq!(deepest.name(), "a");
    assert_eq!(rest, vec!["b".to_string(), "c".to_string()]);

    let resolved = fs.lookup_node(fs.root(), "a").unwrap();
    assert_eq!(resolved.name(), "a");
    assert!(fs.lookup_node(fs.root(), "a/missing").is_none());
}

#[test]
fn readdir_pages_and_resumes() {
    let fs = new_connector(
        &[
            ("one", Entry::File(b"1".to_vec())),
            ("two", Entry::File(b"2".to_vec())),
            ("three", Entry::File(b"3".to_vec())),
        ],
        TreeOptions::default(),
    );
    let ctx = Context::test_stub();
    // attach all children so the default readdir sees them
    for name in ["one", "two", "three"] {
        lookup(&fs, NodeId::ROOT, name).unwrap();
    }
    let open = fs.opendir(&ctx, NodeId::ROOT, 0).unwrap();

    let mut list = crate::ll::reply::DirEntryList::new(4096, 0);
    fs.readdir(&ctx, NodeId::ROOT, open.fh, 0, &mut list).unwrap();
    assert_eq!(list.offset(), 3);

    // resume from offset 2: only one entry left
    let mut rest = crate::ll::reply::DirEntryList::new(4096, 2);
    fs.readdir(&ctx, NodeId::ROOT, open.fh, 2, &mut rest).unwrap();
    assert_eq!(rest.offset(), 3);

    fs.releasedir(&ctx, NodeId::ROOT, open.fh, 0).unwrap();
}
