//! Protocol-level tests.
//!
//! A SOCK_SEQPACKET socketpair stands in for the kernel device: the test
//! writes request frames exactly as the kernel would and reads back reply
//! frames, so the whole dispatch path runs without root or a FUSE module.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use fusetree::raw::{AttrOut, Context, RawFileSystem};
use fusetree::tree::{
    Connector, DataFile, File as TreeFile, Inode, Node, NodeFileSystem, TreeOptions,
};
use fusetree::{
    BackgroundServer, Errno, FileAttr, FileType, MountOptions, NodeId, Owner, Server,
};

const FUSE_LOOKUP: u32 = 1;
const FUSE_FORGET: u32 = 2;
const FUSE_GETATTR: u32 = 3;
const FUSE_OPENDIR: u32 = 27;
const FUSE_READDIR: u32 = 28;
const FUSE_RELEASEDIR: u32 = 29;
const FUSE_INIT: u32 = 26;
const FUSE_INTERRUPT: u32 = 36;

const HELLO_CONTENT: &[u8] = b"hello world\n";

struct HelloRoot;

impl Node for HelloRoot {
    fn getattr(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        _file: Option<&Arc<dyn TreeFile>>,
    ) -> Result<FileAttr, Errno> {
        Ok(FileAttr::new(FileType::Directory, 0o755))
    }

    fn lookup(
        &self,
        _ctx: &Context,
        inode: &Arc<Inode>,
        name: &OsStr,
    ) -> Result<(Arc<Inode>, FileAttr), Errno> {
        if name != "hello.txt" {
            return Err(Errno::ENOENT);
        }
        let mut attr = FileAttr::new(FileType::RegularFile, 0o644);
        attr.size = HELLO_CONTENT.len() as u64;
        let child = inode.new_child(name, Arc::new(HelloFile));
        Ok((child, attr))
    }
}

struct HelloFile;

impl Node for HelloFile {
    fn getattr(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        _file: Option<&Arc<dyn TreeFile>>,
    ) -> Result<FileAttr, Errno> {
        let mut attr = FileAttr::new(FileType::RegularFile, 0o644);
        attr.size = HELLO_CONTENT.len() as u64;
        Ok(attr)
    }

    fn open(
        &self,
        _ctx: &Context,
        _inode: &Arc<Inode>,
        _flags: u32,
    ) -> Result<Arc<dyn TreeFile>, Errno> {
        Ok(DataFile::new(HELLO_CONTENT))
    }
}

struct HelloFs;

impl NodeFileSystem for HelloFs {
    fn root(&self) -> Arc<dyn Node> {
        Arc::new(HelloRoot)
    }
}

struct Reply {
    error: i32,
    unique: u64,
    payload: Vec<u8>,
}

struct Harness {
    // Dropped first: closing the test end lets the server workers see EOF
    // and wind down before the background guard joins them.
    sock: File,
    _server: BackgroundServer,
}

fn start_raw<FS: RawFileSystem>(fs: FS, options: &MountOptions) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (test_end, device_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let server = Server::from_device(fs, File::from(device_end), options);
    Harness {
        sock: File::from(test_end),
        _server: server.spawn().unwrap(),
    }
}

fn start_tree(tree_options: TreeOptions, options: &MountOptions) -> (Arc<Connector>, Harness) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (test_end, device_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let connector = Connector::new(Arc::new(HelloFs), tree_options);
    let server = Server::from_device(connector.clone(), File::from(device_end), options);
    connector.set_notifier(server.notifier());
    let harness = Harness {
        sock: File::from(test_end),
        _server: server.spawn().unwrap(),
    };
    (connector, harness)
}

impl Harness {
    fn send(&mut self, opcode: u32, unique: u64, nodeid: u64, body: &[u8]) {
        let mut frame = Vec::with_capacity(40 + body.len());
        frame.extend_from_slice(&(40 + body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&opcode.to_le_bytes());
        frame.extend_from_slice(&unique.to_le_bytes());
        frame.extend_from_slice(&nodeid.to_le_bytes());
        frame.extend_from_slice(&1000u32.to_le_bytes()); // uid
        frame.extend_from_slice(&1000u32.to_le_bytes()); // gid
        frame.extend_from_slice(&4242u32.to_le_bytes()); // pid
        frame.extend_from_slice(&0u32.to_le_bytes()); // padding
        frame.extend_from_slice(body);
        self.sock.write_all(&frame).unwrap();
    }

    fn recv(&mut self) -> Reply {
        let mut buf = vec![0u8; 135 * 1024];
        let n = self.sock.read(&mut buf).unwrap();
        assert!(n >= 16, "short reply frame: {n}");
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, n, "reply length field does not match the frame");
        Reply {
            error: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            unique: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            payload: buf[16..n].to_vec(),
        }
    }

    fn init(&mut self, kernel_minor: u32) -> Reply {
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&kernel_minor.to_le_bytes());
        body.extend_from_slice(&(128 * 1024u32).to_le_bytes()); // max_readahead
        // async-read, big-writes, readdirplus, max-pages
        let flags: u32 = 1 | (1 << 5) | (1 << 13) | (1 << 22);
        body.extend_from_slice(&flags.to_le_bytes());
        self.send(FUSE_INIT, 1, 0, &body);
        let reply = self.recv();
        assert_eq!(reply.unique, 1);
        reply
    }

    fn lookup(&mut self, unique: u64, parent: u64, name: &str) -> Reply {
        let mut body = name.as_bytes().to_vec();
        body.push(0);
        self.send(FUSE_LOOKUP, unique, parent, &body);
        self.recv()
    }

    fn getattr(&mut self, unique: u64, nodeid: u64) -> Reply {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // getattr_flags
        body.extend_from_slice(&0u32.to_le_bytes()); // dummy
        body.extend_from_slice(&0u64.to_le_bytes()); // fh
        self.send(FUSE_GETATTR, unique, nodeid, &body);
        self.recv()
    }

    fn forget(&mut self, unique: u64, nodeid: u64, nlookup: u64) {
        // FORGET expects no reply.
        self.send(FUSE_FORGET, unique, nodeid, &nlookup.to_le_bytes());
    }
}

fn entry_node_id(payload: &[u8]) -> u64 {
    u64::from_le_bytes(payload[0..8].try_into().unwrap())
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn init_negotiates_version_and_flags() {
    let (_fs, mut h) = start_tree(TreeOptions::default(), &MountOptions::default());
    let reply = h.init(31);
    assert_eq!(reply.error, 0);
    let payload = &reply.payload;
    assert_eq!(payload.len(), 64);
    let major = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let minor = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    assert_eq!(major, 7);
    // higher kernel minors are clamped to what the library speaks
    assert_eq!(minor, 28);
    let flags = u32::from_le_bytes(payload[12..16].try_into().unwrap());
    let offered: u32 = 1 | (1 << 5) | (1 << 13) | (1 << 22);
    assert_eq!(flags & !offered, 0, "replied flags must be a subset of the offer");
    let max_write = u32::from_le_bytes(payload[20..24].try_into().unwrap());
    assert_eq!(max_write, 64 * 1024);
    let max_background = u16::from_le_bytes(payload[16..18].try_into().unwrap());
    assert_eq!(max_background, 12);
    let congestion = u16::from_le_bytes(payload[18..20].try_into().unwrap());
    assert_eq!(congestion, 9);
}

#[test]
fn init_rejects_unsupported_versions() {
    let (_fs, mut h) = start_tree(TreeOptions::default(), &MountOptions::default());
    let reply = h.init(7); // minor below the supported floor
    assert_eq!(reply.error, -libc::EIO);
}

#[test]
fn one_byte_max_write_still_serves() {
    // Regression guard: a max_write below the page size must not break
    // server startup.
    let options = MountOptions {
        max_write: 1,
        ..MountOptions::default()
    };
    let (_fs, mut h) = start_tree(TreeOptions::default(), &options);
    let reply = h.init(28);
    assert_eq!(reply.error, 0);
    let max_write = u32::from_le_bytes(reply.payload[20..24].try_into().unwrap());
    assert_eq!(max_write, 1);

    let reply = h.getattr(2, 1);
    assert_eq!(reply.error, 0);
}

#[test]
fn owner_override_shows_in_attrs() {
    let tree_options = TreeOptions {
        owner: Some(Owner { uid: 42, gid: 43 }),
        ..TreeOptions::default()
    };
    let (_fs, mut h) = start_tree(tree_options, &MountOptions::default());
    h.init(28);

    // getattr on the root
    let reply = h.getattr(2, 1);
    assert_eq!(reply.error, 0);
    let uid = u32::from_le_bytes(reply.payload[84..88].try_into().unwrap());
    let gid = u32::from_le_bytes(reply.payload[88..92].try_into().unwrap());
    assert_eq!((uid, gid), (42, 43));

    // and on a file under the mount
    let reply = h.lookup(3, 1, "hello.txt");
    assert_eq!(reply.error, 0);
    let uid = u32::from_le_bytes(reply.payload[108..112].try_into().unwrap());
    let gid = u32::from_le_bytes(reply.payload[112..116].try_into().unwrap());
    assert_eq!((uid, gid), (42, 43));
}

#[test]
fn lookup_forget_returns_to_baseline() {
    let (fs, mut h) = start_tree(TreeOptions::default(), &MountOptions::default());
    h.init(28);
    assert_eq!(fs.live_inode_count(), 1);

    let reply = h.lookup(2, 1, "hello.txt");
    assert_eq!(reply.error, 0);
    let node_id = entry_node_id(&reply.payload);
    assert_ne!(node_id, 0);
    assert_ne!(node_id, 1);
    assert_eq!(fs.live_inode_count(), 2);

    h.forget(3, node_id, 1);
    wait_for(|| fs.live_inode_count() == 1, "forget to reap the inode");
}

#[test]
fn negative_lookup_reports_enoent() {
    let (_fs, mut h) = start_tree(TreeOptions::default(), &MountOptions::default());
    h.init(28);
    let reply = h.lookup(2, 1, "no-such-file");
    assert_eq!(reply.error, -libc::ENOENT);
}

#[test]
fn readdir_lists_entries() {
    let (_fs, mut h) = start_tree(TreeOptions::default(), &MountOptions::default());
    h.init(28);
    // attach the file so the default directory listing sees it
    let reply = h.lookup(2, 1, "hello.txt");
    assert_eq!(reply.error, 0);

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.extend_from_slice(&0u32.to_le_bytes()); // unused
    h.send(FUSE_OPENDIR, 3, 1, &body);
    let reply = h.recv();
    assert_eq!(reply.error, 0);
    let fh = u64::from_le_bytes(reply.payload[0..8].try_into().unwrap());

    let mut body = Vec::new();
    body.extend_from_slice(&fh.to_le_bytes());
    body.extend_from_slice(&0u64.to_le_bytes()); // offset
    body.extend_from_slice(&4096u32.to_le_bytes()); // size
    body.extend_from_slice(&0u32.to_le_bytes()); // read_flags
    body.extend_from_slice(&0u64.to_le_bytes()); // lock_owner
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.extend_from_slice(&0u32.to_le_bytes()); // padding
    h.send(FUSE_READDIR, 4, 1, &body);
    let reply = h.recv();
    assert_eq!(reply.error, 0);
    // one dirent: 24-byte header, name, padding to 8
    assert!(reply.payload.len() >= 24 + "hello.txt".len());
    let namelen = u32::from_le_bytes(reply.payload[16..20].try_into().unwrap()) as usize;
    assert_eq!(namelen, "hello.txt".len());
    assert_eq!(&reply.payload[24..24 + namelen], b"hello.txt");

    let mut body = Vec::new();
    body.extend_from_slice(&fh.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // flags
    body.extend_from_slice(&0u32.to_le_bytes()); // release_flags
    body.extend_from_slice(&0u64.to_le_bytes()); // lock_owner
    h.send(FUSE_RELEASEDIR, 5, 1, &body);
    assert_eq!(h.recv().error, 0);
}

#[test]
fn unknown_opcode_answers_enosys() {
    let (_fs, mut h) = start_tree(TreeOptions::default(), &MountOptions::default());
    h.init(28);
    h.send(200, 2, 1, &[]);
    let reply = h.recv();
    assert_eq!(reply.unique, 2);
    assert_eq!(reply.error, -libc::ENOSYS);
}

/// A raw filesystem that records whether getattr ever ran.
struct RecordingFs {
    getattr_called: Arc<AtomicBool>,
}

impl RawFileSystem for RecordingFs {
    fn getattr(
        &self,
        _ctx: &Context,
        _node_id: NodeId,
        _fh: Option<fusetree::FileHandle>,
    ) -> Result<AttrOut, Errno> {
        self.getattr_called.store(true, Ordering::SeqCst);
        Ok(AttrOut {
            attr_timeout: Duration::from_secs(1),
            attr: FileAttr::new(FileType::Directory, 0o755),
        })
    }
}

#[test]
fn interrupt_before_target_short_circuits() {
    let getattr_called = Arc::new(AtomicBool::new(false));
    let fs = RecordingFs {
        getattr_called: getattr_called.clone(),
    };
    let mut h = start_raw(fs, &MountOptions::default());
    h.init(28);

    // Interrupt a request the server has not seen yet. The interrupt
    // itself is answered with silence.
    h.send(FUSE_INTERRUPT, 2, 0, &9u64.to_le_bytes());

    // When the target finally arrives it must die with EINTR without the
    // handler running. The interrupt needs a moment to be queued first.
    std::thread::sleep(Duration::from_millis(50));
    h.send(FUSE_GETATTR, 9, 1, &[0u8; 16]);
    let reply = h.recv();
    assert_eq!(reply.unique, 9);
    assert_eq!(reply.error, -libc::EINTR);
    assert!(!getattr_called.load(Ordering::SeqCst));

    // A fresh getattr is unaffected.
    let reply = h.getattr(10, 1);
    assert_eq!(reply.error, 0);
    assert!(getattr_called.load(Ordering::SeqCst));
}
