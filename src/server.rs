//! The request dispatch loop.
//!
//! A bounded set of worker threads reads framed requests from the device
//! fd. Each worker parses its request, runs the filesystem handler inline,
//! and writes the reply; when the last idle worker picks up a request it
//! first spawns a replacement reader (up to the configured cap), so reads
//! continue while handlers run but no CPU is spent polling when the mount
//! is quiet.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::bufpool::{BucketStats, BufferPool};
use crate::channel::Channel;
use crate::ll::abi::{self, InitFlags, fuse_opcode};
use crate::ll::reply::{self, DirEntryList, DirEntryPlusList, Response};
use crate::ll::request::{Operation, Request, RequestError};
use crate::ll::{Errno, FileHandle, LockOwner, NodeId, RequestId, TimeOrNow, Version};
use crate::mnt::Mount;
use crate::notify::Notifier;
use crate::MountOptions;
use crate::raw::{Context, ForgetOne, KernelConfig, RawFileSystem, SerializedFs, SetAttrRequest, XattrOut};

/// Interrupts targeting requests we have not read yet are queued; the queue
/// is bounded so a kernel gone haywire cannot grow it without limit.
const MAX_QUEUED_INTERRUPTS: usize = 4096;

/// Mutable per-connection state established by the INIT handshake.
#[derive(Default)]
struct SessionState {
    initialized: AtomicBool,
    destroyed: AtomicBool,
    /// Negotiated minor version; zero until INIT has happened. Shared with
    /// notifiers so they can downgrade codes older kernels lack.
    proto_minor: Arc<AtomicU32>,
}

impl SessionState {
    fn set_protocol_version(&self, version: Version) {
        self.proto_minor.store(version.minor, Ordering::SeqCst);
    }

    fn protocol_version(&self) -> Option<Version> {
        match self.proto_minor.load(Ordering::SeqCst) {
            0 => None,
            minor => Some(Version {
                major: abi::FUSE_KERNEL_VERSION,
                minor,
            }),
        }
    }

    fn proto_minor(&self) -> Arc<AtomicU32> {
        self.proto_minor.clone()
    }
}

struct Workers {
    exit: AtomicBool,
    total: AtomicUsize,
    idle: AtomicUsize,
    inner: Mutex<WorkersInner>,
    done: Condvar,
}

struct WorkersInner {
    handles: Vec<JoinHandle<()>>,
    next_id: usize,
    error: Option<io::Error>,
}

pub(crate) struct ServerInner {
    fs: Arc<dyn RawFileSystem>,
    channel: Channel,
    mount: Mutex<Option<Mount>>,
    pool: BufferPool,
    options: MountOptions,
    buffer_size: usize,
    state: SessionState,
    workers: Workers,
    /// Cancellation flags of requests currently being handled, keyed by
    /// their unique id.
    inflight: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    /// Interrupts whose target has not been dispatched yet.
    queued_interrupts: Mutex<HashSet<u64>>,
}

/// A mounted filesystem serving kernel requests.
///
/// Dropping the server unmounts. [`Server::run`] blocks the calling thread
/// until the filesystem is unmounted; use [`Server::spawn`] to serve from a
/// background thread instead.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("initialized", &self.inner.state.initialized.load(Ordering::Relaxed))
            .field("destroyed", &self.inner.state.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Server {
    /// Mount `filesystem` at `mountpoint` and prepare a server for it.
    pub fn mount<FS: RawFileSystem>(
        filesystem: FS,
        mountpoint: &Path,
        options: &MountOptions,
    ) -> io::Result<Server> {
        let (device, mount) = Mount::new(mountpoint, options)?;
        Ok(Server::build(filesystem, device, Some(mount), options))
    }

    /// Serve an already-open kernel device fd. No unmount is performed on
    /// teardown; the fd's owner is responsible for the mount lifetime.
    pub fn from_device<FS: RawFileSystem>(
        filesystem: FS,
        device: File,
        options: &MountOptions,
    ) -> Server {
        Server::build(filesystem, Arc::new(device), None, options)
    }

    fn build<FS: RawFileSystem>(
        filesystem: FS,
        device: Arc<File>,
        mount: Option<Mount>,
        options: &MountOptions,
    ) -> Server {
        let fs: Arc<dyn RawFileSystem> = if options.single_threaded {
            Arc::new(SerializedFs::new(filesystem))
        } else {
            Arc::new(filesystem)
        };
        let buffer_size = options.request_buffer_size();
        let max_readers = options.max_readers.max(1);
        Server {
            inner: Arc::new(ServerInner {
                fs,
                channel: Channel::new(device),
                mount: Mutex::new(mount),
                // One spare buffer beyond the reader cap keeps allocate()
                // from ever blocking the read path.
                pool: BufferPool::new(buffer_size, max_readers + 1),
                options: options.clone(),
                buffer_size,
                state: SessionState::default(),
                workers: Workers {
                    exit: AtomicBool::new(false),
                    total: AtomicUsize::new(0),
                    idle: AtomicUsize::new(0),
                    inner: Mutex::new(WorkersInner {
                        handles: Vec::new(),
                        next_id: 0,
                        error: None,
                    }),
                    done: Condvar::new(),
                },
                inflight: Mutex::new(HashMap::new()),
                queued_interrupts: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Serve requests until the filesystem is unmounted.
    pub fn run(&self) -> io::Result<()> {
        ServerInner::start_worker(&self.inner)?;
        let mut guard = self.inner.workers.inner.lock();
        while self.inner.workers.total.load(Ordering::Acquire) > 0 {
            self.inner.workers.done.wait(&mut guard);
        }
        let handles = std::mem::take(&mut guard.handles);
        let result = match guard.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        drop(guard);
        for handle in handles {
            let _ = handle.join();
        }
        if !self.inner.state.destroyed.swap(true, Ordering::SeqCst) {
            self.inner.fs.destroy();
        }
        result
    }

    /// Serve from a background thread; the returned guard unmounts when
    /// dropped.
    pub fn spawn(self) -> io::Result<BackgroundServer> {
        BackgroundServer::new(self)
    }

    /// Unmount the filesystem. The blocked device reads observe `ENODEV`
    /// and the serve loop winds down.
    pub fn unmount(&self) -> io::Result<()> {
        self.inner.workers.exit.store(true, Ordering::Release);
        let mount = self.inner.mount.lock().take();
        match mount {
            Some(mut mount) => mount.unmount(),
            None => Ok(()),
        }
    }

    /// Handle for sending cache-invalidation notifications. Usable once the
    /// kernel has sent INIT.
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.inner.channel.clone(), self.inner.state.proto_minor())
    }

    /// The protocol version negotiated with the kernel, if INIT happened.
    pub fn protocol_version(&self) -> Option<Version> {
        self.inner.state.protocol_version()
    }

    /// Read-buffer pool counters, for diagnostics.
    pub fn buffer_stats(&self) -> Vec<BucketStats> {
        self.inner.pool.stats()
    }
}

/// Guard returned by [`Server::spawn`]: joins the serve loop and unmounts
/// on drop.
pub struct BackgroundServer {
    server: Server,
    guard: Option<JoinHandle<io::Result<()>>>,
}

impl BackgroundServer {
    fn new(server: Server) -> io::Result<BackgroundServer> {
        let runner = Server {
            inner: server.inner.clone(),
        };
        let guard = thread::Builder::new()
            .name("fuse-server".to_string())
            .spawn(move || runner.run())?;
        Ok(BackgroundServer {
            server,
            guard: Some(guard),
        })
    }

    /// The served filesystem's notifier.
    pub fn notifier(&self) -> Notifier {
        self.server.notifier()
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        if let Err(err) = self.server.unmount() {
            error!("unmount failed: {err}");
        }
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

impl std::fmt::Debug for BackgroundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackgroundServer {{ {:?} }}", self.server)
    }
}

fn aligned_sub_buf(buf: &mut [u8], alignment: usize) -> &mut [u8] {
    let off = alignment - (buf.as_ptr() as usize) % alignment;
    if off == alignment { buf } else { &mut buf[off..] }
}

fn is_forget_opcode(opcode: u32) -> bool {
    opcode == fuse_opcode::FUSE_FORGET as u32 || opcode == fuse_opcode::FUSE_BATCH_FORGET as u32
}

impl ServerInner {
    fn start_worker(inner: &Arc<ServerInner>) -> io::Result<()> {
        let mut guard = inner.workers.inner.lock();
        let worker_id = guard.next_id;
        guard.next_id += 1;
        inner.workers.total.fetch_add(1, Ordering::SeqCst);
        let cloned = inner.clone();
        match thread::Builder::new()
            .name(format!("fuse-worker-{worker_id}"))
            .spawn(move || cloned.worker_loop(worker_id))
        {
            Ok(handle) => {
                guard.handles.push(handle);
                Ok(())
            }
            Err(err) => {
                inner.workers.total.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn worker_loop(self: Arc<ServerInner>, worker_id: usize) {
        let header_align = std::mem::align_of::<abi::fuse_in_header>();
        loop {
            if self.workers.exit.load(Ordering::Relaxed) {
                break;
            }

            // The buffer size already carries page-sized slack beyond
            // max_write, which covers the alignment trim below.
            let mut buffer = self.pool.allocate(self.buffer_size);

            // About to block in the device read.
            self.workers.idle.fetch_add(1, Ordering::Release);
            let result = {
                let buf = aligned_sub_buf(&mut buffer, header_align);
                self.channel.receive(buf)
            };
            let prev_idle = self.workers.idle.fetch_sub(1, Ordering::Acquire);

            let size = match result {
                Ok(0) => {
                    // EOF: the device side is gone.
                    self.pool.free(buffer);
                    self.shutdown(None);
                    break;
                }
                Ok(size) => size,
                Err(err) => {
                    self.pool.free(buffer);
                    match err.raw_os_error() {
                        // Transient kernel conditions, safe to retry.
                        Some(libc::ENOENT | libc::EINTR | libc::EAGAIN) => continue,
                        // The mount has gone away.
                        Some(libc::ENODEV) => {
                            self.shutdown(None);
                            break;
                        }
                        _ => {
                            error!("worker {worker_id}: device read failed: {err}");
                            self.shutdown(Some(err));
                            break;
                        }
                    }
                }
            };

            // If we were the last idle reader, bring up a replacement so
            // the device keeps being drained while this request is handled.
            // FORGETs are exempt: they are cheap and must complete inline
            // before anything else is dispatched for the same node anyway.
            if prev_idle <= 1
                && self.state.initialized.load(Ordering::Relaxed)
                && self.workers.total.load(Ordering::Relaxed) < self.options.max_readers.max(1)
            {
                let aligned = aligned_sub_buf(&mut buffer, header_align);
                let skip = aligned.len() >= 8 && {
                    let opcode = u32::from_le_bytes(aligned[4..8].try_into().unwrap());
                    is_forget_opcode(opcode)
                };
                if !skip {
                    if let Err(err) = ServerInner::start_worker(&self) {
                        warn!("spawning additional reader failed: {err}");
                    }
                }
            }

            {
                let aligned = aligned_sub_buf(&mut buffer, header_align);
                self.dispatch(&aligned[..size]);
            }
            self.pool.free(buffer);
        }

        if self.workers.total.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last worker out wakes up run().
            let _guard = self.workers.inner.lock();
            self.workers.done.notify_all();
        }
    }

    fn shutdown(&self, err: Option<io::Error>) {
        self.workers.exit.store(true, Ordering::Release);
        let mut guard = self.workers.inner.lock();
        if let Some(err) = err {
            if guard.error.is_none() {
                guard.error = Some(err);
            }
        }
        self.workers.done.notify_all();
    }

    fn send_response(&self, unique: RequestId, response: &Response<'_>) {
        let result = response.with_iovec(unique, |iov| self.channel.send(iov));
        if let Err(err) = result {
            // ENOENT means the request was interrupted and the kernel
            // already gave up on it.
            if err.raw_os_error() != Some(libc::ENOENT) {
                warn!("reply for request {unique} failed: {err}");
            }
        }
    }

    fn dispatch(&self, data: &[u8]) {
        let req = match Request::try_from(data) {
            Ok(req) => req,
            Err(RequestError::UnknownOperation(opcode)) => {
                warn!("unknown opcode {opcode}");
                if let Some(unique) = peek_unique(data) {
                    self.send_response(unique, &Response::new_error(Errno::ENOSYS));
                }
                return;
            }
            Err(err) => {
                error!("malformed request: {err}");
                if let Some(unique) = peek_unique(data) {
                    self.send_response(unique, &Response::new_error(Errno::EIO));
                }
                return;
            }
        };
        if self.options.debug {
            debug!("{req}");
        }

        let unique = req.unique();
        match req.operation() {
            Operation::Init { arg } => {
                self.handle_init(&req, arg);
                return;
            }
            _ if !self.state.initialized.load(Ordering::Relaxed) => {
                warn!("operation before INIT: {req}");
                self.send_response(unique, &Response::new_error(Errno::EIO));
                return;
            }
            Operation::Destroy => {
                if !self.state.destroyed.swap(true, Ordering::SeqCst) {
                    self.fs.destroy();
                }
                self.send_response(unique, &Response::new_empty());
                return;
            }
            _ if self.state.destroyed.load(Ordering::Relaxed) => {
                warn!("operation after DESTROY: {req}");
                self.send_response(unique, &Response::new_error(Errno::EIO));
                return;
            }
            // The kernel expects silence for forgets. They also must finish
            // before any later request touching the same node, hence inline
            // on the reader thread with no reply.
            Operation::Forget { nlookup } => {
                self.fs.forget(req.node_id(), *nlookup);
                return;
            }
            Operation::BatchForget { nodes } => {
                let nodes: Vec<ForgetOne> = nodes
                    .iter()
                    .map(|n| ForgetOne {
                        node_id: NodeId(n.nodeid),
                        nlookup: n.nlookup,
                    })
                    .collect();
                self.fs.batch_forget(&nodes);
                return;
            }
            Operation::Interrupt { arg } => {
                self.handle_interrupt(unique, arg.unique);
                return;
            }
            _ => {}
        }

        // A queued interrupt may already be waiting for this request: the
        // kernel sent the INTERRUPT before we read its target.
        if self.queued_interrupts.lock().remove(&unique.0) {
            debug!("request {unique} was interrupted before dispatch");
            self.send_response(unique, &Response::new_error(Errno::EINTR));
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inflight.lock().insert(unique.0, cancelled.clone());
        let ctx = Context {
            unique,
            node_id: req.node_id(),
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
            cancelled,
        };
        let response = match self.handle(&ctx, &req) {
            Ok(response) => response,
            Err(errno) => Response::new_error(errno),
        };
        self.inflight.lock().remove(&unique.0);
        if self.options.debug {
            match &response {
                Response::Error(Some(errno)) => debug!("request {unique}: error {errno}"),
                _ => debug!("request {unique}: ok"),
            }
        }
        self.send_response(unique, &response);
    }

    fn handle_init(&self, req: &Request<'_>, arg: &abi::fuse_init_in) {
        let unique = req.unique();
        let kernel = Version {
            major: arg.major,
            minor: arg.minor,
        };
        if kernel.major != abi::FUSE_KERNEL_VERSION || kernel.minor < abi::MIN_KERNEL_MINOR_VERSION
        {
            error!("unsupported FUSE ABI version {kernel}");
            self.send_response(unique, &Response::new_error(Errno::EIO));
            return;
        }
        let capabilities = InitFlags::from_bits_retain(arg.flags);
        let mut config = KernelConfig::new(capabilities, arg.max_readahead, kernel, &self.options);
        let ctx = Context {
            unique,
            node_id: req.node_id(),
            uid: req.uid(),
            gid: req.gid(),
            pid: req.pid(),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        if let Err(errno) = self.fs.init(&ctx, &mut config) {
            self.send_response(unique, &Response::new_error(errno));
            return;
        }
        let negotiated = Version {
            major: abi::FUSE_KERNEL_VERSION,
            minor: kernel.minor.min(abi::FUSE_KERNEL_MINOR_VERSION),
        };
        let flags = config.reply_flags();
        let init = abi::fuse_init_out {
            major: negotiated.major,
            minor: negotiated.minor,
            max_readahead: config.max_readahead,
            flags: flags.bits(),
            max_background: config.max_background,
            congestion_threshold: config.effective_congestion_threshold(),
            max_write: config.max_write,
            time_gran: 1,
            max_pages: if flags.contains(InitFlags::FUSE_MAX_PAGES) {
                config.max_pages()
            } else {
                0
            },
            unused2: 0,
            reserved: [0; 8],
        };
        debug!(
            "INIT response: ABI {negotiated}, flags {:#x}, max readahead {}, max write {}",
            init.flags, init.max_readahead, init.max_write
        );
        self.state.set_protocol_version(negotiated);
        self.state.initialized.store(true, Ordering::SeqCst);
        self.send_response(unique, &Response::new_struct(&init));
    }

    fn handle_interrupt(&self, unique: RequestId, target: u64) {
        if let Some(cancelled) = self.inflight.lock().get(&target) {
            debug!("interrupting in-flight request {target}");
            cancelled.store(true, Ordering::Relaxed);
            // Successful correlation is silent; the EINTR (or late result)
            // goes out under the target's own id.
            return;
        }
        let mut queued = self.queued_interrupts.lock();
        if queued.len() >= MAX_QUEUED_INTERRUPTS {
            drop(queued);
            self.send_response(unique, &Response::new_error(Errno::EAGAIN));
            return;
        }
        debug!("queueing interrupt for not-yet-seen request {target}");
        queued.insert(target);
    }

    fn handle(&self, ctx: &Context, req: &Request<'_>) -> Result<Response<'static>, Errno> {
        let fs = &self.fs;
        let node = ctx.node_id;
        match req.operation() {
            Operation::Lookup { name } => {
                let entry = fs.lookup(ctx, node, name)?;
                Ok(Response::new_struct(&reply::encode_entry_out(&entry)))
            }
            Operation::GetAttr { arg } => {
                let fh = (arg.getattr_flags & abi::FUSE_GETATTR_FH != 0)
                    .then_some(FileHandle(arg.fh));
                let out = fs.getattr(ctx, node, fh)?;
                Ok(Response::new_struct(&encode_attr_out(&out)))
            }
            Operation::SetAttr { arg } => {
                let request = decode_setattr(arg);
                let out = fs.setattr(ctx, node, &request)?;
                Ok(Response::new_struct(&encode_attr_out(&out)))
            }
            Operation::ReadLink => {
                let target = fs.readlink(ctx, node)?;
                Ok(Response::new_data(target))
            }
            Operation::SymLink { name, target } => {
                let entry = fs.symlink(ctx, node, name, target)?;
                Ok(Response::new_struct(&reply::encode_entry_out(&entry)))
            }
            Operation::MkNod { arg, name } => {
                let entry = fs.mknod(ctx, node, name, arg.mode, arg.umask, arg.rdev)?;
                Ok(Response::new_struct(&reply::encode_entry_out(&entry)))
            }
            Operation::MkDir { arg, name } => {
                let entry = fs.mkdir(ctx, node, name, arg.mode, arg.umask)?;
                Ok(Response::new_struct(&reply::encode_entry_out(&entry)))
            }
            Operation::Unlink { name } => {
                fs.unlink(ctx, node, name)?;
                Ok(Response::new_empty())
            }
            Operation::RmDir { name } => {
                fs.rmdir(ctx, node, name)?;
                Ok(Response::new_empty())
            }
            Operation::Rename {
                new_dir,
                name,
                new_name,
                flags,
            } => {
                fs.rename(ctx, node, name, NodeId(*new_dir), new_name, *flags)?;
                Ok(Response::new_empty())
            }
            Operation::Link { arg, name } => {
                let entry = fs.link(ctx, NodeId(arg.oldnodeid), node, name)?;
                Ok(Response::new_struct(&reply::encode_entry_out(&entry)))
            }
            Operation::Open { arg } => {
                let out = fs.open(ctx, node, arg.flags)?;
                Ok(Response::new_struct(&encode_open_out(&out)))
            }
            Operation::Read { arg } => {
                let mut data = fs.read(ctx, node, FileHandle(arg.fh), arg.offset, arg.size)?;
                data.truncate(arg.size as usize);
                Ok(Response::new_data(data))
            }
            Operation::Write { arg, data } => {
                let written =
                    fs.write(ctx, node, FileHandle(arg.fh), arg.offset, data, arg.write_flags)?;
                Ok(Response::new_struct(&abi::fuse_write_out {
                    size: written,
                    padding: 0,
                }))
            }
            Operation::Flush { arg } => {
                fs.flush(ctx, node, FileHandle(arg.fh), LockOwner(arg.lock_owner))?;
                Ok(Response::new_empty())
            }
            Operation::Release { arg } => {
                fs.release(ctx, node, FileHandle(arg.fh), arg.flags)?;
                Ok(Response::new_empty())
            }
            Operation::FSync { arg } => {
                fs.fsync(ctx, node, FileHandle(arg.fh), arg.fsync_flags & abi::FUSE_FSYNC_FDATASYNC != 0)?;
                Ok(Response::new_empty())
            }
            Operation::OpenDir { arg } => {
                let out = fs.opendir(ctx, node, arg.flags)?;
                Ok(Response::new_struct(&encode_open_out(&out)))
            }
            Operation::ReadDir { arg } => {
                let mut list = DirEntryList::new(arg.size as usize, arg.offset);
                fs.readdir(ctx, node, FileHandle(arg.fh), arg.offset, &mut list)?;
                Ok(Response::new_data(list.into_bytes()))
            }
            Operation::ReadDirPlus { arg } => {
                let mut list = DirEntryPlusList::new(arg.size as usize, arg.offset);
                fs.readdirplus(ctx, node, FileHandle(arg.fh), arg.offset, &mut list)?;
                Ok(Response::new_data(list.into_bytes()))
            }
            Operation::ReleaseDir { arg } => {
                fs.releasedir(ctx, node, FileHandle(arg.fh), arg.flags)?;
                Ok(Response::new_empty())
            }
            Operation::FSyncDir { arg } => {
                fs.fsyncdir(ctx, node, FileHandle(arg.fh), arg.fsync_flags & abi::FUSE_FSYNC_FDATASYNC != 0)?;
                Ok(Response::new_empty())
            }
            Operation::StatFs => {
                let out = fs.statfs(ctx, node)?;
                Ok(Response::new_struct(&abi::fuse_statfs_out {
                    st: abi::fuse_kstatfs {
                        blocks: out.blocks,
                        bfree: out.bfree,
                        bavail: out.bavail,
                        files: out.files,
                        ffree: out.ffree,
                        bsize: out.bsize,
                        namelen: out.namelen,
                        frsize: out.frsize,
                        padding: 0,
                        spare: [0; 6],
                    },
                }))
            }
            Operation::Access { arg } => {
                fs.access(ctx, node, arg.mask)?;
                Ok(Response::new_empty())
            }
            Operation::Create { arg, name } => {
                let out = fs.create(ctx, node, name, arg.flags, arg.mode, arg.umask)?;
                Ok(Response::new_structs(
                    &reply::encode_entry_out(&out.entry),
                    &encode_open_out(&out.open),
                ))
            }
            Operation::SetXAttr { arg, name, value } => {
                fs.setxattr(ctx, node, name, value, arg.flags)?;
                Ok(Response::new_empty())
            }
            Operation::GetXAttr { arg, name } => {
                let out = fs.getxattr(ctx, node, name, arg.size)?;
                encode_xattr_out(out, arg.size)
            }
            Operation::ListXAttr { arg } => {
                let out = fs.listxattr(ctx, node, arg.size)?;
                encode_xattr_out(out, arg.size)
            }
            Operation::RemoveXAttr { name } => {
                fs.removexattr(ctx, node, name)?;
                Ok(Response::new_empty())
            }
            Operation::FAllocate { arg } => {
                fs.fallocate(ctx, node, FileHandle(arg.fh), arg.offset, arg.length, arg.mode)?;
                Ok(Response::new_empty())
            }
            Operation::Lseek { arg } => {
                let offset = fs.lseek(ctx, node, FileHandle(arg.fh), arg.offset, arg.whence)?;
                Ok(Response::new_struct(&abi::fuse_lseek_out { offset }))
            }
            Operation::CopyFileRange { arg } => {
                let written = fs.copy_file_range(
                    ctx,
                    node,
                    FileHandle(arg.fh_in),
                    arg.off_in,
                    NodeId(arg.nodeid_out),
                    FileHandle(arg.fh_out),
                    arg.off_out,
                    arg.len,
                    arg.flags,
                )?;
                Ok(Response::new_struct(&abi::fuse_write_out {
                    size: written,
                    padding: 0,
                }))
            }
            Operation::Unsupported { opcode } => {
                debug!("unsupported opcode {opcode:?}");
                Err(Errno::ENOSYS)
            }
            // Handled before reaching here.
            Operation::Init { .. }
            | Operation::Destroy
            | Operation::Forget { .. }
            | Operation::BatchForget { .. }
            | Operation::Interrupt { .. } => unreachable!("handled in dispatch"),
        }
    }
}

fn peek_unique(data: &[u8]) -> Option<RequestId> {
    if data.len() < std::mem::size_of::<abi::fuse_in_header>() {
        return None;
    }
    Some(RequestId(u64::from_le_bytes(data[8..16].try_into().ok()?)))
}

fn encode_attr_out(out: &crate::raw::AttrOut) -> abi::fuse_attr_out {
    let (attr_valid, attr_valid_nsec) = reply::timeout_parts(out.attr_timeout);
    abi::fuse_attr_out {
        attr_valid,
        attr_valid_nsec,
        dummy: 0,
        attr: reply::fuse_attr_from(&out.attr),
    }
}

fn encode_open_out(out: &crate::raw::OpenOut) -> abi::fuse_open_out {
    abi::fuse_open_out {
        fh: out.fh.0,
        open_flags: out.flags.bits(),
        padding: 0,
    }
}

fn encode_xattr_out(out: XattrOut, requested: u32) -> Result<Response<'static>, Errno> {
    match out {
        XattrOut::Size(size) => Ok(Response::new_struct(&abi::fuse_getxattr_out {
            size,
            padding: 0,
        })),
        XattrOut::Data(data) => {
            if requested == 0 {
                Ok(Response::new_struct(&abi::fuse_getxattr_out {
                    size: data.len() as u32,
                    padding: 0,
                }))
            } else if data.len() > requested as usize {
                Err(Errno::ERANGE)
            } else {
                Ok(Response::new_data(data))
            }
        }
    }
}

fn system_time_from(secs: i64, nsecs: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0) + Duration::new(0, nsecs)
    }
}

fn decode_setattr(arg: &abi::fuse_setattr_in) -> SetAttrRequest {
    let valid = arg.valid;
    let time_field = |flag: u32, now_flag: u32, secs: i64, nsecs: u32| -> Option<TimeOrNow> {
        if valid & now_flag != 0 {
            Some(TimeOrNow::Now)
        } else if valid & flag != 0 {
            Some(TimeOrNow::SpecificTime(system_time_from(secs, nsecs)))
        } else {
            None
        }
    };
    SetAttrRequest {
        mode: (valid & abi::FATTR_MODE != 0).then_some(arg.mode),
        uid: (valid & abi::FATTR_UID != 0).then_some(arg.uid),
        gid: (valid & abi::FATTR_GID != 0).then_some(arg.gid),
        size: (valid & abi::FATTR_SIZE != 0).then_some(arg.size),
        atime: time_field(abi::FATTR_ATIME, abi::FATTR_ATIME_NOW, arg.atime, arg.atimensec),
        mtime: time_field(abi::FATTR_MTIME, abi::FATTR_MTIME_NOW, arg.mtime, arg.mtimensec),
        ctime: (valid & abi::FATTR_CTIME != 0)
            .then(|| system_time_from(arg.ctime, arg.ctimensec)),
        fh: (valid & abi::FATTR_FH != 0).then_some(FileHandle(arg.fh)),
        lock_owner: (valid & abi::FATTR_LOCKOWNER != 0).then_some(LockOwner(arg.lock_owner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setattr_mask_decoding() {
        let arg = abi::fuse_setattr_in {
            valid: abi::FATTR_MODE | abi::FATTR_SIZE | abi::FATTR_MTIME_NOW,
            padding: 0,
            fh: 99,
            size: 4096,
            lock_owner: 0,
            atime: 100,
            mtime: 200,
            ctime: 300,
            atimensec: 0,
            mtimensec: 0,
            ctimensec: 0,
            mode: 0o644,
            unused4: 0,
            uid: 1,
            gid: 2,
            unused5: 0,
        };
        let req = decode_setattr(&arg);
        assert_eq!(req.mode, Some(0o644));
        assert_eq!(req.size, Some(4096));
        assert_eq!(req.mtime, Some(TimeOrNow::Now));
        assert_eq!(req.atime, None);
        assert_eq!(req.uid, None);
        assert_eq!(req.gid, None);
        assert_eq!(req.fh, None);
    }

    #[test]
    fn peek_unique_requires_full_header() {
        assert!(peek_unique(&[0u8; 16]).is_none());
        let mut data = [0u8; 40];
        data[8..16].copy_from_slice(&77u64.to_le_bytes());
        assert_eq!(peek_unique(&data), Some(RequestId(77)));
    }
}
