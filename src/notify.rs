//! Kernel cache invalidation.
//!
//! A [`Notifier`] lets the filesystem tell the kernel, outside of any
//! request, that cached metadata or directory entries are stale. Notify
//! frames share the device write mutex with replies, so they never
//! interleave mid-frame.

use std::ffi::OsStr;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::channel::Channel;
use crate::ll::NodeId;
use crate::ll::abi::NOTIFY_DELETE_MINOR_VERSION;
use crate::ll::reply::Notification;

/// A handle by which the filesystem can send notifications to the kernel.
#[derive(Clone)]
pub struct Notifier {
    channel: Channel,
    proto_minor: Arc<AtomicU32>,
}

impl Notifier {
    pub(crate) fn new(channel: Channel, proto_minor: Arc<AtomicU32>) -> Self {
        Notifier {
            channel,
            proto_minor,
        }
    }

    /// Whether the negotiated protocol understands `FUSE_NOTIFY_DELETE`.
    /// Callers should fall back to [`Notifier::inval_entry`] otherwise.
    pub fn supports_delete(&self) -> bool {
        self.proto_minor.load(Ordering::SeqCst) >= NOTIFY_DELETE_MINOR_VERSION
    }

    /// Invalidate the kernel's cached attributes and data range of an
    /// inode. A negative `len` invalidates attributes only.
    pub fn inval_inode(&self, node_id: NodeId, offset: i64, len: i64) -> io::Result<()> {
        self.send(&Notification::inval_inode(node_id.0, offset, len))
    }

    /// Invalidate the kernel's cached `parent/name -> inode` binding.
    pub fn inval_entry(&self, parent: NodeId, name: &OsStr) -> io::Result<()> {
        self.send(&Notification::inval_entry(parent.0, name))
    }

    /// Like [`Notifier::inval_entry`], and additionally informs inotify
    /// watchers that the entry was deleted.
    pub fn delete(&self, parent: NodeId, child: NodeId, name: &OsStr) -> io::Result<()> {
        self.send(&Notification::delete(parent.0, child.0, name))
    }

    fn send(&self, notification: &Notification<'_>) -> io::Result<()> {
        match notification.with_iovec(|iov| self.channel.send(iov)) {
            // ENOENT is harmless for an invalidation: the kernel may have
            // already dropped the cached entry on its own.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            x => x,
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Notifier")
    }
}
