//! Open-file objects.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::FileAttr;
use crate::ll::Errno;
use crate::raw::SetAttrRequest;

use super::inode::Inode;
use super::node::DirEntry;

/// The data plane of an open file. Returned by [`super::Node::open`] and
/// driven by read/write/flush/release requests carrying the handle.
///
/// Defaults answer `ENOSYS` so read-only or stateless files implement only
/// what they need.
#[allow(unused_variables)]
pub trait File: Send + Sync + 'static {
    /// Read up to `size` bytes at `offset`. A short result means EOF.
    fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Write `data` at `offset`, returning the bytes accepted.
    fn write(&self, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Called on each close(2) of a descriptor for this open file.
    fn flush(&self) -> Result<(), Errno> {
        Ok(())
    }

    /// Called exactly once when the last reference goes away.
    fn release(&self) {}

    fn fsync(&self, datasync: bool) -> Result<(), Errno> {
        Ok(())
    }

    /// File-level attributes, when fresher than what the node reports
    /// (size of an open append stream, for instance). `None` defers to the
    /// node.
    fn getattr(&self) -> Result<Option<FileAttr>, Errno> {
        Ok(None)
    }

    /// Apply a size/time change through the open handle.
    fn setattr(&self, req: &SetAttrRequest) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn allocate(&self, offset: u64, length: u64, mode: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }
}

/// What an open handle refers to.
pub(crate) enum OpenKind {
    File(Arc<dyn File>),
    /// Directory stream snapshot taken at opendir; READDIR pages through
    /// it by logical offset.
    Dir(Mutex<Vec<DirEntry>>),
}

/// One open file or directory, stored in its mount's open-files map and
/// handed to the kernel as `fh`.
pub(crate) struct OpenFile {
    pub(crate) inode: Arc<Inode>,
    pub(crate) flags: u32,
    pub(crate) kind: OpenKind,
}

impl OpenFile {
    pub(crate) fn file(&self) -> Result<&Arc<dyn File>, Errno> {
        match &self.kind {
            OpenKind::File(file) => Ok(file),
            OpenKind::Dir(_) => Err(Errno::EISDIR),
        }
    }

    pub(crate) fn dir(&self) -> Result<&Mutex<Vec<DirEntry>>, Errno> {
        match &self.kind {
            OpenKind::Dir(entries) => Ok(entries),
            OpenKind::File(_) => Err(Errno::ENOTDIR),
        }
    }
}

/// A [`File`] serving reads out of a static byte slice. Handy for
/// synthetic filesystems.
#[derive(Debug)]
pub struct DataFile {
    data: Vec<u8>,
}

impl DataFile {
    pub fn new(data: impl Into<Vec<u8>>) -> Arc<DataFile> {
        Arc::new(DataFile { data: data.into() })
    }
}

impl File for DataFile {
    fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let start = (offset as usize).min(self.data.len());
        let end = (start + size as usize).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}
