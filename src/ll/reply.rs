//! Reply and notification framing.
//!
//! A reply is a `fuse_out_header` followed by the opcode-specific output
//! record and an optional flat data tail. Everything is gathered into a
//! single writev so a reply hits the device fd in one atomic frame.

use std::ffi::OsStr;
use std::io::IoSlice;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use smallvec::{SmallVec, smallvec};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

use super::abi;
use super::{Errno, RequestId};
use crate::{FileAttr, FileType};

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;

pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// An outgoing reply, not yet prefixed with its header.
#[derive(Debug)]
pub(crate) enum Response<'a> {
    Error(Option<Errno>),
    Data(ResponseBuf),
    Slice(&'a [u8]),
}

impl<'a> Response<'a> {
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        unique: RequestId,
        f: F,
    ) -> T {
        let datalen = match &self {
            Response::Error(_) => 0,
            Response::Data(v) => v.len(),
            Response::Slice(d) => d.len(),
        };
        let header = abi::fuse_out_header {
            unique: unique.0,
            error: if let Response::Error(Some(errno)) = self {
                -errno.0.get()
            } else {
                0
            },
            len: (size_of::<abi::fuse_out_header>() + datalen)
                .try_into()
                .expect("Too much data"),
        };
        let mut v: SmallVec<[IoSlice<'_>; 2]> = smallvec![IoSlice::new(header.as_bytes())];
        match &self {
            Response::Error(_) => {}
            Response::Data(d) => v.push(IoSlice::new(d)),
            Response::Slice(d) => v.push(IoSlice::new(d)),
        }
        f(&v)
    }

    pub(crate) fn new_empty() -> Self {
        Self::Error(None)
    }

    pub(crate) fn new_error(error: Errno) -> Self {
        Self::Error(Some(error))
    }

    pub(crate) fn new_data<T: AsRef<[u8]> + Into<Vec<u8>>>(data: T) -> Self {
        Self::Data(if data.as_ref().len() <= INLINE_DATA_THRESHOLD {
            ResponseBuf::from_slice(data.as_ref())
        } else {
            ResponseBuf::from_vec(data.into())
        })
    }

    pub(crate) fn new_slice(data: &'a [u8]) -> Self {
        Self::Slice(data)
    }

    pub(crate) fn new_struct<T: IntoBytes + Immutable + KnownLayout + ?Sized>(data: &T) -> Self {
        Self::Data(ResponseBuf::from_slice(data.as_bytes()))
    }

    /// Two consecutive records (entry + open in a CREATE reply).
    pub(crate) fn new_structs<T, U>(first: &T, second: &U) -> Self
    where
        T: IntoBytes + Immutable + KnownLayout,
        U: IntoBytes + Immutable + KnownLayout,
    {
        let mut buf = ResponseBuf::from_slice(first.as_bytes());
        buf.extend_from_slice(second.as_bytes());
        Self::Data(buf)
    }
}

/// Split a `SystemTime` into the (seconds, nanoseconds) pair the wire format
/// wants. Times before the epoch map to negative seconds.
pub(crate) fn time_parts(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(before) => {
            let d = before.duration();
            let nsec = d.subsec_nanos();
            if nsec == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - nsec)
            }
        }
    }
}

pub(crate) fn timeout_parts(timeout: Duration) -> (u64, u32) {
    (timeout.as_secs(), timeout.subsec_nanos())
}

pub(crate) fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (match kind {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::Directory => libc::S_IFDIR,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
    }) as u32
        | perm as u32
}

/// Encode an entry reply, including the timeout split.
pub(crate) fn encode_entry_out(entry: &crate::raw::EntryOut) -> abi::fuse_entry_out {
    let (entry_valid, entry_valid_nsec) = timeout_parts(entry.entry_timeout);
    let (attr_valid, attr_valid_nsec) = timeout_parts(entry.attr_timeout);
    abi::fuse_entry_out {
        nodeid: entry.node_id.0,
        generation: entry.generation.0,
        entry_valid,
        attr_valid,
        entry_valid_nsec,
        attr_valid_nsec,
        attr: fuse_attr_from(&entry.attr),
    }
}

pub(crate) fn fuse_attr_from(attr: &FileAttr) -> abi::fuse_attr {
    let (atime_secs, atime_nanos) = time_parts(attr.atime);
    let (mtime_secs, mtime_nanos) = time_parts(attr.mtime);
    let (ctime_secs, ctime_nanos) = time_parts(attr.ctime);
    abi::fuse_attr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: atime_secs,
        mtime: mtime_secs,
        ctime: ctime_secs,
        atimensec: atime_nanos,
        mtimensec: mtime_nanos,
        ctimensec: ctime_nanos,
        mode: mode_from_kind_and_perm(attr.kind, attr.perm),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        padding: 0,
    }
}

/// Paged encoder for READDIR replies, in the kernel's dirent layout.
///
/// `add` refuses entries that would overflow the kernel's requested size;
/// the caller stops there and the kernel re-issues the read at the returned
/// continuation offset.
#[derive(Debug)]
pub struct DirEntryList {
    buf: Vec<u8>,
    max_size: usize,
    offset: u64,
}

impl DirEntryList {
    pub(crate) fn new(max_size: usize, offset: u64) -> Self {
        DirEntryList {
            buf: Vec::with_capacity(max_size.min(4096)),
            max_size,
            offset,
        }
    }

    /// Append one entry. Returns `false` without consuming the entry when
    /// the reply is full.
    pub fn add(&mut self, ino: u64, kind: FileType, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let entlen = size_of::<abi::fuse_dirent>() + name.len();
        let entsize = (entlen + 7) & !7; // 64bit align
        if self.buf.len() + entsize > self.max_size {
            return false;
        }
        self.offset += 1;
        let header = abi::fuse_dirent {
            ino,
            off: self.offset as i64,
            namelen: name.len() as u32,
            typ: mode_from_kind_and_perm(kind, 0) >> 12,
        };
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(name);
        let padlen = entsize - entlen;
        self.buf.extend_from_slice(&[0u8; 8][..padlen]);
        true
    }

    /// The logical offset the next entry would get; the kernel passes it
    /// back to resume the listing.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Paged encoder for READDIRPLUS replies: each entry embeds a full
/// `fuse_entry_out` so the kernel primes its caches while listing.
#[derive(Debug)]
pub struct DirEntryPlusList {
    buf: Vec<u8>,
    max_size: usize,
    offset: u64,
}

impl DirEntryPlusList {
    pub(crate) fn new(max_size: usize, offset: u64) -> Self {
        DirEntryPlusList {
            buf: Vec::with_capacity(max_size.min(4096)),
            max_size,
            offset,
        }
    }

    /// Append one entry. Returns `false` without consuming the entry when
    /// the reply is full. Entries accepted here carry a kernel reference on
    /// their node id, exactly like a LOOKUP reply.
    pub fn add(&mut self, entry: &crate::raw::EntryOut, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let entlen = size_of::<abi::fuse_direntplus>() + name.len();
        let entsize = (entlen + 7) & !7;
        if self.buf.len() + entsize > self.max_size {
            return false;
        }
        self.offset += 1;
        let entry_out = encode_entry_out(entry);
        let record = abi::fuse_direntplus {
            dirent: abi::fuse_dirent {
                ino: entry_out.attr.ino,
                off: self.offset as i64,
                namelen: name.len() as u32,
                typ: entry_out.attr.mode >> 12,
            },
            entry_out,
        };
        self.buf.extend_from_slice(record.as_bytes());
        self.buf.extend_from_slice(name);
        let padlen = entsize - entlen;
        self.buf.extend_from_slice(&[0u8; 8][..padlen]);
        true
    }

    /// The logical offset the next entry would get.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A library-initiated message to the kernel. Framed like a reply but with
/// the notify code in the error field and no request id.
#[derive(Debug)]
pub(crate) enum Notification<'a> {
    InvalInode(abi::fuse_notify_inval_inode_out),
    InvalEntry(abi::fuse_notify_inval_entry_out, &'a OsStr),
    Delete(abi::fuse_notify_delete_out, &'a OsStr),
}

impl Notification<'_> {
    pub(crate) fn inval_inode(ino: u64, offset: i64, len: i64) -> Self {
        Notification::InvalInode(abi::fuse_notify_inval_inode_out { ino, off: offset, len })
    }

    pub(crate) fn inval_entry(parent: u64, name: &OsStr) -> Notification<'_> {
        Notification::InvalEntry(
            abi::fuse_notify_inval_entry_out {
                parent,
                namelen: name.as_bytes().len() as u32,
                padding: 0,
            },
            name,
        )
    }

    pub(crate) fn delete(parent: u64, child: u64, name: &OsStr) -> Notification<'_> {
        Notification::Delete(
            abi::fuse_notify_delete_out {
                parent,
                child,
                namelen: name.as_bytes().len() as u32,
                padding: 0,
            },
            name,
        )
    }

    pub(crate) fn code(&self) -> abi::fuse_notify_code {
        match self {
            Notification::InvalInode(_) => abi::fuse_notify_code::FUSE_NOTIFY_INVAL_INODE,
            Notification::InvalEntry(..) => abi::fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY,
            Notification::Delete(..) => abi::fuse_notify_code::FUSE_NOTIFY_DELETE,
        }
    }

    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(&self, f: F) -> T {
        // The name tail carries its terminating NUL on the wire.
        const NUL: [u8; 1] = [0];
        let (body, name): (&[u8], Option<&[u8]>) = match self {
            Notification::InvalInode(out) => (out.as_bytes(), None),
            Notification::InvalEntry(out, name) => (out.as_bytes(), Some(name.as_bytes())),
            Notification::Delete(out, name) => (out.as_bytes(), Some(name.as_bytes())),
        };
        let datalen = body.len() + name.map_or(0, |n| n.len() + 1);
        let header = abi::fuse_out_header {
            len: (size_of::<abi::fuse_out_header>() + datalen)
                .try_into()
                .expect("Too much data"),
            error: self.code() as i32,
            unique: 0,
        };
        let mut v: SmallVec<[IoSlice<'_>; 4]> =
            smallvec![IoSlice::new(header.as_bytes()), IoSlice::new(body)];
        if let Some(name) = name {
            v.push(IoSlice::new(name));
            v.push(IoSlice::new(&NUL));
        }
        f(&v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flatten(iov: &[IoSlice<'_>]) -> Vec<u8> {
        iov.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn reply_empty() {
        let r = Response::new_empty();
        let bytes = r.with_iovec(RequestId(0xdeadbeef), flatten);
        assert_eq!(
            bytes,
            [
                0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn reply_error() {
        let r = Response::new_error(Errno::ENOENT);
        let bytes = r.with_iovec(RequestId(0xdeadbeef), flatten);
        let mut expected = vec![0x10, 0x00, 0x00, 0x00];
        expected.extend_from_slice(&(-libc::ENOENT).to_le_bytes());
        expected.extend_from_slice(&[0xef, 0xbe, 0xad, 0xde, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn reply_data() {
        let r = Response::new_data([0xde, 0xad, 0xbe, 0xef].as_ref());
        let bytes = r.with_iovec(RequestId(0xdeadbeef), flatten);
        assert_eq!(
            bytes,
            [
                0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef
            ]
        );
    }

    #[test]
    fn dirent_paging() {
        let mut list = DirEntryList::new(90, 0);
        assert!(list.add(1, FileType::Directory, OsStr::new(".")));
        assert!(list.add(2, FileType::RegularFile, OsStr::new("hello")));
        // a third entry would exceed 90 bytes
        assert!(!list.add(3, FileType::RegularFile, OsStr::new("world")));
        assert_eq!(list.offset(), 2);

        let bytes = list.into_bytes();
        // 32-byte aligned record for "." plus 32 bytes for "hello"
        assert_eq!(bytes.len(), 64);
        // second record starts at 32: ino 2, off 2
        assert_eq!(bytes[32..40], 2u64.to_le_bytes());
        assert_eq!(bytes[40..48], 2i64.to_le_bytes());
        // namelen 5, type = S_IFREG >> 12
        assert_eq!(bytes[48..52], 5u32.to_le_bytes());
        assert_eq!(bytes[52..56], ((libc::S_IFREG >> 12) as u32).to_le_bytes());
        assert_eq!(&bytes[56..61], b"hello");
    }

    #[test]
    fn dirent_resume_offset() {
        let mut list = DirEntryList::new(4096, 7);
        assert!(list.add(10, FileType::RegularFile, OsStr::new("x")));
        assert_eq!(list.offset(), 8);
    }

    #[test]
    fn notify_delete_frame() {
        let n = Notification::delete(1, 5, OsStr::new("gone"));
        let bytes = n.with_iovec(flatten);
        // header(16) + payload(24) + name(4) + NUL
        assert_eq!(bytes.len(), 45);
        assert_eq!(bytes[0..4], 45u32.to_le_bytes());
        assert_eq!(bytes[4..8], 6i32.to_le_bytes()); // FUSE_NOTIFY_DELETE
        assert_eq!(bytes[8..16], 0u64.to_le_bytes()); // no request id
        assert_eq!(&bytes[40..44], b"gone");
        assert_eq!(bytes[44], 0);
    }

    #[test]
    fn time_parts_pre_epoch() {
        let t = UNIX_EPOCH - Duration::new(1, 500_000_000);
        assert_eq!(time_parts(t), (-2, 500_000_000));
        assert_eq!(time_parts(UNIX_EPOCH), (0, 0));
    }
}
