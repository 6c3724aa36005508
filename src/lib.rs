//! FUSE userspace filesystem library.
//!
//! This crate speaks the Linux FUSE kernel protocol directly: it mounts
//! the kernel's character device, parses the binary requests the kernel
//! forwards for syscalls under the mountpoint, dispatches them to
//! filesystem callbacks, and writes binary replies back. The only outside
//! help used is the setuid `fusermount` helper (or a plain mount(2) call
//! when running as root) to obtain the device fd.
//!
//! Two layers are offered. The low-level [`raw::RawFileSystem`] trait is
//! keyed on the 64-bit node ids exchanged with the kernel and maps one
//! method to one opcode. The [`tree`] layer maintains an inode tree with
//! parent/child relationships, submount composition, and the
//! lookup/forget accounting contract, so most filesystems only implement
//! [`tree::Node`] (or the path-string variant, [`tree::PathFileSystem`]).

#![warn(missing_docs, rust_2018_idioms)]

use std::os::unix::fs::FileTypeExt;
use std::time::SystemTime;

mod bufpool;
mod channel;
mod handle;
mod ll;
mod mnt;
mod notify;
pub mod raw;
mod server;
pub mod tree;

pub use crate::bufpool::BucketStats;
pub use crate::ll::abi::{FopenFlags, InitFlags};
pub use crate::ll::reply::{DirEntryList, DirEntryPlusList};
pub use crate::ll::{
    Errno, FileHandle, Generation, LockOwner, NodeId, RequestId, TimeOrNow, Version,
};
pub use crate::mnt::{MountOptions, reserve_helper_fds};
pub use crate::notify::Notifier;
pub use crate::raw::Context;
pub use crate::server::{BackgroundServer, Server};

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Convert std `FileType` to this crate's `FileType`.
    pub fn from_std(file_type: std::fs::FileType) -> Option<Self> {
        if file_type.is_file() {
            Some(FileType::RegularFile)
        } else if file_type.is_dir() {
            Some(FileType::Directory)
        } else if file_type.is_symlink() {
            Some(FileType::Symlink)
        } else if file_type.is_fifo() {
            Some(FileType::NamedPipe)
        } else if file_type.is_socket() {
            Some(FileType::Socket)
        } else if file_type.is_char_device() {
            Some(FileType::CharDevice)
        } else if file_type.is_block_device() {
            Some(FileType::BlockDevice)
        } else {
            None
        }
    }
}

/// File attributes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    /// Inode number as reported to stat(2). Zero lets the tree layer
    /// substitute the kernel node id.
    pub ino: u64,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
    /// Block size to be reported by `stat()`. If unsure, set to 4096.
    pub blksize: u32,
}

impl FileAttr {
    /// A fresh attribute record of the given kind and permissions, with
    /// all times set to now.
    pub fn new(kind: FileType, perm: u16) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

/// Uid/gid pair reported for every inode when the owner override mount
/// option is set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Owner {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Owner {
    /// The calling process's effective uid and gid.
    pub fn current() -> Owner {
        Owner {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}
