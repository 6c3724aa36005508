//! Low-level filesystem operation request.
//!
//! A request represents information about a filesystem operation the kernel
//! driver wants us to perform. Parsing splits the fixed header off the
//! buffer, decodes the opcode-specific record, and slices off any trailing
//! names or write payload.

use std::convert::TryFrom;
use std::ffi::OsStr;
use std::{error, fmt, mem};

use super::abi::{self, fuse_in_header, fuse_opcode};
use super::argument::ArgumentIterator;
use super::{NodeId, RequestId};

/// Error that may occur while reading and parsing a request from the kernel
/// driver.
#[derive(Debug)]
pub(crate) enum RequestError {
    /// Not enough data for parsing the header (short read).
    ShortReadHeader(usize),
    /// The kernel requested an operation this library has never heard of.
    UnknownOperation(u32),
    /// Not enough data for the opcode's arguments (short read).
    ShortRead(usize, usize),
    /// Insufficient argument data.
    InsufficientData,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => write!(
                f,
                "Short read of FUSE request header ({} < {})",
                len,
                mem::size_of::<fuse_in_header>()
            ),
            RequestError::UnknownOperation(opcode) => write!(f, "Unknown FUSE opcode ({opcode})"),
            RequestError::ShortRead(len, total) => {
                write!(f, "Short read of FUSE request ({len} < {total})")
            }
            RequestError::InsufficientData => write!(f, "Insufficient argument data"),
        }
    }
}

impl error::Error for RequestError {}

/// A fully parsed request: the fixed header plus the typed operation.
pub(crate) struct Request<'a> {
    header: &'a fuse_in_header,
    operation: Operation<'a>,
}

/// The opcode-specific payload of a request.
#[derive(Debug)]
pub(crate) enum Operation<'a> {
    Init {
        arg: &'a abi::fuse_init_in,
    },
    Destroy,
    Lookup {
        name: &'a OsStr,
    },
    Forget {
        nlookup: u64,
    },
    BatchForget {
        nodes: &'a [abi::fuse_forget_one],
    },
    GetAttr {
        arg: &'a abi::fuse_getattr_in,
    },
    SetAttr {
        arg: &'a abi::fuse_setattr_in,
    },
    ReadLink,
    SymLink {
        name: &'a OsStr,
        target: &'a OsStr,
    },
    MkNod {
        arg: &'a abi::fuse_mknod_in,
        name: &'a OsStr,
    },
    MkDir {
        arg: &'a abi::fuse_mkdir_in,
        name: &'a OsStr,
    },
    Unlink {
        name: &'a OsStr,
    },
    RmDir {
        name: &'a OsStr,
    },
    Rename {
        new_dir: u64,
        name: &'a OsStr,
        new_name: &'a OsStr,
        flags: u32,
    },
    Link {
        arg: &'a abi::fuse_link_in,
        name: &'a OsStr,
    },
    Open {
        arg: &'a abi::fuse_open_in,
    },
    Read {
        arg: &'a abi::fuse_read_in,
    },
    Write {
        arg: &'a abi::fuse_write_in,
        data: &'a [u8],
    },
    StatFs,
    Release {
        arg: &'a abi::fuse_release_in,
    },
    FSync {
        arg: &'a abi::fuse_fsync_in,
    },
    SetXAttr {
        arg: &'a abi::fuse_setxattr_in,
        name: &'a OsStr,
        value: &'a [u8],
    },
    GetXAttr {
        arg: &'a abi::fuse_getxattr_in,
        name: &'a OsStr,
    },
    ListXAttr {
        arg: &'a abi::fuse_getxattr_in,
    },
    RemoveXAttr {
        name: &'a OsStr,
    },
    Flush {
        arg: &'a abi::fuse_flush_in,
    },
    OpenDir {
        arg: &'a abi::fuse_open_in,
    },
    ReadDir {
        arg: &'a abi::fuse_read_in,
    },
    ReleaseDir {
        arg: &'a abi::fuse_release_in,
    },
    FSyncDir {
        arg: &'a abi::fuse_fsync_in,
    },
    Access {
        arg: &'a abi::fuse_access_in,
    },
    Create {
        arg: &'a abi::fuse_create_in,
        name: &'a OsStr,
    },
    Interrupt {
        arg: &'a abi::fuse_interrupt_in,
    },
    FAllocate {
        arg: &'a abi::fuse_fallocate_in,
    },
    ReadDirPlus {
        arg: &'a abi::fuse_read_in,
    },
    Lseek {
        arg: &'a abi::fuse_lseek_in,
    },
    CopyFileRange {
        arg: &'a abi::fuse_copy_file_range_in,
    },
    /// A recognized opcode this library deliberately does not implement
    /// (locking, bmap, ioctl, poll). Answered with `ENOSYS`.
    Unsupported {
        opcode: fuse_opcode,
    },
}

impl<'a> Operation<'a> {
    fn parse(opcode: fuse_opcode, data: &mut ArgumentIterator<'a>) -> Option<Operation<'a>> {
        Some(match opcode {
            fuse_opcode::FUSE_LOOKUP => Operation::Lookup {
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_FORGET => Operation::Forget {
                nlookup: data.fetch::<abi::fuse_forget_in>()?.nlookup,
            },
            fuse_opcode::FUSE_GETATTR => Operation::GetAttr { arg: data.fetch()? },
            fuse_opcode::FUSE_SETATTR => Operation::SetAttr { arg: data.fetch()? },
            fuse_opcode::FUSE_READLINK => Operation::ReadLink,
            fuse_opcode::FUSE_SYMLINK => Operation::SymLink {
                name: data.fetch_str()?,
                target: data.fetch_str()?,
            },
            fuse_opcode::FUSE_MKNOD => Operation::MkNod {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_MKDIR => Operation::MkDir {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_UNLINK => Operation::Unlink {
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_RMDIR => Operation::RmDir {
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_RENAME => {
                let arg = data.fetch::<abi::fuse_rename_in>()?;
                Operation::Rename {
                    new_dir: arg.newdir,
                    name: data.fetch_str()?,
                    new_name: data.fetch_str()?,
                    flags: 0,
                }
            }
            fuse_opcode::FUSE_RENAME2 => {
                let arg = data.fetch::<abi::fuse_rename2_in>()?;
                Operation::Rename {
                    new_dir: arg.newdir,
                    name: data.fetch_str()?,
                    new_name: data.fetch_str()?,
                    flags: arg.flags,
                }
            }
            fuse_opcode::FUSE_LINK => Operation::Link {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_OPEN => Operation::Open { arg: data.fetch()? },
            fuse_opcode::FUSE_READ => Operation::Read { arg: data.fetch()? },
            fuse_opcode::FUSE_WRITE => {
                let arg = data.fetch::<abi::fuse_write_in>()?;
                let data = data.fetch_all();
                if data.len() < arg.size as usize {
                    return None;
                }
                Operation::Write {
                    arg,
                    data: &data[..arg.size as usize],
                }
            }
            fuse_opcode::FUSE_STATFS => Operation::StatFs,
            fuse_opcode::FUSE_RELEASE => Operation::Release { arg: data.fetch()? },
            fuse_opcode::FUSE_FSYNC => Operation::FSync { arg: data.fetch()? },
            fuse_opcode::FUSE_SETXATTR => {
                let arg = data.fetch::<abi::fuse_setxattr_in>()?;
                let name = data.fetch_str()?;
                let value = data.fetch_all();
                if value.len() < arg.size as usize {
                    return None;
                }
                Operation::SetXAttr {
                    arg,
                    name,
                    value: &value[..arg.size as usize],
                }
            }
            fuse_opcode::FUSE_GETXATTR => Operation::GetXAttr {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_LISTXATTR => Operation::ListXAttr { arg: data.fetch()? },
            fuse_opcode::FUSE_REMOVEXATTR => Operation::RemoveXAttr {
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_FLUSH => Operation::Flush { arg: data.fetch()? },
            fuse_opcode::FUSE_INIT => Operation::Init { arg: data.fetch()? },
            fuse_opcode::FUSE_OPENDIR => Operation::OpenDir { arg: data.fetch()? },
            fuse_opcode::FUSE_READDIR => Operation::ReadDir { arg: data.fetch()? },
            fuse_opcode::FUSE_RELEASEDIR => Operation::ReleaseDir { arg: data.fetch()? },
            fuse_opcode::FUSE_FSYNCDIR => Operation::FSyncDir { arg: data.fetch()? },
            fuse_opcode::FUSE_ACCESS => Operation::Access { arg: data.fetch()? },
            fuse_opcode::FUSE_CREATE => Operation::Create {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            fuse_opcode::FUSE_INTERRUPT => Operation::Interrupt { arg: data.fetch()? },
            fuse_opcode::FUSE_DESTROY => Operation::Destroy,
            fuse_opcode::FUSE_BATCH_FORGET => {
                let arg = data.fetch::<abi::fuse_batch_forget_in>()?;
                Operation::BatchForget {
                    nodes: data.fetch_slice(arg.count as usize)?,
                }
            }
            fuse_opcode::FUSE_FALLOCATE => Operation::FAllocate { arg: data.fetch()? },
            fuse_opcode::FUSE_READDIRPLUS => Operation::ReadDirPlus { arg: data.fetch()? },
            fuse_opcode::FUSE_LSEEK => Operation::Lseek { arg: data.fetch()? },
            fuse_opcode::FUSE_COPY_FILE_RANGE => Operation::CopyFileRange { arg: data.fetch()? },
            fuse_opcode::FUSE_GETLK
            | fuse_opcode::FUSE_SETLK
            | fuse_opcode::FUSE_SETLKW
            | fuse_opcode::FUSE_BMAP
            | fuse_opcode::FUSE_IOCTL
            | fuse_opcode::FUSE_POLL
            | fuse_opcode::FUSE_NOTIFY_REPLY => Operation::Unsupported { opcode },
        })
    }
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Init { arg } => write!(
                f,
                "INIT kernel ABI {}.{}, flags {:#x}, max readahead {}",
                arg.major, arg.minor, arg.flags, arg.max_readahead
            ),
            Operation::Destroy => write!(f, "DESTROY"),
            Operation::Lookup { name } => write!(f, "LOOKUP name {name:?}"),
            Operation::Forget { nlookup } => write!(f, "FORGET nlookup {nlookup}"),
            Operation::BatchForget { nodes } => write!(f, "BATCH_FORGET {} nodes", nodes.len()),
            Operation::GetAttr { arg } => write!(f, "GETATTR fh {:#x}", arg.fh),
            Operation::SetAttr { arg } => write!(f, "SETATTR valid {:#x}", arg.valid),
            Operation::ReadLink => write!(f, "READLINK"),
            Operation::SymLink { name, target } => {
                write!(f, "SYMLINK name {name:?}, target {target:?}")
            }
            Operation::MkNod { arg, name } => {
                write!(f, "MKNOD name {name:?}, mode {:#o}, rdev {}", arg.mode, arg.rdev)
            }
            Operation::MkDir { arg, name } => {
                write!(f, "MKDIR name {name:?}, mode {:#o}", arg.mode)
            }
            Operation::Unlink { name } => write!(f, "UNLINK name {name:?}"),
            Operation::RmDir { name } => write!(f, "RMDIR name {name:?}"),
            Operation::Rename {
                new_dir,
                name,
                new_name,
                ..
            } => write!(f, "RENAME name {name:?}, newdir {new_dir:#x}, newname {new_name:?}"),
            Operation::Link { arg, name } => {
                write!(f, "LINK oldnodeid {:#x}, name {name:?}", arg.oldnodeid)
            }
            Operation::Open { arg } => write!(f, "OPEN flags {:#x}", arg.flags),
            Operation::Read { arg } => {
                write!(f, "READ fh {:#x}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
            Operation::Write { arg, .. } => {
                write!(f, "WRITE fh {:#x}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
            Operation::StatFs => write!(f, "STATFS"),
            Operation::Release { arg } => write!(f, "RELEASE fh {:#x}", arg.fh),
            Operation::FSync { arg } => write!(f, "FSYNC fh {:#x}", arg.fh),
            Operation::SetXAttr { arg, name, .. } => {
                write!(f, "SETXATTR name {name:?}, size {}", arg.size)
            }
            Operation::GetXAttr { arg, name } => {
                write!(f, "GETXATTR name {name:?}, size {}", arg.size)
            }
            Operation::ListXAttr { arg } => write!(f, "LISTXATTR size {}", arg.size),
            Operation::RemoveXAttr { name } => write!(f, "REMOVEXATTR name {name:?}"),
            Operation::Flush { arg } => write!(f, "FLUSH fh {:#x}", arg.fh),
            Operation::OpenDir { arg } => write!(f, "OPENDIR flags {:#x}", arg.flags),
            Operation::ReadDir { arg } => {
                write!(f, "READDIR fh {:#x}, offset {}, size {}", arg.fh, arg.offset, arg.size)
            }
            Operation::ReleaseDir { arg } => write!(f, "RELEASEDIR fh {:#x}", arg.fh),
            Operation::FSyncDir { arg } => write!(f, "FSYNCDIR fh {:#x}", arg.fh),
            Operation::Access { arg } => write!(f, "ACCESS mask {:#o}", arg.mask),
            Operation::Create { arg, name } => {
                write!(f, "CREATE name {name:?}, mode {:#o}, flags {:#x}", arg.mode, arg.flags)
            }
            Operation::Interrupt { arg } => write!(f, "INTERRUPT unique {}", arg.unique),
            Operation::FAllocate { arg } => write!(
                f,
                "FALLOCATE fh {:#x}, offset {}, length {}",
                arg.fh, arg.offset, arg.length
            ),
            Operation::ReadDirPlus { arg } => write!(
                f,
                "READDIRPLUS fh {:#x}, offset {}, size {}",
                arg.fh, arg.offset, arg.size
            ),
            Operation::Lseek { arg } => {
                write!(f, "LSEEK fh {:#x}, offset {}, whence {}", arg.fh, arg.offset, arg.whence)
            }
            Operation::CopyFileRange { arg } => write!(
                f,
                "COPY_FILE_RANGE fh {:#x}, offset {} -> nodeid {:#x}, fh {:#x}, offset {}, len {}",
                arg.fh_in, arg.off_in, arg.nodeid_out, arg.fh_out, arg.off_out, arg.len
            ),
            Operation::Unsupported { opcode } => write!(f, "{opcode:?} (unsupported)"),
        }
    }
}

impl<'a> TryFrom<&'a [u8]> for Request<'a> {
    type Error = RequestError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let data_len = data.len();
        let mut arguments = ArgumentIterator::new(data);
        // Parse the fixed header
        let header: &fuse_in_header = arguments
            .fetch()
            .ok_or_else(|| RequestError::ShortReadHeader(arguments.len()))?;
        // Check data size
        if data_len < header.len as usize {
            return Err(RequestError::ShortRead(data_len, header.len as usize));
        }
        // Parse the opcode and its arguments
        let opcode = fuse_opcode::try_from(header.opcode)
            .map_err(|_| RequestError::UnknownOperation(header.opcode))?;
        let operation =
            Operation::parse(opcode, &mut arguments).ok_or(RequestError::InsufficientData)?;
        Ok(Self { header, operation })
    }
}

impl<'a> Request<'a> {
    /// The unique request id stamped by the kernel.
    pub(crate) fn unique(&self) -> RequestId {
        RequestId(self.header.unique)
    }

    /// The node id the operation applies to.
    pub(crate) fn node_id(&self) -> NodeId {
        NodeId(self.header.nodeid)
    }

    /// Credentials of the calling process.
    pub(crate) fn uid(&self) -> u32 {
        self.header.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.header.gid
    }

    pub(crate) fn pid(&self) -> u32 {
        self.header.pid
    }

    pub(crate) fn operation(&self) -> &Operation<'a> {
        &self.operation
    }
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUSE({:3}) ino {:#020x}: {}",
            self.header.unique, self.header.nodeid, self.operation
        )
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::super::test::AlignedData;
    use super::*;

    const LOOKUP_REQUEST: AlignedData<[u8; 56]> = AlignedData([
        0x38, 0x00, 0x00, 0x00, // len = 56
        0x01, 0x00, 0x00, 0x00, // opcode = 1 (LOOKUP)
        0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // unique = 2
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // nodeid = 1
        0xf8, 0x03, 0x00, 0x00, // uid = 1016
        0xe8, 0x03, 0x00, 0x00, // gid = 1000
        0x88, 0x2c, 0x00, 0x00, // pid = 11400
        0x00, 0x00, 0x00, 0x00, // padding
        0x73, 0x72, 0x63, 0x00, 0x00, 0x00, 0x00, 0x00, // name = "src"
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]);

    const INTERRUPT_REQUEST: AlignedData<[u8; 48]> = AlignedData([
        0x30, 0x00, 0x00, 0x00, // len = 48
        0x24, 0x00, 0x00, 0x00, // opcode = 36 (INTERRUPT)
        0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // unique = 7
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // nodeid = 0
        0x00, 0x00, 0x00, 0x00, // uid
        0x00, 0x00, 0x00, 0x00, // gid
        0x00, 0x00, 0x00, 0x00, // pid
        0x00, 0x00, 0x00, 0x00, // padding
        0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // target unique = 5
    ]);

    #[test]
    fn short_read_header() {
        match Request::try_from(&LOOKUP_REQUEST[..20]) {
            Err(RequestError::ShortReadHeader(20)) => (),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn short_read() {
        match Request::try_from(&LOOKUP_REQUEST[..48]) {
            Err(RequestError::ShortRead(48, 56)) => (),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn lookup() {
        let req = Request::try_from(&LOOKUP_REQUEST[..]).unwrap();
        assert_eq!(req.unique(), RequestId(2));
        assert_eq!(req.node_id(), NodeId::ROOT);
        assert_eq!(req.uid(), 1016);
        assert_eq!(req.gid(), 1000);
        assert_eq!(req.pid(), 11400);
        match req.operation() {
            Operation::Lookup { name } => assert_eq!(*name, "src"),
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn interrupt() {
        let req = Request::try_from(&INTERRUPT_REQUEST[..]).unwrap();
        assert_eq!(req.unique(), RequestId(7));
        match req.operation() {
            Operation::Interrupt { arg } => assert_eq!(arg.unique, 5),
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode() {
        let mut bad = LOOKUP_REQUEST.0;
        bad[4] = 0xff;
        match Request::try_from(&bad[..]) {
            Err(RequestError::UnknownOperation(0xff)) => (),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
