//! Low-level kernel protocol types.
//!
//! Everything that touches raw wire bytes lives below this module: the ABI
//! records, the request parser, the reply/notification encoders, and the
//! newtypes the rest of the crate uses to keep the kernel's various 64-bit
//! identifiers from being mixed up.

pub(crate) mod abi;
pub(crate) mod argument;
mod errno;
pub(crate) mod reply;
pub(crate) mod request;

use std::fmt;
use std::time::SystemTime;

pub use errno::Errno;

/// A 64-bit identifier the kernel uses to reference an inode. Allocated by
/// this library, opaque to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The reserved id of the root inode.
    pub const ROOT: NodeId = NodeId(abi::FUSE_ROOT_ID);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque open-file handle handed to the kernel in open replies and
/// echoed back on every subsequent file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The kernel's per-request correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation counter paired with a node id. A (node id, generation) pair
/// must be unique over the lifetime of the mount, not just the lifetime of
/// the inode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

/// Lock owner token passed with flush and byte-range operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);

/// A protocol version pair as negotiated in INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major protocol number. Anything other than the compiled-in major is
    /// rejected.
    pub major: u32,
    /// Minor protocol number.
    pub minor: u32,
}

impl Version {
    /// The protocol level this library was built against.
    pub const SUPPORTED: Version = Version {
        major: abi::FUSE_KERNEL_VERSION,
        minor: abi::FUSE_KERNEL_MINOR_VERSION,
    };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A timestamp in a setattr request: either an explicit time or "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    /// A specific point in time.
    SpecificTime(SystemTime),
    /// The current time at the moment the filesystem applies the change.
    Now,
}

#[cfg(test)]
pub(crate) mod test {
    /// Wrapper forcing 8-byte alignment onto test byte arrays, so parsing
    /// them behaves like parsing an aligned read buffer.
    #[repr(align(8))]
    pub(crate) struct AlignedData<T>(pub T);

    impl<T> std::ops::Deref for AlignedData<T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.0
        }
    }
}
