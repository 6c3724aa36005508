//! Errno wrapper for filesystem status codes.
//!
//! Every filesystem callback reports failure as an `Errno`; the dispatcher
//! negates it into the reply header. `NonZeroI32` keeps the success case out
//! of the type entirely.

use std::fmt;
use std::io;
use std::num::NonZeroI32;

/// A raw POSIX error code, guaranteed non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        $(
            #[allow(missing_docs)]
            pub const $name: Errno = Errno(match NonZeroI32::new(libc::$name) {
                Some(x) => x,
                None => panic!("zero errno constant"),
            });
        )*
    };
}

impl Errno {
    errno_consts!(
        EPERM, ENOENT, EINTR, EIO, EAGAIN, ENOMEM, EACCES, EBUSY, EEXIST, EXDEV, ENODEV,
        ENOTDIR, EISDIR, EINVAL, ENOSPC, EROFS, ENOSYS, ENOTEMPTY, ENAMETOOLONG, ERANGE,
        EPROTO, ENODATA, EOVERFLOW, ENOTSUP,
    );

    /// The raw (positive) error number.
    pub fn code(self) -> i32 {
        self.0.get()
    }

    /// Wrap a raw error number, mapping zero and negative values to `EIO`.
    pub fn from_i32(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(x) if x.get() > 0 => Errno(x),
            _ => Errno::EIO,
        }
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        match err.raw_os_error() {
            Some(code) => Errno::from_i32(code),
            None => Errno::EIO,
        }
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno::from_i32(err as i32)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.code()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        assert_eq!(Errno::ENOENT.code(), libc::ENOENT);
        assert_eq!(Errno::from_i32(libc::EBUSY), Errno::EBUSY);
    }

    #[test]
    fn bad_codes_collapse_to_eio() {
        assert_eq!(Errno::from_i32(0), Errno::EIO);
        assert_eq!(Errno::from_i32(-5), Errno::EIO);
    }

    #[test]
    fn from_io_error() {
        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Errno::from(err), Errno::EACCES);
        let err = io::Error::other("no raw code");
        assert_eq!(Errno::from(err), Errno::EIO);
    }
}
