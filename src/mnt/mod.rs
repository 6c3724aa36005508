//! Acquiring and releasing the kernel device fd.
//!
//! Two mount strategies exist: the setuid fusermount helper (works without
//! privileges) and a direct mount(2) call (root only). A third pseudo-form,
//! `/dev/fd/N`, performs no mount at all and adopts an fd that some outer
//! process already obtained.

mod direct;
mod fusermount;
pub(crate) mod options;

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{error, warn};

pub use options::MountOptions;

/// Unmount retry schedule: the kernel may still hold fds on the mount
/// briefly after the last release.
const UNMOUNT_BACKOFF_START: Duration = Duration::from_millis(5);
const UNMOUNT_ATTEMPTS: u32 = 6;

static RESERVED_FDS: OnceLock<Vec<OwnedFd>> = OnceLock::new();

/// Occupy the low file descriptors (3, 4, 5) with pipes that are never
/// closed, so a fusermount helper spawned later finds its communication fd
/// on a predictable descriptor even when the host process has opened many
/// files. Idempotent; called by [`Mount::new`], but hosts that juggle fds
/// at startup may call it earlier themselves.
pub fn reserve_helper_fds() {
    RESERVED_FDS.get_or_init(|| {
        use std::os::fd::AsRawFd;
        let mut kept: Vec<OwnedFd> = Vec::new();
        for _ in 0..3 {
            match nix::unistd::pipe() {
                Ok((r, w)) => {
                    let past_low_range = r.as_raw_fd() > 5 && w.as_raw_fd() > 5;
                    kept.push(r);
                    kept.push(w);
                    if past_low_range {
                        break;
                    }
                }
                Err(err) => {
                    warn!("reserving low fds failed: {err}");
                    break;
                }
            }
        }
        kept
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Helper,
    Direct,
    /// `/dev/fd/N`: the fd was handed to us, nothing to unmount.
    Adopted,
}

/// A mounted kernel device fd plus enough state to unmount it again.
#[derive(Debug)]
pub(crate) struct Mount {
    mountpoint: PathBuf,
    strategy: Strategy,
    active: bool,
}

impl Mount {
    /// Mount at `mountpoint` and return the device fd.
    pub(crate) fn new(mountpoint: &Path, options: &MountOptions) -> io::Result<(Arc<File>, Mount)> {
        reserve_helper_fds();

        if let Some(fd) = parse_dev_fd(mountpoint) {
            // Already mounted by an outer process; adopt the descriptor.
            let file = unsafe { File::from_raw_fd(fd) };
            return Ok((
                Arc::new(file),
                Mount {
                    mountpoint: mountpoint.to_path_buf(),
                    strategy: Strategy::Adopted,
                    active: true,
                },
            ));
        }

        let mountpoint = mountpoint.canonicalize()?;
        let want_direct = options.direct_mount || options.direct_mount_strict;
        if want_direct {
            match direct::mount(&mountpoint, options) {
                Ok(device) => {
                    return Ok((
                        Arc::new(device),
                        Mount {
                            mountpoint,
                            strategy: Strategy::Direct,
                            active: true,
                        },
                    ));
                }
                Err(err) if err.kind() == ErrorKind::PermissionDenied
                    && !options.direct_mount_strict =>
                {
                    warn!("direct mount denied, falling back to fusermount: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        let device = fusermount::mount(&mountpoint, options)?;
        Ok((
            Arc::new(device),
            Mount {
                mountpoint,
                strategy: Strategy::Helper,
                active: true,
            },
        ))
    }

    /// Unmount, retrying `EBUSY` with exponential backoff.
    pub(crate) fn unmount(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        if self.strategy == Strategy::Adopted {
            self.active = false;
            return Ok(());
        }
        let mut delay = UNMOUNT_BACKOFF_START;
        let mut attempt = 0;
        loop {
            let result = match self.strategy {
                Strategy::Helper => fusermount::unmount(&self.mountpoint),
                Strategy::Direct => direct::unmount(&self.mountpoint),
                Strategy::Adopted => unreachable!(),
            };
            match result {
                Ok(()) => {
                    self.active = false;
                    return Ok(());
                }
                Err(err)
                    if err.raw_os_error() == Some(libc::EBUSY)
                        && attempt < UNMOUNT_ATTEMPTS =>
                {
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.unmount() {
                error!("unmount of {} failed: {err}", self.mountpoint.display());
            }
        }
    }
}

/// Recognize the `/dev/fd/N` pseudo-mountpoint and extract N.
fn parse_dev_fd(mountpoint: &Path) -> Option<i32> {
    let rest = mountpoint.to_str()?.strip_prefix("/dev/fd/")?;
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_fd_syntax() {
        assert_eq!(parse_dev_fd(Path::new("/dev/fd/7")), Some(7));
        assert_eq!(parse_dev_fd(Path::new("/dev/fd/42")), Some(42));
        assert_eq!(parse_dev_fd(Path::new("/dev/fdx/7")), None);
        assert_eq!(parse_dev_fd(Path::new("/tmp/mnt")), None);
        assert_eq!(parse_dev_fd(Path::new("/dev/fd/x")), None);
    }

    #[test]
    fn reserve_is_idempotent() {
        reserve_helper_fds();
        let first = RESERVED_FDS.get().map(Vec::len);
        reserve_helper_fds();
        assert_eq!(RESERVED_FDS.get().map(Vec::len), first);
    }
}
