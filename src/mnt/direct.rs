//! Mounting by calling mount(2) directly.
//!
//! Root (or a suitably capable process) can skip the setuid helper: open
//! `/dev/fuse`, then mount with the device fd embedded in the mount-data
//! string.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::error;
use nix::mount::MsFlags;

use super::options::MountOptions;

const FUSE_DEVICE: &str = "/dev/fuse";

/// Mount `mountpoint` via mount(2); returns the kernel device fd.
///
/// `EPERM` from the kernel is returned as `PermissionDenied` so the caller
/// can fall back to the fusermount helper.
pub(crate) fn mount(mountpoint: &Path, options: &MountOptions) -> io::Result<File> {
    let device = match OpenOptions::new().read(true).write(true).open(FUSE_DEVICE) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                error!("{FUSE_DEVICE} not found. Try 'modprobe fuse'");
            }
            return Err(err);
        }
    };
    assert!(
        device.as_raw_fd() > 2,
        "fuse device fd {} conflicts with stdio",
        device.as_raw_fd()
    );

    let rootmode = std::fs::metadata(mountpoint)?.mode() & libc::S_IFMT;
    let data = options.kernel_mount_data(
        device.as_raw_fd(),
        rootmode,
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    );

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if options.read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    let source = if options.fs_name.is_empty() {
        FUSE_DEVICE
    } else {
        options.fs_name.as_str()
    };
    let fstype = if options.name.is_empty() {
        "fuse".to_string()
    } else {
        format!("fuse.{}", options.name)
    };

    nix::mount::mount(
        Some(source),
        mountpoint,
        Some(fstype.as_str()),
        flags,
        Some(data.as_str()),
    )
    .map_err(|errno| {
        let err = io::Error::from(errno);
        if err.kind() == ErrorKind::PermissionDenied {
            err
        } else {
            io::Error::new(
                err.kind(),
                format!("mount({}) with data {data:?} failed: {err}", mountpoint.display()),
            )
        }
    })?;

    Ok(device)
}

/// Unmount via umount2(2). `EBUSY` surfaces to the caller for retry.
pub(crate) fn unmount(mountpoint: &Path) -> io::Result<()> {
    nix::mount::umount2(mountpoint, nix::mount::MntFlags::empty()).map_err(io::Error::from)
}
