//! Mounting through the setuid fusermount helper.
//!
//! The helper is handed one end of a socketpair on a well-known descriptor
//! (`_FUSE_COMMFD`); after performing the privileged mount it passes the
//! kernel device fd back over `SCM_RIGHTS`.

use std::env;
use std::fs::File;
use std::io::{self, ErrorKind, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, error};
use nix::sys::socket::{
    AddressFamily, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg, socketpair,
};

use super::options::MountOptions;

pub(crate) const FUSERMOUNT_BIN: &str = "fusermount";
pub(crate) const FUSERMOUNT3_BIN: &str = "fusermount3";
const FUSERMOUNT_COMM_ENV: &str = "_FUSE_COMMFD";

/// The descriptor number the helper's end of the socketpair is moved to in
/// the child. Kept low and predictable; see `reserve_helper_fds`.
const FUSERMOUNT_COMM_FD: RawFd = 3;

/// Locate the helper binary. `FUSERMOUNT_PATH` overrides the search.
pub(crate) fn detect_fusermount_bin() -> String {
    if let Some(path) = env::var_os("FUSERMOUNT_PATH") {
        return path.to_string_lossy().into_owned();
    }
    for name in [
        FUSERMOUNT3_BIN.to_string(),
        FUSERMOUNT_BIN.to_string(),
        format!("/sbin/{FUSERMOUNT3_BIN}"),
        format!("/sbin/{FUSERMOUNT_BIN}"),
        format!("/bin/{FUSERMOUNT3_BIN}"),
        format!("/bin/{FUSERMOUNT_BIN}"),
    ] {
        if Command::new(&name)
            .arg("-h")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
        {
            return name;
        }
    }
    FUSERMOUNT3_BIN.to_string()
}

/// Receive the kernel device fd the helper sends over the socketpair. The
/// control message must carry exactly one descriptor.
fn receive_device_fd(socket: &OwnedFd) -> io::Result<File> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    if msg.bytes == 0 {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "fusermount closed the comm socket without sending a descriptor",
        ));
    }
    let mut fds: Vec<RawFd> = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    if fds.len() != 1 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("expected one descriptor from fusermount, got {}", fds.len()),
        ));
    }
    // Ownership of the received fd transfers to the File.
    Ok(unsafe { File::from_raw_fd(fds[0]) })
}

/// Mount `mountpoint` by spawning the helper; returns the kernel device fd.
pub(crate) fn mount(mountpoint: &Path, options: &MountOptions) -> io::Result<File> {
    let bin = detect_fusermount_bin();
    let (parent_end, child_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .map_err(io::Error::from)?;

    let mut cmd = Command::new(&bin);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(opts) = options.fusermount_options() {
        cmd.arg("-o").arg(opts);
    }
    cmd.arg("--")
        .arg(mountpoint)
        .env(FUSERMOUNT_COMM_ENV, FUSERMOUNT_COMM_FD.to_string());

    let comm_fd = child_end.as_raw_fd();
    unsafe {
        // Runs in the forked child: park the socket on the advertised
        // descriptor. dup2 clears close-on-exec on the duplicate.
        cmd.pre_exec(move || {
            if libc::dup2(comm_fd, FUSERMOUNT_COMM_FD) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(child_end);

    let device = match receive_device_fd(&parent_end) {
        Ok(device) => device,
        Err(err) => {
            drop(parent_end);
            let output = child.wait_with_output()?;
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!("fusermount failed on {}: {}", mountpoint.display(), stderr.trim());
            return if stderr.contains("only allowed if 'user_allow_other' is set") {
                Err(io::Error::new(ErrorKind::PermissionDenied, stderr))
            } else if stderr.trim().is_empty() {
                Err(err)
            } else {
                Err(io::Error::other(stderr))
            };
        }
    };
    drop(parent_end);

    let output = child.wait_with_output()?;
    debug!("fusermount stdout: {}", String::from_utf8_lossy(&output.stdout));
    debug!("fusermount stderr: {}", String::from_utf8_lossy(&output.stderr));

    unsafe {
        libc::fcntl(device.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(device)
}

/// Unmount by running `fusermount -u`.
pub(crate) fn unmount(mountpoint: &Path) -> io::Result<()> {
    let mut cmd = Command::new(detect_fusermount_bin());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.arg("-u").arg("-q").arg("--").arg(mountpoint);
    let output = cmd.output()?;
    debug!("fusermount -u stdout: {}", String::from_utf8_lossy(&output.stdout));
    debug!("fusermount -u stderr: {}", String::from_utf8_lossy(&output.stderr));
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("busy") {
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        } else {
            Err(io::Error::from_raw_os_error(
                output.status.code().unwrap_or(libc::EIO),
            ))
        }
    }
}
