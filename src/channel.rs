//! Raw communication channel to the FUSE kernel driver.
//!
//! Reads happen concurrently from several workers; the kernel hands each
//! read one complete request. Writes (replies and notifications) are
//! serialized behind a mutex so frames never interleave.

use std::fs::File;
use std::io::{self, IoSlice};
use std::os::fd::AsFd;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub(crate) struct Channel {
    device: Arc<File>,
    write_lock: Arc<Mutex<()>>,
}

impl Channel {
    pub(crate) fn new(device: Arc<File>) -> Self {
        Channel {
            device,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Block until the kernel delivers one complete request into `buffer`.
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.device.as_fd(), buffer).map_err(io::Error::from)
    }

    /// Write one frame. The lock covers the whole writev so a reply can
    /// never interleave with another reply or a notification.
    pub(crate) fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        let written = nix::sys::uio::writev(self.device.as_fd(), iov).map_err(io::Error::from)?;
        let expected: usize = iov.iter().map(|s| s.len()).sum();
        if written != expected {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to fuse device: {written} != {expected}"),
            ));
        }
        Ok(())
    }
}
