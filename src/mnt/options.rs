//! Mount options.
//!
//! One options struct covers both sides of the mount: what gets encoded
//! into the kernel's mount-data string (or the fusermount `-o` list), and
//! what the server negotiates during INIT (max write, background limits).

use crate::ll::abi;

/// Options controlling the mount syscall and the INIT handshake.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Let users other than the mount owner access the filesystem.
    pub allow_other: bool,
    /// Have the kernel enforce permission bits instead of the filesystem.
    pub default_permissions: bool,
    /// Mount read-only.
    pub read_only: bool,
    /// Name of the source shown in mtab. Commas and backslashes are escaped
    /// when embedded in the mount-data string.
    pub fs_name: String,
    /// Filesystem subtype shown in mtab (`fuse.<name>`).
    pub name: String,
    /// Largest write payload advertised to the kernel. Clamped to the
    /// kernel's 128 KiB ceiling.
    pub max_write: u32,
    /// Readahead ceiling advertised to the kernel; 0 keeps the kernel's
    /// offer.
    pub max_readahead: u32,
    /// Kernel-side cap on queued background requests.
    pub max_background: u16,
    /// Queue depth at which the kernel marks the connection congested.
    pub congestion_threshold: u16,
    /// Mount by calling mount(2) directly instead of the fusermount helper.
    /// Requires privileges; falls back to the helper on EPERM.
    pub direct_mount: bool,
    /// Like `direct_mount`, but a privilege failure is final.
    pub direct_mount_strict: bool,
    /// Serialize every filesystem callback behind one mutex.
    pub single_threaded: bool,
    /// Log every request and reply status.
    pub debug: bool,
    /// Upper bound on concurrent device readers.
    pub max_readers: usize,
    /// Extra raw options appended to the mount-data string.
    pub options: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: false,
            default_permissions: false,
            read_only: false,
            fs_name: String::new(),
            name: String::new(),
            max_write: abi::DEFAULT_MAX_WRITE,
            max_readahead: 0,
            max_background: 12,
            congestion_threshold: 9,
            direct_mount: false,
            direct_mount_strict: false,
            single_threaded: false,
            debug: false,
            max_readers: 2,
            options: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Effective max write size, clamped to the kernel's hard limit.
    pub(crate) fn effective_max_write(&self) -> u32 {
        self.max_write.clamp(1, abi::MAX_MAX_WRITE)
    }

    /// Buffer size needed for the largest possible request frame.
    pub(crate) fn request_buffer_size(&self) -> usize {
        (self.effective_max_write() as usize + 4096).max(abi::FUSE_MIN_READ_BUFFER)
    }

    fn shared_options(&self, out: &mut Vec<String>) {
        if self.allow_other {
            out.push("allow_other".to_string());
        }
        if self.default_permissions {
            out.push("default_permissions".to_string());
        }
        if self.read_only {
            out.push("ro".to_string());
        }
        out.extend(self.options.iter().cloned());
    }

    /// The data string for a direct mount(2) call.
    pub(crate) fn kernel_mount_data(&self, fd: i32, rootmode: u32, uid: u32, gid: u32) -> String {
        let mut opts = vec![format!(
            "fd={fd},rootmode={rootmode:o},user_id={uid},group_id={gid}"
        )];
        if !self.fs_name.is_empty() {
            opts.push(format!("fsname={}", escape(&self.fs_name)));
        }
        if !self.name.is_empty() {
            opts.push(format!("subtype={}", escape(&self.name)));
        }
        self.shared_options(&mut opts);
        opts.join(",")
    }

    /// The `-o` argument handed to the fusermount helper, or `None` when
    /// nothing needs passing.
    pub(crate) fn fusermount_options(&self) -> Option<String> {
        let mut opts = Vec::new();
        if !self.fs_name.is_empty() {
            opts.push(format!("fsname={}", escape(&self.fs_name)));
        }
        if !self.name.is_empty() {
            opts.push(format!("subtype={}", escape(&self.name)));
        }
        self.shared_options(&mut opts);
        if opts.is_empty() {
            None
        } else {
            Some(opts.join(","))
        }
    }
}

/// Escape commas and backslashes inside an option value, so a `fsname`
/// containing a comma cannot smuggle in extra mount options.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_commas_and_backslashes() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "a\\,b");
        assert_eq!(escape("a\\b"), "a\\\\b");
        assert_eq!(escape("a\\,b"), "a\\\\\\,b");
    }

    #[test]
    fn kernel_mount_data_layout() {
        let opts = MountOptions {
            fs_name: "src,dir".to_string(),
            allow_other: true,
            read_only: true,
            ..MountOptions::default()
        };
        assert_eq!(
            opts.kernel_mount_data(7, 0o40000, 1000, 1000),
            "fd=7,rootmode=40000,user_id=1000,group_id=1000,fsname=src\\,dir,allow_other,ro"
        );
    }

    #[test]
    fn fusermount_options_empty_when_default() {
        assert_eq!(MountOptions::default().fusermount_options(), None);
        let opts = MountOptions {
            default_permissions: true,
            options: vec!["noatime".to_string()],
            ..MountOptions::default()
        };
        assert_eq!(
            opts.fusermount_options().as_deref(),
            Some("default_permissions,noatime")
        );
    }

    #[test]
    fn max_write_clamped() {
        let mut opts = MountOptions {
            max_write: 1024 * 1024,
            ..MountOptions::default()
        };
        assert_eq!(opts.effective_max_write(), abi::MAX_MAX_WRITE);
        opts.max_write = 1;
        assert_eq!(opts.effective_max_write(), 1);
        // a 1-byte max write must still leave room for a full request frame
        assert!(opts.request_buffer_size() >= abi::FUSE_MIN_READ_BUFFER);
    }
}
