//! Mount syscalls behind a seam.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};

/// Mount operations the overlay manager needs.
pub trait MountOps {
    /// Whether `path` is currently a mount point.
    fn is_mountpoint(&self, path: &Path) -> bool {
        is_mountpoint(path)
    }

    /// Mount overlayfs at `target` with the given option string.
    fn mount_overlay(&self, target: &Path, data: &str) -> Result<(), Errno>;

    /// Unmount `target`; `detach` requests a lazy unmount.
    fn unmount(&self, target: &Path, detach: bool) -> Result<(), Errno>;
}

/// The host's mount table, via nix.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounts;

impl MountOps for SystemMounts {
    fn mount_overlay(&self, target: &Path, data: &str) -> Result<(), Errno> {
        nix::mount::mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(data),
        )
    }

    fn unmount(&self, target: &Path, detach: bool) -> Result<(), Errno> {
        let flags = if detach {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        nix::mount::umount2(target, flags)
    }
}

/// A directory is a mount point when its device differs from its parent's.
///
/// Unreadable paths count as not mounted. Bind mounts of a directory onto
/// the same filesystem are not detected; the overlay mounts we make always
/// carry their own device.
pub fn is_mountpoint(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    let (Ok(meta), Ok(parent_meta)) = (std::fs::metadata(path), std::fs::metadata(parent)) else {
        return false;
    };
    meta.dev() != parent_meta.dev()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_subdirectory_is_not_mountpoint() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("merged");
        std::fs::create_dir(&sub).unwrap();
        assert!(!is_mountpoint(&sub));
    }

    #[test]
    fn test_proc_is_mountpoint() {
        // procfs always has its own device
        assert!(is_mountpoint(Path::new("/proc")));
    }

    #[test]
    fn test_missing_path_is_not_mountpoint() {
        let dir = TempDir::new().unwrap();
        assert!(!is_mountpoint(&dir.path().join("absent")));
    }

    #[test]
    fn test_root_has_no_parent() {
        assert!(!is_mountpoint(Path::new("/")));
    }
}
