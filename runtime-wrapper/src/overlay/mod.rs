//! Overlayfs setup on the OS volume.
//!
//! The image rootfs is the read-only lowerdir and the PVC carries upper and
//! work, so every write the workload makes lands on the volume and survives
//! restarts and reschedules while the image stays pristine.
//!
//! Layout inside the volume:
//!
//! ```text
//! <volume>/upper    writable delta, persistent
//! <volume>/work     overlayfs scratch, emptied before each mount
//! <volume>/merged   union view, becomes Root.Path
//! ```

mod kernel;
mod mount;

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;

pub use kernel::{KernelVersion, ensure_nested_overlay};
pub use mount::{MountOps, SystemMounts, is_mountpoint};

use crate::constants::overlay::{MERGED_DIR, UPPER_DIR, WORK_DIR};
use crate::error::OverlayError;

/// Paths of one overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayLayout {
    /// Layout for image rootfs `lower` on top of volume directory `volume`.
    pub fn new(lower: impl Into<PathBuf>, volume: &Path) -> Self {
        Self {
            lower: lower.into(),
            upper: volume.join(UPPER_DIR),
            work: volume.join(WORK_DIR),
            merged: volume.join(MERGED_DIR),
        }
    }

    /// Mount data string. `,` separates options and `:` separates lower
    /// layers, so paths containing either are refused.
    pub fn mount_data(&self) -> Result<String, OverlayError> {
        for (role, path) in [
            ("lowerdir", &self.lower),
            ("upperdir", &self.upper),
            ("workdir", &self.work),
        ] {
            let s = path.to_string_lossy();
            if s.contains(',') || s.contains(':') {
                return Err(OverlayError::UnsafeOptionPath {
                    role,
                    path: path.clone(),
                });
            }
        }
        Ok(format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        ))
    }
}

/// Source of the kernel release string.
#[derive(Debug, Clone, Default)]
pub enum KernelRelease {
    /// Ask the running kernel.
    #[default]
    Host,
    Fixed(String),
}

impl KernelRelease {
    fn get(&self) -> Result<String, OverlayError> {
        match self {
            Self::Host => KernelVersion::host_release(),
            Self::Fixed(release) => Ok(release.clone()),
        }
    }
}

/// Builds and mounts the overlay. Safe to re-run for the same volume.
#[derive(Debug, Clone)]
pub struct OverlayManager<M: MountOps> {
    mounts: M,
    kernel: KernelRelease,
}

impl OverlayManager<SystemMounts> {
    pub fn system() -> Self {
        Self::new(SystemMounts, KernelRelease::Host)
    }
}

impl<M: MountOps> OverlayManager<M> {
    pub fn new(mounts: M, kernel: KernelRelease) -> Self {
        Self { mounts, kernel }
    }

    pub fn mounts(&self) -> &M {
        &self.mounts
    }

    /// Mount `layout.merged`. Returns the merged directory.
    pub fn setup(&self, layout: &OverlayLayout) -> Result<PathBuf, OverlayError> {
        // 1. Kernel gate
        let release = self.kernel.get()?;
        ensure_nested_overlay(&release)?;

        let data = layout.mount_data()?;

        // 2. Directories (pre-existing is fine: upper holds the state).
        // The workload can write the volume: no symlinks, real dirs only.
        for dir in [&layout.upper, &layout.work, &layout.merged] {
            ensure_real_dir(dir)?;
        }

        // 3. workdir MUST be empty for overlayfs to mount
        clear_dir(&layout.work)?;

        // 4. Left over from a previous run of this container
        if self.mounts.is_mountpoint(&layout.merged) {
            tracing::info!(merged = %layout.merged.display(), "Detected existing mount, unmounting");
            self.unmount_existing(&layout.merged)?;
        }

        // 5. Mount
        ensure_real_dir(&layout.merged)?;
        tracing::info!(
            lowerdir = %layout.lower.display(),
            upperdir = %layout.upper.display(),
            workdir = %layout.work.display(),
            merged = %layout.merged.display(),
            "Mounting overlayfs"
        );
        self.mounts
            .mount_overlay(&layout.merged, &data)
            .map_err(|errno| classify_mount_error(&layout.merged, errno))?;

        tracing::info!(merged = %layout.merged.display(), "Overlayfs mounted");
        Ok(layout.merged.clone())
    }

    /// Lazily unmount `merged`, used when a later step fails after mounting.
    pub fn teardown(&self, merged: &Path) {
        match self.mounts.unmount(merged, true) {
            Ok(()) => tracing::info!(merged = %merged.display(), "Rolled back overlay mount"),
            Err(e) => tracing::warn!(
                merged = %merged.display(),
                error = %e,
                "Failed to roll back overlay mount"
            ),
        }
    }

    fn unmount_existing(&self, merged: &Path) -> Result<(), OverlayError> {
        if let Err(e) = self.mounts.unmount(merged, false) {
            tracing::warn!(error = %e, "Failed to unmount existing overlay, trying lazy unmount");
            self.mounts
                .unmount(merged, true)
                .map_err(|source| OverlayError::Unmount {
                    path: merged.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// EINVAL on overlay mount almost always means nested overlay is unsupported,
/// even when the version gate passed (backported or patched kernels).
fn classify_mount_error(merged: &Path, errno: Errno) -> OverlayError {
    if errno == Errno::EINVAL {
        OverlayError::NestedUnsupported {
            path: merged.to_path_buf(),
        }
    } else {
        OverlayError::Mount {
            path: merged.to_path_buf(),
            source: errno,
        }
    }
}

/// Create `path` if missing, then require that it is a directory and not a
/// symlink. Its parent is expected to exist.
fn ensure_real_dir(path: &Path) -> Result<(), OverlayError> {
    match std::fs::DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(OverlayError::directory(path, e)),
    }

    let meta = std::fs::symlink_metadata(path).map_err(|e| OverlayError::directory(path, e))?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        return Err(OverlayError::UnsafeDirectory {
            path: path.to_path_buf(),
            reason: "it is a symlink",
        });
    }
    if !file_type.is_dir() {
        return Err(OverlayError::UnsafeDirectory {
            path: path.to_path_buf(),
            reason: "it is not a directory",
        });
    }
    Ok(())
}

/// Remove everything inside `path` but keep `path`. Missing is fine; a
/// symlinked `path` is refused. Entries are removed without following links.
fn clear_dir(path: &Path) -> Result<(), OverlayError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(OverlayError::UnsafeDirectory {
                path: path.to_path_buf(),
                reason: "it is a symlink",
            });
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(OverlayError::directory(path, e)),
    }

    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(OverlayError::directory(path, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| OverlayError::directory(path, e))?;
        let entry_path = entry.path();
        let is_dir = entry
            .file_type()
            .map(|t| t.is_dir())
            .map_err(|e| OverlayError::directory(&entry_path, e))?;
        let removed = if is_dir {
            std::fs::remove_dir_all(&entry_path)
        } else {
            std::fs::remove_file(&entry_path)
        };
        removed.map_err(|e| OverlayError::directory(&entry_path, e))?;
    }
    Ok(())
}
