//! Spec mutation and persistence.
//!
//! All edits happen on an in-memory [`Spec`]; [`serialize`] and
//! [`write_spec`] are split so the document can be rendered before any
//! mount exists and written only once the mount is in place.

use std::collections::HashMap;
use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{Hook, HookBuilder, Spec};

use crate::constants::annotations;
use crate::constants::overlay::UMOUNT_BINARY;
use crate::error::RewriteError;
use crate::overlay::OverlayLayout;
use crate::validate::ValidatedVolume;

/// `Root.Path` before rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalRoot {
    /// As written in the spec, often just `rootfs`.
    pub declared: PathBuf,
    /// Absolute, resolved against the bundle directory when relative.
    pub absolute: PathBuf,
}

impl OriginalRoot {
    pub fn from_spec(spec: &Spec, bundle_dir: &Path) -> Result<Self, RewriteError> {
        let root = spec.root().as_ref().ok_or(RewriteError::MissingRoot)?;
        let declared = root.path().clone();

        let joined = if declared.is_absolute() {
            declared.clone()
        } else {
            bundle_dir.join(&declared)
        };
        let absolute = std::path::absolute(&joined).unwrap_or(joined);
        if absolute != declared {
            tracing::info!(
                declared = %declared.display(),
                absolute = %absolute.display(),
                "Resolved original root path"
            );
        }

        Ok(Self { declared, absolute })
    }
}

/// Point the spec at the merged overlay and record how it got there.
pub fn apply_overlay(
    spec: &mut Spec,
    original: &OriginalRoot,
    layout: &OverlayLayout,
    volume: &ValidatedVolume,
) -> Result<(), RewriteError> {
    set_writable_root(spec, &layout.merged)?;
    remove_volume_mount(spec, volume);
    append_unmount_hook(spec, &layout.merged)?;

    insert_annotations(
        spec,
        [
            (
                annotations::ORIGINAL_ROOT,
                original.absolute.display().to_string(),
            ),
            (
                annotations::OVERLAY_LOWERDIR,
                layout.lower.display().to_string(),
            ),
            (
                annotations::OVERLAY_UPPERDIR,
                layout.upper.display().to_string(),
            ),
            (
                annotations::OVERLAY_MERGED,
                layout.merged.display().to_string(),
            ),
        ],
    );
    Ok(())
}

/// Use the volume directory itself as root; image content is not visible.
pub fn apply_root_swap(
    spec: &mut Spec,
    original: &OriginalRoot,
    volume: &ValidatedVolume,
) -> Result<(), RewriteError> {
    set_writable_root(spec, &volume.resolved)?;
    remove_volume_mount(spec, volume);

    insert_annotations(
        spec,
        [
            (
                annotations::ORIGINAL_ROOT,
                original.absolute.display().to_string(),
            ),
            (annotations::BOOT_VOLUME_ACTIVE, "true".to_string()),
        ],
    );
    Ok(())
}

fn set_writable_root(spec: &mut Spec, path: &Path) -> Result<(), RewriteError> {
    let mut root = spec.root().clone().ok_or(RewriteError::MissingRoot)?;
    root.set_path(path.to_path_buf());
    root.set_readonly(Some(false));
    spec.set_root(Some(root));
    tracing::info!(root = %path.display(), "New root path");
    Ok(())
}

/// Drop the volume's own bind mount; it is the root now.
///
/// Sources are compared after symlink resolution, falling back to the
/// literal declared path when a source cannot be resolved. Returns how many
/// entries were removed.
pub fn remove_volume_mount(spec: &mut Spec, volume: &ValidatedVolume) -> usize {
    let Some(mounts) = spec.mounts().clone() else {
        return 0;
    };
    let before = mounts.len();

    let kept: Vec<_> = mounts
        .into_iter()
        .filter(|mount| {
            let Some(source) = mount.source() else {
                return true;
            };
            let matches = source == &volume.declared
                || match source.canonicalize() {
                    Ok(resolved) => resolved == volume.resolved,
                    Err(e) => {
                        tracing::debug!(
                            source = %source.display(),
                            error = %e,
                            "Could not resolve mount source, comparing literally"
                        );
                        false
                    }
                };
            if matches {
                tracing::info!(
                    source = %source.display(),
                    destination = %mount.destination().display(),
                    "Removing volume mount (now root)"
                );
            }
            !matches
        })
        .collect();

    let removed = before - kept.len();
    spec.set_mounts(Some(kept));
    removed
}

/// Append `umount -l <merged>` to poststop, unless the same hook is already there.
///
/// Returns whether a hook was added.
pub fn append_unmount_hook(spec: &mut Spec, merged: &Path) -> Result<bool, RewriteError> {
    let hook = unmount_hook(merged)?;
    let mut hooks = spec.hooks().clone().unwrap_or_default();
    let mut poststop = hooks.poststop().clone().unwrap_or_default();

    if poststop.contains(&hook) {
        tracing::debug!(merged = %merged.display(), "Unmount hook already present");
        return Ok(false);
    }

    poststop.push(hook);
    hooks.set_poststop(Some(poststop));
    spec.set_hooks(Some(hooks));
    tracing::info!(merged = %merged.display(), "Added poststop hook to unmount overlay");
    Ok(true)
}

fn unmount_hook(merged: &Path) -> Result<Hook, RewriteError> {
    HookBuilder::default()
        .path(UMOUNT_BINARY)
        .args(vec![
            "umount".to_string(),
            "-l".to_string(),
            merged.display().to_string(),
        ])
        .build()
        .map_err(|e| RewriteError::Hook(e.to_string()))
}

fn insert_annotations<const N: usize>(spec: &mut Spec, entries: [(&str, String); N]) {
    let mut map: HashMap<String, String> = spec.annotations().clone().unwrap_or_default();
    for (key, value) in entries {
        map.insert(key.to_string(), value);
    }
    spec.set_annotations(Some(map));
}

/// Render the spec the way it is written back: pretty JSON.
pub fn serialize(spec: &Spec) -> Result<Vec<u8>, RewriteError> {
    serde_json::to_vec_pretty(spec).map_err(RewriteError::Serialize)
}

/// Atomically replace `path` with `contents`, mode 0600.
///
/// The file goes to a temporary sibling first and is renamed over the
/// original, so the runtime never sees a half-written spec.
pub fn write_spec(path: &Path, contents: &[u8]) -> Result<(), RewriteError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".config.json.")
        .tempfile_in(dir)
        .map_err(|e| RewriteError::write(path, e))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o600))
        .map_err(|e| RewriteError::write(path, e))?;
    tmp.write_all(contents)
        .map_err(|e| RewriteError::write(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| RewriteError::write(path, e))?;
    tmp.persist(path)
        .map_err(|e| RewriteError::write(path, e.error))?;

    tracing::info!(path = %path.display(), bytes = contents.len(), "Wrote modified spec");
    Ok(())
}

/// Number of poststop hooks in `spec`.
pub fn poststop_len(spec: &Spec) -> usize {
    spec.hooks()
        .as_ref()
        .and_then(|hooks| hooks.poststop().as_ref())
        .map_or(0, Vec::len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgs_test_utils::{BundleFixture, VolumeFixture};
    use tempfile::TempDir;

    fn spec_from(fixture: &BundleFixture) -> Spec {
        serde_json::from_value(fixture.to_json()).unwrap()
    }

    fn volume(fx: &VolumeFixture) -> ValidatedVolume {
        ValidatedVolume {
            declared: fx.volume().to_path_buf(),
            resolved: fx.volume().canonicalize().unwrap(),
        }
    }

    #[test]
    fn test_original_root_relative_and_absolute() {
        let spec = spec_from(&BundleFixture::new());
        let root = OriginalRoot::from_spec(&spec, Path::new("/run/bundle")).unwrap();
        assert_eq!(root.declared, PathBuf::from("rootfs"));
        assert_eq!(root.absolute, PathBuf::from("/run/bundle/rootfs"));

        let spec = spec_from(&BundleFixture::new().root_path("/snapshots/42/fs"));
        let root = OriginalRoot::from_spec(&spec, Path::new("/run/bundle")).unwrap();
        assert_eq!(root.absolute, PathBuf::from("/snapshots/42/fs"));
    }

    #[test]
    fn test_original_root_missing() {
        let spec = spec_from(&BundleFixture::new().without_root());
        assert!(matches!(
            OriginalRoot::from_spec(&spec, Path::new("/b")),
            Err(RewriteError::MissingRoot)
        ));
    }

    #[test]
    fn test_apply_overlay() {
        let fx = VolumeFixture::new();
        let fixture = BundleFixture::new()
            .mount("proc", "/proc", "proc")
            .bind(fx.volume(), "/sgs-os-volume")
            .bind("/etc/hosts", "/etc/hosts");
        let mut spec = spec_from(&fixture);
        let original = OriginalRoot::from_spec(&spec, Path::new("/run/b")).unwrap();
        let layout = OverlayLayout::new(&original.absolute, &volume(&fx).resolved);

        apply_overlay(&mut spec, &original, &layout, &volume(&fx)).unwrap();

        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.path(), &layout.merged);
        assert_eq!(root.readonly(), Some(false));

        let destinations: Vec<_> = spec
            .mounts()
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.destination().clone())
            .collect();
        assert_eq!(
            destinations,
            vec![PathBuf::from("/proc"), PathBuf::from("/etc/hosts")]
        );

        let poststop = spec.hooks().as_ref().unwrap().poststop().as_ref().unwrap();
        assert_eq!(poststop.len(), 1);
        assert_eq!(poststop[0].path(), &PathBuf::from("/bin/umount"));
        assert_eq!(
            poststop[0].args().as_ref().unwrap(),
            &vec![
                "umount".to_string(),
                "-l".to_string(),
                layout.merged.display().to_string()
            ]
        );

        let ann = spec.annotations().as_ref().unwrap();
        assert_eq!(ann["sgs.snucse.org/original-root"], "/run/b/rootfs");
        assert_eq!(ann["sgs.snucse.org/overlay-lowerdir"], "/run/b/rootfs");
        assert_eq!(
            ann["sgs.snucse.org/overlay-upperdir"],
            layout.upper.display().to_string()
        );
        assert_eq!(
            ann["sgs.snucse.org/overlay-merged"],
            layout.merged.display().to_string()
        );
    }

    #[test]
    fn test_existing_annotations_and_hooks_are_kept() {
        let fx = VolumeFixture::new();
        let fixture = BundleFixture::new()
            .bind(fx.volume(), "/sgs-os-volume")
            .annotation("io.kubernetes.cri.container-type", "container")
            .poststop_hook("/usr/bin/true", &["true"]);
        let mut spec = spec_from(&fixture);
        let original = OriginalRoot::from_spec(&spec, Path::new("/b")).unwrap();
        let layout = OverlayLayout::new(&original.absolute, &volume(&fx).resolved);

        apply_overlay(&mut spec, &original, &layout, &volume(&fx)).unwrap();

        assert_eq!(poststop_len(&spec), 2);
        let ann = spec.annotations().as_ref().unwrap();
        assert_eq!(ann["io.kubernetes.cri.container-type"], "container");
    }

    #[test]
    fn test_unmount_hook_not_duplicated() {
        let mut spec = spec_from(&BundleFixture::new());
        let merged = Path::new("/v/merged");
        assert!(append_unmount_hook(&mut spec, merged).unwrap());
        assert!(!append_unmount_hook(&mut spec, merged).unwrap());
        assert_eq!(poststop_len(&spec), 1);
    }

    #[test]
    fn test_remove_volume_mount_through_symlink() {
        let fx = VolumeFixture::new();
        let alias = fx.prefix().join("alias");
        std::os::unix::fs::symlink(fx.volume(), &alias).unwrap();
        let fixture = BundleFixture::new()
            .bind(&alias, "/sgs-os-volume")
            .bind("/does/not/exist", "/data");
        let mut spec = spec_from(&fixture);

        assert_eq!(remove_volume_mount(&mut spec, &volume(&fx)), 1);
        assert_eq!(spec.mounts().as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_volume_mount_literal_fallback() {
        let volume = ValidatedVolume {
            declared: PathBuf::from("/var/lib/kubelet/pods/u/v/pvc/mount"),
            resolved: PathBuf::from("/var/lib/kubelet/pods/u/v/pvc/mount"),
        };
        let fixture = BundleFixture::new().bind("/var/lib/kubelet/pods/u/v/pvc/mount", "/sgs-os-volume");
        let mut spec = spec_from(&fixture);
        assert_eq!(remove_volume_mount(&mut spec, &volume), 1);
    }

    #[test]
    fn test_apply_root_swap() {
        let fx = VolumeFixture::new();
        let fixture = BundleFixture::new().bind(fx.volume(), "/sgs-os-volume");
        let mut spec = spec_from(&fixture);
        let original = OriginalRoot::from_spec(&spec, Path::new("/b")).unwrap();

        apply_root_swap(&mut spec, &original, &volume(&fx)).unwrap();

        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.path(), &volume(&fx).resolved);
        assert_eq!(root.readonly(), Some(false));
        assert!(spec.mounts().as_ref().unwrap().is_empty());
        assert_eq!(poststop_len(&spec), 0);
        let ann = spec.annotations().as_ref().unwrap();
        assert_eq!(ann["sgs.snucse.org/boot-volume-active"], "true");
        assert_eq!(ann["sgs.snucse.org/original-root"], "/b/rootfs");
    }

    #[test]
    fn test_write_spec_is_0600_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        let spec = spec_from(&BundleFixture::new());
        write_spec(&path, &serialize(&spec).unwrap()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let reread: Spec = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reread, spec);
        // no temporary files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_spec_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone/config.json");
        assert!(matches!(
            write_spec(&path, b"{}"),
            Err(RewriteError::Write { .. })
        ));
    }
}
