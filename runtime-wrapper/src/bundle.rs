//! OCI bundle loading and OS volume discovery.
//!
//! Discovery works on the raw JSON document. Runtimes accept capability,
//! rlimit and seccomp names that the typed model may not know yet, so a
//! container that never asked for a stateful root must not depend on the
//! typed parse succeeding.

use std::path::{Path, PathBuf};

use oci_spec::runtime::Spec;
use serde_json::Value;

use crate::constants::BUNDLE_CONFIG_FILE;
use crate::error::BundleError;

/// A bundle directory and its `config.json` document.
#[derive(Debug, Clone)]
pub struct Bundle {
    dir: PathBuf,
    config_path: PathBuf,
    document: Value,
}

impl Bundle {
    /// Read `<dir>/config.json` as JSON.
    ///
    /// A malformed document is an error, never "not applicable": we cannot
    /// tell whether it asked for a stateful root.
    pub fn load(dir: &Path) -> Result<Self, BundleError> {
        let config_path = dir.join(BUNDLE_CONFIG_FILE);
        let data = std::fs::read(&config_path).map_err(|source| BundleError::Read {
            path: config_path.clone(),
            source,
        })?;
        let document: Value =
            serde_json::from_slice(&data).map_err(|source| BundleError::Parse {
                path: config_path.clone(),
                source,
            })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config_path,
            document,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Host source of the mount whose destination is `destination`.
    pub fn find_os_volume(&self, destination: &Path) -> Option<OsVolume> {
        find_os_volume(&self.document, destination)
    }

    /// Typed spec, needed only once the container participates.
    pub fn into_spec(self) -> Result<Spec, BundleError> {
        serde_json::from_value(self.document).map_err(|source| BundleError::Schema {
            path: self.config_path,
            source,
        })
    }
}

/// The mount that requested a stateful root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsVolume {
    /// Host path as written in the spec.
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Scan `mounts` for the OS volume destination. Identified structurally only.
pub fn find_os_volume(document: &Value, destination: &Path) -> Option<OsVolume> {
    let mounts = document
        .get("mounts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let found = mounts.iter().find_map(|m| {
        let dest = m.get("destination").and_then(Value::as_str)?;
        if Path::new(dest) != destination {
            return None;
        }
        let source = m.get("source").and_then(Value::as_str)?;
        Some(OsVolume {
            source: PathBuf::from(source),
            destination: PathBuf::from(dest),
        })
    });

    match &found {
        Some(volume) => tracing::info!(
            source = %volume.source.display(),
            destination = %volume.destination.display(),
            "Found OS volume mount"
        ),
        None => log_mounts(mounts),
    }
    found
}

fn log_mounts(mounts: &[Value]) {
    for (i, mount) in mounts.iter().enumerate() {
        tracing::debug!(
            index = i,
            source = ?mount.get("source").and_then(serde_json::Value::as_str),
            destination = ?mount.get("destination").and_then(serde_json::Value::as_str),
            "Mount"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgs_test_utils::BundleFixture;

    #[test]
    fn test_load_and_find_os_volume() {
        let fixture = BundleFixture::new()
            .mount("proc", "/proc", "proc")
            .bind("/var/lib/kubelet/pods/u1/volumes/kubernetes.io~csi/pvc-1/mount", "/sgs-os-volume")
            .write();

        let bundle = Bundle::load(fixture.dir()).unwrap();
        assert_eq!(bundle.config_path(), fixture.config_path());
        assert!(bundle.clone().into_spec().is_ok());

        let volume = bundle.find_os_volume(Path::new("/sgs-os-volume")).unwrap();
        assert_eq!(
            volume.source,
            PathBuf::from("/var/lib/kubelet/pods/u1/volumes/kubernetes.io~csi/pvc-1/mount")
        );
    }

    #[test]
    fn test_missing_os_volume_is_none() {
        let fixture = BundleFixture::new()
            .bind("/data/scratch", "/scratch")
            .write();
        let bundle = Bundle::load(fixture.dir()).unwrap();
        assert!(bundle.find_os_volume(Path::new("/sgs-os-volume")).is_none());
    }

    #[test]
    fn test_destination_must_match_exactly() {
        let fixture = BundleFixture::new()
            .bind("/var/lib/kubelet/pods/u1/v", "/sgs-os-volume/sub")
            .bind("/var/lib/kubelet/pods/u1/w", "/sgs-os-volume-2")
            .write();
        let bundle = Bundle::load(fixture.dir()).unwrap();
        assert!(bundle.find_os_volume(Path::new("/sgs-os-volume")).is_none());
    }

    #[test]
    fn test_spec_without_mounts() {
        let fixture = BundleFixture::new().write();
        let bundle = Bundle::load(fixture.dir()).unwrap();
        assert!(bundle.find_os_volume(Path::new("/sgs-os-volume")).is_none());
    }

    #[test]
    fn test_malformed_spec_is_parse_error() {
        let fixture = BundleFixture::new().write_raw("{ not json");
        let err = Bundle::load(fixture.dir()).unwrap_err();
        assert!(matches!(err, BundleError::Parse { .. }));
    }

    #[test]
    fn test_missing_config_is_read_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Bundle::load(dir.path()).unwrap_err();
        assert!(matches!(err, BundleError::Read { .. }));
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_unknown_capability_still_discovers() {
        let mut doc = BundleFixture::new().mount("proc", "/proc", "proc").to_json();
        doc["process"]["capabilities"] = serde_json::json!({
            "bounding": ["CAP_CHOWN", "CAP_NEW_IN_LINUX_7"],
        });
        let fixture = BundleFixture::new().write_raw(&doc.to_string());

        let bundle = Bundle::load(fixture.dir()).unwrap();
        assert!(bundle.find_os_volume(Path::new("/sgs-os-volume")).is_none());
        assert!(matches!(
            bundle.into_spec().unwrap_err(),
            BundleError::Schema { .. }
        ));
    }

    #[test]
    fn test_mount_without_source_is_ignored() {
        let mut doc = BundleFixture::new().to_json();
        doc["mounts"] = serde_json::json!([{ "destination": "/sgs-os-volume", "type": "tmpfs" }]);
        let fixture = BundleFixture::new().write_raw(&doc.to_string());

        let bundle = Bundle::load(fixture.dir()).unwrap();
        assert!(bundle.find_os_volume(Path::new("/sgs-os-volume")).is_none());
    }
}
