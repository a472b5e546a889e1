//! Volume host path validation.
//!
//! The next step mounts content from this path as the container's root, so
//! anything not staged by kubelet is refused: relative paths, `..` tricks,
//! paths outside the pods tree, and symlinks that lead out of it.

use std::path::{Component, Path, PathBuf};

use crate::error::ValidationError;

/// A volume path that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedVolume {
    /// Path as written in the spec; used to match the mount entry.
    pub declared: PathBuf,
    /// Symlink-free path; used for every filesystem operation.
    pub resolved: PathBuf,
}

#[derive(Debug, Clone)]
pub struct VolumeValidator {
    prefix: PathBuf,
}

impl VolumeValidator {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Lexical checks first, so a bad path never reaches the filesystem.
    pub fn validate(&self, path: &Path) -> Result<ValidatedVolume, ValidationError> {
        self.check_lexical(path)?;

        let resolved = path.canonicalize().map_err(|source| ValidationError::Stat {
            path: path.to_path_buf(),
            source,
        })?;

        // The prefix itself may be a symlink on some nodes (/var/lib/kubelet on
        // a data disk); compare resolved against resolved.
        let resolved_prefix = self
            .prefix
            .canonicalize()
            .unwrap_or_else(|_| self.prefix.clone());
        if !is_strictly_below(&resolved, &resolved_prefix) {
            return Err(ValidationError::SymlinkEscape {
                path: path.to_path_buf(),
                resolved,
                prefix: self.prefix.clone(),
            });
        }

        let meta = std::fs::metadata(&resolved).map_err(|source| ValidationError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ValidationError::NotDirectory(path.to_path_buf()));
        }

        tracing::debug!(
            declared = %path.display(),
            resolved = %resolved.display(),
            "Volume host path validated"
        );
        Ok(ValidatedVolume {
            declared: path.to_path_buf(),
            resolved,
        })
    }

    fn check_lexical(&self, path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::Traversal(path.to_path_buf()));
        }
        if !path.is_absolute() || !is_strictly_below(path, &self.prefix) {
            return Err(ValidationError::OutsidePrefix {
                path: path.to_path_buf(),
                prefix: self.prefix.clone(),
            });
        }
        Ok(())
    }
}

/// Component-wise prefix test that excludes the prefix itself.
fn is_strictly_below(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix) && path != prefix
}
