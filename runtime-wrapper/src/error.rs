//! Hierarchical error types for the wrapper.
//!
//! Every variant here is a *real* failure: the container would otherwise
//! start on a wrong or unsafe root filesystem, so the wrapper aborts without
//! handing off to the runtime. Containers that simply do not opt in never
//! produce an error; see [`crate::wrapper::Preparation`].
//!
//! - [`BundleError`]: the bundle spec cannot be read or parsed
//! - [`ValidationError`]: the volume host path is not acceptable
//! - [`OverlayError`]: kernel gate or mount sequence failed
//! - [`RewriteError`]: the mutated spec could not be built or persisted

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Any failure that must abort a `create` before the runtime is exec'd.
#[derive(Debug, Error)]
pub enum WrapperError {
    /// Bundle spec unreadable or malformed.
    #[error("bundle: {0}")]
    Bundle(#[from] BundleError),

    /// Volume host path rejected.
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    /// Overlay setup failed.
    #[error("overlay: {0}")]
    Overlay(#[from] OverlayError),

    /// Spec rewrite failed.
    #[error("rewrite: {0}")]
    Rewrite(#[from] RewriteError),
}

pub type WrapperResult<T> = Result<T, WrapperError>;

// ============================================================================
// Bundle Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Well-formed JSON that does not fit the runtime spec model.
    #[error("{path} is not a usable runtime spec: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Validation Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ValidationError {
    /// Path is not strictly below the kubelet volume tree.
    #[error(
        "volume host path '{path}' is not within expected kubelet directory '{prefix}'; \
         this may indicate a security issue or misconfiguration"
    )]
    OutsidePrefix { path: PathBuf, prefix: PathBuf },

    /// Path carries `..` components.
    #[error("volume host path '{0}' contains parent directory components")]
    Traversal(PathBuf),

    /// Symlink resolution leads outside the kubelet volume tree.
    #[error("volume host path '{path}' resolves to '{resolved}', outside '{prefix}'")]
    SymlinkEscape {
        path: PathBuf,
        resolved: PathBuf,
        prefix: PathBuf,
    },

    #[error("volume host path validation failed for {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("volume host path is not a directory: {0}")]
    NotDirectory(PathBuf),
}

// ============================================================================
// Overlay Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("failed to get kernel version: {0}")]
    Uname(#[source] Errno),

    #[error("failed to parse kernel version '{0}'")]
    KernelParse(String),

    #[error(
        "kernel {major}.{minor} is too old for nested overlayfs; \
         requires kernel 5.11+ (found: {release})"
    )]
    KernelTooOld {
        major: u32,
        minor: u32,
        release: String,
    },

    /// Path would corrupt the overlay mount data string.
    #[error("{role} path '{path}' contains ',' or ':' and cannot be used in overlay options")]
    UnsafeOptionPath { role: &'static str, path: PathBuf },

    /// Overlay directory on the volume is a symlink or not a directory.
    #[error("refusing to use {path}: {reason}")]
    UnsafeDirectory { path: PathBuf, reason: &'static str },

    #[error("failed to prepare {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmount existing overlay at {path}: {source}")]
    Unmount {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    /// Mount returned EINVAL, the usual symptom of missing nested overlay support.
    #[error(
        "overlayfs mount at {path} failed (EINVAL): nested overlayfs may not be \
         supported on this kernel; requires kernel 5.11+ for nested overlay"
    )]
    NestedUnsupported { path: PathBuf },

    #[error("failed to mount overlayfs at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

// ============================================================================
// Rewrite Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("spec has no root")]
    MissingRoot,

    #[error("failed to build poststop hook: {0}")]
    Hook(String),

    #[error("failed to serialize modified spec: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to write modified {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Convenience Constructors
// ============================================================================

impl OverlayError {
    pub fn directory(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Directory {
            path: path.into(),
            source,
        }
    }
}

impl RewriteError {
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
