//! Wrapper configuration, read once from the environment.
//!
//! The argument vector belongs to the real runtime and is never parsed as
//! options, so every knob lives in an environment variable.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::constants::{self, env};

/// How the OS volume becomes the container root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootfsStrategy {
    /// Image as lowerdir, volume as upperdir, merged view as root.
    #[default]
    Overlay,
    /// Volume directory used directly as root, image content ignored.
    RootSwap,
}

impl FromStr for RootfsStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overlay" | "overlayfs" => Ok(Self::Overlay),
            "rootswap" | "root-swap" => Ok(Self::RootSwap),
            other => Err(format!("unknown rootfs strategy '{}'", other)),
        }
    }
}

impl fmt::Display for RootfsStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlay => f.write_str("overlay"),
            Self::RootSwap => f.write_str("rootswap"),
        }
    }
}

/// Fully resolved wrapper settings.
#[derive(Clone, Debug)]
pub struct WrapperConfig {
    /// `SGS_RUNC_PATH`: real runtime path, wins over any detection.
    pub runtime_path: Option<PathBuf>,
    /// `SGS_WRAPPER_MODE`: raw mode override, interpreted by the classifier.
    pub mode_override: Option<String>,
    /// `SGS_ROOTFS_STRATEGY`.
    pub strategy: RootfsStrategy,
    /// `SGS_WRAPPER_LOG_FILE`.
    pub log_file: PathBuf,
    /// `SGS_WRAPPER_LOG_LEVEL`, EnvFilter syntax.
    pub log_level: String,
    /// Only volumes strictly below this directory may become a root.
    pub volume_prefix: PathBuf,
    /// In-container destination identifying the OS volume.
    pub os_volume_mount: PathBuf,
    /// Problems found while reading the environment, logged once logging is up.
    pub warnings: Vec<String>,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            runtime_path: None,
            mode_override: None,
            strategy: RootfsStrategy::default(),
            log_file: PathBuf::from(constants::logging::DEFAULT_LOG_FILE),
            log_level: constants::logging::DEFAULT_LEVEL.to_string(),
            volume_prefix: PathBuf::from(constants::KUBELET_PODS_DIR),
            os_volume_mount: PathBuf::from(constants::OS_VOLUME_MOUNT_PATH),
            warnings: Vec::new(),
        }
    }
}

impl WrapperConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.runtime_path = get(env::RUNTIME_PATH).map(PathBuf::from);
        config.mode_override = get(env::WRAPPER_MODE).map(|v| v.to_string_lossy().into_owned());

        if let Some(raw) = get(env::ROOTFS_STRATEGY) {
            let raw = raw.to_string_lossy();
            match raw.parse() {
                Ok(strategy) => config.strategy = strategy,
                Err(e) => config.warnings.push(format!(
                    "{}; using {}",
                    e,
                    RootfsStrategy::Overlay
                )),
            }
        }
        if let Some(path) = get(env::LOG_FILE) {
            config.log_file = PathBuf::from(path);
        }
        if let Some(level) = get(env::LOG_LEVEL) {
            config.log_level = level.to_string_lossy().into_owned();
        }

        config
    }

    /// Replace the volume prefix, e.g. with a temporary directory in tests.
    pub fn with_volume_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.volume_prefix = prefix.into();
        self
    }

    pub fn with_strategy(mut self, strategy: RootfsStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}
