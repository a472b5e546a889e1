//! Invocation classification and real runtime discovery.
//!
//! containerd calls the wrapper exactly as it would call the runtime, so the
//! argument vector is opaque apart from the `create` token and the bundle
//! flag. Which runtime we stand in for is decided once here and threaded to
//! runtime lookup and exec.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::WrapperConfig;
use crate::constants::runtime;

// ============================================================================
// Mode
// ============================================================================

/// The runtime this process is standing in for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapperMode {
    /// Plain runc, installed via a RuntimeClass `BinaryName`.
    Runc,
    /// nvidia-container-runtime, hijacked by symlinking its name to us.
    Nvidia,
}

impl WrapperMode {
    /// Decide the mode from an explicit override, then from argv[0].
    ///
    /// argv[0] keeps the symlink name (e.g. `nvidia-container-runtime`) even
    /// when the link points at this binary, which is what makes detection work.
    pub fn detect(argv0: &OsStr, mode_override: Option<&str>) -> Self {
        if let Some(raw) = mode_override {
            let mode = Self::from_override(raw);
            tracing::info!(value = raw, ?mode, "Using wrapper mode from override");
            return mode;
        }

        let invoked_as = Path::new(argv0)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if invoked_as.contains(runtime::NVIDIA_RUNTIME_NAME) {
            tracing::info!(invoked_as = %invoked_as, "Auto-detected nvidia mode");
            Self::Nvidia
        } else {
            tracing::info!(invoked_as = %invoked_as, "Auto-detected runc mode");
            Self::Runc
        }
    }

    /// Anything other than an nvidia spelling means runc; the override wins either way.
    fn from_override(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nvidia" | "gpu" => Self::Nvidia,
            "runc" => Self::Runc,
            other => {
                tracing::warn!(value = other, "Unknown wrapper mode override, using runc");
                Self::Runc
            }
        }
    }
}

impl fmt::Display for WrapperMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runc => f.write_str("runc"),
            Self::Nvidia => f.write_str("nvidia"),
        }
    }
}

// ============================================================================
// Argument vector
// ============================================================================

/// The argument vector as received, plus the two facts the wrapper cares about.
#[derive(Clone, Debug)]
pub struct Invocation {
    argv0: OsString,
    args: Vec<OsString>,
    is_create: bool,
    bundle: Option<PathBuf>,
}

impl Invocation {
    /// Parse a full argv (including argv[0]).
    pub fn parse<I>(argv: I) -> Self
    where
        I: IntoIterator<Item = OsString>,
    {
        let mut iter = argv.into_iter();
        let argv0 = iter.next().unwrap_or_default();
        let args: Vec<OsString> = iter.collect();

        let mut is_create = false;
        let mut bundle = None;

        for (i, arg) in args.iter().enumerate() {
            let bytes = arg.as_bytes();
            if bytes == b"create" {
                is_create = true;
            } else if bytes == b"--bundle" || bytes == b"-b" {
                if let Some(value) = args.get(i + 1) {
                    bundle = Some(PathBuf::from(value));
                }
            } else if let Some(value) = bytes
                .strip_prefix(b"--bundle=")
                .or_else(|| bytes.strip_prefix(b"-b="))
            {
                bundle = Some(PathBuf::from(OsStr::from_bytes(value)));
            }
        }

        Self {
            argv0,
            args,
            is_create,
            bundle,
        }
    }

    pub fn argv0(&self) -> &OsStr {
        &self.argv0
    }

    /// Everything after argv[0], untouched.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn into_args(self) -> Vec<OsString> {
        self.args
    }

    pub fn is_create(&self) -> bool {
        self.is_create
    }

    pub fn bundle(&self) -> Option<&Path> {
        self.bundle.as_deref()
    }
}

// ============================================================================
// Runtime lookup
// ============================================================================

/// Where the resolved runtime path came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeSource {
    Override,
    NvidiaCandidate,
    SearchPath,
    Default,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRuntime {
    pub path: PathBuf,
    pub source: RuntimeSource,
}

impl ResolvedRuntime {
    /// argv[0] the real runtime expects: its own basename.
    pub fn argv0(&self) -> OsString {
        self.path
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_else(|| self.path.clone().into_os_string())
    }
}

/// Resolves the real runtime binary. Only probes the filesystem.
#[derive(Clone, Debug)]
pub struct RuntimeLocator {
    override_path: Option<PathBuf>,
    nvidia_candidates: Vec<PathBuf>,
    search_path: Option<OsString>,
    self_exe: Option<PathBuf>,
    default_path: PathBuf,
}

impl RuntimeLocator {
    /// Locator for this process: real `PATH`, real executable path.
    pub fn from_config(config: &WrapperConfig) -> Self {
        Self {
            override_path: config.runtime_path.clone(),
            nvidia_candidates: runtime::NVIDIA_REAL_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .collect(),
            search_path: std::env::var_os("PATH"),
            self_exe: std::env::current_exe().ok(),
            default_path: PathBuf::from(runtime::DEFAULT_RUNC_PATH),
        }
    }

    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.override_path = path;
        self
    }

    pub fn with_nvidia_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.nvidia_candidates = candidates;
        self
    }

    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_self_exe(mut self, self_exe: Option<PathBuf>) -> Self {
        self.self_exe = self_exe;
        self
    }

    pub fn with_default_path(mut self, path: PathBuf) -> Self {
        self.default_path = path;
        self
    }

    /// Override, then mode-specific candidates, then the default runc path.
    pub fn resolve(&self, mode: WrapperMode) -> ResolvedRuntime {
        if let Some(path) = &self.override_path {
            tracing::info!(path = %path.display(), "Using runtime path from override");
            return ResolvedRuntime {
                path: path.clone(),
                source: RuntimeSource::Override,
            };
        }

        let found = match mode {
            WrapperMode::Nvidia => self
                .find_nvidia_runtime()
                .map(|path| (path, RuntimeSource::NvidiaCandidate)),
            WrapperMode::Runc => self
                .find_runc_on_path()
                .map(|path| (path, RuntimeSource::SearchPath)),
        };

        match found {
            Some((path, source)) => ResolvedRuntime { path, source },
            None => {
                if mode == WrapperMode::Nvidia {
                    tracing::warn!("nvidia-container-runtime.real not found, falling back to runc");
                }
                tracing::info!(path = %self.default_path.display(), "Using default runc path");
                ResolvedRuntime {
                    path: self.default_path.clone(),
                    source: RuntimeSource::Default,
                }
            }
        }
    }

    fn find_nvidia_runtime(&self) -> Option<PathBuf> {
        let found = self
            .nvidia_candidates
            .iter()
            .find(|path| is_executable_file(path))
            .cloned();
        if let Some(path) = &found {
            tracing::info!(path = %path.display(), "Found real nvidia-container-runtime");
        }
        found
    }

    fn find_runc_on_path(&self) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let path = which::which_in(runtime::RUNC_BINARY, Some(search_path), cwd).ok()?;

        // Installed as `runc` somewhere on PATH, we would find ourselves.
        if let Some(self_exe) = &self.self_exe
            && same_file(&path, self_exe)
        {
            tracing::warn!(
                path = %path.display(),
                "PATH lookup returned our own executable, skipping"
            );
            return None;
        }

        tracing::info!(path = %path.display(), "Found runc via PATH");
        Some(path)
    }
}

/// Regular file with at least one executable bit. Follows symlinks.
fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Compare after resolving symlinks on both sides, raw paths when that fails.
fn same_file(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a == b
}
