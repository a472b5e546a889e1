#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use nix::errno::Errno;
use sgs_runtime_wrapper::overlay::{KernelRelease, MountOps, OverlayManager};
use sgs_runtime_wrapper::{Wrapper, WrapperConfig};
use sgs_test_utils::FakeRuntime;

/// Kernel release that passes the nested overlay gate.
pub const MODERN_KERNEL: &str = "6.1.0-17-amd64";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount(PathBuf, String),
    Unmount(PathBuf, bool),
}

/// Mount table kept in memory. `on_mount` runs after a successful mount,
/// which lets a test break the filesystem between mount and persist.
#[derive(Default)]
pub struct RecordingMounts {
    pub mounted: RefCell<HashSet<PathBuf>>,
    pub calls: RefCell<Vec<MountCall>>,
    pub mount_error: Option<Errno>,
    pub on_mount: Option<Box<dyn Fn()>>,
}

impl RecordingMounts {
    pub fn failing(errno: Errno) -> Self {
        Self {
            mount_error: Some(errno),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.borrow().clone()
    }
}

impl MountOps for RecordingMounts {
    fn is_mountpoint(&self, path: &Path) -> bool {
        self.mounted.borrow().contains(path)
    }

    fn mount_overlay(&self, target: &Path, data: &str) -> Result<(), Errno> {
        self.calls
            .borrow_mut()
            .push(MountCall::Mount(target.to_path_buf(), data.to_string()));
        if let Some(errno) = self.mount_error {
            return Err(errno);
        }
        self.mounted.borrow_mut().insert(target.to_path_buf());
        if let Some(hook) = &self.on_mount {
            hook();
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, detach: bool) -> Result<(), Errno> {
        self.calls
            .borrow_mut()
            .push(MountCall::Unmount(target.to_path_buf(), detach));
        self.mounted.borrow_mut().remove(target);
        Ok(())
    }
}

/// Wrapper over a recording mount table, accepting volumes below `prefix`.
pub fn wrapper(prefix: &Path, mounts: RecordingMounts) -> Wrapper<RecordingMounts> {
    wrapper_with_config(WrapperConfig::from_lookup(|_| None), prefix, mounts)
}

pub fn wrapper_with_config(
    config: WrapperConfig,
    prefix: &Path,
    mounts: RecordingMounts,
) -> Wrapper<RecordingMounts> {
    let config = config.with_volume_prefix(prefix);
    let overlay = OverlayManager::new(mounts, KernelRelease::Fixed(MODERN_KERNEL.to_string()));
    Wrapper::with_overlay(&config, overlay)
}

/// The wrapper binary with a clean `SGS_*` environment, the fake runtime
/// forced, and logs sent to `log_file`.
pub fn wrapper_cmd(runtime: &FakeRuntime, log_file: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sgs-runtime-wrapper"));
    for key in [
        "SGS_WRAPPER_MODE",
        "SGS_ROOTFS_STRATEGY",
        "SGS_WRAPPER_LOG_LEVEL",
    ] {
        cmd.env_remove(key);
    }
    cmd.env("SGS_RUNC_PATH", runtime.path());
    cmd.env("SGS_WRAPPER_LOG_FILE", log_file);
    cmd
}

pub fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
