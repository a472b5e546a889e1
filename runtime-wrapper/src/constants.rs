//! Fixed paths, names and environment keys shared across the wrapper.

/// In-container destination at which the OS volume must be mounted.
///
/// This is the only discovery mechanism: any pod that wants a stateful
/// rootfs mounts its PVC here, no annotation required.
pub const OS_VOLUME_MOUNT_PATH: &str = "/sgs-os-volume";

/// Node-local tree under which kubelet stages every pod volume.
pub const KUBELET_PODS_DIR: &str = "/var/lib/kubelet/pods";

/// Name of the spec file inside an OCI bundle.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// Exit code used when preparation fails for a participating container.
///
/// Kept apart from 1 so an aborted setup is distinguishable from a runtime
/// that ran and failed.
pub const EXIT_SETUP_FAILED: u8 = 125;

/// Exit code used when the real runtime's own code cannot be determined.
pub const EXIT_RUNTIME_UNKNOWN: i32 = 1;

/// Environment variable keys.
pub mod env {
    /// Forces the real runtime binary path, regardless of mode.
    pub const RUNTIME_PATH: &str = "SGS_RUNC_PATH";

    /// Forces the wrapper mode (`runc` or `nvidia`).
    pub const WRAPPER_MODE: &str = "SGS_WRAPPER_MODE";

    /// Selects the rootfs strategy (`overlay` or `rootswap`).
    pub const ROOTFS_STRATEGY: &str = "SGS_ROOTFS_STRATEGY";

    /// Overrides the log file location.
    pub const LOG_FILE: &str = "SGS_WRAPPER_LOG_FILE";

    /// EnvFilter directive for the wrapper's own log output.
    pub const LOG_LEVEL: &str = "SGS_WRAPPER_LOG_LEVEL";
}

/// Real runtime locations.
pub mod runtime {
    /// Fallback runc path when nothing else resolves.
    pub const DEFAULT_RUNC_PATH: &str = "/usr/bin/runc";

    /// Binary name searched on `PATH` in runc mode.
    pub const RUNC_BINARY: &str = "runc";

    /// Substring of argv[0] that selects nvidia mode.
    pub const NVIDIA_RUNTIME_NAME: &str = "nvidia-container-runtime";

    /// Where the renamed nvidia runtime is expected, in lookup order.
    pub const NVIDIA_REAL_CANDIDATES: &[&str] = &[
        "/usr/bin/nvidia-container-runtime.real",
        "/usr/local/bin/nvidia-container-runtime.real",
    ];
}

/// Overlay layout inside the OS volume.
pub mod overlay {
    /// Writable delta layer.
    pub const UPPER_DIR: &str = "upper";

    /// Overlayfs scratch directory; must be empty at mount time.
    pub const WORK_DIR: &str = "work";

    /// Merged view that becomes the container root.
    pub const MERGED_DIR: &str = "merged";

    /// Nested overlay (lowerdir on overlay) needs 5.11+.
    pub const MIN_KERNEL: (u32, u32) = (5, 11);

    /// Binary run by the poststop hook.
    pub const UMOUNT_BINARY: &str = "/bin/umount";
}

/// Annotation keys written into the rewritten spec.
pub mod annotations {
    pub const ORIGINAL_ROOT: &str = "sgs.snucse.org/original-root";
    pub const OVERLAY_LOWERDIR: &str = "sgs.snucse.org/overlay-lowerdir";
    pub const OVERLAY_UPPERDIR: &str = "sgs.snucse.org/overlay-upperdir";
    pub const OVERLAY_MERGED: &str = "sgs.snucse.org/overlay-merged";
    pub const BOOT_VOLUME_ACTIVE: &str = "sgs.snucse.org/boot-volume-active";
}

/// Logging defaults.
pub mod logging {
    pub const DEFAULT_LOG_FILE: &str = "/var/log/sgs-runtime-wrapper.log";
    pub const DEFAULT_LEVEL: &str = "info";
}
