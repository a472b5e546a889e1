//! Per-invocation orchestration: inspect, validate, overlay, rewrite.
//!
//! Everything here runs before the handoff. A container that does not opt
//! in comes back as [`Preparation::Skipped`] with its spec untouched; any
//! error means the runtime must not be started.

use std::path::{Path, PathBuf};

use crate::bundle::Bundle;
use crate::config::{RootfsStrategy, WrapperConfig};
use crate::error::WrapperResult;
use crate::invocation::Invocation;
use crate::overlay::{MountOps, OverlayLayout, OverlayManager, SystemMounts};
use crate::rewrite::{self, OriginalRoot};
use crate::validate::{ValidatedVolume, VolumeValidator};

/// Why the spec was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a `create` call.
    NotCreate,
    /// `create` without a bundle flag.
    NoBundle,
    /// No mount at the OS volume destination.
    NoOsVolume,
}

/// What was done to a participating bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteSummary {
    pub strategy: RootfsStrategy,
    pub config_path: PathBuf,
    pub original_root: OriginalRoot,
    pub new_root: PathBuf,
    pub volume: ValidatedVolume,
    /// Present for the overlay strategy only.
    pub overlay: Option<OverlayLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    Skipped(SkipReason),
    Rewritten(RewriteSummary),
}

pub struct Wrapper<M: MountOps> {
    strategy: RootfsStrategy,
    os_volume_mount: PathBuf,
    validator: VolumeValidator,
    overlay: OverlayManager<M>,
}

impl Wrapper<SystemMounts> {
    pub fn new(config: &WrapperConfig) -> Self {
        Self::with_overlay(config, OverlayManager::system())
    }
}

impl<M: MountOps> Wrapper<M> {
    pub fn with_overlay(config: &WrapperConfig, overlay: OverlayManager<M>) -> Self {
        Self {
            strategy: config.strategy,
            os_volume_mount: config.os_volume_mount.clone(),
            validator: VolumeValidator::new(config.volume_prefix.clone()),
            overlay,
        }
    }

    pub fn overlay(&self) -> &OverlayManager<M> {
        &self.overlay
    }

    /// Decide whether this invocation concerns us, and prepare the bundle if so.
    pub fn prepare(&self, invocation: &Invocation) -> WrapperResult<Preparation> {
        if !invocation.is_create() {
            return Ok(Preparation::Skipped(SkipReason::NotCreate));
        }
        let Some(bundle) = invocation.bundle() else {
            tracing::warn!(
                "'create' command detected but no bundle path found; proceeding without modification"
            );
            return Ok(Preparation::Skipped(SkipReason::NoBundle));
        };
        self.prepare_bundle(bundle)
    }

    pub fn prepare_bundle(&self, dir: &Path) -> WrapperResult<Preparation> {
        let bundle = Bundle::load(dir)?;

        let Some(os_volume) = bundle.find_os_volume(&self.os_volume_mount) else {
            tracing::info!(
                destination = %self.os_volume_mount.display(),
                "No OS volume mount found; leaving spec untouched"
            );
            return Ok(Preparation::Skipped(SkipReason::NoOsVolume));
        };

        let volume = self.validator.validate(&os_volume.source)?;
        let bundle_dir = bundle.dir().to_path_buf();
        let config_path = bundle.config_path().to_path_buf();
        let mut spec = bundle.into_spec()?;
        let original_root = OriginalRoot::from_spec(&spec, &bundle_dir)?;

        tracing::info!(
            strategy = %self.strategy,
            volume = %volume.resolved.display(),
            original_root = %original_root.declared.display(),
            "Preparing stateful rootfs"
        );

        let (new_root, overlay) = match self.strategy {
            RootfsStrategy::Overlay => {
                let lower = original_root
                    .absolute
                    .canonicalize()
                    .unwrap_or_else(|_| original_root.absolute.clone());
                let layout = OverlayLayout::new(lower, &volume.resolved);

                // Render first so nothing is mounted for a spec we cannot write.
                rewrite::apply_overlay(&mut spec, &original_root, &layout, &volume)?;
                let contents = rewrite::serialize(&spec)?;

                let merged = self.overlay.setup(&layout)?;
                if let Err(e) = rewrite::write_spec(&config_path, &contents) {
                    self.overlay.teardown(&merged);
                    return Err(e.into());
                }
                (merged, Some(layout))
            }
            RootfsStrategy::RootSwap => {
                rewrite::apply_root_swap(&mut spec, &original_root, &volume)?;
                let contents = rewrite::serialize(&spec)?;
                rewrite::write_spec(&config_path, &contents)?;
                (volume.resolved.clone(), None)
            }
        };

        tracing::info!(
            root = %new_root.display(),
            poststop_hooks = rewrite::poststop_len(&spec),
            "Successfully modified config.json for OS volume"
        );

        Ok(Preparation::Rewritten(RewriteSummary {
            strategy: self.strategy,
            config_path,
            original_root,
            new_root,
            volume,
            overlay,
        }))
    }
}
