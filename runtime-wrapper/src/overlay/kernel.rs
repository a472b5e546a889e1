//! Kernel version gate for nested overlayfs.
//!
//! containerd's snapshotter usually prepares the image rootfs on overlayfs
//! itself. Using that as our lowerdir means overlay-on-overlay, which only
//! works from 5.11 on.

use std::fmt;

use crate::constants::overlay::MIN_KERNEL;
use crate::error::OverlayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    /// Parse the leading `major.minor` of a release string such as
    /// `5.15.0-91-generic` or `6.8.0-rc3`.
    pub fn parse(release: &str) -> Result<Self, OverlayError> {
        let bad = || OverlayError::KernelParse(release.to_string());

        let (major, rest) = release.trim().split_once('.').ok_or_else(bad)?;
        let major = major.parse::<u32>().map_err(|_| bad())?;

        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .map_or(rest, |end| &rest[..end]);
        let minor = digits.parse::<u32>().map_err(|_| bad())?;

        Ok(Self { major, minor })
    }

    /// Release string of the running kernel.
    pub fn host_release() -> Result<String, OverlayError> {
        let uts = nix::sys::utsname::uname().map_err(OverlayError::Uname)?;
        Ok(uts.release().to_string_lossy().into_owned())
    }

    pub fn supports_nested_overlay(self) -> bool {
        (self.major, self.minor) >= MIN_KERNEL
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Fail unless `release` is new enough for overlay-on-overlay.
pub fn ensure_nested_overlay(release: &str) -> Result<KernelVersion, OverlayError> {
    let version = KernelVersion::parse(release)?;
    if !version.supports_nested_overlay() {
        return Err(OverlayError::KernelTooOld {
            major: version.major,
            minor: version.minor,
            release: release.to_string(),
        });
    }
    tracing::info!(release, "Kernel supports nested overlayfs");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("5.11.0", 5, 11)]
    #[case("5.15.0-91-generic", 5, 15)]
    #[case("6.1.0", 6, 1)]
    #[case("6.8.0-rc3", 6, 8)]
    #[case("5.11-rc1", 5, 11)]
    #[case("4.19.0+", 4, 19)]
    fn test_parse(#[case] release: &str, #[case] major: u32, #[case] minor: u32) {
        assert_eq!(
            KernelVersion::parse(release).unwrap(),
            KernelVersion { major, minor }
        );
    }

    #[rstest]
    #[case("")]
    #[case("5")]
    #[case("linux-5.15")]
    #[case("5.x")]
    #[case(".15")]
    #[case("v6.1.0")]
    fn test_parse_rejects_malformed(#[case] release: &str) {
        assert!(matches!(
            KernelVersion::parse(release),
            Err(OverlayError::KernelParse(_))
        ));
    }

    #[rstest]
    #[case("5.11.0")]
    #[case("5.15.0")]
    #[case("6.1.0")]
    #[case("10.0.0")]
    fn test_gate_accepts(#[case] release: &str) {
        assert!(ensure_nested_overlay(release).is_ok());
    }

    #[rstest]
    #[case("5.10.0")]
    #[case("5.4.0-150-generic")]
    #[case("4.19.0")]
    fn test_gate_rejects_old(#[case] release: &str) {
        assert!(matches!(
            ensure_nested_overlay(release),
            Err(OverlayError::KernelTooOld { .. })
        ));
    }

    #[test]
    fn test_gate_surfaces_parse_error() {
        assert!(matches!(
            ensure_nested_overlay("garbage"),
            Err(OverlayError::KernelParse(_))
        ));
    }

    #[test]
    fn test_host_release_parses() {
        let release = KernelVersion::host_release().unwrap();
        assert!(KernelVersion::parse(&release).is_ok(), "{release}");
    }
}
