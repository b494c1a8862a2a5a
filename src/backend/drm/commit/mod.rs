//! Ways of pushing overlay plane state to the kernel
//!
//! A device either takes one property at a time through the legacy `SetPlane` ioctl, or a
//! transaction of properties through an atomic commit. Which one is used is decided once,
//! when the backend is created, by [`select_strategy`].

use std::fmt;

use drm::control::{crtc, framebuffer};
use tracing::info;

use super::{device::DeviceCapabilities, device::KmsDevice, error::CommitError, plane::OverlayPlane};

mod atomic;
mod legacy;

pub use self::atomic::AtomicCommit;
pub use self::legacy::LegacyCommit;

/// Strategy committing overlay plane updates
pub trait CommitStrategy: fmt::Debug + Send {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Whether the strategy uses atomic commits
    fn is_atomic(&self) -> bool;

    /// Show `fb` on `plane` at the plane's staged geometry, stacking and opacity
    ///
    /// `None` keeps the plane attached to `crtc` without any content.
    fn commit_overlay(
        &self,
        device: &dyn KmsDevice,
        crtc: crtc::Handle,
        plane: &mut OverlayPlane,
        fb: Option<framebuffer::Handle>,
    ) -> Result<(), CommitError>;

    /// Switch `plane` off
    fn disable_overlay(
        &self,
        device: &dyn KmsDevice,
        crtc: crtc::Handle,
        plane: &mut OverlayPlane,
    ) -> Result<(), CommitError>;
}

/// Pick the commit strategy for a device
///
/// Atomic commits are used whenever the driver supports them, unless `force_legacy` is set.
pub fn select_strategy(caps: &DeviceCapabilities, force_legacy: bool) -> Box<dyn CommitStrategy> {
    if force_legacy {
        info!("Legacy commits forced by configuration");
    }

    if caps.atomic && !force_legacy {
        info!("Using atomic commits for overlay planes");
        Box::new(AtomicCommit::new())
    } else {
        info!("Falling back to legacy commits");
        Box::new(LegacyCommit)
    }
}

#[cfg(test)]
mod tests {
    use super::select_strategy;
    use crate::backend::drm::device::DeviceCapabilities;

    #[test]
    fn strategy_follows_capabilities() {
        let mut caps = DeviceCapabilities::default();
        assert!(!select_strategy(&caps, false).is_atomic());

        caps.atomic = true;
        assert!(select_strategy(&caps, false).is_atomic());
        assert_eq!(select_strategy(&caps, true).name(), "legacy");
    }
}
