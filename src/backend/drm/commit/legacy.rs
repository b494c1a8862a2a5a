use drm::control::{crtc, framebuffer};
use smallvec::SmallVec;
use tracing::trace;

use super::CommitStrategy;
use crate::{
    backend::drm::{
        device::KmsDevice,
        error::CommitError,
        plane::{FixedRect, OverlayPlane},
    },
    utils::Rectangle,
};

/// Commits overlays through `SetPlane`, one plane per call
///
/// Stacking and opacity cannot be expressed this way and are left as the kernel has them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyCommit;

impl CommitStrategy for LegacyCommit {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn is_atomic(&self) -> bool {
        false
    }

    #[profiling::function]
    fn commit_overlay(
        &self,
        device: &dyn KmsDevice,
        crtc: crtc::Handle,
        plane: &mut OverlayPlane,
        fb: Option<framebuffer::Handle>,
    ) -> Result<(), CommitError> {
        trace!(plane = ?plane.handle, ?crtc, ?fb, dst = ?plane.dst, src = ?plane.src, "set plane");
        device
            .set_plane(plane.handle, crtc, fb, plane.dst, plane.src)
            .map_err(|source| CommitError {
                plane: plane.handle,
                property: None,
                source,
            })?;

        let values: SmallVec<[_; 12]> = plane
            .property_values(crtc, fb)
            .into_iter()
            .filter(|(prop, _)| prop.is_geometry())
            .collect();
        plane.record_committed(&values);
        Ok(())
    }

    fn disable_overlay(
        &self,
        device: &dyn KmsDevice,
        crtc: crtc::Handle,
        plane: &mut OverlayPlane,
    ) -> Result<(), CommitError> {
        trace!(plane = ?plane.handle, ?crtc, "disabling plane");
        device
            .set_plane(plane.handle, crtc, None, Rectangle::default(), FixedRect::default())
            .map_err(|source| CommitError {
                plane: plane.handle,
                property: None,
                source,
            })
    }
}
