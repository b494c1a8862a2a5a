use drm::control::{crtc, framebuffer, AtomicCommitFlags};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{CommitStrategy, LegacyCommit};
use crate::backend::drm::{
    device::{AtomicRequest, KmsDevice},
    error::CommitError,
    plane::{OverlayPlane, PlaneProperty},
};

/// Commits every changed property of an overlay in one atomic transaction
///
/// Planes whose content was not prepared for an atomic flip are committed through
/// [`LegacyCommit`] instead.
#[derive(Debug, Default)]
pub struct AtomicCommit {
    legacy: LegacyCommit,
}

impl AtomicCommit {
    /// Create a new atomic strategy
    pub fn new() -> Self {
        AtomicCommit::default()
    }

    fn request(plane: &OverlayPlane, values: &[(PlaneProperty, u64)]) -> AtomicRequest {
        let mut req = AtomicRequest::new();
        for (prop, value) in values {
            if let Some(handle) = plane.props.handle(*prop) {
                req.add(plane.handle, handle, *value);
            }
        }
        req
    }

    /// Test `req`, and if the driver refuses it, find the first property it refuses
    fn test(
        &self,
        device: &dyn KmsDevice,
        plane: &OverlayPlane,
        req: &AtomicRequest,
        values: &[(PlaneProperty, u64)],
    ) -> Result<(), CommitError> {
        let Err(source) = device.atomic_commit(req, AtomicCommitFlags::TEST_ONLY) else {
            return Ok(());
        };

        // grow the request one property at a time, the first failing prefix names the culprit
        let property = (1..=req.len())
            .find(|len| {
                device
                    .atomic_commit(&req.truncated(*len), AtomicCommitFlags::TEST_ONLY)
                    .is_err()
            })
            .and_then(|len| values.get(len - 1))
            .map(|(prop, _)| prop.name());

        warn!(plane = ?plane.handle, ?property, "atomic commit test failed: {}", source);
        Err(CommitError {
            plane: plane.handle,
            property,
            source,
        })
    }
}

impl CommitStrategy for AtomicCommit {
    fn name(&self) -> &'static str {
        "atomic"
    }

    fn is_atomic(&self) -> bool {
        true
    }

    #[profiling::function]
    fn commit_overlay(
        &self,
        device: &dyn KmsDevice,
        crtc: crtc::Handle,
        plane: &mut OverlayPlane,
        fb: Option<framebuffer::Handle>,
    ) -> Result<(), CommitError> {
        if !plane.atomic_ready {
            debug!(plane = ?plane.handle, "buffer not prepared for an atomic flip, using set plane");
            return self.legacy.commit_overlay(device, crtc, plane, fb);
        }

        let values: SmallVec<[_; 12]> = plane.changed_properties(crtc, fb);
        if values.is_empty() {
            trace!(plane = ?plane.handle, "no property changed");
            return Ok(());
        }

        let req = Self::request(plane, &values);
        self.test(device, plane, &req, &values)?;

        trace!(plane = ?plane.handle, ?req, "atomic commit");
        device
            .atomic_commit(&req, AtomicCommitFlags::empty())
            .map_err(|source| CommitError {
                plane: plane.handle,
                property: None,
                source,
            })?;
        plane.record_committed(&values);
        Ok(())
    }

    fn disable_overlay(
        &self,
        device: &dyn KmsDevice,
        crtc: crtc::Handle,
        plane: &mut OverlayPlane,
    ) -> Result<(), CommitError> {
        let values = [(PlaneProperty::FbId, 0), (PlaneProperty::CrtcId, 0)];
        let req = Self::request(plane, &values);
        if req.len() != values.len() {
            return self.legacy.disable_overlay(device, crtc, plane);
        }

        trace!(plane = ?plane.handle, ?crtc, "disabling plane");
        device
            .atomic_commit(&req, AtomicCommitFlags::empty())
            .map_err(|source| CommitError {
                plane: plane.handle,
                property: None,
                source,
            })?;
        plane.record_committed(&values);
        Ok(())
    }
}
