//! Hardware planes and their buffer slots

use drm::control::{crtc, plane, property};
use drm_fourcc::DrmFourcc;
use smallvec::SmallVec;
use tracing::debug;

use super::{buffer::BufferHandle, device::PlaneInfo, error::Error};
use crate::utils::{Buffer, Coordinate, Physical, Rectangle};

/// Distance between the zpos of two overlays adjacent in the view list
pub const ZPOS_PADDING: u64 = 10;
/// Alpha property value of a fully opaque overlay
pub const MAX_ALPHA: u64 = 255;

/// The kind of a hardware plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    /// The plane the crtc scans out its framebuffer from
    Primary,
    /// The hardware cursor
    Cursor,
    /// Any other plane, sometimes called sprite
    Overlay,
}

#[inline]
pub(crate) fn to_fixed<N: Coordinate>(n: N) -> u32 {
    f64::round(n.to_f64() * (1 << 16) as f64) as u32
}

/// A source rectangle in 16.16 fixed point, as consumed by the kernel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedRect {
    /// horizontal offset
    pub x: u32,
    /// vertical offset
    pub y: u32,
    /// width
    pub w: u32,
    /// height
    pub h: u32,
}

impl FixedRect {
    /// Convert a buffer-space rectangle
    pub fn from_rect(rect: Rectangle<f64, Buffer>) -> Self {
        FixedRect {
            x: to_fixed(rect.loc.x),
            y: to_fixed(rect.loc.y),
            w: to_fixed(rect.size.w),
            h: to_fixed(rect.size.h),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PlaneProperty {
    FbId,
    CrtcId,
    SrcX,
    SrcY,
    SrcW,
    SrcH,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    Zpos,
    Alpha,
}

const PROPERTY_COUNT: usize = 12;

impl PlaneProperty {
    pub(crate) const ALL: [PlaneProperty; PROPERTY_COUNT] = [
        PlaneProperty::FbId,
        PlaneProperty::CrtcId,
        PlaneProperty::SrcX,
        PlaneProperty::SrcY,
        PlaneProperty::SrcW,
        PlaneProperty::SrcH,
        PlaneProperty::CrtcX,
        PlaneProperty::CrtcY,
        PlaneProperty::CrtcW,
        PlaneProperty::CrtcH,
        PlaneProperty::Zpos,
        PlaneProperty::Alpha,
    ];

    const GEOMETRY: [PlaneProperty; 10] = [
        PlaneProperty::FbId,
        PlaneProperty::CrtcId,
        PlaneProperty::SrcX,
        PlaneProperty::SrcY,
        PlaneProperty::SrcW,
        PlaneProperty::SrcH,
        PlaneProperty::CrtcX,
        PlaneProperty::CrtcY,
        PlaneProperty::CrtcW,
        PlaneProperty::CrtcH,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            PlaneProperty::FbId => "FB_ID",
            PlaneProperty::CrtcId => "CRTC_ID",
            PlaneProperty::SrcX => "SRC_X",
            PlaneProperty::SrcY => "SRC_Y",
            PlaneProperty::SrcW => "SRC_W",
            PlaneProperty::SrcH => "SRC_H",
            PlaneProperty::CrtcX => "CRTC_X",
            PlaneProperty::CrtcY => "CRTC_Y",
            PlaneProperty::CrtcW => "CRTC_W",
            PlaneProperty::CrtcH => "CRTC_H",
            PlaneProperty::Zpos => "zpos",
            PlaneProperty::Alpha => "alpha",
        }
    }

    pub(crate) fn is_geometry(self) -> bool {
        PlaneProperty::GEOMETRY.contains(&self)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Property handles of a plane, looked up once by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PlaneProperties {
    handles: [Option<property::Handle>; PROPERTY_COUNT],
    initial: [u64; PROPERTY_COUNT],
    valid: u32,
}

impl PlaneProperties {
    pub(crate) fn from_info(info: &PlaneInfo) -> Self {
        let mut props = PlaneProperties::default();
        for prop in PlaneProperty::ALL {
            if let Some(found) = info.properties.iter().find(|p| p.name == prop.name()) {
                props.handles[prop.index()] = Some(found.handle);
                props.initial[prop.index()] = found.value;
                props.valid |= 1 << prop.index();
            }
        }
        props
    }

    pub(crate) fn is_valid(&self, prop: PlaneProperty) -> bool {
        self.valid & (1 << prop.index()) != 0
    }

    pub(crate) fn handle(&self, prop: PlaneProperty) -> Option<property::Handle> {
        self.handles[prop.index()]
    }

    fn initial(&self, prop: PlaneProperty) -> Option<u64> {
        self.is_valid(prop).then(|| self.initial[prop.index()])
    }

    /// Check that every property needed to position the plane atomically is present
    pub(crate) fn check_atomic(&self, plane: plane::Handle) -> Result<(), Error> {
        match PlaneProperty::GEOMETRY.iter().find(|prop| !self.is_valid(**prop)) {
            Some(missing) => Err(Error::UnknownProperty {
                handle: plane,
                name: missing.name(),
            }),
            None => Ok(()),
        }
    }
}

/// The `current` and `pending` buffer of a plane
///
/// The current buffer only leaves the slots once the kernel confirmed a successor
/// ([`PlaneSlots::complete`]) or the plane was disabled ([`PlaneSlots::clear`]).
#[derive(Debug, Default)]
pub(crate) struct PlaneSlots {
    current: Option<BufferHandle>,
    pending: Option<BufferHandle>,
    in_flight: bool,
}

impl PlaneSlots {
    pub(crate) fn current(&self) -> Option<&BufferHandle> {
        self.current.as_ref()
    }

    pub(crate) fn pending(&self) -> Option<&BufferHandle> {
        self.pending.as_ref()
    }

    /// The buffer the next commit should show
    pub(crate) fn latest(&self) -> Option<&BufferHandle> {
        self.pending.as_ref().or(self.current.as_ref())
    }

    /// Stage a buffer for the next commit, replacing any uncommitted one
    ///
    /// Rejected while a commit is waiting for confirmation.
    pub(crate) fn stage(&mut self, buffer: BufferHandle) -> Result<(), BufferHandle> {
        if self.in_flight {
            return Err(buffer);
        }
        self.pending = Some(buffer);
        Ok(())
    }

    pub(crate) fn commit_started(&mut self) {
        self.in_flight = true;
    }

    /// The kernel confirmed the commit, the pending buffer becomes current
    pub(crate) fn complete(&mut self) {
        self.in_flight = false;
        if let Some(pending) = self.pending.take() {
            self.current = Some(pending);
        }
    }

    /// Drop a staged buffer that was never committed
    pub(crate) fn discard(&mut self) {
        if !self.in_flight {
            self.pending = None;
        }
    }

    /// The commit was rejected, drop the pending buffer
    pub(crate) fn abort(&mut self) {
        self.in_flight = false;
        self.pending = None;
    }

    /// The plane no longer scans out anything
    pub(crate) fn clear(&mut self) {
        self.in_flight = false;
        self.pending = None;
        self.current = None;
    }
}

/// An overlay plane and the state last committed to it
#[derive(Debug)]
pub struct OverlayPlane {
    pub(crate) handle: plane::Handle,
    pub(crate) possible_crtcs: SmallVec<[crtc::Handle; 4]>,
    pub(crate) formats: Vec<DrmFourcc>,
    pub(crate) props: PlaneProperties,
    pub(crate) slots: PlaneSlots,
    pub(crate) src: FixedRect,
    pub(crate) dst: Rectangle<i32, Physical>,
    pub(crate) zpos: u64,
    pub(crate) alpha: u64,
    /// geometry or buffer changed since the last successful commit
    pub(crate) update: bool,
    /// the renderer prepared an atomic flip for the staged buffer
    pub(crate) atomic_ready: bool,
    /// crtc that assigned a surface to this plane in the current frame
    pub(crate) claim: Option<crtc::Handle>,
    /// crtc the plane is enabled on
    pub(crate) bound: Option<crtc::Handle>,
    /// crtc whose vblank confirms the last commit
    pub(crate) vblank: Option<crtc::Handle>,
    pub(crate) committed: [Option<u64>; PROPERTY_COUNT],
}

impl OverlayPlane {
    pub(crate) fn new(info: PlaneInfo) -> Self {
        let props = PlaneProperties::from_info(&info);
        let zpos = props.initial(PlaneProperty::Zpos).unwrap_or(0);
        let alpha = props.initial(PlaneProperty::Alpha).unwrap_or(MAX_ALPHA);
        debug!(plane = ?info.handle, zpos, alpha, formats = info.formats.len(), "found overlay plane");
        OverlayPlane {
            handle: info.handle,
            possible_crtcs: info.possible_crtcs,
            formats: info.formats,
            props,
            slots: PlaneSlots::default(),
            src: FixedRect::default(),
            dst: Rectangle::default(),
            zpos,
            alpha,
            update: true,
            atomic_ready: false,
            claim: None,
            bound: None,
            vblank: None,
            committed: [None; PROPERTY_COUNT],
        }
    }

    /// Kernel handle of the plane
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// Crtcs the plane can be attached to
    pub fn possible_crtcs(&self) -> &[crtc::Handle] {
        &self.possible_crtcs
    }

    /// Whether the plane can scan out `format`
    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&format)
    }

    /// Crtc the plane is currently enabled on
    pub fn bound_crtc(&self) -> Option<crtc::Handle> {
        self.bound
    }

    /// Whether the last commit still waits for its vblank
    pub fn is_busy(&self) -> bool {
        self.vblank.is_some()
    }

    /// Destination on the crtc
    pub fn dst(&self) -> Rectangle<i32, Physical> {
        self.dst
    }

    /// Source in the buffer, 16.16 fixed point
    pub fn src(&self) -> FixedRect {
        self.src
    }

    /// Stacking position, meaningful only if the plane has a `zpos` property
    pub fn zpos(&self) -> Option<u64> {
        self.props.is_valid(PlaneProperty::Zpos).then_some(self.zpos)
    }

    /// Opacity, meaningful only if the plane has an `alpha` property
    pub fn alpha(&self) -> Option<u64> {
        self.props.is_valid(PlaneProperty::Alpha).then_some(self.alpha)
    }

    /// Whether the next commit has to touch this plane
    pub fn needs_update(&self) -> bool {
        self.update
    }

    /// Whether `crtc` may assign a surface to this plane in the current frame
    pub(crate) fn available_for(&self, crtc: crtc::Handle) -> bool {
        self.possible_crtcs.contains(&crtc)
            && self.claim.is_none()
            && self.vblank.is_none()
            && self.bound.map_or(true, |bound| bound == crtc)
    }

    /// Values of every property the plane has, for a commit showing `fb` on `crtc`
    ///
    /// Without a framebuffer the plane is detached from the crtc as well.
    pub(crate) fn property_values(
        &self,
        crtc: crtc::Handle,
        fb: Option<drm::control::framebuffer::Handle>,
    ) -> SmallVec<[(PlaneProperty, u64); PROPERTY_COUNT]> {
        let value = |prop: PlaneProperty| -> u64 {
            match prop {
                PlaneProperty::FbId => fb.map(|fb| u32::from(fb) as u64).unwrap_or(0),
                PlaneProperty::CrtcId => fb.map(|_| u32::from(crtc) as u64).unwrap_or(0),
                PlaneProperty::SrcX => self.src.x as u64,
                PlaneProperty::SrcY => self.src.y as u64,
                PlaneProperty::SrcW => self.src.w as u64,
                PlaneProperty::SrcH => self.src.h as u64,
                PlaneProperty::CrtcX => self.dst.loc.x as i64 as u64,
                PlaneProperty::CrtcY => self.dst.loc.y as i64 as u64,
                PlaneProperty::CrtcW => self.dst.size.w as u64,
                PlaneProperty::CrtcH => self.dst.size.h as u64,
                PlaneProperty::Zpos => self.zpos,
                PlaneProperty::Alpha => self.alpha,
            }
        };
        PlaneProperty::ALL
            .iter()
            .filter(|prop| self.props.is_valid(**prop))
            .map(|prop| (*prop, value(*prop)))
            .collect()
    }

    /// Like [`OverlayPlane::property_values`], minus what the kernel already has
    pub(crate) fn changed_properties(
        &self,
        crtc: crtc::Handle,
        fb: Option<drm::control::framebuffer::Handle>,
    ) -> SmallVec<[(PlaneProperty, u64); PROPERTY_COUNT]> {
        self.property_values(crtc, fb)
            .into_iter()
            .filter(|(prop, value)| self.committed[prop.index()] != Some(*value))
            .collect()
    }

    pub(crate) fn record_committed(&mut self, values: &[(PlaneProperty, u64)]) {
        for (prop, value) in values {
            self.committed[prop.index()] = Some(*value);
        }
    }

    /// Forget everything committed, after the plane was switched off
    pub(crate) fn reset(&mut self) {
        self.slots.clear();
        self.src = FixedRect::default();
        self.dst = Rectangle::default();
        self.update = true;
        self.atomic_ready = false;
        self.claim = None;
        self.bound = None;
        self.vblank = None;
        self.committed = [None; PROPERTY_COUNT];
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drm_fourcc::DrmFourcc;

    use super::{to_fixed, FixedRect, OverlayPlane, PlaneKind, PlaneProperty, PlaneSlots};
    use crate::{
        backend::drm::{device::PlaneInfo, BufferHandle, Error, FramebufferLimits},
        testing::{handle, plane_properties, MockDevice},
        utils::{Buffer, Rectangle},
    };

    #[test]
    fn test_fixed_point() {
        let geometry: Rectangle<f64, Buffer> = Rectangle::new((0.0, 0.0).into(), (1920.0, 1080.0).into());
        let fixed = to_fixed(geometry.size.w) as u64;
        assert_eq!(125829120, fixed);
    }

    #[test]
    fn test_fractional_fixed_point() {
        let geometry: Rectangle<f64, Buffer> = Rectangle::new((0.0, 0.0).into(), (1920.1, 1080.0).into());
        let fixed = to_fixed(geometry.size.w) as u64;
        assert_eq!(125835674, fixed);
        assert_eq!(FixedRect::from_rect(geometry).h, 1080 << 16);
    }

    fn overlay(with_zpos: bool) -> OverlayPlane {
        OverlayPlane::new(PlaneInfo {
            handle: handle(40),
            kind: PlaneKind::Overlay,
            possible_crtcs: [handle(31), handle(32)].into_iter().collect(),
            formats: vec![DrmFourcc::Xrgb8888],
            properties: plane_properties(100, with_zpos, with_zpos),
        })
    }

    #[test]
    fn property_cache_tracks_validity() {
        let plane = overlay(false);
        assert!(plane.props.is_valid(PlaneProperty::SrcX));
        assert!(!plane.props.is_valid(PlaneProperty::Zpos));
        assert_eq!(plane.zpos(), None);
        assert!(plane.props.check_atomic(plane.handle()).is_ok());

        let plane = overlay(true);
        assert_eq!(plane.zpos(), Some(0));
        assert_eq!(plane.alpha(), Some(super::MAX_ALPHA));
        assert_eq!(plane.property_values(handle(31), None).len(), 12);
    }

    #[test]
    fn missing_geometry_property_is_reported() {
        let mut info = PlaneInfo {
            handle: handle(41),
            kind: PlaneKind::Overlay,
            possible_crtcs: Default::default(),
            formats: vec![],
            properties: plane_properties(100, false, false),
        };
        info.properties.retain(|p| p.name != "CRTC_W");
        let plane = OverlayPlane::new(info);

        assert!(matches!(
            plane.props.check_atomic(plane.handle()),
            Err(Error::UnknownProperty { name: "CRTC_W", .. })
        ));
    }

    #[test]
    fn only_changed_properties_are_resent() {
        let mut plane = overlay(true);
        plane.dst = Rectangle::new((10, 10).into(), (100, 100).into());
        let all = plane.changed_properties(handle(31), None);
        plane.record_committed(&all);
        assert!(plane.changed_properties(handle(31), None).is_empty());

        plane.dst.loc.x = 20;
        let changed = plane.changed_properties(handle(31), None);
        assert_eq!(changed.as_slice(), &[(PlaneProperty::CrtcX, 20)]);

        plane.reset();
        assert_eq!(plane.changed_properties(handle(31), None).len(), 12);
    }

    #[test]
    fn busy_or_foreign_planes_are_unavailable() {
        let mut plane = overlay(false);
        assert!(plane.available_for(handle(31)));
        assert!(!plane.available_for(handle(33)));

        plane.bound = Some(handle(32));
        assert!(!plane.available_for(handle(31)));

        plane.bound = Some(handle(31));
        plane.vblank = Some(handle(31));
        assert!(!plane.available_for(handle(31)));
    }

    #[test]
    fn slots_hold_current_until_confirmed() {
        let mock = Arc::new(MockDevice::new(Default::default()));
        let mut limits = FramebufferLimits {
            min: (1, 1).into(),
            max: (4096, 4096).into(),
            addfb2: true,
        };
        let mut dumb = |w: u32| BufferHandle::dumb(mock.clone(), &mut limits, (w, w).into(), DrmFourcc::Xrgb8888).unwrap();
        let mut slots = PlaneSlots::default();

        slots.stage(dumb(64)).unwrap();
        slots.commit_started();
        assert!(slots.stage(dumb(32)).is_err());
        assert_eq!(mock.live_framebuffers(), 1);

        slots.complete();
        assert!(slots.current().is_some());
        slots.stage(dumb(16)).unwrap();
        slots.commit_started();
        slots.complete();
        assert_eq!(slots.current().unwrap().size(), (16, 16).into());
        assert_eq!(mock.live_framebuffers(), 1);

        slots.stage(dumb(8)).unwrap();
        slots.abort();
        assert_eq!(slots.latest().unwrap().size(), (16, 16).into());

        slots.clear();
        assert_eq!(mock.live_framebuffers(), 0);
    }
}
