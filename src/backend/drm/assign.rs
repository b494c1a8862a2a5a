//! Per frame assignment of scene surfaces to hardware planes
//!
//! The scene is walked from the topmost surface down. Every surface ends up in exactly one
//! place, tried in this order:
//!
//! 1. composited, if it overlaps anything composited above it,
//! 2. the cursor plane,
//! 3. the primary plane, by scanning out its buffer directly,
//! 4. the overlay plane associated with the surface,
//! 5. composited by the renderer.
//!
//! Failing a check is never an error, the surface just moves on to the next option.

use std::{collections::HashMap, sync::Arc};

use drm::control::plane;
use drm_fourcc::DrmFourcc;
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{
    buffer::{BufferHandle, BufferObject, BufferOwner, BufferSource, ClientBufferId, FramebufferLimits},
    config::{BackendConfig, DebugFlags, RendererKind},
    cursor::CursorUpdate,
    device::KmsDevice,
    output::Output,
    plane::{FixedRect, OverlayPlane, PlaneProperty, MAX_ALPHA, ZPOS_PADDING},
    OutputId, PresentationFlags,
};
use crate::utils::{Buffer, Logical, Physical, Rectangle, Region, Size, Transform};

/// Identity of a surface of the compositor's scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Where the pixels of a client buffer live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferStorage {
    /// Shared memory, only readable by the cpu
    Shm,
    /// A gpu buffer that can be imported as a buffer object
    Native,
}

/// The buffer attached to a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceBuffer {
    /// Identity of the client buffer
    pub id: ClientBufferId,
    /// Where the buffer lives
    pub storage: BufferStorage,
    /// Pixel format
    pub format: DrmFourcc,
    /// Dimensions in pixels
    pub size: Size<i32, Buffer>,
    /// Scale the client rendered the buffer at
    pub scale: i32,
    /// Transform the client rendered the buffer with
    pub transform: Transform,
}

/// The 2d transformation applied to a surface on top of its position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewTransform {
    /// Shown as is
    #[default]
    None,
    /// Only moved around
    Translate,
    /// Scaled, possibly moved, but axis aligned
    Scale,
    /// Rotated or skewed
    Rotate,
}

impl ViewTransform {
    fn is_translation(self) -> bool {
        matches!(self, ViewTransform::None | ViewTransform::Translate)
    }
}

/// A surface of the scene, as the compositor sees it for this frame
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSurface {
    /// Identity of the surface
    pub id: SurfaceId,
    /// Bounding box in compositor space
    pub geometry: Rectangle<i32, Logical>,
    /// Transformation on top of the position
    pub transform: ViewTransform,
    /// Opacity of the whole surface, `1.0` is opaque
    pub alpha: f32,
    /// Outputs the surface is visible on
    pub outputs: SmallVec<[OutputId; 2]>,
    /// Clip applied to the surface in compositor space
    pub scissor: Option<Rectangle<i32, Logical>>,
    /// The opaque region of the surface covers all of it
    pub opaque: bool,
    /// Damage since the last frame, in compositor space
    pub damage: Vec<Rectangle<i32, Logical>>,
    /// The attached buffer
    pub buffer: Option<SurfaceBuffer>,
}

impl SceneSurface {
    /// A fully damaged, untransformed and opaque-alpha surface without a buffer
    pub fn new(id: SurfaceId, geometry: Rectangle<i32, Logical>) -> Self {
        SceneSurface {
            id,
            geometry,
            transform: ViewTransform::None,
            alpha: 1.0,
            outputs: SmallVec::new(),
            scissor: None,
            opaque: false,
            damage: vec![geometry],
            buffer: None,
        }
    }

    /// Attach a buffer
    pub fn with_buffer(mut self, buffer: SurfaceBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Mark the surface as visible on `output`
    pub fn on_output(mut self, output: OutputId) -> Self {
        if !self.outputs.contains(&output) {
            self.outputs.push(output);
        }
        self
    }

    /// Mark the whole surface as opaque
    pub fn opaque(mut self) -> Self {
        self.opaque = true;
        self
    }

    /// Set the view transformation
    pub fn with_transform(mut self, transform: ViewTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Set the opacity
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Replace the damage
    pub fn with_damage(mut self, damage: Vec<Rectangle<i32, Logical>>) -> Self {
        self.damage = damage;
        self
    }

    /// Clip the surface
    pub fn with_scissor(mut self, scissor: Rectangle<i32, Logical>) -> Self {
        self.scissor = Some(scissor);
        self
    }
}

/// Access to client buffer contents, provided by the renderer
pub trait ScanoutSource {
    /// Import `buffer` as a buffer object that can be scanned out
    ///
    /// The returned owner gets the buffer object back once it is no longer used.
    fn import(
        &mut self,
        surface: &SceneSurface,
        buffer: &SurfaceBuffer,
    ) -> Option<(BufferObject, Box<dyn BufferOwner>)>;

    /// Copy the shared memory `buffer` into `dst`, rows of `stride` bytes of ARGB8888
    fn copy_cursor(&mut self, surface: &SceneSurface, buffer: &SurfaceBuffer, dst: &mut [u8], stride: u32)
        -> bool;

    /// Make sure the buffer imported for `surface` can be flipped on `plane` in an atomic commit
    fn prepare_atomic_flip(&mut self, surface: &SceneSurface, plane: plane::Handle) -> bool {
        let _ = (surface, plane);
        true
    }
}

/// Where a surface is shown this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assignment {
    /// Scanned out directly by the primary plane
    Primary,
    /// Shown on the cursor plane
    Cursor,
    /// Shown on an overlay plane
    Overlay(plane::Handle),
    /// Has to be rendered into the primary buffer
    Composited,
}

/// Assignment of a single surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceAssignment {
    /// The surface
    pub surface: SurfaceId,
    /// Where it is shown
    pub target: Assignment,
    /// Presentation flags contributed by the surface
    pub flags: PresentationFlags,
    /// The buffer may be scanned out in a later frame, don't release it after compositing
    pub keep_buffer: bool,
}

/// Staged overlay state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayUpdate {
    /// The overlay plane
    pub plane: plane::Handle,
    /// The surface shown on it
    pub surface: SurfaceId,
    /// Source rectangle, 16.16 fixed point
    pub src: FixedRect,
    /// Destination on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Stacking position, if the plane supports it
    pub zpos: Option<u64>,
    /// Opacity, if the plane supports it
    pub alpha: Option<u64>,
    /// The plane has to be committed again
    pub update_sprite: bool,
}

/// Result of [`KmsBackend::assign_planes`](super::KmsBackend::assign_planes)
#[derive(Debug)]
pub struct PlaneAssignment {
    /// The output the scene was assigned for
    pub output: OutputId,
    /// Per surface result, in scene order. Surfaces not on the output are left out.
    pub surfaces: Vec<SurfaceAssignment>,
    /// Overlay planes used this frame
    pub overlays: Vec<OverlayUpdate>,
    /// Damage the renderer has to repaint in the primary buffer, in crtc coordinates
    pub primary_damage: Region<i32, Physical>,
}

impl PlaneAssignment {
    /// Where `surface` ended up
    pub fn target(&self, surface: SurfaceId) -> Option<Assignment> {
        self.surfaces.iter().find(|s| s.surface == surface).map(|s| s.target)
    }

    /// Surfaces the renderer has to composite, in scene order
    pub fn composited(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.surfaces
            .iter()
            .filter(|s| s.target == Assignment::Composited)
            .map(|s| s.surface)
    }

    /// A client buffer was staged for direct scanout, no rendering is needed
    pub fn is_direct_scanout(&self) -> bool {
        self.surfaces.iter().any(|s| s.target == Assignment::Primary)
    }
}

/// Everything outside the output the assignment reads or stages into
pub(crate) struct AssignContext<'a> {
    pub(crate) device: &'a Arc<dyn KmsDevice>,
    pub(crate) limits: &'a mut FramebufferLimits,
    pub(crate) config: &'a BackendConfig,
    pub(crate) atomic: bool,
    pub(crate) cursors_broken: bool,
    pub(crate) sprites_broken: bool,
    pub(crate) overlays: &'a mut IndexMap<plane::Handle, OverlayPlane>,
    pub(crate) associations: &'a HashMap<SurfaceId, plane::Handle>,
}

/// ARGB buffers whose opaque region covers them can be scanned out as XRGB
fn scanout_format(format: DrmFourcc, opaque: bool) -> DrmFourcc {
    match format {
        DrmFourcc::Argb8888 if opaque => DrmFourcc::Xrgb8888,
        format => format,
    }
}

/// The part of the buffer visible through `dst`, when all of it maps to `full`
fn source_rect(
    full: Rectangle<i32, Physical>,
    dst: Rectangle<i32, Physical>,
    buffer: Size<i32, Buffer>,
) -> Option<FixedRect> {
    if full.is_empty() || dst.is_empty() {
        return None;
    }
    let sx = buffer.w as f64 / full.size.w as f64;
    let sy = buffer.h as f64 / full.size.h as f64;
    let rect = Rectangle::<f64, Buffer>::new(
        (
            (dst.loc.x - full.loc.x) as f64 * sx,
            (dst.loc.y - full.loc.y) as f64 * sy,
        )
            .into(),
        (dst.size.w as f64 * sx, dst.size.h as f64 * sy).into(),
    );
    Some(FixedRect::from_rect(rect))
}

struct Assigner<'a, 'b> {
    ctx: AssignContext<'a>,
    output: &'b mut Output,
    source: &'b mut dyn ScanoutSource,
    cursor_taken: bool,
    scanout_taken: bool,
}

#[profiling::function]
pub(crate) fn assign_planes(
    ctx: AssignContext<'_>,
    output: &mut Output,
    scene: &[SceneSurface],
    source: &mut dyn ScanoutSource,
) -> PlaneAssignment {
    let crtc = output.crtc;

    // leftovers of an assignment that was never submitted
    output.primary.discard();
    for plane in ctx.overlays.values_mut() {
        if plane.claim == Some(crtc) {
            plane.claim = None;
            plane.slots.discard();
        }
    }

    let mut assigner = Assigner {
        ctx,
        output,
        source,
        cursor_taken: false,
        scanout_taken: false,
    };
    let mut result = PlaneAssignment {
        output: assigner.output.id,
        surfaces: Vec::with_capacity(scene.len()),
        overlays: Vec::new(),
        primary_damage: Region::new(),
    };
    let mut overlap = Region::<i32, Logical>::new();
    let area = assigner.output.geometry();

    for (idx, surface) in scene.iter().enumerate() {
        if !surface.outputs.contains(&result.output) {
            continue;
        }
        let zpos = (scene.len() - idx) as u64 * ZPOS_PADDING;

        let target = if overlap.overlaps(surface.geometry) {
            Assignment::Composited
        } else if assigner.try_cursor(surface) {
            Assignment::Cursor
        } else if assigner.try_scanout(surface) {
            Assignment::Primary
        } else if let Some(update) = assigner.try_overlay(surface, zpos) {
            result.overlays.push(update);
            Assignment::Overlay(update.plane)
        } else {
            Assignment::Composited
        };

        if target == Assignment::Composited {
            overlap.add(surface.geometry);
            for damage in surface.damage.iter().filter_map(|d| d.intersection(area)) {
                result.primary_damage.add(assigner.output.to_crtc(damage));
            }
        }

        let flags = match target {
            Assignment::Primary | Assignment::Overlay(_) => PresentationFlags::ZERO_COPY,
            Assignment::Cursor | Assignment::Composited => PresentationFlags::empty(),
        };
        let keep_buffer = surface.buffer.as_ref().map_or(false, |buffer| {
            let cursor = assigner.output.cursor.size();
            buffer.storage == BufferStorage::Native
                || (buffer.size.w <= cursor.w as i32 && buffer.size.h <= cursor.h as i32)
                || assigner.ctx.config.renderer == RendererKind::Pixman
        });

        trace!(surface = ?surface.id, ?target, "assigned");
        result.surfaces.push(SurfaceAssignment {
            surface: surface.id,
            target,
            flags,
            keep_buffer,
        });
    }

    if !assigner.cursor_taken {
        assigner.output.cursor.stage(CursorUpdate::Hide);
    }

    // overlays about to be switched off reveal whatever the primary plane shows below them
    for plane in assigner.ctx.overlays.values() {
        if plane.bound == Some(crtc) && plane.claim.is_none() {
            result.primary_damage.add(plane.dst);
        }
    }

    assigner.output.frame_assigned = true;
    result
}

impl<'a, 'b> Assigner<'a, 'b> {
    fn acquire(&mut self, surface: &SceneSurface, buffer: &SurfaceBuffer, format: DrmFourcc) -> Option<BufferHandle> {
        let (bo, owner) = self.source.import(surface, buffer)?;
        BufferHandle::acquire(
            self.ctx.device.clone(),
            self.ctx.limits,
            bo,
            format,
            BufferSource::ClientImported { id: buffer.id, owner },
        )
        .map_err(|err| debug!(surface = ?surface.id, "failed to import client buffer: {}", err))
        .ok()
    }

    fn try_cursor(&mut self, surface: &SceneSurface) -> bool {
        if self.cursor_taken
            || self.ctx.cursors_broken
            || self.ctx.config.debug.contains(DebugFlags::DISABLE_CURSORS)
        {
            return false;
        }
        let Some(buffer) = surface.buffer.as_ref() else {
            return false;
        };
        let output = &mut *self.output;
        let size = output.cursor.size();
        if surface.outputs.len() != 1
            || surface.scissor.is_some()
            || output.transform != Transform::Normal
            || buffer.scale != output.scale
            || !surface.transform.is_translation()
            || buffer.storage != BufferStorage::Shm
            || buffer.format != DrmFourcc::Argb8888
            || buffer.size.w > size.w as i32
            || buffer.size.h > size.h as i32
        {
            return false;
        }

        let image = if !surface.damage.is_empty() || !output.cursor.has_image() {
            let mut image = output.cursor.staging_area();
            if !self
                .source
                .copy_cursor(surface, buffer, &mut image, output.cursor.stride())
            {
                return false;
            }
            Some(image)
        } else {
            None
        };

        let position = output.to_crtc(surface.geometry).loc;
        output.cursor.stage(CursorUpdate::Show { position, image });
        self.cursor_taken = true;
        true
    }

    fn try_scanout(&mut self, surface: &SceneSurface) -> bool {
        if self.scanout_taken || self.ctx.config.renderer == RendererKind::Pixman {
            return false;
        }
        let Some(buffer) = surface.buffer.as_ref() else {
            return false;
        };
        let mode = self.output.mode_size();
        if buffer.storage == BufferStorage::Shm
            || surface.alpha < 1.0
            || surface.scissor.is_some()
            || !surface.transform.is_translation()
            || surface.geometry != self.output.geometry()
            || buffer.transform != self.output.transform
            || buffer.scale != self.output.scale
            || (buffer.size.w, buffer.size.h) != (mode.w, mode.h)
        {
            return false;
        }

        let format = scanout_format(buffer.format, surface.opaque);
        if format != self.output.format {
            trace!(surface = ?surface.id, ?format, "format unsuitable for scanout");
            return false;
        }

        let Some(handle) = self.acquire(surface, buffer, format) else {
            return false;
        };
        if self.output.primary.stage(handle).is_err() {
            return false;
        }
        self.scanout_taken = true;
        true
    }

    fn try_overlay(&mut self, surface: &SceneSurface, zpos: u64) -> Option<OverlayUpdate> {
        if self.ctx.sprites_broken
            || self.ctx.config.debug.contains(DebugFlags::DISABLE_OVERLAYS)
            || self.ctx.config.renderer == RendererKind::Pixman
        {
            return None;
        }
        let handle = *self.ctx.associations.get(&surface.id)?;
        let buffer = surface.buffer.as_ref()?;
        if buffer.storage == BufferStorage::Shm
            || surface.outputs.len() != 1
            || surface.transform == ViewTransform::Rotate
            || buffer.transform != self.output.transform
            || buffer.scale != self.output.scale
        {
            return None;
        }

        let crtc = self.output.crtc;
        let atomic = self.ctx.atomic;
        let plane = self.ctx.overlays.get(&handle)?;
        if !plane.available_for(crtc) || (atomic && plane.props.check_atomic(handle).is_err()) {
            return None;
        }

        let alpha = if plane.props.is_valid(PlaneProperty::Alpha) {
            (MAX_ALPHA as f32 * surface.alpha.clamp(0.0, 1.0)).round() as u64
        } else if surface.alpha < 1.0 {
            return None;
        } else {
            MAX_ALPHA
        };
        let format = scanout_format(buffer.format, surface.opaque);
        if !plane.supports_format(format) {
            return None;
        }

        let mut visible = surface.geometry.intersection(self.output.geometry())?;
        if let Some(scissor) = surface.scissor {
            visible = visible.intersection(scissor)?;
        }
        let dst = self.output.to_crtc(visible);
        let src = source_rect(self.output.to_crtc(surface.geometry), dst, buffer.size)?;

        let reuse = plane.slots.latest().and_then(BufferHandle::client_id) == Some(buffer.id);
        let imported = if reuse {
            None
        } else {
            Some(self.acquire(surface, buffer, format)?)
        };
        let atomic_ready = imported.is_some() && atomic && self.source.prepare_atomic_flip(surface, handle);

        let plane = self.ctx.overlays.get_mut(&handle)?;
        if let Some(imported) = imported {
            plane.slots.stage(imported).ok()?;
            plane.atomic_ready = atomic_ready;
            plane.update = true;
        }
        if plane.src != src || plane.dst != dst {
            plane.src = src;
            plane.dst = dst;
            plane.update = true;
        }
        if plane.props.is_valid(PlaneProperty::Zpos) && plane.zpos != zpos {
            plane.zpos = zpos;
            plane.update = true;
        }
        if plane.props.is_valid(PlaneProperty::Alpha) && plane.alpha != alpha {
            plane.alpha = alpha;
            plane.update = true;
        }

        plane.claim = Some(crtc);

        debug!(surface = ?surface.id, plane = ?handle, ?dst, update = plane.update, "assigned overlay");
        Some(OverlayUpdate {
            plane: handle,
            surface: surface.id,
            src,
            dst,
            zpos: plane.zpos(),
            alpha: plane.alpha(),
            update_sprite: plane.update,
        })
    }
}

#[cfg(test)]
mod tests {
    use drm_fourcc::DrmFourcc;

    use super::{scanout_format, source_rect};
    use crate::{backend::drm::FixedRect, utils::Rectangle};

    #[test]
    fn opaque_argb_scans_out_as_xrgb() {
        assert_eq!(scanout_format(DrmFourcc::Argb8888, true), DrmFourcc::Xrgb8888);
        assert_eq!(scanout_format(DrmFourcc::Argb8888, false), DrmFourcc::Argb8888);
        assert_eq!(scanout_format(DrmFourcc::Nv12, true), DrmFourcc::Nv12);
    }

    #[test]
    fn clipped_overlay_samples_visible_part() {
        // surface hanging 100px off the left edge, buffer at twice the resolution
        let full = Rectangle::new((-100, 0).into(), (400, 300).into());
        let dst = Rectangle::new((0, 0).into(), (300, 300).into());

        assert_eq!(
            source_rect(full, dst, (800, 600).into()),
            Some(FixedRect {
                x: 200 << 16,
                y: 0,
                w: 600 << 16,
                h: 600 << 16,
            })
        );
        assert_eq!(source_rect(full, Rectangle::default(), (800, 600).into()), None);
    }
}
