//! Per crtc state of the backend

use drm::control::{connector, crtc};
use drm_fourcc::DrmFourcc;
use tracing::Span;

use super::{
    buffer::BufferHandle, cursor::CursorState, device::SavedCrtc, mode::ModeInfo, plane::PlaneSlots,
    OutputId,
};
use crate::utils::{refresh_period, Buffer, Logical, Physical, Point, Rectangle, Size, Transform};

/// Why a page flip was queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlipKind {
    /// A new frame is being presented
    Frame,
    /// The current buffer was flipped again to learn when the next vblank happens
    Timestamp,
}

/// Presentation state of an [`Output`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputState {
    /// Ready to accept a new frame
    Idle,
    /// A frame is on its way to the screen.
    ///
    /// The state is left once the page flip and every vblank armed for the
    /// frame's overlays have completed.
    FlipPending(FlipKind),
    /// The output was destroyed while a page flip was in flight.
    ///
    /// Teardown happens once the flip completes.
    DestroyPending,
}

/// A display pipe: one crtc driving one connector
#[derive(Debug)]
pub struct Output {
    pub(crate) id: OutputId,
    pub(crate) name: String,
    pub(crate) crtc: crtc::Handle,
    pub(crate) pipe: u32,
    pub(crate) connector: connector::Handle,
    pub(crate) physical_size: (u32, u32),
    pub(crate) saved_crtc: SavedCrtc,

    pub(crate) modes: Vec<ModeInfo>,
    pub(crate) current_mode: usize,
    pub(crate) format: DrmFourcc,
    pub(crate) scale: i32,
    pub(crate) transform: Transform,
    pub(crate) position: Point<i32, Logical>,

    pub(crate) primary: PlaneSlots,
    pub(crate) cursor: CursorState,

    pub(crate) state: OutputState,
    pub(crate) flip_outstanding: bool,
    pub(crate) vblanks_pending: u32,
    /// the next frame has to go through a full mode-set
    pub(crate) modeset_needed: bool,
    pub(crate) programmed_stride: Option<u32>,
    /// `assign_planes` ran for the frame about to be submitted
    pub(crate) frame_assigned: bool,
    /// a frame submitted while another one was in flight
    pub(crate) queued: Option<BufferHandle>,
    pub(crate) msc: u64,
    pub(crate) span: Span,
}

impl Output {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: OutputId,
        name: String,
        crtc: crtc::Handle,
        pipe: u32,
        connector: connector::Handle,
        physical_size: (u32, u32),
        saved_crtc: SavedCrtc,
        modes: Vec<ModeInfo>,
        current_mode: usize,
        format: DrmFourcc,
        scale: i32,
        transform: Transform,
        position: Point<i32, Logical>,
        cursor_size: Size<u32, Buffer>,
    ) -> Self {
        let span = tracing::info_span!("kms_output", ?crtc, ?connector);
        Output {
            id,
            name,
            crtc,
            pipe,
            connector,
            physical_size,
            saved_crtc,
            modes,
            current_mode,
            format,
            scale: scale.max(1),
            transform,
            position,
            primary: PlaneSlots::default(),
            cursor: CursorState::new(cursor_size),
            state: OutputState::Idle,
            flip_outstanding: false,
            vblanks_pending: 0,
            modeset_needed: true,
            programmed_stride: None,
            frame_assigned: false,
            queued: None,
            msc: 0,
            span,
        }
    }

    /// Id of this output
    pub fn id(&self) -> OutputId {
        self.id
    }

    /// Connector name, e.g. `HDMI-A-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Crtc driving this output
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Connector of this output
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Pipe index of the crtc
    pub fn pipe(&self) -> u32 {
        self.pipe
    }

    /// Physical dimensions in millimeters
    pub fn physical_size(&self) -> (u32, u32) {
        self.physical_size
    }

    /// Every mode the output can be driven with
    pub fn modes(&self) -> &[ModeInfo] {
        &self.modes
    }

    /// The mode the output is driven with
    pub fn current_mode(&self) -> &ModeInfo {
        &self.modes[self.current_mode]
    }

    /// Framebuffer format of the primary plane
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Integer scale of the output
    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// Transform of the output
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Presentation state
    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Media stream counter, the kernel's vblank sequence extended to 64 bits
    pub fn msc(&self) -> u64 {
        self.msc
    }

    /// Duration of one refresh cycle of the current mode
    pub fn refresh_period(&self) -> std::time::Duration {
        refresh_period(self.current_mode().refresh_mhz())
    }

    /// Size of the current mode in device pixels
    pub fn mode_size(&self) -> Size<i32, Physical> {
        self.current_mode().size()
    }

    /// Size of the output in device pixels, after applying its transform
    pub fn transformed_size(&self) -> Size<i32, Physical> {
        self.transform.transform_size(self.mode_size())
    }

    /// Area of the output in compositor space
    pub fn geometry(&self) -> Rectangle<i32, Logical> {
        let size = self.transformed_size();
        Rectangle::new(self.position, (size.w / self.scale, size.h / self.scale).into())
    }

    /// Whether the cursor plane currently shows an image
    pub fn cursor_visible(&self) -> bool {
        self.cursor.is_visible()
    }

    /// Framebuffer the primary plane is scanning out, as last confirmed by the kernel
    pub fn scanout_framebuffer(&self) -> Option<drm::control::framebuffer::Handle> {
        self.primary.current().and_then(BufferHandle::framebuffer)
    }

    /// Map a rectangle in compositor space to crtc coordinates
    pub(crate) fn to_crtc(&self, rect: Rectangle<i32, Logical>) -> Rectangle<i32, Physical> {
        let local = Rectangle::<i32, Logical>::new(
            (rect.loc.x - self.position.x, rect.loc.y - self.position.y).into(),
            rect.size,
        )
        .to_physical(self.scale);
        self.transform.invert().transform_rect_in(local, &self.transformed_size())
    }

    /// Whether the output is still in service
    pub(crate) fn is_live(&self) -> bool {
        self.state != OutputState::DestroyPending
    }

    /// Extend a 32 bit vblank sequence to the 64 bit counter
    pub(crate) fn update_msc(&mut self, sequence: u32) -> u64 {
        let mut high = self.msc >> 32;
        if (sequence as u64) < (self.msc & 0xffff_ffff) {
            high += 1;
        }
        self.msc = (high << 32) + sequence as u64;
        self.msc
    }
}

#[cfg(test)]
mod tests {
    use super::{Output, OutputId, OutputState};
    use crate::{
        backend::drm::device::SavedCrtc,
        testing::{handle, mode},
        utils::{Rectangle, Transform},
    };

    fn output(transform: Transform, scale: i32) -> Output {
        let crtc = handle(31);
        Output::new(
            OutputId(1),
            "HDMI-A-1".into(),
            crtc,
            0,
            handle(50),
            (520, 290),
            SavedCrtc {
                handle: crtc,
                framebuffer: None,
                position: (0, 0),
                mode: None,
            },
            vec![mode(1920, 1080, 60, true)],
            0,
            drm_fourcc::DrmFourcc::Xrgb8888,
            scale,
            transform,
            (1920, 0).into(),
            (64, 64).into(),
        )
    }

    #[test]
    fn msc_survives_sequence_wrap() {
        let mut output = output(Transform::Normal, 1);
        assert_eq!(output.update_msc(u32::MAX - 1), (u32::MAX - 1) as u64);
        assert_eq!(output.update_msc(3), (1 << 32) + 3);
        assert_eq!(output.update_msc(4), (1 << 32) + 4);
    }

    #[test]
    fn geometry_accounts_for_scale_and_transform() {
        let output = output(Transform::_90, 2);
        assert_eq!(output.geometry(), Rectangle::new((1920, 0).into(), (540, 960).into()));
        assert_eq!(output.state(), OutputState::Idle);
        assert_eq!(output.refresh_period().as_millis(), 16);
    }

    #[test]
    fn compositor_rects_map_to_crtc_space() {
        let output = output(Transform::Normal, 2);
        let rect = Rectangle::new((1930, 10).into(), (100, 50).into());
        assert_eq!(output.to_crtc(rect), Rectangle::new((20, 20).into(), (200, 100).into()));
    }
}
