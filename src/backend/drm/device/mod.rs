//! Access to the kernel mode-setting interface
//!
//! Everything the backend asks of the kernel goes through the object-safe [`KmsDevice`]
//! trait. [`DrmDeviceFd`] implements it on top of an open drm node, tests substitute a
//! scripted device (see [`crate::testing`]).

use std::{fmt, io, path::PathBuf};

use calloop::{
    generic::Generic, EventSource, Interest, Mode as TriggerMode, Poll, PostAction, Readiness, Token,
    TokenFactory,
};
use drm::control::{connector, crtc, framebuffer, plane, property, AtomicCommitFlags};
use drm_fourcc::DrmFourcc;
use smallvec::SmallVec;
use tracing::trace;

use super::{
    buffer::BufferObject,
    error::AccessError,
    mode::ModeInfo,
    plane::{FixedRect, PlaneKind},
    DrmEvent, Error,
};
use crate::utils::{Buffer, Physical, Point, Rectangle, Size};

mod fd;

pub use self::fd::DrmDeviceFd;

/// Driver capabilities relevant to scanout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// The device accepts atomic commits
    pub atomic: bool,
    /// Size of the hardware cursor
    pub cursor_size: Size<u32, Buffer>,
    /// Event timestamps are taken from `CLOCK_MONOTONIC`
    pub monotonic_timestamps: bool,
    /// Framebuffers may carry format modifiers
    pub addfb2_modifiers: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        DeviceCapabilities {
            atomic: false,
            cursor_size: (64, 64).into(),
            monotonic_timestamps: true,
            addfb2_modifiers: false,
        }
    }
}

/// Mode-setting resources of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResources {
    /// Crtcs, in kernel order. The index of a crtc is its pipe.
    pub crtcs: Vec<crtc::Handle>,
    /// Connectors
    pub connectors: Vec<connector::Handle>,
    /// Universal planes
    pub planes: Vec<plane::Handle>,
    /// Smallest framebuffer the device accepts
    pub min_size: Size<u32, Buffer>,
    /// Largest framebuffer the device accepts
    pub max_size: Size<u32, Buffer>,
}

impl DeviceResources {
    /// The pipe index of `crtc`
    pub fn pipe(&self, crtc: crtc::Handle) -> Option<u32> {
        self.crtcs.iter().position(|c| *c == crtc).map(|idx| idx as u32)
    }

    /// Resolve a kernel `possible_crtcs` bitmask
    pub fn crtcs_from_mask(&self, mask: u32) -> SmallVec<[crtc::Handle; 4]> {
        self.crtcs
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx < 32 && mask & (1 << idx) != 0)
            .map(|(_, crtc)| *crtc)
            .collect()
    }
}

/// State of a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Connector handle
    pub handle: connector::Handle,
    /// Name, e.g. `HDMI-A-1`
    pub name: String,
    /// Whether a display is attached
    pub connected: bool,
    /// Modes advertised by the display
    pub modes: Vec<ModeInfo>,
    /// Crtcs reachable through the connector's encoders, in encoder order
    pub possible_crtcs: Vec<crtc::Handle>,
    /// Crtc currently driving the connector
    pub current_crtc: Option<crtc::Handle>,
    /// Physical size in millimeters
    pub physical_size: (u32, u32),
}

/// Crtc state saved at startup, restored when the output is torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCrtc {
    /// Crtc handle
    pub handle: crtc::Handle,
    /// Framebuffer that was scanned out
    pub framebuffer: Option<framebuffer::Handle>,
    /// Scanout offset into the framebuffer
    pub position: (u32, u32),
    /// Mode the crtc was driven with
    pub mode: Option<ModeInfo>,
}

/// A plane property, as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property name, e.g. `SRC_X`
    pub name: String,
    /// Property handle
    pub handle: property::Handle,
    /// Current value
    pub value: u64,
}

/// Description of a hardware plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Plane handle
    pub handle: plane::Handle,
    /// Kind of the plane
    pub kind: PlaneKind,
    /// Crtcs the plane may be attached to
    pub possible_crtcs: SmallVec<[crtc::Handle; 4]>,
    /// Formats the plane can scan out
    pub formats: Vec<DrmFourcc>,
    /// Properties of the plane
    pub properties: Vec<PropertyInfo>,
}

/// Reply to an instant vblank query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankReply {
    /// Sequence number of the last vblank
    pub sequence: u32,
    /// Timestamp of the last vblank, zero if unknown
    pub time: std::time::Duration,
}

/// An ordered list of plane property changes, committed as one unit
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AtomicRequest {
    props: SmallVec<[(plane::Handle, property::Handle, u64); 16]>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property change
    pub fn add(&mut self, plane: plane::Handle, property: property::Handle, value: u64) {
        self.props.push((plane, property, value));
    }

    /// The property changes, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &(plane::Handle, property::Handle, u64)> {
        self.props.iter()
    }

    /// Number of property changes
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Returns true if the request changes nothing
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// A request made of the first `len` changes of this one
    pub fn truncated(&self, len: usize) -> AtomicRequest {
        AtomicRequest {
            props: self.props.iter().take(len).copied().collect(),
        }
    }
}

/// Operations the backend needs from a mode-setting device
///
/// All calls are synchronous. Completion of page flips and armed vblanks is reported
/// later through [`KmsDevice::receive_events`].
pub trait KmsDevice: fmt::Debug + Send + Sync {
    /// Path of the device node, for error messages
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }

    /// Capabilities of the driver
    fn capabilities(&self) -> DeviceCapabilities;
    /// Enumerate crtcs, connectors and planes
    fn resources(&self) -> io::Result<DeviceResources>;
    /// Query (and probe) a connector
    fn connector(&self, connector: connector::Handle) -> io::Result<ConnectorInfo>;
    /// Query the current state of a crtc
    fn saved_crtc(&self, crtc: crtc::Handle) -> io::Result<SavedCrtc>;
    /// Query a plane
    fn plane(&self, plane: plane::Handle) -> io::Result<PlaneInfo>;

    /// Allocate a linear, cpu-mappable buffer object
    fn create_dumb_buffer(&self, size: Size<u32, Buffer>, format: DrmFourcc) -> io::Result<BufferObject>;
    /// Free a buffer object created by [`KmsDevice::create_dumb_buffer`]
    fn destroy_dumb_buffer(&self, bo: &BufferObject) -> io::Result<()>;
    /// Copy `data`, laid out with the buffer's stride, into a dumb buffer
    fn write_dumb_buffer(&self, bo: &BufferObject, data: &[u8]) -> io::Result<()>;

    /// Register a buffer object with an explicit format (addfb2)
    fn add_framebuffer(&self, bo: &BufferObject, format: DrmFourcc) -> io::Result<framebuffer::Handle>;
    /// Register a buffer object by depth and bpp (legacy addfb)
    fn add_legacy_framebuffer(
        &self,
        bo: &BufferObject,
        depth: u32,
        bpp: u32,
    ) -> io::Result<framebuffer::Handle>;
    /// Unregister a framebuffer
    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;

    /// Full mode-set of a crtc. `None` for framebuffer and mode disables the crtc.
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()>;
    /// Queue a page flip, completion is reported as [`DrmEvent::PageFlip`]
    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()>;
    /// Legacy single plane update
    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: Rectangle<i32, Physical>,
        src: FixedRect,
    ) -> io::Result<()>;
    /// Apply all property changes of `request` in one transaction
    fn atomic_commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> io::Result<()>;

    /// Set or clear the cursor image of a crtc
    fn set_cursor(&self, crtc: crtc::Handle, bo: Option<&BufferObject>) -> io::Result<()>;
    /// Move the cursor of a crtc
    fn move_cursor(&self, crtc: crtc::Handle, position: Point<i32, Physical>) -> io::Result<()>;

    /// Instant query of the last vblank on `pipe`
    fn query_vblank(&self, pipe: u32) -> io::Result<VblankReply>;
    /// Arm a one-shot event for the next vblank on `pipe`, reported as [`DrmEvent::VBlank`]
    fn queue_vblank(&self, pipe: u32, token: u64) -> io::Result<()>;

    /// Read pending kernel events
    fn receive_events(&self) -> io::Result<Vec<DrmEvent>>;
}

/// Events source for a [`DrmDeviceFd`]
///
/// Insert it into a [`calloop`] event loop and forward every [`DrmEvent`] to
/// [`KmsBackend::handle_event`](super::KmsBackend::handle_event).
#[derive(Debug)]
pub struct DrmDeviceNotifier {
    fd: DrmDeviceFd,
    source: Generic<DrmDeviceFd>,
}

impl DrmDeviceNotifier {
    /// Create a notifier reading the events of `fd`
    pub fn new(fd: DrmDeviceFd) -> Self {
        DrmDeviceNotifier {
            source: Generic::new(fd.clone(), Interest::READ, TriggerMode::Level),
            fd,
        }
    }
}

impl EventSource for DrmDeviceNotifier {
    type Event = DrmEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    #[profiling::function]
    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let fd = &self.fd;
        self.source.process_events(readiness, token, |_, _| {
            match fd.receive_events() {
                Ok(events) => {
                    for event in events {
                        trace!(?event, "Dispatching drm event");
                        callback(event, &mut ());
                    }
                }
                Err(source) => {
                    callback(
                        DrmEvent::Error(Error::Access(AccessError {
                            errmsg: "Error processing drm events",
                            dev: fd.dev_path(),
                            source,
                        })),
                        &mut (),
                    );
                }
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicRequest, DeviceResources};
    use crate::testing::handle;

    #[test]
    fn crtc_mask_resolves_in_pipe_order() {
        let res = DeviceResources {
            crtcs: vec![handle(31), handle(45), handle(59)],
            connectors: vec![],
            planes: vec![],
            min_size: (0, 0).into(),
            max_size: (8192, 8192).into(),
        };

        assert_eq!(res.crtcs_from_mask(0b101).as_slice(), &[handle(31), handle(59)]);
        assert_eq!(res.pipe(handle(45)), Some(1));
        assert_eq!(res.pipe(handle(99)), None);
    }

    #[test]
    fn truncated_request_keeps_order() {
        let mut req = AtomicRequest::new();
        req.add(handle(40), handle(1), 10);
        req.add(handle(40), handle(2), 20);
        req.add(handle(40), handle(3), 30);

        let head = req.truncated(2);
        assert_eq!(head.len(), 2);
        assert_eq!(head.iter().map(|(_, _, v)| *v).collect::<Vec<_>>(), vec![10, 20]);
    }
}
