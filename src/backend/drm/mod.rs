//! Drm/Kms types and backend implementations
//!
//! This module provides a [`KmsBackend`], which owns every output (crtc/connector pair) of a
//! drm device, decides which buffer is shown on which hardware plane and drives the kernel's
//! page-flip and vblank protocol.
//!
//! ## How to use it
//!
//! ### Initialization
//!
//! Open the drm node and wrap it in a [`DrmDeviceFd`](device::DrmDeviceFd). Any type
//! implementing [`KmsDevice`](device::KmsDevice) can back the [`KmsBackend`], the file
//! descriptor wrapper is the one talking to a real kernel.
//!
//! ```rust,no_run
//! use std::{fs::OpenOptions, os::unix::io::OwnedFd, sync::Arc};
//! use kms_scanout::backend::drm::{device::DrmDeviceFd, BackendConfig, KmsBackend};
//!
//! let file = OpenOptions::new().read(true).write(true).open("/dev/dri/card0").unwrap();
//! let device = DrmDeviceFd::new(OwnedFd::from(file));
//! let mut backend = KmsBackend::new(Arc::new(device.clone()), BackendConfig::default()).unwrap();
//! ```
//!
//! ### Per frame
//!
//! 1. [`KmsBackend::assign_planes`] walks the scene and stages cursor, overlay and direct
//!    scanout candidates. Everything left over has to be composited by the renderer.
//! 2. [`KmsBackend::submit_frame`] hands over the composited buffer (or nothing, if a
//!    client buffer was staged for direct scanout) and issues the page flip, the cursor
//!    update and the overlay commits.
//! 3. Once the kernel reports completion through [`DrmEvent`]s, fed into
//!    [`KmsBackend::handle_event`], a [`BackendEvent::FrameFinished`] is queued. The
//!    compositor should not render for that output before it sees it.
//!
//! Events can be received from the kernel by inserting the
//! [`DrmDeviceNotifier`](device::DrmDeviceNotifier) into a [`calloop`] event loop.

pub(crate) mod assign;
mod backend;
pub mod buffer;
mod commit;
mod config;
mod cursor;
pub mod device;
mod error;
mod mode;
mod output;
pub mod plane;

use std::time::Duration;

use drm::control::crtc;

pub use self::assign::{
    Assignment, BufferStorage, OverlayUpdate, PlaneAssignment, SceneSurface, ScanoutSource,
    SurfaceAssignment, SurfaceBuffer, SurfaceId, ViewTransform,
};
pub use self::backend::{BackendEvent, KmsBackend, SubmitOutcome};
pub use self::buffer::{
    BufferHandle, BufferKind, BufferObject, BufferOwner, BufferSource, ClientBufferId, FramebufferLimits,
};
pub use self::commit::{select_strategy, AtomicCommit, CommitStrategy, LegacyCommit};
pub use self::config::{BackendConfig, DebugFlags, DebugToggle, OutputConfig, RendererKind};
pub use self::error::{AccessError, AllocationError, CommitError, Error, RegistrationError};
pub use self::mode::{choose_mode, ModeConfig, ModeFlags, ModeInfo, ParseModeError};
pub use self::output::{FlipKind, Output, OutputState};
pub use self::plane::{FixedRect, PlaneKind};

/// Stable handle of an output inside a [`KmsBackend`]
///
/// Ids are never reused, so an id held across a teardown simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u32);

impl OutputId {
    pub(crate) fn next(counter: &mut u32) -> OutputId {
        *counter += 1;
        OutputId(*counter)
    }

    /// Raw value of this id, for logging
    pub fn raw(&self) -> u32 {
        self.0
    }
}

bitflags::bitflags! {
    /// How a frame reached the screen, as reported to presentation-time clients
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PresentationFlags: u32 {
        /// The update was synchronized to the vertical retrace
        const VSYNC = 0x1;
        /// The timestamp was taken by the display hardware
        const HW_CLOCK = 0x2;
        /// The display hardware signalled that the update started
        const HW_COMPLETION = 0x4;
        /// The client buffer was scanned out without a copy
        const ZERO_COPY = 0x8;
        /// The timestamp is a software estimate and not tied to a real retrace
        const INVALID = 0x8000_0000;
    }
}

/// Events that can be generated by a drm device
#[derive(Debug)]
pub enum DrmEvent {
    /// A page flip issued on the provided crtc has completed
    PageFlip {
        /// crtc the flip was queued on
        crtc: crtc::Handle,
        /// kernel timing of the flip
        metadata: EventMetadata,
    },
    /// A vblank event armed with the given token has fired
    VBlank {
        /// the token handed to [`KmsDevice::queue_vblank`](device::KmsDevice::queue_vblank)
        token: u64,
        /// kernel timing of the vblank
        metadata: EventMetadata,
    },
    /// An error happened while processing events
    Error(Error),
}

/// Timing metadata for page-flip and vblank events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMetadata {
    /// Time of the event on the device's presentation clock.
    ///
    /// A zero duration means the driver failed to provide a timestamp.
    pub time: Duration,
    /// The sequence number of the frame
    pub sequence: u32,
}
