//! Backend (rendering/input) helpers
//!
//! This module only covers the display side: driving kernel mode-setting
//! devices ([`drm`]) and listening for connector hotplug ([`udev`]).
//!
//! Rendering and input are left to the compositor. The [`drm`] backend only
//! consumes the buffers a renderer produced and tells it when to draw next.

pub mod drm;

#[cfg(feature = "backend_udev")]
pub mod udev;
