#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # kms-scanout: getting composited frames onto the screen
//!
//! This crate drives the kernel mode-setting interface of a display device on behalf of a
//! compositor. It decides which surfaces can skip composition and be scanned out by a
//! hardware plane, submits frames with page flips and tracks every output until the
//! kernel reports a frame on screen.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the [`KmsBackend`](backend::drm::KmsBackend), its output
//!   state machine, the plane assignment and the device abstraction.
//! - [`backend::udev`] listens for connector hotplug events.
//! - [`utils`] provides the geometry types shared by all of the above.
//! - [`testing`] provides an in-memory device to exercise the backend without hardware.
//!
//! ### The event loop
//!
//! The backend is built around [`calloop`]. The device is readable whenever a page flip or
//! vblank completed. Insert a [`DrmDeviceNotifier`](backend::drm::device::DrmDeviceNotifier)
//! into your event loop and forward its events to
//! [`KmsBackend::handle_event`](backend::drm::KmsBackend::handle_event). All operations are
//! synchronous and never block on the display.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. Every output
//! carries its own span, so messages can be attributed to a crtc.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! For example to enable `trace` messages for debug builds, but limit release builds to
//! `debug` add the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod testing;
pub mod utils;
