use std::{io, path::PathBuf};

use drm::control::{connector, plane};
use drm_fourcc::DrmFourcc;

use super::OutputId;
use crate::utils::{Buffer, Physical, Size};

/// Errors thrown by the [`KmsBackend`](super::KmsBackend) and the buffer helpers
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The kernel refused to allocate a buffer object
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The kernel refused to register a buffer object as a framebuffer
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// A plane commit was rejected
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// No mode of the output matches the requested size and refresh rate
    #[error("Output {output:?} has no mode matching {size:?}@{refresh}mHz")]
    UnsupportedMode {
        /// Output the mode switch was requested for
        output: OutputId,
        /// Requested size
        size: Size<i32, Physical>,
        /// Requested refresh rate, 0 matches any rate
        refresh: u32,
    },
    /// The device has no usable outputs left
    #[error("The drm device has no usable outputs left")]
    DeviceLost,
    /// Device is currently paused
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// The output is unknown or already torn down
    #[error("Output {0:?} does not exist")]
    UnknownOutput(OutputId),
    /// A page flip is outstanding on the output
    #[error("Output {0:?} has a page flip pending, operation rejected")]
    FlipPending(OutputId),
    /// Neither a rendered buffer nor a scanout candidate is staged for the output
    #[error("Nothing staged to present on output {0:?}")]
    NothingToPresent(OutputId),
    /// No crtc is free to drive the connector
    #[error("No free crtc can drive connector {0:?}")]
    NoSuitableCrtc(connector::Handle),
    /// The connector does not advertise a usable mode
    #[error("Connector {0:?} has no usable mode")]
    NoModes(connector::Handle),
    /// The plane is not an overlay of this device
    #[error("Plane {0:?} is not a known overlay plane")]
    UnknownPlane(plane::Handle),
    /// The plane is missing a property required by the commit strategy
    #[error("The plane {handle:?} is missing a required property '{name}'")]
    UnknownProperty {
        /// Plane handle
        handle: plane::Handle,
        /// Property name
        name: &'static str,
    },
}

/// Error returned by device operations
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Errors creating a buffer object
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// The requested geometry lies outside of the device's framebuffer limits
    #[error("bo geometry {size:?} out of bounds ({min:?} - {max:?})")]
    OutOfBounds {
        /// Requested size
        size: Size<u32, Buffer>,
        /// Smallest framebuffer the device accepts
        min: Size<u32, Buffer>,
        /// Largest framebuffer the device accepts
        max: Size<u32, Buffer>,
    },
    /// The kernel rejected the allocation
    #[error("Failed to allocate a {size:?} buffer of format {format}")]
    Rejected {
        /// Requested size
        size: Size<u32, Buffer>,
        /// Requested format
        format: DrmFourcc,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
}

/// A buffer object could not be turned into a framebuffer
#[derive(Debug, thiserror::Error)]
#[error("Failed to create a framebuffer for a {size:?} buffer of format {format}")]
pub struct RegistrationError {
    /// Size of the rejected buffer
    pub size: Size<u32, Buffer>,
    /// Format of the rejected buffer
    pub format: DrmFourcc,
    /// Error of the last registration attempt
    #[source]
    pub source: io::Error,
}

/// A plane update was rejected by the kernel
#[derive(Debug, thiserror::Error)]
#[error("Commit of plane {plane:?} failed{}: {source}", .property.map(|p| format!(" on property `{}`", p)).unwrap_or_default())]
pub struct CommitError {
    /// The plane the update was aimed at
    pub plane: plane::Handle,
    /// The property at fault, if it could be determined
    pub property: Option<&'static str>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}
