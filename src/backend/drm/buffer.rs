//! Scanout buffers and their lifetime
//!
//! A [`BufferHandle`] couples a kernel buffer object with the framebuffer registered for
//! it. Dropping (or [`releasing`](BufferHandle::release)) the handle unregisters the
//! framebuffer and hands the buffer object back to where it came from, exactly once.

use std::{fmt, sync::Arc};

use drm::control::framebuffer;
use drm_fourcc::DrmFourcc;
use tracing::{debug, trace, warn};

use super::{
    device::{DeviceResources, KmsDevice},
    error::{AllocationError, Error, RegistrationError},
};
use crate::utils::{Buffer, Size};

/// A kernel buffer object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferObject {
    /// GEM handle of the buffer
    pub handle: drm::buffer::Handle,
    /// Dimensions in pixels
    pub size: Size<u32, Buffer>,
    /// Bytes per row
    pub stride: u32,
    /// Pixel format of the contents
    pub format: DrmFourcc,
}

/// Identity of a client buffer, assigned by the client subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientBufferId(pub u64);

/// Gets buffer objects back once they are no longer scanned out
pub trait BufferOwner: fmt::Debug + Send {
    /// Take back `bo`. Called exactly once per acquired handle.
    fn release(&mut self, bo: BufferObject);
}

/// Where a buffer object came from, and where it goes back to
#[derive(Debug)]
pub enum BufferSource {
    /// Rendered by the backend's renderer, returned to it for reuse
    Rendered(Box<dyn BufferOwner>),
    /// Imported from a client buffer, the client subsystem keeps ownership
    ClientImported {
        /// Identity of the client buffer
        id: ClientBufferId,
        /// Reference returned on release
        owner: Box<dyn BufferOwner>,
    },
    /// A dumb buffer allocated by the backend itself, destroyed on release
    Dumb,
}

impl BufferSource {
    /// The kind of this source
    pub fn kind(&self) -> BufferKind {
        match self {
            BufferSource::Rendered(_) => BufferKind::Rendered,
            BufferSource::ClientImported { .. } => BufferKind::ClientImported,
            BufferSource::Dumb => BufferKind::Dumb,
        }
    }
}

/// Tag of a [`BufferSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// See [`BufferSource::Rendered`]
    Rendered,
    /// See [`BufferSource::ClientImported`]
    ClientImported,
    /// See [`BufferSource::Dumb`]
    Dumb,
}

/// Framebuffer constraints of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferLimits {
    /// Smallest accepted size
    pub min: Size<u32, Buffer>,
    /// Largest accepted size
    pub max: Size<u32, Buffer>,
    /// Whether framebuffers are registered with an explicit format.
    ///
    /// Cleared for good the first time the kernel rejects such a registration.
    pub addfb2: bool,
}

impl FramebufferLimits {
    /// Limits as advertised by the device
    pub fn from_resources(res: &DeviceResources) -> Self {
        FramebufferLimits {
            min: res.min_size,
            max: res.max_size,
            addfb2: true,
        }
    }

    fn check(&self, size: Size<u32, Buffer>) -> Result<(), AllocationError> {
        if size.w < self.min.w || size.w > self.max.w || size.h < self.min.h || size.h > self.max.h {
            warn!(?size, min = ?self.min, max = ?self.max, "bo geometry out of bounds");
            return Err(AllocationError::OutOfBounds {
                size,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// A buffer object registered for scanout
pub struct BufferHandle {
    device: Arc<dyn KmsDevice>,
    bo: BufferObject,
    fb: Option<framebuffer::Handle>,
    format: DrmFourcc,
    source: Option<BufferSource>,
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("bo", &self.bo)
            .field("fb", &self.fb)
            .field("format", &self.format)
            .field("source", &self.source.as_ref().map(BufferSource::kind))
            .finish()
    }
}

impl BufferHandle {
    /// Register `bo` as a framebuffer scanned out as `format`
    ///
    /// `format` may differ from the buffer's own format, e.g. an opaque ARGB buffer
    /// registered as XRGB. If registration with an explicit format fails once, the
    /// legacy depth/bpp interface is used from then on and `limits.addfb2` is cleared.
    ///
    /// On failure `bo` has already been handed back to its `source`.
    pub fn acquire(
        device: Arc<dyn KmsDevice>,
        limits: &mut FramebufferLimits,
        bo: BufferObject,
        format: DrmFourcc,
        source: BufferSource,
    ) -> Result<BufferHandle, Error> {
        let mut handle = BufferHandle {
            device,
            bo,
            fb: None,
            format,
            source: Some(source),
        };
        limits.check(handle.bo.size)?;

        let mut result = Err(None);
        if limits.addfb2 {
            result = handle.device.add_framebuffer(&handle.bo, format).map_err(Some);
            if let Err(Some(err)) = &result {
                debug!("addfb2 failed: {}", err);
                limits.addfb2 = false;
            }
        }

        let fb = match result {
            Ok(fb) => fb,
            Err(last_err) => match format {
                DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888 => handle
                    .device
                    .add_legacy_framebuffer(&handle.bo, 24, 32)
                    .map_err(|source| RegistrationError {
                        size: handle.bo.size,
                        format,
                        source,
                    })?,
                _ => {
                    return Err(RegistrationError {
                        size: handle.bo.size,
                        format,
                        source: last_err.unwrap_or_else(|| {
                            std::io::Error::new(
                                std::io::ErrorKind::Unsupported,
                                "format cannot be registered without addfb2",
                            )
                        }),
                    }
                    .into())
                }
            },
        };

        trace!(?fb, bo = ?handle.bo.handle, "registered framebuffer");
        handle.fb = Some(fb);
        Ok(handle)
    }

    /// Allocate a dumb buffer and register it
    pub fn dumb(
        device: Arc<dyn KmsDevice>,
        limits: &mut FramebufferLimits,
        size: Size<u32, Buffer>,
        format: DrmFourcc,
    ) -> Result<BufferHandle, Error> {
        limits.check(size)?;
        let bo = device
            .create_dumb_buffer(size, format)
            .map_err(|source| AllocationError::Rejected { size, format, source })?;
        BufferHandle::acquire(device, limits, bo, format, BufferSource::Dumb)
    }

    /// Allocate a dumb buffer without registering a framebuffer, as used for cursor images
    pub fn dumb_unregistered(
        device: Arc<dyn KmsDevice>,
        size: Size<u32, Buffer>,
        format: DrmFourcc,
    ) -> Result<BufferHandle, Error> {
        let bo = device
            .create_dumb_buffer(size, format)
            .map_err(|source| AllocationError::Rejected { size, format, source })?;
        Ok(BufferHandle {
            device,
            bo,
            fb: None,
            format,
            source: Some(BufferSource::Dumb),
        })
    }

    /// The registered framebuffer, `None` for unregistered dumb buffers
    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.fb
    }

    /// The underlying buffer object
    pub fn bo(&self) -> &BufferObject {
        &self.bo
    }

    /// Bytes per row
    pub fn stride(&self) -> u32 {
        self.bo.stride
    }

    /// Dimensions in pixels
    pub fn size(&self) -> Size<u32, Buffer> {
        self.bo.size
    }

    /// Format the framebuffer was registered with
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Where the buffer object came from
    pub fn kind(&self) -> BufferKind {
        self.source.as_ref().map(BufferSource::kind).unwrap_or(BufferKind::Dumb)
    }

    /// Identity of the client buffer, if imported from one
    pub fn client_id(&self) -> Option<ClientBufferId> {
        match &self.source {
            Some(BufferSource::ClientImported { id, .. }) => Some(*id),
            _ => None,
        }
    }

    /// Unregister the framebuffer and hand the buffer object back to its origin
    ///
    /// Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(fb) = self.fb.take() {
            trace!(?fb, "destroying framebuffer");
            if let Err(err) = self.device.destroy_framebuffer(fb) {
                warn!(?fb, ?err, "failed to destroy framebuffer");
            }
        }

        match self.source.take() {
            Some(BufferSource::Dumb) => {
                trace!(bo = ?self.bo.handle, "destroying dumb buffer");
                if let Err(err) = self.device.destroy_dumb_buffer(&self.bo) {
                    warn!(bo = ?self.bo.handle, ?err, "failed to destroy dumb buffer");
                }
            }
            Some(BufferSource::Rendered(mut owner)) | Some(BufferSource::ClientImported { mut owner, .. }) => {
                owner.release(self.bo.clone());
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drm_fourcc::DrmFourcc;

    use super::{BufferHandle, BufferKind, BufferSource, ClientBufferId, FramebufferLimits};
    use crate::{
        backend::drm::{AllocationError, Error},
        testing::{Failure, MockDevice, ReleaseLog},
    };

    fn is_send<S: Send>() {}

    #[test]
    fn handle_is_send() {
        is_send::<BufferHandle>();
    }

    fn setup() -> (Arc<MockDevice>, FramebufferLimits) {
        let mock = Arc::new(MockDevice::new(Default::default()));
        let limits = FramebufferLimits {
            min: (1, 1).into(),
            max: (4096, 4096).into(),
            addfb2: true,
        };
        (mock, limits)
    }

    #[test]
    fn dumb_buffer_lifecycle() {
        let (mock, mut limits) = setup();
        let handle = BufferHandle::dumb(mock.clone(), &mut limits, (256, 256).into(), DrmFourcc::Xrgb8888)
            .expect("allocation failed");

        assert!(handle.framebuffer().is_some());
        assert_eq!(handle.kind(), BufferKind::Dumb);
        assert_eq!(mock.live_framebuffers(), 1);
        assert_eq!(mock.live_dumb_buffers(), 1);

        handle.release();
        assert_eq!(mock.live_framebuffers(), 0);
        assert_eq!(mock.live_dumb_buffers(), 0);
    }

    #[test]
    fn out_of_bounds_returns_bo_to_owner() {
        let (mock, mut limits) = setup();
        let log = ReleaseLog::default();
        let bo = mock.create_client_bo((8192, 64).into(), DrmFourcc::Xrgb8888);

        let err = BufferHandle::acquire(
            mock.clone(),
            &mut limits,
            bo.clone(),
            DrmFourcc::Xrgb8888,
            BufferSource::Rendered(Box::new(log.clone())),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Allocation(AllocationError::OutOfBounds { .. })));
        assert_eq!(log.released(), vec![bo.handle]);
        assert_eq!(mock.live_framebuffers(), 0);
    }

    #[test]
    fn addfb2_failure_falls_back_to_legacy() {
        let (mock, mut limits) = setup();
        mock.fail_next(Failure::AddFb2);

        let handle = BufferHandle::dumb(mock.clone(), &mut limits, (64, 64).into(), DrmFourcc::Argb8888)
            .expect("legacy registration failed");

        assert!(!limits.addfb2);
        assert!(handle.framebuffer().is_some());
        assert_eq!(mock.legacy_framebuffers(), 1);
    }

    #[test]
    fn registration_failure_frees_the_buffer_object() {
        let (mock, mut limits) = setup();
        mock.fail_next(Failure::AddFb2);
        mock.fail_next(Failure::LegacyAddFb);

        let err = BufferHandle::dumb(mock.clone(), &mut limits, (64, 64).into(), DrmFourcc::Xrgb8888)
            .unwrap_err();

        assert!(matches!(err, Error::Registration(_)));
        assert_eq!(mock.live_dumb_buffers(), 0);
        assert_eq!(mock.live_framebuffers(), 0);
    }

    #[test]
    fn client_buffers_are_returned_not_destroyed() {
        let (mock, mut limits) = setup();
        let log = ReleaseLog::default();
        let bo = mock.create_client_bo((640, 480).into(), DrmFourcc::Argb8888);

        let handle = BufferHandle::acquire(
            mock.clone(),
            &mut limits,
            bo.clone(),
            DrmFourcc::Xrgb8888,
            BufferSource::ClientImported {
                id: ClientBufferId(7),
                owner: Box::new(log.clone()),
            },
        )
        .expect("import failed");

        assert_eq!(handle.client_id(), Some(ClientBufferId(7)));
        assert_eq!(handle.format(), DrmFourcc::Xrgb8888);
        drop(handle);

        assert_eq!(log.released(), vec![bo.handle]);
        assert_eq!(mock.live_framebuffers(), 0);
    }
}
