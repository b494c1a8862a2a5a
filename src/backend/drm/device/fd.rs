use std::{
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::PathBuf,
    sync::Arc,
};

use drm::{
    buffer::{Buffer as DrmBuffer, Handle as BufferHandle, PlanarBuffer},
    control::{
        atomic::AtomicModeReq, connector, crtc, framebuffer, plane, AtomicCommitFlags,
        Device as ControlDevice, Event, FbCmd2Flags, PageFlipFlags,
    },
    ClientCapability, Device as BasicDevice, DriverCapability, VblankWaitFlags, VblankWaitTarget,
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{error, info, trace, warn};

use super::{
    AtomicRequest, ConnectorInfo, DeviceCapabilities, DeviceResources, KmsDevice, PlaneInfo, PropertyInfo,
    SavedCrtc, VblankReply,
};
use crate::{
    backend::drm::{
        buffer::BufferObject,
        mode::ModeInfo,
        plane::{FixedRect, PlaneKind},
        DrmEvent, EventMetadata,
    },
    utils::{Buffer, Physical, Point, Rectangle, Size},
};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
    caps: DeviceCapabilities,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", dev_path(self.fd.as_fd()));
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// file descriptor, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
            caps: DeviceCapabilities::default(),
        };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // This is only needed on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        if let Err(err) = dev.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!("Unable to request universal planes: {}", err);
        }
        let cap = |cap| dev.get_driver_capability(cap).ok();
        let caps = DeviceCapabilities {
            atomic: dev.set_client_capability(ClientCapability::Atomic, true).is_ok(),
            cursor_size: (
                cap(DriverCapability::CursorWidth).unwrap_or(64) as u32,
                cap(DriverCapability::CursorHeight).unwrap_or(64) as u32,
            )
                .into(),
            monotonic_timestamps: cap(DriverCapability::MonotonicTimestamp).unwrap_or(0) == 1,
            addfb2_modifiers: cap(DriverCapability::AddFB2Modifiers).unwrap_or(0) == 1,
        };
        dev.caps = caps;

        DrmDeviceFd(Arc::new(dev))
    }

    /// Returns the `dev_t` of the underlying device
    pub fn dev_id(&self) -> io::Result<libc::dev_t> {
        Ok(rustix::fs::fstat(self.as_fd())?.st_rdev as libc::dev_t)
    }

    /// Whether the drm master lock is held
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }
}

fn dev_path(fd: BorrowedFd<'_>) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).ok()
}

fn invalid_handle() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "kernel returned a null handle")
}

fn bits_per_pixel(format: DrmFourcc) -> Option<u32> {
    match format {
        DrmFourcc::Argb8888
        | DrmFourcc::Xrgb8888
        | DrmFourcc::Abgr8888
        | DrmFourcc::Xbgr8888
        | DrmFourcc::Argb2101010
        | DrmFourcc::Xrgb2101010 => Some(32),
        DrmFourcc::Rgb565 => Some(16),
        _ => None,
    }
}

struct Planar<'a>(&'a BufferObject, DrmFourcc);

impl PlanarBuffer for Planar<'_> {
    fn size(&self) -> (u32, u32) {
        (self.0.size.w, self.0.size.h)
    }
    fn format(&self) -> DrmFourcc {
        self.1
    }
    fn modifier(&self) -> Option<DrmModifier> {
        None
    }
    fn pitches(&self) -> [u32; 4] {
        [self.0.stride, 0, 0, 0]
    }
    fn handles(&self) -> [Option<BufferHandle>; 4] {
        [Some(self.0.handle), None, None, None]
    }
    fn offsets(&self) -> [u32; 4] {
        [0; 4]
    }
}

struct Legacy<'a>(&'a BufferObject);

impl DrmBuffer for Legacy<'_> {
    fn size(&self) -> (u32, u32) {
        (self.0.size.w, self.0.size.h)
    }
    fn format(&self) -> DrmFourcc {
        self.0.format
    }
    fn pitch(&self) -> u32 {
        self.0.stride
    }
    fn handle(&self) -> BufferHandle {
        self.0.handle
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        dev_path(self.as_fd())
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.0.caps
    }

    fn resources(&self) -> io::Result<DeviceResources> {
        let res = self.0.resource_handles()?;
        let planes = self.0.plane_handles()?;
        let (min_w, max_w) = bounds(res.supported_fb_width());
        let (min_h, max_h) = bounds(res.supported_fb_height());
        Ok(DeviceResources {
            crtcs: res.crtcs().to_vec(),
            connectors: res.connectors().to_vec(),
            planes: planes.to_vec(),
            min_size: (min_w, min_h).into(),
            max_size: (max_w, max_h).into(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<ConnectorInfo> {
        let info = self.0.get_connector(handle, true)?;
        let res = self.0.resource_handles()?;

        let mut possible_crtcs = Vec::new();
        for encoder in info.encoders() {
            let encoder = self.0.get_encoder(*encoder)?;
            for crtc in res.filter_crtcs(encoder.possible_crtcs()) {
                if !possible_crtcs.contains(&crtc) {
                    possible_crtcs.push(crtc);
                }
            }
        }
        let current_crtc = info
            .current_encoder()
            .and_then(|encoder| self.0.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc());

        Ok(ConnectorInfo {
            handle,
            name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
            connected: info.state() == connector::State::Connected,
            modes: info.modes().iter().map(|mode| ModeInfo::from(*mode)).collect(),
            possible_crtcs,
            current_crtc,
            physical_size: info.size().unwrap_or((0, 0)),
        })
    }

    fn saved_crtc(&self, crtc: crtc::Handle) -> io::Result<SavedCrtc> {
        let info = self.0.get_crtc(crtc)?;
        Ok(SavedCrtc {
            handle: crtc,
            framebuffer: info.framebuffer(),
            position: info.position(),
            mode: info.mode().map(ModeInfo::from),
        })
    }

    fn plane(&self, handle: plane::Handle) -> io::Result<PlaneInfo> {
        let info = self.0.get_plane(handle)?;
        let res = self.0.resource_handles()?;
        let props = self.0.get_properties(handle)?;
        let (prop_handles, values) = props.as_props_and_values();

        let mut kind = PlaneKind::Overlay;
        let mut properties = Vec::with_capacity(prop_handles.len());
        for (prop, value) in prop_handles.iter().zip(values.iter()) {
            let name = self.0.get_property(*prop)?.name().to_string_lossy().into_owned();
            if name == "type" {
                kind = match value {
                    1 => PlaneKind::Primary,
                    2 => PlaneKind::Cursor,
                    _ => PlaneKind::Overlay,
                };
            }
            properties.push(PropertyInfo {
                name,
                handle: *prop,
                value: *value,
            });
        }

        Ok(PlaneInfo {
            handle,
            kind,
            possible_crtcs: res.filter_crtcs(info.possible_crtcs()).into_iter().collect(),
            formats: info
                .formats()
                .iter()
                .filter_map(|code| DrmFourcc::try_from(*code).ok())
                .collect(),
            properties,
        })
    }

    fn create_dumb_buffer(&self, size: Size<u32, Buffer>, format: DrmFourcc) -> io::Result<BufferObject> {
        let bpp = bits_per_pixel(format).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "format not supported for dumb buffers")
        })?;
        let raw = drm_ffi::mode::dumbbuffer::create(self.as_fd(), size.w, size.h, bpp, 0)?;
        Ok(BufferObject {
            handle: drm::control::from_u32(raw.handle).ok_or_else(invalid_handle)?,
            size,
            stride: raw.pitch,
            format,
        })
    }

    fn destroy_dumb_buffer(&self, bo: &BufferObject) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.as_fd(), bo.handle.into())?;
        Ok(())
    }

    fn write_dumb_buffer(&self, bo: &BufferObject, data: &[u8]) -> io::Result<()> {
        let map = drm_ffi::mode::dumbbuffer::map(self.as_fd(), bo.handle.into(), 0, 0)?;
        let len = bo.stride as usize * bo.size.h as usize;
        // SAFETY: the kernel hands out the offset of a mapping exactly `len` bytes long,
        // which is unmapped again before returning.
        unsafe {
            let ptr = mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.as_fd(),
                map.offset,
            )?;
            let dst = std::slice::from_raw_parts_mut(ptr as *mut u8, len);
            let count = data.len().min(len);
            dst[..count].copy_from_slice(&data[..count]);
            munmap(ptr, len)?;
        }
        Ok(())
    }

    fn add_framebuffer(&self, bo: &BufferObject, format: DrmFourcc) -> io::Result<framebuffer::Handle> {
        self.0
            .add_planar_framebuffer(&Planar(bo, format), FbCmd2Flags::empty())
    }

    fn add_legacy_framebuffer(
        &self,
        bo: &BufferObject,
        depth: u32,
        bpp: u32,
    ) -> io::Result<framebuffer::Handle> {
        self.0.add_framebuffer(&Legacy(bo), depth, bpp)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        self.0.destroy_framebuffer(fb)
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        self.0
            .set_crtc(crtc, fb, position, connectors, mode.map(ModeInfo::to_drm))
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()> {
        self.0.page_flip(crtc, fb, PageFlipFlags::EVENT, None)
    }

    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: Rectangle<i32, Physical>,
        src: FixedRect,
    ) -> io::Result<()> {
        self.0.set_plane(
            plane,
            crtc,
            fb,
            0,
            (dst.loc.x, dst.loc.y, dst.size.w as u32, dst.size.h as u32),
            (src.x, src.y, src.w, src.h),
        )
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> io::Result<()> {
        let mut req = AtomicModeReq::new();
        for (plane, prop, value) in request.iter() {
            req.add_raw_property((*plane).into(), *prop, *value);
        }
        trace!(?req, "Atomic commit");
        self.0.atomic_commit(flags, req)
    }

    fn set_cursor(&self, crtc: crtc::Handle, bo: Option<&BufferObject>) -> io::Result<()> {
        let (handle, w, h) = match bo {
            Some(bo) => (bo.handle.into(), bo.size.w, bo.size.h),
            None => (0, 0, 0),
        };
        drm_ffi::mode::set_cursor(self.as_fd(), crtc.into(), handle, w, h)?;
        Ok(())
    }

    fn move_cursor(&self, crtc: crtc::Handle, position: Point<i32, Physical>) -> io::Result<()> {
        drm_ffi::mode::move_cursor(self.as_fd(), crtc.into(), position.x, position.y)?;
        Ok(())
    }

    fn query_vblank(&self, pipe: u32) -> io::Result<VblankReply> {
        let reply = self
            .0
            .wait_vblank(VblankWaitTarget::Relative(0), VblankWaitFlags::empty(), pipe, 0)?;
        Ok(VblankReply {
            sequence: reply.frame(),
            time: reply.time().unwrap_or_default(),
        })
    }

    fn queue_vblank(&self, pipe: u32, token: u64) -> io::Result<()> {
        self.0.wait_vblank(
            VblankWaitTarget::Relative(1),
            VblankWaitFlags::EVENT,
            pipe,
            token as usize,
        )?;
        Ok(())
    }

    fn receive_events(&self) -> io::Result<Vec<DrmEvent>> {
        let events = self.0.receive_events()?;
        Ok(events
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(DrmEvent::PageFlip {
                    crtc: event.crtc,
                    metadata: EventMetadata {
                        time: event.duration,
                        sequence: event.frame,
                    },
                }),
                Event::Vblank(event) => Some(DrmEvent::VBlank {
                    token: event.user_data as u64,
                    metadata: EventMetadata {
                        time: event.time,
                        sequence: event.frame,
                    },
                }),
                _ => {
                    trace!("Ignoring unknown drm event");
                    None
                }
            })
            .collect())
    }
}

fn bounds(range: impl std::ops::RangeBounds<u32>) -> (u32, u32) {
    use std::ops::Bound;

    let min = match range.start_bound() {
        Bound::Included(v) => *v,
        Bound::Excluded(v) => v.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let max = match range.end_bound() {
        Bound::Included(v) => *v,
        Bound::Excluded(v) => v.saturating_sub(1),
        Bound::Unbounded => u32::MAX,
    };
    (min, max)
}
