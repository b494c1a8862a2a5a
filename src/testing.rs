//! Test helpers: a scripted [`KmsDevice`] and a scanout source to drive a
//! [`KmsBackend`](crate::backend::drm::KmsBackend) without hardware.
//!
//! [`MockDevice`] keeps the kernel side of mode-setting in memory. Page flips and armed
//! vblanks stay pending until [`MockDevice::vblank`] is called, every state changing call
//! is recorded and individual calls can be made to fail.
#![allow(missing_docs)]

use std::{
    collections::{HashMap, HashSet},
    io,
    num::NonZeroU32,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use drm::control::{connector, crtc, framebuffer, plane, property, AtomicCommitFlags};
use drm_fourcc::DrmFourcc;

use crate::{
    backend::drm::{
        device::{
            AtomicRequest, ConnectorInfo, DeviceCapabilities, DeviceResources, KmsDevice, PlaneInfo,
            PropertyInfo, SavedCrtc, VblankReply,
        },
        BufferObject, BufferOwner, BufferStorage, DrmEvent, EventMetadata, FixedRect, ModeFlags, ModeInfo,
        PlaneKind, SceneSurface, ScanoutSource, SurfaceBuffer,
    },
    utils::{Buffer, Physical, Point, Rectangle, Size},
};

/// Build a kernel handle from its raw value. Zero maps to one.
pub fn handle<T: From<NonZeroU32>>(raw: u32) -> T {
    T::from(NonZeroU32::MIN.saturating_add(raw.saturating_sub(1)))
}

/// A mode with plausible timings for `w`x`h` at `refresh_hz`
pub fn mode(w: u16, h: u16, refresh_hz: u32, preferred: bool) -> ModeInfo {
    let htotal = w + 160;
    let vtotal = h + 45;
    ModeInfo {
        clock: htotal as u32 * vtotal as u32 * refresh_hz / 1000,
        hdisplay: w,
        hsync_start: w + 48,
        hsync_end: w + 80,
        htotal,
        hskew: 0,
        vdisplay: h,
        vsync_start: h + 3,
        vsync_end: h + 8,
        vtotal,
        vscan: 0,
        flags: ModeFlags::PHSYNC | ModeFlags::NVSYNC,
        mode_type: if preferred { 1 << 3 } else { 0 },
        name: format!("{}x{}", w, h),
    }
}

const GEOMETRY_PROPERTIES: [&str; 10] = [
    "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H",
];

/// Properties of an overlay plane, handles numbered from `base`
pub fn plane_properties(base: u32, with_zpos: bool, with_alpha: bool) -> Vec<PropertyInfo> {
    let mut props = GEOMETRY_PROPERTIES
        .iter()
        .enumerate()
        .map(|(idx, name)| PropertyInfo {
            name: name.to_string(),
            handle: handle(base + idx as u32),
            value: 0,
        })
        .collect::<Vec<_>>();
    if with_zpos {
        props.push(PropertyInfo {
            name: "zpos".into(),
            handle: handle(base + 10),
            value: 0,
        });
    }
    if with_alpha {
        props.push(PropertyInfo {
            name: "alpha".into(),
            handle: handle(base + 11),
            value: 0xff,
        });
    }
    props
}

/// A device call that can be made to fail with [`MockDevice::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failure {
    /// `drmModeSetCrtc`
    SetCrtc,
    /// `drmModePageFlip`
    PageFlip,
    /// `drmModeSetPlane`
    SetPlane,
    /// A real (not test-only) atomic commit
    AtomicCommit,
    /// `drmModeAddFB2`
    AddFb2,
    /// `drmModeAddFB`
    LegacyAddFb,
    /// Dumb buffer allocation
    CreateDumb,
    /// `drmModeSetCursor`
    SetCursor,
    /// `drmModeMoveCursor`
    MoveCursor,
    /// Querying the last vblank
    QueryVblank,
    /// Requesting a vblank event
    QueueVblank,
}

/// A state changing device call, as recorded by [`MockDevice::calls`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Call {
    SetCrtc {
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: Vec<connector::Handle>,
        mode: Option<ModeInfo>,
    },
    PageFlip {
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
    },
    SetPlane {
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: Rectangle<i32, Physical>,
        src: FixedRect,
    },
    AtomicCommit {
        test_only: bool,
        props: Vec<(plane::Handle, String, u64)>,
    },
    SetCursor {
        crtc: crtc::Handle,
        bo: Option<drm::buffer::Handle>,
    },
    MoveCursor {
        crtc: crtc::Handle,
        position: Point<i32, Physical>,
    },
    QueueVblank {
        pipe: u32,
        token: u64,
    },
}

/// What the mock kernel currently shows on a plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaneState {
    /// Crtc the plane is enabled on
    pub crtc: Option<crtc::Handle>,
    /// Framebuffer shown, `None` if the plane is disabled
    pub fb: Option<framebuffer::Handle>,
    /// Destination on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Source rectangle in 16.16 fixed point
    pub src: FixedRect,
    /// Last `zpos` set through an atomic commit
    pub zpos: Option<u64>,
    /// Last `alpha` set through an atomic commit
    pub alpha: Option<u64>,
}

/// Cursor state of a crtc
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorState {
    /// Cursor image, `None` while hidden
    pub bo: Option<drm::buffer::Handle>,
    /// Last position the cursor was moved to
    pub position: Point<i32, Physical>,
}

#[derive(Debug, Default)]
struct CrtcState {
    fb: Option<framebuffer::Handle>,
    mode: Option<ModeInfo>,
    connectors: Vec<connector::Handle>,
    cursor: CursorState,
}

#[derive(Debug)]
struct MockConnector {
    info: ConnectorInfo,
    present: bool,
}

#[derive(Debug)]
struct Framebuffer {
    legacy: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u32,
    crtcs: Vec<crtc::Handle>,
    crtc_state: HashMap<crtc::Handle, CrtcState>,
    connectors: Vec<MockConnector>,
    planes: Vec<PlaneInfo>,
    plane_state: HashMap<plane::Handle, PlaneState>,
    property_names: HashMap<property::Handle, String>,
    rejected_properties: HashSet<String>,

    framebuffers: HashMap<framebuffer::Handle, Framebuffer>,
    dumb_buffers: HashSet<drm::buffer::Handle>,

    failures: Vec<Failure>,
    calls: Vec<Call>,

    pending_flips: Vec<(crtc::Handle, framebuffer::Handle)>,
    armed_vblanks: Vec<(u32, u64)>,
    overlapping_flips: usize,
    events: Vec<DrmEvent>,
    sequence: u32,
    last_vblank: Duration,
    vblank_reply: Option<VblankReply>,
}

impl MockState {
    fn next<T: From<NonZeroU32>>(&mut self) -> T {
        self.next_handle += 1;
        handle(self.next_handle)
    }

    fn fail(&mut self, failure: Failure) -> io::Result<()> {
        match self.failures.iter().position(|f| *f == failure) {
            Some(idx) => {
                self.failures.remove(idx);
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            }
            None => Ok(()),
        }
    }

    fn crtc(&mut self, crtc: crtc::Handle) -> io::Result<&mut CrtcState> {
        self.crtc_state.get_mut(&crtc).ok_or_else(not_found)
    }
}

fn not_found() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

/// An in-memory [`KmsDevice`]
#[derive(Debug)]
pub struct MockDevice {
    caps: DeviceCapabilities,
    state: Mutex<MockState>,
}

impl MockDevice {
    /// A device without any crtc, connector or plane
    pub fn new(caps: DeviceCapabilities) -> Self {
        MockDevice {
            caps,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // a panicking test must not take the others down with it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a crtc, the pipe is its index
    pub fn add_crtc(&self) -> crtc::Handle {
        let mut state = self.state();
        let crtc = state.next();
        state.crtcs.push(crtc);
        state.crtc_state.insert(crtc, CrtcState::default());
        crtc
    }

    /// Add a connected connector
    pub fn add_connector(&self, name: &str, modes: Vec<ModeInfo>, crtcs: &[crtc::Handle]) -> connector::Handle {
        let mut state = self.state();
        let handle = state.next();
        state.connectors.push(MockConnector {
            info: ConnectorInfo {
                handle,
                name: name.into(),
                connected: true,
                modes,
                possible_crtcs: crtcs.to_vec(),
                current_crtc: None,
                physical_size: (520, 290),
            },
            present: true,
        });
        handle
    }

    /// Plug or unplug the display of `connector`
    pub fn set_connected(&self, connector: connector::Handle, connected: bool) {
        let mut state = self.state();
        if let Some(conn) = state.connectors.iter_mut().find(|c| c.info.handle == connector) {
            conn.info.connected = connected;
        }
    }

    /// Make the connector disappear from the resources, like an unplugged MST port
    pub fn remove_connector(&self, connector: connector::Handle) {
        let mut state = self.state();
        if let Some(conn) = state.connectors.iter_mut().find(|c| c.info.handle == connector) {
            conn.present = false;
        }
    }

    /// Pretend the firmware lit up `connector` on `crtc` with `mode`
    ///
    /// Returns the framebuffer the console scans out.
    pub fn set_boot_state(
        &self,
        crtc: crtc::Handle,
        connector: connector::Handle,
        mode: ModeInfo,
    ) -> framebuffer::Handle {
        let mut state = self.state();
        let fb = state.next();
        if let Some(conn) = state.connectors.iter_mut().find(|c| c.info.handle == connector) {
            conn.info.current_crtc = Some(crtc);
        }
        if let Some(crtc) = state.crtc_state.get_mut(&crtc) {
            crtc.fb = Some(fb);
            crtc.mode = Some(mode);
            crtc.connectors = vec![connector];
        }
        fb
    }

    /// Add a plane of `kind` that can be used with `crtcs`
    pub fn add_plane(
        &self,
        kind: PlaneKind,
        crtcs: &[crtc::Handle],
        formats: &[DrmFourcc],
        zpos_alpha: bool,
    ) -> plane::Handle {
        let mut state = self.state();
        let handle = state.next();
        let base = state.next_handle + 1;
        state.next_handle += 12;

        let properties = plane_properties(base, zpos_alpha, zpos_alpha);
        for prop in &properties {
            state.property_names.insert(prop.handle, prop.name.clone());
        }
        state.plane_state.insert(
            handle,
            PlaneState {
                zpos: zpos_alpha.then_some(0),
                alpha: zpos_alpha.then_some(0xff),
                ..Default::default()
            },
        );
        state.planes.push(PlaneInfo {
            handle,
            kind,
            possible_crtcs: crtcs.iter().copied().collect(),
            formats: formats.to_vec(),
            properties,
        });
        handle
    }

    /// Add an overlay plane, with `zpos` and `alpha` properties if `zpos_alpha` is set
    pub fn add_overlay_plane(&self, crtcs: &[crtc::Handle], formats: &[DrmFourcc], zpos_alpha: bool) -> plane::Handle {
        self.add_plane(PlaneKind::Overlay, crtcs, formats, zpos_alpha)
    }

    /// Make the next call of the given kind fail with `EINVAL`
    pub fn fail_next(&self, failure: Failure) {
        self.state().failures.push(failure);
    }

    /// Refuse every atomic request touching a property called `name`
    pub fn reject_atomic_property(&self, name: &str) {
        self.state().rejected_properties.insert(name.into());
    }

    /// Answer instant vblank queries with `reply`
    pub fn set_vblank_reply(&self, reply: VblankReply) {
        self.state().vblank_reply = Some(reply);
    }

    /// Start counting vblanks at `sequence`
    pub fn set_sequence(&self, sequence: u32) {
        self.state().sequence = sequence;
    }

    /// Let a vblank pass at `time`
    ///
    /// Every pending page flip completes and every armed vblank fires. The events are
    /// returned by the next [`KmsDevice::receive_events`].
    pub fn vblank(&self, time: Duration) {
        let mut state = self.state();
        state.sequence = state.sequence.wrapping_add(1);
        state.last_vblank = time;
        let metadata = EventMetadata {
            time,
            sequence: state.sequence,
        };

        for (crtc, fb) in std::mem::take(&mut state.pending_flips) {
            if let Some(crtc_state) = state.crtc_state.get_mut(&crtc) {
                crtc_state.fb = Some(fb);
            }
            state.events.push(DrmEvent::PageFlip { crtc, metadata });
        }
        for (_, token) in std::mem::take(&mut state.armed_vblanks) {
            state.events.push(DrmEvent::VBlank { token, metadata });
        }
    }

    /// Every state changing call since the last [`MockDevice::clear_calls`]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Framebuffers that were added and not yet removed
    pub fn live_framebuffers(&self) -> usize {
        self.state().framebuffers.len()
    }

    /// Live framebuffers added with `drmModeAddFB`
    pub fn legacy_framebuffers(&self) -> usize {
        self.state().framebuffers.values().filter(|fb| fb.legacy).count()
    }

    /// Dumb buffers that were created and not yet destroyed
    pub fn live_dumb_buffers(&self) -> usize {
        self.state().dumb_buffers.len()
    }

    /// Page flips waiting for the next [`MockDevice::vblank`]
    pub fn pending_flips(&self) -> usize {
        self.state().pending_flips.len()
    }

    /// Page flips that were queued while another one was pending on the same crtc
    pub fn overlapping_flips(&self) -> usize {
        self.state().overlapping_flips
    }

    /// What `plane` shows right now
    pub fn plane_state(&self, plane: plane::Handle) -> PlaneState {
        self.state().plane_state.get(&plane).cloned().unwrap_or_default()
    }

    /// Cursor of `crtc`
    pub fn cursor(&self, crtc: crtc::Handle) -> CursorState {
        self.state()
            .crtc_state
            .get(&crtc)
            .map(|c| c.cursor.clone())
            .unwrap_or_default()
    }

    /// Framebuffer the crtc scans out, `None` if it is disabled
    pub fn crtc_framebuffer(&self, crtc: crtc::Handle) -> Option<framebuffer::Handle> {
        self.state().crtc_state.get(&crtc).and_then(|c| c.fb)
    }

    /// Mode the crtc runs, `None` if it is disabled
    pub fn crtc_mode(&self, crtc: crtc::Handle) -> Option<ModeInfo> {
        self.state().crtc_state.get(&crtc).and_then(|c| c.mode.clone())
    }

    /// A buffer object as a client buffer import would produce it
    pub fn create_client_bo(&self, size: Size<u32, Buffer>, format: DrmFourcc) -> BufferObject {
        let mut state = self.state();
        BufferObject {
            handle: state.next(),
            size,
            stride: size.w * 4,
            format,
        }
    }
}

impl KmsDevice for MockDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("/dev/dri/mock0"))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn resources(&self) -> io::Result<DeviceResources> {
        let state = self.state();
        Ok(DeviceResources {
            crtcs: state.crtcs.clone(),
            connectors: state
                .connectors
                .iter()
                .filter(|c| c.present)
                .map(|c| c.info.handle)
                .collect(),
            planes: state.planes.iter().map(|p| p.handle).collect(),
            min_size: (1, 1).into(),
            max_size: (8192, 8192).into(),
        })
    }

    fn connector(&self, connector: connector::Handle) -> io::Result<ConnectorInfo> {
        let state = self.state();
        state
            .connectors
            .iter()
            .find(|c| c.present && c.info.handle == connector)
            .map(|c| c.info.clone())
            .ok_or_else(not_found)
    }

    fn saved_crtc(&self, crtc: crtc::Handle) -> io::Result<SavedCrtc> {
        let state = self.state();
        let saved = state.crtc_state.get(&crtc).ok_or_else(not_found)?;
        Ok(SavedCrtc {
            handle: crtc,
            framebuffer: saved.fb,
            position: (0, 0),
            mode: saved.mode.clone(),
        })
    }

    fn plane(&self, plane: plane::Handle) -> io::Result<PlaneInfo> {
        let state = self.state();
        state
            .planes
            .iter()
            .find(|p| p.handle == plane)
            .cloned()
            .ok_or_else(not_found)
    }

    fn create_dumb_buffer(&self, size: Size<u32, Buffer>, format: DrmFourcc) -> io::Result<BufferObject> {
        let mut state = self.state();
        state.fail(Failure::CreateDumb)?;
        let handle = state.next();
        state.dumb_buffers.insert(handle);
        Ok(BufferObject {
            handle,
            size,
            stride: size.w * 4,
            format,
        })
    }

    fn destroy_dumb_buffer(&self, bo: &BufferObject) -> io::Result<()> {
        match self.state().dumb_buffers.remove(&bo.handle) {
            true => Ok(()),
            false => Err(not_found()),
        }
    }

    fn write_dumb_buffer(&self, bo: &BufferObject, data: &[u8]) -> io::Result<()> {
        let state = self.state();
        if !state.dumb_buffers.contains(&bo.handle) {
            return Err(not_found());
        }
        if data.len() > (bo.stride * bo.size.h) as usize {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn add_framebuffer(&self, _bo: &BufferObject, _format: DrmFourcc) -> io::Result<framebuffer::Handle> {
        let mut state = self.state();
        state.fail(Failure::AddFb2)?;
        let fb = state.next();
        state.framebuffers.insert(fb, Framebuffer { legacy: false });
        Ok(fb)
    }

    fn add_legacy_framebuffer(&self, _bo: &BufferObject, _depth: u32, _bpp: u32) -> io::Result<framebuffer::Handle> {
        let mut state = self.state();
        state.fail(Failure::LegacyAddFb)?;
        let fb = state.next();
        state.framebuffers.insert(fb, Framebuffer { legacy: true });
        Ok(fb)
    }

    fn destroy_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        self.state().framebuffers.remove(&fb).map(|_| ()).ok_or_else(not_found)
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        _position: (u32, u32),
        connectors: &[connector::Handle],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(Call::SetCrtc {
            crtc,
            fb,
            connectors: connectors.to_vec(),
            mode: mode.cloned(),
        });
        state.fail(Failure::SetCrtc)?;
        let crtc = state.crtc(crtc)?;
        crtc.fb = fb;
        crtc.mode = mode.cloned();
        crtc.connectors = connectors.to_vec();
        Ok(())
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(Call::PageFlip { crtc, fb });
        state.fail(Failure::PageFlip)?;
        if state.pending_flips.iter().any(|(c, _)| *c == crtc) {
            state.overlapping_flips += 1;
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if !state.framebuffers.contains_key(&fb) {
            return Err(not_found());
        }
        state.pending_flips.push((crtc, fb));
        Ok(())
    }

    fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        dst: Rectangle<i32, Physical>,
        src: FixedRect,
    ) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(Call::SetPlane {
            plane,
            crtc,
            fb,
            dst,
            src,
        });
        state.fail(Failure::SetPlane)?;
        let plane = state.plane_state.get_mut(&plane).ok_or_else(not_found)?;
        plane.crtc = fb.map(|_| crtc);
        plane.fb = fb;
        plane.dst = dst;
        plane.src = src;
        Ok(())
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: AtomicCommitFlags) -> io::Result<()> {
        let mut state = self.state();
        let test_only = flags.contains(AtomicCommitFlags::TEST_ONLY);
        let props = request
            .iter()
            .map(|(plane, prop, value)| {
                let name = state.property_names.get(prop).cloned().unwrap_or_default();
                (*plane, name, *value)
            })
            .collect::<Vec<_>>();
        state.calls.push(Call::AtomicCommit {
            test_only,
            props: props.clone(),
        });

        if !test_only {
            state.fail(Failure::AtomicCommit)?;
        }
        if props
            .iter()
            .any(|(_, name, _)| name.is_empty() || state.rejected_properties.contains(name))
        {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if test_only {
            return Ok(());
        }

        for (plane, name, value) in props {
            let plane = state.plane_state.get_mut(&plane).ok_or_else(not_found)?;
            let raw = value as u32;
            match name.as_str() {
                "FB_ID" => plane.fb = drm::control::from_u32(raw),
                "CRTC_ID" => plane.crtc = drm::control::from_u32(raw),
                "SRC_X" => plane.src.x = raw,
                "SRC_Y" => plane.src.y = raw,
                "SRC_W" => plane.src.w = raw,
                "SRC_H" => plane.src.h = raw,
                "CRTC_X" => plane.dst.loc.x = value as i64 as i32,
                "CRTC_Y" => plane.dst.loc.y = value as i64 as i32,
                "CRTC_W" => plane.dst.size.w = value as i32,
                "CRTC_H" => plane.dst.size.h = value as i32,
                "zpos" => plane.zpos = Some(value),
                "alpha" => plane.alpha = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn set_cursor(&self, crtc: crtc::Handle, bo: Option<&BufferObject>) -> io::Result<()> {
        let mut state = self.state();
        let bo = bo.map(|bo| bo.handle);
        state.calls.push(Call::SetCursor { crtc, bo });
        state.fail(Failure::SetCursor)?;
        state.crtc(crtc)?.cursor.bo = bo;
        Ok(())
    }

    fn move_cursor(&self, crtc: crtc::Handle, position: Point<i32, Physical>) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(Call::MoveCursor { crtc, position });
        state.fail(Failure::MoveCursor)?;
        state.crtc(crtc)?.cursor.position = position;
        Ok(())
    }

    fn query_vblank(&self, _pipe: u32) -> io::Result<VblankReply> {
        let mut state = self.state();
        state.fail(Failure::QueryVblank)?;
        Ok(state.vblank_reply.unwrap_or(VblankReply {
            sequence: state.sequence,
            time: state.last_vblank,
        }))
    }

    fn queue_vblank(&self, pipe: u32, token: u64) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(Call::QueueVblank { pipe, token });
        state.fail(Failure::QueueVblank)?;
        if pipe as usize >= state.crtcs.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.armed_vblanks.push((pipe, token));
        Ok(())
    }

    fn receive_events(&self) -> io::Result<Vec<DrmEvent>> {
        Ok(std::mem::take(&mut self.state().events))
    }
}

/// Records the buffer objects handed back to it
#[derive(Debug, Clone, Default)]
pub struct ReleaseLog(Arc<Mutex<Vec<drm::buffer::Handle>>>);

impl ReleaseLog {
    /// Buffer objects released so far, oldest first
    pub fn released(&self) -> Vec<drm::buffer::Handle> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

impl BufferOwner for ReleaseLog {
    fn release(&mut self, bo: BufferObject) {
        if let Ok(mut log) = self.0.lock() {
            log.push(bo.handle);
        }
    }
}

/// A [`ScanoutSource`] importing every native buffer through a [`MockDevice`]
#[derive(Debug)]
pub struct MockSource {
    device: Arc<MockDevice>,
    log: ReleaseLog,
    /// Fail every import
    pub refuse_import: bool,
    /// Fail every atomic flip preparation
    pub refuse_atomic: bool,
    /// Number of successful imports
    pub imports: usize,
    /// Number of cursor images copied
    pub cursor_copies: usize,
}

impl MockSource {
    /// A source importing into `device`
    pub fn new(device: Arc<MockDevice>) -> Self {
        MockSource {
            device,
            log: ReleaseLog::default(),
            refuse_import: false,
            refuse_atomic: false,
            imports: 0,
            cursor_copies: 0,
        }
    }

    /// Buffer objects of imported client buffers that were given back
    pub fn released(&self) -> Vec<drm::buffer::Handle> {
        self.log.released()
    }
}

impl ScanoutSource for MockSource {
    fn import(&mut self, _surface: &SceneSurface, buffer: &SurfaceBuffer) -> Option<(BufferObject, Box<dyn BufferOwner>)> {
        if self.refuse_import || buffer.storage == BufferStorage::Shm {
            return None;
        }
        self.imports += 1;
        let size = (buffer.size.w.max(0) as u32, buffer.size.h.max(0) as u32).into();
        let bo = self.device.create_client_bo(size, buffer.format);
        Some((bo, Box::new(self.log.clone())))
    }

    fn copy_cursor(&mut self, _surface: &SceneSurface, buffer: &SurfaceBuffer, dst: &mut [u8], stride: u32) -> bool {
        self.cursor_copies += 1;
        let row = (buffer.size.w.max(0) as usize * 4).min(stride as usize);
        for line in dst.chunks_mut(stride as usize).take(buffer.size.h.max(0) as usize) {
            line[..row].fill(0xff);
        }
        true
    }

    fn prepare_atomic_flip(&mut self, _surface: &SceneSurface, _plane: plane::Handle) -> bool {
        !self.refuse_atomic
    }
}
