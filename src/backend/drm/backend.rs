use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use drm::control::{crtc, plane};
use drm_fourcc::DrmFourcc;
use indexmap::IndexMap;
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::{
    assign::{self, AssignContext, PlaneAssignment, SceneSurface, ScanoutSource, SurfaceId},
    buffer::{BufferHandle, BufferKind, BufferObject, BufferSource, FramebufferLimits},
    commit::{select_strategy, CommitStrategy},
    config::{BackendConfig, DebugFlags, DebugToggle},
    device::{ConnectorInfo, DeviceCapabilities, DeviceResources, KmsDevice},
    error::{AccessError, Error},
    mode::{choose_initial_mode, choose_mode, ModeConfig},
    output::{FlipKind, Output, OutputState},
    plane::{OverlayPlane, PlaneKind},
    DrmEvent, EventMetadata, OutputId, PresentationFlags,
};
use crate::utils::{Buffer, Physical, PresentationClock, Region, Size};

/// What happened to a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitOutcome {
    /// The page flip was queued, a [`BackendEvent::FrameFinished`] follows on completion
    Flipping,
    /// Another frame is still in flight, this one is presented after it
    Queued,
    /// The kernel refused the frame, it was reported finished with
    /// [`PresentationFlags::INVALID`]
    Failed,
}

/// Notifications for the host of a [`KmsBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The last submitted frame of an output reached the screen, or failed to
    FrameFinished {
        /// The output
        output: OutputId,
        /// Presentation time, on `clock`
        time: Duration,
        /// Clock of `time`
        clock: PresentationClock,
        /// Media stream counter at presentation
        msc: u64,
        /// How the frame was presented
        flags: PresentationFlags,
    },
    /// A connector was plugged in
    OutputAdded(OutputId),
    /// An output was torn down
    OutputRemoved(OutputId),
    /// The renderer has to recreate its state for the output, e.g. after a mode switch
    RenderStateReset {
        /// The output
        output: OutputId,
        /// New size of the primary buffers
        size: Size<i32, Physical>,
    },
    /// No usable output is left, the backend cannot continue
    DeviceLost,
}

/// Display backend driving every output of one drm device
///
/// All operations are synchronous. Completion of page flips and vblanks has to be
/// fed back through [`KmsBackend::handle_event`] or [`KmsBackend::dispatch`].
#[derive(Debug)]
pub struct KmsBackend {
    device: Arc<dyn KmsDevice>,
    caps: DeviceCapabilities,
    strategy: Box<dyn CommitStrategy>,
    config: BackendConfig,
    clock: PresentationClock,
    limits: FramebufferLimits,

    outputs: IndexMap<OutputId, Output>,
    crtc_index: HashMap<crtc::Handle, OutputId>,
    overlays: IndexMap<plane::Handle, OverlayPlane>,
    associations: HashMap<SurfaceId, plane::Handle>,

    cursors_broken: bool,
    sprites_broken: bool,
    active: bool,
    next_output_id: u32,
    next_x: i32,
    /// a connected connector found every possible crtc taken
    crtc_starved: bool,
    events: Vec<BackendEvent>,
    span: tracing::Span,
}

impl KmsBackend {
    /// Take over `device` and create an output for every connected connector
    ///
    /// Fails with [`Error::DeviceLost`] if no output could be created.
    pub fn new(device: Arc<dyn KmsDevice>, config: BackendConfig) -> Result<KmsBackend, Error> {
        let span = info_span!("kms_backend", dev = ?device.dev_path());
        let _guard = span.enter();
        info!("KmsBackend initializing");

        let caps = device.capabilities();
        let resources = device.resources().map_err(|source| AccessError {
            errmsg: "Error loading drm resources",
            dev: device.dev_path(),
            source,
        })?;
        let strategy = select_strategy(&caps, config.legacy_forced());

        drop(_guard);
        let mut backend = KmsBackend {
            limits: FramebufferLimits::from_resources(&resources),
            clock: PresentationClock::for_device(caps.monotonic_timestamps),
            device,
            caps,
            strategy,
            config,
            outputs: IndexMap::new(),
            crtc_index: HashMap::new(),
            overlays: IndexMap::new(),
            associations: HashMap::new(),
            cursors_broken: false,
            sprites_broken: false,
            active: true,
            next_output_id: 0,
            next_x: 0,
            crtc_starved: false,
            events: Vec::new(),
            span,
        };

        let span = backend.span.clone();
        let _guard = span.enter();
        backend.discover_planes(&resources);
        backend.rescan_with(&resources);
        if backend.live_outputs() == 0 {
            warn!("No usable outputs found");
            return Err(Error::DeviceLost);
        }
        Ok(backend)
    }

    fn discover_planes(&mut self, resources: &DeviceResources) {
        for handle in resources.planes.iter().copied() {
            let info = match self.device.plane(handle) {
                Ok(info) => info,
                Err(err) => {
                    warn!(plane = ?handle, "Failed to query plane: {}", err);
                    continue;
                }
            };
            if info.kind != PlaneKind::Overlay {
                continue;
            }

            let plane = OverlayPlane::new(info);
            if self.strategy.is_atomic() {
                if let Err(err) = plane.props.check_atomic(handle) {
                    warn!(plane = ?handle, "Not using plane as overlay: {}", err);
                    continue;
                }
            }
            self.overlays.insert(handle, plane);
        }
        info!("Found {} overlay planes", self.overlays.len());
    }

    fn access(&self, errmsg: &'static str, source: std::io::Error) -> Error {
        Error::Access(AccessError {
            errmsg,
            dev: self.device.dev_path(),
            source,
        })
    }

    fn live_outputs(&self) -> usize {
        self.outputs.values().filter(|o| o.is_live()).count()
    }

    /// Outputs in service, in creation order
    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values().filter(|o| o.is_live())
    }

    /// Look up an output
    ///
    /// Outputs awaiting deferred teardown are still returned.
    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    /// Overlay planes of the device
    pub fn overlays(&self) -> impl Iterator<Item = &OverlayPlane> {
        self.overlays.values()
    }

    /// Current configuration
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Capabilities of the device
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    /// The device driven by this backend
    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.device
    }

    /// Register a buffer object produced by the renderer (or a client) for scanout
    ///
    /// See [`BufferHandle::acquire`].
    pub fn import_buffer(
        &mut self,
        bo: BufferObject,
        format: DrmFourcc,
        source: BufferSource,
    ) -> Result<BufferHandle, Error> {
        let result = BufferHandle::acquire(self.device.clone(), &mut self.limits, bo, format, source);
        self.check_addfb2();
        result
    }

    /// Allocate a dumb buffer usable as primary buffer, e.g. for a software renderer
    pub fn create_dumb_buffer(&mut self, size: Size<u32, Buffer>, format: DrmFourcc) -> Result<BufferHandle, Error> {
        let result = BufferHandle::dumb(self.device.clone(), &mut self.limits, size, format);
        self.check_addfb2();
        result
    }

    fn check_addfb2(&mut self) {
        if !self.limits.addfb2 && !self.sprites_broken {
            warn!(parent: &self.span, "addfb2 failed, disabling overlay planes");
            self.sprites_broken = true;
        }
    }

    /// The strategy used for overlay commits
    pub fn commit_strategy(&self) -> &dyn CommitStrategy {
        &*self.strategy
    }

    /// Clock of all presentation timestamps
    pub fn clock(&self) -> PresentationClock {
        self.clock
    }

    /// Whether the backend currently owns the device
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the cursor plane was given up after a failure
    pub fn cursors_broken(&self) -> bool {
        self.cursors_broken
    }

    /// Whether overlay planes were given up after a failure
    pub fn sprites_broken(&self) -> bool {
        self.sprites_broken
    }

    /// Take the pending notifications
    pub fn drain_events(&mut self) -> std::vec::Drain<'_, BackendEvent> {
        self.events.drain(..)
    }

    /// Allow the renderer's buffers for `surface` to be shown on `plane`
    pub fn register_overlay_association(&mut self, surface: SurfaceId, plane: plane::Handle) -> Result<(), Error> {
        if !self.overlays.contains_key(&plane) {
            return Err(Error::UnknownPlane(plane));
        }
        trace!(?surface, ?plane, "overlay association");
        self.associations.insert(surface, plane);
        Ok(())
    }

    /// Remove the overlay association of `surface`
    pub fn unregister_overlay_association(&mut self, surface: SurfaceId) -> Option<plane::Handle> {
        self.associations.remove(&surface)
    }

    /// Flip a debug toggle, returning whether the toggled feature is now on
    pub fn toggle(&mut self, toggle: DebugToggle) -> bool {
        let _guard = self.span.enter();
        let enabled = self.config.apply(toggle);
        info!(?toggle, enabled, "debug toggle");

        if toggle == DebugToggle::Renderer {
            let resets = self
                .outputs
                .values()
                .filter(|o| o.is_live())
                .map(|o| BackendEvent::RenderStateReset {
                    output: o.id,
                    size: o.mode_size(),
                })
                .collect::<Vec<_>>();
            self.events.extend(resets);
        }
        enabled
    }

    /// Decide which surfaces of `scene` are shown on hardware planes of `output`
    ///
    /// `scene` is ordered front to back. Cursor, overlay and direct scanout buffers are
    /// staged for the next [`KmsBackend::submit_frame`], everything reported as
    /// [`Assignment::Composited`](super::Assignment::Composited) has to be rendered
    /// into the primary buffer.
    #[instrument(level = "trace", parent = &self.span, skip(self, scene, source))]
    #[profiling::function]
    pub fn assign_planes(
        &mut self,
        output: OutputId,
        scene: &[SceneSurface],
        source: &mut dyn ScanoutSource,
    ) -> Result<PlaneAssignment, Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let out = self
            .outputs
            .get_mut(&output)
            .filter(|o| o.is_live())
            .ok_or(Error::UnknownOutput(output))?;
        if out.state != OutputState::Idle {
            return Err(Error::FlipPending(output));
        }

        let span = out.span.clone();
        let _guard = span.enter();
        let ctx = AssignContext {
            device: &self.device,
            limits: &mut self.limits,
            config: &self.config,
            atomic: self.strategy.is_atomic(),
            cursors_broken: self.cursors_broken,
            sprites_broken: self.sprites_broken,
            overlays: &mut self.overlays,
            associations: &self.associations,
        };
        let result = assign::assign_planes(ctx, out, scene, source);
        drop(_guard);

        self.check_addfb2();
        Ok(result)
    }

    /// Present a frame on `output`
    ///
    /// `buffer` is the composited primary buffer. Pass `None` if
    /// [`KmsBackend::assign_planes`] staged a client buffer for direct scanout, or if
    /// nothing changed on the primary plane (empty `damage`) and only the cursor or
    /// overlays moved.
    ///
    /// While a frame is in flight, a new buffer is queued and replaces any previously
    /// queued one.
    #[instrument(level = "trace", parent = &self.span, skip(self, buffer, damage))]
    #[profiling::function]
    pub fn submit_frame(
        &mut self,
        output: OutputId,
        buffer: Option<BufferHandle>,
        damage: &Region<i32, Physical>,
    ) -> Result<SubmitOutcome, Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let out = live_output(&mut self.outputs, output)?;
        let span = out.span.clone();
        let _guard = span.enter();

        if let OutputState::FlipPending(_) = out.state {
            return match buffer {
                Some(buffer) => {
                    if out.queued.replace(buffer).is_some() {
                        debug!("Replacing queued frame");
                    }
                    Ok(SubmitOutcome::Queued)
                }
                None => Err(Error::FlipPending(output)),
            };
        }

        if let Some(buffer) = buffer {
            if let Err(buffer) = out.primary.stage(buffer) {
                out.queued = Some(buffer);
                return Ok(SubmitOutcome::Queued);
            }
        } else if out.primary.pending().is_none() && (!damage.is_empty() || out.primary.current().is_none()) {
            return Err(Error::NothingToPresent(output));
        }

        let Some((fb, stride)) = out
            .primary
            .latest()
            .and_then(|buffer| buffer.framebuffer().map(|fb| (fb, buffer.stride())))
        else {
            out.primary.discard();
            return Err(Error::NothingToPresent(output));
        };

        let crtc = out.crtc;
        if out.modeset_needed || out.programmed_stride != Some(stride) {
            let mode = out.current_mode().clone();
            debug!(?crtc, mode = %mode, "Setting mode");
            if let Err(err) = self
                .device
                .set_crtc(crtc, Some(fb), (0, 0), &[out.connector], Some(&mode))
            {
                warn!("set mode failed: {}", err);
                self.fail_frame(output);
                return Ok(SubmitOutcome::Failed);
            }
            out.modeset_needed = false;
            out.programmed_stride = Some(stride);
        }

        if let Err(err) = self.device.page_flip(crtc, fb) {
            warn!("queueing pageflip failed: {}", err);
            self.fail_frame(output);
            return Ok(SubmitOutcome::Failed);
        }
        trace!(?fb, "Page flip queued");
        out.primary.commit_started();
        out.flip_outstanding = true;
        out.state = OutputState::FlipPending(FlipKind::Frame);

        if std::mem::take(&mut out.frame_assigned) {
            self.commit_planes(output);
        }
        Ok(SubmitOutcome::Flipping)
    }

    /// Push the cursor and overlay state staged by the last assignment
    fn commit_planes(&mut self, output: OutputId) {
        let Some(out) = self.outputs.get_mut(&output) else {
            return;
        };
        let crtc = out.crtc;

        if !self.cursors_broken {
            if let Err(err) = out.cursor.commit(&self.device, crtc) {
                warn!("cursor update failed, disabling hardware cursors: {}", err);
                self.cursors_broken = true;
            }
        }

        let hide = self.config.debug.contains(DebugFlags::HIDE_OVERLAYS);
        for plane in self.overlays.values_mut() {
            if plane.claim == Some(crtc) {
                plane.claim = None;
                if !plane.update {
                    continue;
                }

                let fb = if hide {
                    None
                } else {
                    plane.slots.latest().and_then(BufferHandle::framebuffer)
                };
                if let Err(err) = self.strategy.commit_overlay(&*self.device, crtc, plane, fb) {
                    warn!("{}", err);
                    plane.slots.abort();
                    continue;
                }
                plane.update = false;
                plane.bound = Some(crtc);
                plane.slots.commit_started();

                match self.device.queue_vblank(out.pipe, u32::from(plane.handle) as u64) {
                    Ok(()) => {
                        plane.vblank = Some(crtc);
                        out.vblanks_pending += 1;
                    }
                    Err(err) => {
                        warn!(plane = ?plane.handle, "vblank event request failed: {}", err);
                        plane.slots.complete();
                    }
                }
            } else if plane.bound == Some(crtc) {
                debug!(plane = ?plane.handle, "Disabling unused overlay");
                if let Err(err) = self.strategy.disable_overlay(&*self.device, crtc, plane) {
                    warn!("{}", err);
                }
                plane.reset();
            }
        }
    }

    /// Drop everything staged for the frame and report it finished with an invalid timestamp
    fn fail_frame(&mut self, output: OutputId) {
        let Some(out) = self.outputs.get_mut(&output) else {
            return;
        };
        out.primary.abort();
        out.flip_outstanding = false;
        out.state = OutputState::Idle;
        self.discard_assignment(output);
        self.frame_finished(output, None, PresentationFlags::INVALID);
    }

    /// Forget what the last [`KmsBackend::assign_planes`] staged without committing it
    fn discard_assignment(&mut self, output: OutputId) {
        let Some(out) = self.outputs.get_mut(&output) else {
            return;
        };
        let crtc = out.crtc;
        out.primary.discard();
        out.cursor.discard();
        out.frame_assigned = false;
        for plane in self.overlays.values_mut() {
            if plane.claim == Some(crtc) {
                plane.claim = None;
                plane.slots.discard();
            }
        }
    }

    fn frame_finished(&mut self, output: OutputId, time: Option<Duration>, mut flags: PresentationFlags) {
        let Some(out) = self.outputs.get_mut(&output) else {
            return;
        };
        let time = match time.filter(|time| !time.is_zero()) {
            Some(time) => time,
            None => {
                flags |= PresentationFlags::INVALID;
                self.clock.now()
            }
        };
        if out.state == OutputState::FlipPending(FlipKind::Frame)
            && out.primary.current().map(BufferHandle::kind) == Some(BufferKind::ClientImported)
        {
            flags |= PresentationFlags::ZERO_COPY;
        }
        out.state = OutputState::Idle;

        trace!(?output, ?time, ?flags, "Frame finished");
        self.events.push(BackendEvent::FrameFinished {
            output,
            time,
            clock: self.clock,
            msc: out.msc,
            flags,
        });

        if let Some(buffer) = out.queued.take() {
            debug!(?output, "Presenting queued frame");
            if let Err(err) = self.submit_frame(output, Some(buffer), &Region::new()) {
                warn!(?output, "Failed to present queued frame: {}", err);
            }
        }
    }

    /// Find out when the next frame can be shown on an idle output
    ///
    /// Queries the last vblank. If it is recent, the frame is reported finished right
    /// away. Otherwise the current buffer is flipped again and the frame finishes with
    /// that flip. Both report [`PresentationFlags::INVALID`] timestamps for anything but
    /// the flip.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn start_repaint_loop(&mut self, output: OutputId) -> Result<(), Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let now = self.clock.now();
        let out = live_output(&mut self.outputs, output)?;
        if out.state != OutputState::Idle {
            return Err(Error::FlipPending(output));
        }
        // the timestamp flip shows the current buffer again, nothing staged may ride along
        self.discard_assignment(output);
        let out = live_output(&mut self.outputs, output)?;

        match self.device.query_vblank(out.pipe) {
            Ok(reply) if !reply.time.is_zero() => {
                if now.saturating_sub(reply.time) < out.refresh_period() {
                    out.update_msc(reply.sequence);
                    self.frame_finished(output, Some(reply.time), PresentationFlags::INVALID);
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(err) => {
                debug!("vblank query failed: {}", err);
                self.frame_finished(output, None, PresentationFlags::INVALID);
                return Ok(());
            }
        }

        let Some(fb) = out.primary.current().and_then(BufferHandle::framebuffer) else {
            self.frame_finished(output, None, PresentationFlags::INVALID);
            return Ok(());
        };
        if let Err(err) = self.device.page_flip(out.crtc, fb) {
            warn!("queueing pageflip failed: {}", err);
            self.frame_finished(output, None, PresentationFlags::INVALID);
            return Ok(());
        }
        out.flip_outstanding = true;
        out.state = OutputState::FlipPending(FlipKind::Timestamp);
        Ok(())
    }

    /// Read and process pending kernel events, returning how many there were
    pub fn dispatch(&mut self) -> Result<usize, Error> {
        let events = self
            .device
            .receive_events()
            .map_err(|source| self.access("Error processing drm events", source))?;
        let count = events.len();
        for event in events {
            self.handle_event(event);
        }
        Ok(count)
    }

    /// Process a kernel event
    #[profiling::function]
    pub fn handle_event(&mut self, event: DrmEvent) {
        match event {
            DrmEvent::PageFlip { crtc, metadata } => self.page_flip_done(crtc, metadata),
            DrmEvent::VBlank { token, metadata } => self.vblank_done(token, metadata),
            DrmEvent::Error(err) => error!(parent: &self.span, "drm device error: {}", err),
        }
    }

    fn page_flip_done(&mut self, crtc: crtc::Handle, metadata: EventMetadata) {
        let Some(output) = self.crtc_index.get(&crtc).copied() else {
            trace!(parent: &self.span, ?crtc, "page flip for unknown crtc");
            return;
        };
        let Some(out) = self.outputs.get_mut(&output) else {
            return;
        };
        let span = out.span.clone();
        let _guard = span.enter();

        if !out.flip_outstanding {
            warn!("unexpected page flip event");
            return;
        }
        out.flip_outstanding = false;
        out.primary.complete();
        out.update_msc(metadata.sequence);

        let (state, vblanks) = (out.state, out.vblanks_pending);
        match state {
            OutputState::DestroyPending => {
                self.teardown(output);
                if std::mem::take(&mut self.crtc_starved) {
                    self.claim_released_crtc();
                }
            }
            OutputState::FlipPending(_) if vblanks == 0 => self.frame_finished(
                output,
                Some(metadata.time),
                PresentationFlags::VSYNC | PresentationFlags::HW_CLOCK | PresentationFlags::HW_COMPLETION,
            ),
            _ => trace!(vblanks, "waiting for overlay vblanks"),
        }
    }

    fn vblank_done(&mut self, token: u64, metadata: EventMetadata) {
        let Some(plane) = u32::try_from(token)
            .ok()
            .and_then(drm::control::from_u32::<plane::Handle>)
            .and_then(|handle| self.overlays.get_mut(&handle))
        else {
            trace!(parent: &self.span, token, "vblank for unknown token");
            return;
        };
        let Some(crtc) = plane.vblank.take() else {
            return;
        };
        plane.slots.complete();
        self.vblank_released(crtc, Some(metadata));
    }

    /// A vblank armed on `crtc` completed or will never be delivered
    fn vblank_released(&mut self, crtc: crtc::Handle, metadata: Option<EventMetadata>) {
        let Some(output) = self.crtc_index.get(&crtc).copied() else {
            return;
        };
        let Some(out) = self.outputs.get_mut(&output) else {
            return;
        };
        out.vblanks_pending = out.vblanks_pending.saturating_sub(1);
        if let Some(metadata) = metadata {
            out.update_msc(metadata.sequence);
        }

        if matches!(out.state, OutputState::FlipPending(_)) && !out.flip_outstanding && out.vblanks_pending == 0 {
            self.frame_finished(
                output,
                metadata.map(|m| m.time),
                PresentationFlags::HW_CLOCK | PresentationFlags::HW_COMPLETION,
            );
        }
    }

    /// Destroy an output
    ///
    /// If a page flip is in flight, teardown is deferred until it completes.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn destroy_output(&mut self, output: OutputId) -> Result<(), Error> {
        let out = self.outputs.get_mut(&output).ok_or(Error::UnknownOutput(output))?;
        let (state, flipping) = (out.state, out.flip_outstanding);
        match state {
            OutputState::DestroyPending => {}
            OutputState::FlipPending(_) if flipping => {
                info!("destroy output while page flip pending");
                out.state = OutputState::DestroyPending;
            }
            _ => self.teardown(output),
        }
        Ok(())
    }

    /// Restore the crtc and release everything the output owns
    fn teardown(&mut self, output: OutputId) {
        let Some(mut out) = self.outputs.shift_remove(&output) else {
            return;
        };
        let span = out.span.clone();
        let _guard = span.enter();
        let crtc = out.crtc;
        self.crtc_index.remove(&crtc);

        for plane in self.overlays.values_mut() {
            if plane.bound == Some(crtc) || plane.claim == Some(crtc) || plane.vblank == Some(crtc) {
                if plane.bound.is_some() {
                    if let Err(err) = self.strategy.disable_overlay(&*self.device, crtc, plane) {
                        warn!("{}", err);
                    }
                }
                plane.reset();
            }
        }

        if let Err(err) = out.cursor.hide(&*self.device, crtc) {
            warn!("Failed to disable cursor: {}", err);
        }

        let saved = &out.saved_crtc;
        let connectors = if saved.framebuffer.is_some() {
            vec![out.connector]
        } else {
            Vec::new()
        };
        if let Err(err) = self.device.set_crtc(
            saved.handle,
            saved.framebuffer,
            saved.position,
            &connectors,
            saved.mode.as_ref(),
        ) {
            warn!("Failed to restore crtc: {}", err);
        }

        out.primary.clear();
        out.queued = None;
        info!(name = %out.name, "Output destroyed");
        drop(out);
        self.events.push(BackendEvent::OutputRemoved(output));
    }

    /// Switch `output` to the mode closest to `size` and `refresh_mhz`
    ///
    /// A `refresh_mhz` of 0 matches any refresh rate. The mode-set happens with the next
    /// frame, the renderer is told to recreate its buffers through
    /// [`BackendEvent::RenderStateReset`].
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn switch_mode(&mut self, output: OutputId, size: Size<i32, Physical>, refresh_mhz: u32) -> Result<(), Error> {
        let out = live_output(&mut self.outputs, output)?;
        if out.state != OutputState::Idle {
            return Err(Error::FlipPending(output));
        }

        let idx = choose_mode(&out.modes, out.current_mode, size, refresh_mhz).ok_or(Error::UnsupportedMode {
            output,
            size,
            refresh: refresh_mhz,
        })?;
        if idx == out.current_mode {
            return Ok(());
        }

        out.current_mode = idx;
        out.modeset_needed = true;
        let size = out.mode_size();
        info!(mode = %out.current_mode(), "Switching mode");
        self.events.push(BackendEvent::RenderStateReset { output, size });
        Ok(())
    }

    /// Re-read every connector, creating outputs for new displays and destroying the ones
    /// of unplugged displays
    ///
    /// Fails with [`Error::DeviceLost`] (and queues [`BackendEvent::DeviceLost`]) if no
    /// output is left.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn rescan_connectors(&mut self) -> Result<(), Error> {
        let resources = self
            .device
            .resources()
            .map_err(|source| self.access("Error loading drm resources", source))?;
        self.rescan_with(&resources);

        if self.live_outputs() == 0 {
            error!("No outputs left");
            self.events.push(BackendEvent::DeviceLost);
            return Err(Error::DeviceLost);
        }
        Ok(())
    }

    fn rescan_with(&mut self, resources: &DeviceResources) {
        self.crtc_starved = false;
        for connector in resources.connectors.iter().copied() {
            let info = match self.device.connector(connector) {
                Ok(info) => info,
                Err(err) => {
                    warn!(?connector, "Failed to query connector: {}", err);
                    continue;
                }
            };
            let existing = self
                .outputs
                .values()
                .find(|o| o.connector == connector && o.is_live())
                .map(|o| o.id);

            match (info.connected, existing) {
                (true, None) => {
                    if let Err(err) = self.create_output(&info, resources) {
                        self.crtc_starved |= matches!(err, Error::NoSuitableCrtc(_));
                        warn!(name = %info.name, "Failed to create output: {}", err);
                    }
                }
                (false, Some(output)) => {
                    info!(name = %info.name, "Connector disconnected");
                    if let Err(err) = self.destroy_output(output) {
                        warn!(name = %info.name, "Failed to destroy output: {}", err);
                    }
                }
                _ => {}
            }
        }

        let present: HashSet<_> = resources.connectors.iter().copied().collect();
        let vanished = self
            .outputs
            .values()
            .filter(|o| o.is_live() && !present.contains(&o.connector))
            .map(|o| o.id)
            .collect::<Vec<_>>();
        for output in vanished {
            if let Err(err) = self.destroy_output(output) {
                warn!(?output, "Failed to destroy output: {}", err);
            }
        }
    }

    /// A deferred teardown freed a crtc, connectors left without one get another chance
    fn claim_released_crtc(&mut self) {
        let resources = match self.device.resources() {
            Ok(resources) => resources,
            Err(err) => {
                warn!(parent: &self.span, "Failed to reload drm resources: {}", err);
                return;
            }
        };
        self.rescan_with(&resources);
    }

    fn create_output(&mut self, info: &ConnectorInfo, resources: &DeviceResources) -> Result<Option<OutputId>, Error> {
        let config = self.config.output(&info.name);
        let crtc = info
            .possible_crtcs
            .iter()
            .copied()
            .find(|crtc| !self.crtc_index.contains_key(crtc))
            .ok_or(Error::NoSuitableCrtc(info.handle))?;

        if config.mode == ModeConfig::Off {
            info!(name = %info.name, "Disabling output");
            if let Err(err) = self.device.set_crtc(crtc, None, (0, 0), &[], None) {
                warn!(?crtc, "Failed to disable crtc: {}", err);
            }
            return Ok(None);
        }

        let saved = self
            .device
            .saved_crtc(crtc)
            .map_err(|source| self.access("Error reading crtc state", source))?;
        let crtc_mode = match info.current_crtc {
            Some(current) if current == crtc => saved.mode.clone(),
            Some(current) => self.device.saved_crtc(current).ok().and_then(|s| s.mode),
            None => None,
        };

        let mut modes = info.modes.clone();
        let current_mode =
            choose_initial_mode(&mut modes, &config.mode, crtc_mode.as_ref()).ok_or(Error::NoModes(info.handle))?;

        let id = OutputId::next(&mut self.next_output_id);
        let output = Output::new(
            id,
            info.name.clone(),
            crtc,
            resources.pipe(crtc).unwrap_or(0),
            info.handle,
            info.physical_size,
            saved,
            modes,
            current_mode,
            config.format.unwrap_or(self.config.format),
            config.scale,
            config.transform,
            (self.next_x, 0).into(),
            self.caps.cursor_size,
        );
        self.next_x += output.geometry().size.w;

        info!(
            name = %output.name,
            ?crtc,
            mode = %output.current_mode(),
            refresh = output.current_mode().refresh_mhz(),
            "Output created"
        );
        self.crtc_index.insert(crtc, id);
        self.outputs.insert(id, output);
        self.events.push(BackendEvent::OutputAdded(id));
        Ok(Some(id))
    }

    /// The session lost the device: hide cursors, disable overlays and refuse frames
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        for out in self.outputs.values_mut() {
            if let Err(err) = out.cursor.hide(&*self.device, out.crtc) {
                warn!(crtc = ?out.crtc, "Failed to disable cursor: {}", err);
            }
        }

        let mut released = Vec::new();
        for plane in self.overlays.values_mut() {
            if let Some(crtc) = plane.bound {
                if let Err(err) = self.strategy.disable_overlay(&*self.device, crtc, plane) {
                    warn!("{}", err);
                }
            }
            released.extend(plane.vblank);
            plane.reset();
        }
        for crtc in released {
            self.vblank_released(crtc, None);
        }
        info!("Device paused");
    }

    /// The session got the device back, every output is mode-set with its next frame
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        for out in self.outputs.values_mut() {
            out.modeset_needed = true;
            out.cursor.invalidate();
        }
        info!("Device resumed");
    }
}

fn live_output(outputs: &mut IndexMap<OutputId, Output>, id: OutputId) -> Result<&mut Output, Error> {
    outputs
        .get_mut(&id)
        .filter(|o| o.is_live())
        .ok_or(Error::UnknownOutput(id))
}

impl Drop for KmsBackend {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let outputs = self.outputs.keys().copied().collect::<Vec<_>>();
        for output in outputs {
            self.teardown(output);
        }
    }
}
