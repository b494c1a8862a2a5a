use std::{sync::Arc, time::Duration};

use drm::control::plane;
use drm_fourcc::DrmFourcc;
use kms_scanout::{
    backend::drm::{
        device::{DeviceCapabilities, KmsDevice, VblankReply},
        Assignment, BackendConfig, BackendEvent, BufferStorage, ClientBufferId, DebugToggle, Error, KmsBackend,
        OutputId, OutputState, PlaneAssignment, PlaneKind, PresentationFlags, SceneSurface, SubmitOutcome,
        SurfaceBuffer, SurfaceId, ViewTransform,
    },
    testing::{mode, Call, Failure, MockDevice, MockSource},
    utils::{Logical, Rectangle, Transform},
};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

struct Fixture {
    mock: Arc<MockDevice>,
    backend: KmsBackend,
    source: MockSource,
    output: OutputId,
    overlay: plane::Handle,
    overlays: Vec<plane::Handle>,
}

impl Fixture {
    fn new(caps: DeviceCapabilities) -> Fixture {
        Fixture::with_overlays(caps, 1)
    }

    fn with_overlays(caps: DeviceCapabilities, count: usize) -> Fixture {
        init_logging();
        let mock = Arc::new(MockDevice::new(caps));
        let crtc = mock.add_crtc();
        mock.add_plane(PlaneKind::Primary, &[crtc], &[DrmFourcc::Xrgb8888], false);
        let overlays = (0..count)
            .map(|_| mock.add_overlay_plane(&[crtc], &[DrmFourcc::Xrgb8888, DrmFourcc::Argb8888], true))
            .collect::<Vec<_>>();
        mock.add_connector("DP-1", vec![mode(1920, 1080, 60, true)], &[crtc]);

        let mut backend = KmsBackend::new(mock.clone(), BackendConfig::default()).expect("backend creation failed");
        let output = backend.outputs().next().expect("no output").id();
        backend.drain_events().for_each(drop);
        Fixture {
            source: MockSource::new(mock.clone()),
            mock,
            backend,
            output,
            overlay: overlays[0],
            overlays,
        }
    }

    fn legacy() -> Fixture {
        Fixture::new(DeviceCapabilities::default())
    }

    fn atomic() -> Fixture {
        Fixture::new(DeviceCapabilities {
            atomic: true,
            ..Default::default()
        })
    }

    fn crtc(&self) -> drm::control::crtc::Handle {
        self.backend.output(self.output).unwrap().crtc()
    }

    fn assign(&mut self, scene: &[SceneSurface]) -> PlaneAssignment {
        self.backend
            .assign_planes(self.output, scene, &mut self.source)
            .expect("assignment failed")
    }

    /// Render (or not, if the primary plane scans out a client buffer) and submit
    fn present(&mut self, assignment: &PlaneAssignment) -> SubmitOutcome {
        let buffer = if assignment.is_direct_scanout() {
            None
        } else {
            Some(
                self.backend
                    .create_dumb_buffer((1920, 1080).into(), DrmFourcc::Xrgb8888)
                    .expect("allocation failed"),
            )
        };
        self.backend
            .submit_frame(self.output, buffer, &assignment.primary_damage)
            .expect("submit failed")
    }

    fn vblank(&mut self, ms: u64) -> Vec<BackendEvent> {
        self.mock.vblank(Duration::from_millis(ms));
        self.backend.dispatch().expect("dispatch failed");
        self.backend.drain_events().collect()
    }
}

fn rect(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Logical> {
    Rectangle::new((x, y).into(), (w, h).into())
}

fn buffer(id: u64, storage: BufferStorage, format: DrmFourcc, w: i32, h: i32) -> SurfaceBuffer {
    SurfaceBuffer {
        id: ClientBufferId(id),
        storage,
        format,
        size: (w, h).into(),
        scale: 1,
        transform: Transform::Normal,
    }
}

fn video(fx: &Fixture, buffer_id: u64, geometry: Rectangle<i32, Logical>) -> SceneSurface {
    SceneSurface::new(SurfaceId(1), geometry)
        .with_buffer(buffer(
            buffer_id,
            BufferStorage::Native,
            DrmFourcc::Xrgb8888,
            geometry.size.w,
            geometry.size.h,
        ))
        .on_output(fx.output)
}

fn pointer(fx: &Fixture) -> SceneSurface {
    SceneSurface::new(SurfaceId(2), rect(10, 20, 32, 32))
        .with_buffer(buffer(20, BufferStorage::Shm, DrmFourcc::Argb8888, 32, 32))
        .on_output(fx.output)
}

fn finished_flags(events: &[BackendEvent]) -> Vec<PresentationFlags> {
    events
        .iter()
        .filter_map(|event| match event {
            BackendEvent::FrameFinished { flags, .. } => Some(*flags),
            _ => None,
        })
        .collect()
}

#[test]
fn fullscreen_client_buffer_is_scanned_out() {
    let mut fx = Fixture::legacy();
    let geometry = fx.backend.output(fx.output).unwrap().geometry();
    let scene = [SceneSurface::new(SurfaceId(1), geometry)
        .with_buffer(buffer(1, BufferStorage::Native, DrmFourcc::Argb8888, 1920, 1080))
        .opaque()
        .on_output(fx.output)];

    let assignment = fx.assign(&scene);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Primary));
    assert!(assignment.surfaces[0].flags.contains(PresentationFlags::ZERO_COPY));
    assert!(assignment.surfaces[0].keep_buffer);
    assert!(assignment.primary_damage.is_empty());

    assert_eq!(fx.present(&assignment), SubmitOutcome::Flipping);
    let flags = finished_flags(&fx.vblank(16));
    assert!(flags[0].contains(PresentationFlags::ZERO_COPY | PresentationFlags::VSYNC));

    // the client buffer goes back once something else is on screen
    let assignment = fx.assign(&[]);
    fx.present(&assignment);
    assert!(fx.source.released().is_empty());
    fx.vblank(33);
    assert_eq!(fx.source.released().len(), 1);
}

#[test]
fn translucent_fullscreen_surface_is_composited() {
    let mut fx = Fixture::legacy();
    let geometry = fx.backend.output(fx.output).unwrap().geometry();
    let scene = [SceneSurface::new(SurfaceId(1), geometry)
        .with_buffer(buffer(1, BufferStorage::Native, DrmFourcc::Argb8888, 1920, 1080))
        .on_output(fx.output)];

    // ARGB without an opaque region does not match the XRGB primary plane
    let assignment = fx.assign(&scene);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Composited));
    assert_eq!(fx.source.imports, 0);
}

#[test]
fn overlay_frame_waits_for_its_vblank() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();

    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Overlay(fx.overlay)));
    assert!(assignment.overlays[0].update_sprite);
    fx.present(&assignment);

    let calls = fx.mock.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        Call::SetPlane { plane, fb: Some(_), dst, .. } if *plane == fx.overlay && *dst == Rectangle::new((100, 100).into(), (640, 480).into())
    )));
    assert!(calls.iter().any(|call| matches!(call, Call::QueueVblank { .. })));

    fx.mock.vblank(Duration::from_millis(16));
    let mut events = fx.mock.receive_events().unwrap().into_iter();
    fx.backend.handle_event(events.next().unwrap());
    assert_eq!(fx.backend.drain_events().count(), 0);
    assert!(matches!(
        fx.backend.output(fx.output).unwrap().state(),
        OutputState::FlipPending(_)
    ));

    fx.backend.handle_event(events.next().unwrap());
    let flags = finished_flags(&fx.backend.drain_events().collect::<Vec<_>>());
    assert_eq!(flags, vec![PresentationFlags::HW_CLOCK | PresentationFlags::HW_COMPLETION]);
    assert_eq!(fx.backend.output(fx.output).unwrap().state(), OutputState::Idle);
}

#[test]
fn unchanged_overlay_is_not_recommitted() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();
    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    fx.present(&assignment);
    fx.vblank(16);

    fx.mock.clear_calls();
    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480)).with_damage(vec![])]);
    assert!(!assignment.overlays[0].update_sprite);
    fx.present(&assignment);
    assert!(matches!(fx.mock.calls().as_slice(), [Call::PageFlip { .. }]));
    assert_eq!(fx.source.imports, 1);

    // moving the surface only updates the geometry
    fx.vblank(33);
    fx.mock.clear_calls();
    let assignment = fx.assign(&[video(&fx, 1, rect(200, 100, 640, 480))]);
    assert!(assignment.overlays[0].update_sprite);
    fx.present(&assignment);
    assert_eq!(fx.source.imports, 1);
    assert_eq!(fx.mock.plane_state(fx.overlay).dst.loc.x, 200);
}

#[test]
fn replaced_overlay_buffer_is_released_after_the_swap() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();
    let assignment = fx.assign(&[video(&fx, 1, rect(0, 0, 640, 480))]);
    fx.present(&assignment);
    fx.vblank(16);

    let assignment = fx.assign(&[video(&fx, 2, rect(0, 0, 640, 480))]);
    fx.present(&assignment);
    assert!(fx.source.released().is_empty());
    fx.vblank(33);
    assert_eq!(fx.source.released().len(), 1);
}

#[test]
fn unused_overlay_is_disabled_and_damages_the_primary() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();
    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    fx.present(&assignment);
    fx.vblank(16);

    fx.mock.clear_calls();
    let assignment = fx.assign(&[]);
    assert_eq!(
        assignment.primary_damage.extents(),
        Rectangle::new((100, 100).into(), (640, 480).into())
    );
    fx.present(&assignment);

    assert!(fx
        .mock
        .calls()
        .iter()
        .any(|call| matches!(call, Call::SetPlane { plane, fb: None, .. } if *plane == fx.overlay)));
    assert_eq!(fx.source.released().len(), 1);
    assert_eq!(fx.backend.overlays().next().unwrap().bound_crtc(), None);
}

#[test]
fn surfaces_below_composited_content_are_composited() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();
    let popup = SceneSurface::new(SurfaceId(3), rect(150, 150, 200, 200))
        .with_buffer(buffer(30, BufferStorage::Shm, DrmFourcc::Argb8888, 200, 200))
        .on_output(fx.output);

    let assignment = fx.assign(&[popup, video(&fx, 1, rect(100, 100, 640, 480))]);
    assert_eq!(
        assignment.composited().collect::<Vec<_>>(),
        vec![SurfaceId(3), SurfaceId(1)]
    );
    assert!(assignment.overlays.is_empty());
    assert_eq!(fx.source.imports, 0);
}

#[test]
fn overlay_rejects_unsuitable_surfaces() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();

    let rotated = video(&fx, 1, rect(0, 0, 640, 480)).with_transform(ViewTransform::Rotate);
    let mut hidpi = video(&fx, 1, rect(0, 0, 640, 480));
    if let Some(buffer) = hidpi.buffer.as_mut() {
        buffer.scale = 2;
    }
    let mut nv12 = video(&fx, 1, rect(0, 0, 640, 480));
    if let Some(buffer) = nv12.buffer.as_mut() {
        buffer.format = DrmFourcc::Nv12;
    }
    let unassociated = SceneSurface {
        id: SurfaceId(9),
        ..video(&fx, 1, rect(0, 0, 640, 480))
    };

    for surface in [rotated, hidpi, nv12, unassociated] {
        let id = surface.id;
        let assignment = fx.assign(&[surface]);
        assert_eq!(assignment.target(id), Some(Assignment::Composited));
    }
}

#[test]
fn atomic_overlay_carries_stacking_and_opacity() {
    let mut fx = Fixture::atomic();
    assert!(fx.backend.commit_strategy().is_atomic());
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();

    let assignment = fx.assign(&[
        pointer(&fx),
        video(&fx, 1, rect(100, 100, 640, 480)),
    ]);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Overlay(fx.overlay)));
    assert_eq!(assignment.overlays[0].zpos, Some(10));
    assert_eq!(assignment.overlays[0].alpha, Some(255));
    fx.present(&assignment);

    let commits = fx
        .mock
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::AtomicCommit { test_only, .. } => Some(test_only),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(commits, vec![true, false]);

    let state = fx.mock.plane_state(fx.overlay);
    assert_eq!(state.crtc, Some(fx.crtc()));
    assert!(state.fb.is_some());
    assert_eq!(state.zpos, Some(10));
    assert_eq!(state.dst, Rectangle::new((100, 100).into(), (640, 480).into()));
}

#[test]
fn rejected_atomic_commit_keeps_the_frame_going() {
    let mut fx = Fixture::atomic();
    fx.mock.reject_atomic_property("alpha");
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();

    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    assert_eq!(fx.present(&assignment), SubmitOutcome::Flipping);
    assert!(!fx
        .mock
        .calls()
        .iter()
        .any(|call| matches!(call, Call::QueueVblank { .. })));

    // the flip alone finishes the frame and the import is handed back
    assert_eq!(finished_flags(&fx.vblank(16)).len(), 1);
    assert_eq!(fx.source.released().len(), 1);
}

#[test]
fn cursor_plane_shows_small_shm_surfaces() {
    let mut fx = Fixture::legacy();
    let crtc = fx.crtc();

    let assignment = fx.assign(&[pointer(&fx)]);
    assert_eq!(assignment.target(SurfaceId(2)), Some(Assignment::Cursor));
    assert!(assignment.surfaces[0].keep_buffer);
    assert_eq!(fx.source.cursor_copies, 1);
    fx.present(&assignment);

    let cursor = fx.mock.cursor(crtc);
    assert!(cursor.bo.is_some());
    assert_eq!(cursor.position, (10, 20).into());
    assert!(fx.backend.output(fx.output).unwrap().cursor_visible());
    fx.vblank(16);

    // undamaged cursor, no copy
    let assignment = fx.assign(&[pointer(&fx).with_damage(vec![])]);
    assert_eq!(assignment.target(SurfaceId(2)), Some(Assignment::Cursor));
    assert_eq!(fx.source.cursor_copies, 1);
    fx.present(&assignment);
    fx.vblank(33);

    let assignment = fx.assign(&[]);
    fx.present(&assignment);
    assert_eq!(fx.mock.cursor(crtc).bo, None);
    assert!(!fx.backend.output(fx.output).unwrap().cursor_visible());
}

#[test]
fn cursor_failure_disables_cursors_for_good() {
    let mut fx = Fixture::legacy();
    fx.mock.fail_next(Failure::SetCursor);

    let assignment = fx.assign(&[pointer(&fx)]);
    assert_eq!(fx.present(&assignment), SubmitOutcome::Flipping);
    assert!(fx.backend.cursors_broken());
    fx.vblank(16);

    let assignment = fx.assign(&[pointer(&fx)]);
    assert_eq!(assignment.target(SurfaceId(2)), Some(Assignment::Composited));
}

#[test]
fn debug_toggles_steer_plane_usage() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();

    assert!(fx.backend.toggle(DebugToggle::Cursors));
    assert!(fx.backend.toggle(DebugToggle::Overlays));
    let assignment = fx.assign(&[pointer(&fx), video(&fx, 1, rect(100, 100, 640, 480))]);
    assert_eq!(assignment.composited().count(), 2);
    fx.backend.toggle(DebugToggle::Cursors);
    fx.backend.toggle(DebugToggle::Overlays);

    assert!(fx.backend.toggle(DebugToggle::HideOverlays));
    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Overlay(fx.overlay)));
    fx.present(&assignment);
    assert_eq!(fx.mock.plane_state(fx.overlay).fb, None);
}

#[test]
fn software_rendering_keeps_buffers_and_skips_scanout() {
    let mut fx = Fixture::legacy();
    assert!(fx.backend.toggle(DebugToggle::Renderer));
    let geometry = fx.backend.output(fx.output).unwrap().geometry();
    let scene = [SceneSurface::new(SurfaceId(1), geometry)
        .with_buffer(buffer(1, BufferStorage::Native, DrmFourcc::Xrgb8888, 1920, 1080))
        .on_output(fx.output)];

    let assignment = fx.assign(&scene);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Composited));
    assert!(assignment.surfaces[0].keep_buffer);
    assert_eq!(fx.source.imports, 0);
}

#[test]
fn addfb2_fallback_gives_up_on_overlays() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();
    fx.mock.fail_next(Failure::AddFb2);

    fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    assert!(fx.backend.sprites_broken());

    let assignment = fx.assign(&[video(&fx, 2, rect(100, 100, 640, 480))]);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Composited));
}

#[test]
fn assignment_is_refused_while_flipping() {
    let mut fx = Fixture::legacy();
    let assignment = fx.assign(&[]);
    fx.present(&assignment);

    assert!(matches!(
        fx.backend.assign_planes(fx.output, &[], &mut fx.source),
        Err(Error::FlipPending(_))
    ));
    assert!(matches!(
        fx.backend.register_overlay_association(SurfaceId(1), drm::control::from_u32(9999).unwrap()),
        Err(Error::UnknownPlane(_))
    ));
}

#[test]
fn pausing_resolves_outstanding_overlay_vblanks() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(1), fx.overlay)
        .unwrap();
    let assignment = fx.assign(&[video(&fx, 1, rect(100, 100, 640, 480))]);
    fx.present(&assignment);

    fx.mock.vblank(Duration::from_millis(16));
    let mut events = fx.mock.receive_events().unwrap().into_iter();
    fx.backend.handle_event(events.next().unwrap());

    fx.backend.deactivate();
    let flags = finished_flags(&fx.backend.drain_events().collect::<Vec<_>>());
    assert_eq!(flags.len(), 1);
    assert!(flags[0].contains(PresentationFlags::INVALID));
    assert_eq!(fx.mock.plane_state(fx.overlay).fb, None);

    // the late vblank is ignored
    fx.backend.handle_event(events.next().unwrap());
    assert_eq!(fx.backend.drain_events().count(), 0);
}

#[test]
fn stacked_overlays_follow_the_view_order() {
    let mut fx = Fixture::with_overlays(
        DeviceCapabilities {
            atomic: true,
            ..Default::default()
        },
        2,
    );
    let (lower, upper) = (fx.overlays[0], fx.overlays[1]);
    fx.backend.register_overlay_association(SurfaceId(1), lower).unwrap();
    fx.backend.register_overlay_association(SurfaceId(4), upper).unwrap();

    let top = SceneSurface {
        id: SurfaceId(4),
        ..video(&fx, 4, rect(1000, 100, 320, 240))
    };
    let assignment = fx.assign(&[top, video(&fx, 1, rect(100, 100, 640, 480))]);

    let zpos = |plane| {
        assignment
            .overlays
            .iter()
            .find(|o| o.plane == plane)
            .and_then(|o| o.zpos)
            .unwrap()
    };
    assert_eq!(assignment.overlays.len(), 2);
    assert!(zpos(upper) > zpos(lower));
}

#[test]
fn legacy_and_atomic_commits_converge() {
    let mut shown = Vec::new();
    for mut fx in [Fixture::legacy(), Fixture::atomic()] {
        fx.backend
            .register_overlay_association(SurfaceId(1), fx.overlay)
            .unwrap();
        let assignment = fx.assign(&[video(&fx, 1, rect(-100, 200, 640, 480))]);
        fx.present(&assignment);
        let state = fx.mock.plane_state(fx.overlay);
        assert!(state.fb.is_some());
        shown.push((state.crtc, state.dst, state.src));
    }
    assert_eq!(shown[0], shown[1]);
}

#[test]
fn repaint_loop_drops_an_unsubmitted_assignment() {
    let mut fx = Fixture::legacy();
    fx.backend
        .register_overlay_association(SurfaceId(3), fx.overlay)
        .unwrap();
    let assignment = fx.assign(&[]);
    fx.present(&assignment);
    fx.vblank(16);
    let shown = fx.mock.crtc_framebuffer(fx.crtc());
    assert!(shown.is_some());

    let geometry = fx.backend.output(fx.output).unwrap().geometry();
    let scene = [
        SceneSurface::new(SurfaceId(3), rect(100, 100, 640, 480))
            .with_buffer(buffer(3, BufferStorage::Native, DrmFourcc::Xrgb8888, 640, 480))
            .on_output(fx.output),
        SceneSurface::new(SurfaceId(1), geometry)
            .with_buffer(buffer(1, BufferStorage::Native, DrmFourcc::Xrgb8888, 1920, 1080))
            .opaque()
            .on_output(fx.output),
    ];
    let assignment = fx.assign(&scene);
    assert_eq!(assignment.target(SurfaceId(1)), Some(Assignment::Primary));
    assert_eq!(assignment.target(SurfaceId(3)), Some(Assignment::Overlay(fx.overlay)));

    // the compositor gave up on the frame and asks for a timestamp instead
    fx.mock.clear_calls();
    fx.mock.set_vblank_reply(VblankReply {
        sequence: 1,
        time: Duration::from_millis(16),
    });
    fx.backend.start_repaint_loop(fx.output).unwrap();
    assert!(matches!(fx.mock.calls().as_slice(), [Call::PageFlip { fb, .. }] if Some(*fb) == shown));

    let flags = finished_flags(&fx.vblank(1000));
    assert_eq!(flags.len(), 1);
    assert!(!flags[0].contains(PresentationFlags::ZERO_COPY));

    let output = fx.backend.output(fx.output).unwrap();
    assert_eq!(fx.mock.crtc_framebuffer(fx.crtc()), shown);
    assert_eq!(output.scanout_framebuffer(), shown);
    assert_eq!(fx.mock.live_framebuffers(), 1);
    assert!(fx.mock.plane_state(fx.overlay).fb.is_none());
    assert!(fx.backend.overlays().all(|plane| plane.bound_crtc().is_none()));
}
