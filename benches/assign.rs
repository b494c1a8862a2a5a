use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use drm_fourcc::DrmFourcc;
use kms_scanout::{
    backend::drm::{
        BackendConfig, BufferStorage, ClientBufferId, KmsBackend, SceneSurface, SurfaceBuffer, SurfaceId,
    },
    testing::{mode, MockDevice, MockSource},
    utils::{Rectangle, Transform},
};

fn scene(output: kms_scanout::backend::drm::OutputId, windows: usize) -> Vec<SceneSurface> {
    let pointer = SceneSurface::new(SurfaceId(0), Rectangle::new((500, 300).into(), (24, 24).into()))
        .with_buffer(SurfaceBuffer {
            id: ClientBufferId(0),
            storage: BufferStorage::Shm,
            format: DrmFourcc::Argb8888,
            size: (24, 24).into(),
            scale: 1,
            transform: Transform::Normal,
        })
        .on_output(output);

    std::iter::once(pointer)
        .chain((1..=windows).map(|i| {
            let offset = (i as i32 * 37) % 1200;
            SceneSurface::new(
                SurfaceId(i as u64),
                Rectangle::new((offset, offset / 2).into(), (640, 480).into()),
            )
            .with_buffer(SurfaceBuffer {
                id: ClientBufferId(i as u64),
                storage: BufferStorage::Shm,
                format: DrmFourcc::Argb8888,
                size: (640, 480).into(),
                scale: 1,
                transform: Transform::Normal,
            })
            .on_output(output)
        }))
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mock = Arc::new(MockDevice::new(Default::default()));
    let crtc = mock.add_crtc();
    mock.add_overlay_plane(&[crtc], &[DrmFourcc::Xrgb8888], true);
    mock.add_connector("eDP-1", vec![mode(1920, 1080, 60, true)], &[crtc]);

    let mut backend = KmsBackend::new(mock.clone(), BackendConfig::default()).unwrap();
    let output = backend.outputs().next().unwrap().id();
    let mut source = MockSource::new(mock);

    let mut group = c.benchmark_group("assign_planes");
    for windows in [4, 32, 256] {
        let surfaces = scene(output, windows);
        group.bench_with_input(BenchmarkId::from_parameter(windows), &surfaces, |b, surfaces| {
            b.iter(|| backend.assign_planes(output, surfaces, &mut source).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
