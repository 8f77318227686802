use calview::config::ViewerConfig;
use calview::depth::{self, decode_depth, encode_depth, DepthImage, DepthSource};
use calview::entity::EntityKind;
use calview::events::SceneEvent;
use calview::gpu::recording::RecordingBackend;
use calview::gpu::{PassKind, RenderTarget};
use calview::packet::{sensor_to_enu, PacketExtras, PointCloudPacket, PointFormat};
use calview::scene::Gesture;
use calview::SceneWidget;
use glam::{DVec3, Vec2, Vec3};
use std::time::{Duration, Instant};

const W: u32 = 64;
const H: u32 = 48;

fn scene(gpu: &mut RecordingBackend) -> SceneWidget {
    let mut config = ViewerConfig::default();
    config.window.width = W;
    config.window.height = H;
    let mut scene = SceneWidget::new(config).expect("scene");
    scene.initialize(gpu);
    scene.events();
    scene
}

fn uniform<T: Copy>(value: T) -> DepthImage<T> {
    DepthImage { width: W, height: H, data: vec![value; (W * H) as usize] }
}

fn georeferenced_cloud(origin: DVec3) -> Vec<u8> {
    PointCloudPacket {
        extras: PacketExtras { origin: Some(origin), label: None },
        format: PointFormat::XYZ,
        n_points: 4,
        data: vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0],
        ..Default::default()
    }
    .encode()
}

fn assert_close(actual: Vec3, expected: Vec3) {
    assert!(actual.abs_diff_eq(expected, 1e-3), "expected {expected}, got {actual}");
}

#[test]
fn double_click_moves_poi_onto_float_depth() {
    let mut gpu = RecordingBackend::new(W, H);
    gpu.set_float_depth(uniform(0.5f32));
    let mut scene = scene(&mut gpu);
    scene.paint(&mut gpu, Instant::now()).expect("paint");
    assert!(!scene.alt_depth());
    assert_eq!(scene.depth().source(), DepthSource::Float);

    let vp = scene.draw_context().view_projection();
    let expected = depth::unproject(Vec3::new(32.0, 24.0, 0.5), vp, [0, 0, W as i32, H as i32]).expect("inside");
    assert!(scene.handle(Gesture::DoubleClick { position: Vec2::new(32.0, 24.0) }));
    assert_close(scene.camera().poi, expected);
    assert_eq!(scene.events(), vec![SceneEvent::poi_updated(expected)]);
    assert!(scene.take_redraw_request());
}

#[test]
fn clicks_near_the_edge_or_on_background_miss() {
    let mut gpu = RecordingBackend::new(W, H);
    let mut scene = scene(&mut gpu);
    scene.paint(&mut gpu, Instant::now()).expect("paint");
    let poi = scene.camera().poi;

    // blank depth reads as the far plane everywhere
    assert!(!scene.set_poi_from_window(32.0, 24.0));
    gpu.set_float_depth(uniform(0.5f32));
    scene.paint(&mut gpu, Instant::now()).expect("paint");
    assert!(!scene.set_poi_from_window(3.0, 24.0), "probe must stay inside the search margin");
    assert_eq!(scene.camera().poi, poi);
    assert!(scene.events().is_empty());
}

#[test]
fn missing_depth_readback_falls_back_to_encoded_frames() {
    let mut gpu = RecordingBackend::new(W, H).without_float_depth();
    let word = encode_depth(0.5);
    gpu.set_encoded_depth(uniform(word));
    let mut scene = scene(&mut gpu);
    scene.paint(&mut gpu, Instant::now()).expect("paint");

    assert!(scene.alt_depth());
    assert_eq!(scene.depth().source(), DepthSource::Encoded);
    let frames = gpu.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].target, RenderTarget::Screen);
    let pick = &frames[1];
    assert_eq!(pick.target, RenderTarget::EncodedDepth);
    assert_eq!(pick.depth_reads, 1);
    let kinds: Vec<_> = pick.passes.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, vec![PassKind::OpaquePickable, PassKind::OpaqueOther, PassKind::Alpha { blend: false }]);

    let vp = scene.draw_context().view_projection();
    let z = decode_depth(word);
    let expected = depth::unproject(Vec3::new(32.0, 24.0, z), vp, [0, 0, W as i32, H as i32]).expect("inside");
    assert!(scene.set_poi_from_window(32.0, 24.0));
    assert_close(scene.camera().poi, expected);
}

#[test]
fn first_georeferenced_entity_seeds_the_master_origin() {
    let mut gpu = RecordingBackend::new(W, H);
    let mut scene = scene(&mut gpu);
    assert_eq!(scene.master_origin(), Vec3::ZERO);

    let origin = DVec3::new(10.0, -4.0, 250.0);
    let id = scene.load_bytes(EntityKind::PointCloud, georeferenced_cloud(origin), "geo");
    scene.finish_loading(&mut gpu, Duration::from_secs(10));
    let local_origin = sensor_to_enu(10.0, -4.0, 250.0);
    assert_close(scene.master_origin(), local_origin);

    let other = DVec3::new(500.0, 0.0, 0.0);
    scene.load_bytes(EntityKind::PointCloud, georeferenced_cloud(other), "later");
    scene.finish_loading(&mut gpu, Duration::from_secs(10));
    assert_close(scene.master_origin(), local_origin);

    // clicking recenters on the cloud's first point
    scene.camera_mut().poi = Vec3::new(3.0, 3.0, 3.0);
    assert!(scene.entity_clicked(id));
    assert_close(scene.master_origin(), local_origin + sensor_to_enu(1.0, 2.0, 3.0));
    assert_eq!(scene.camera().poi, Vec3::ZERO);
}

#[test]
fn entities_without_origin_do_not_recenter() {
    let mut gpu = RecordingBackend::new(W, H);
    let mut scene = scene(&mut gpu);
    let id = scene.load_bytes(EntityKind::Stock, Vec::<u8>::new(), "arrow");
    scene.finish_loading(&mut gpu, Duration::from_secs(10));
    assert!(scene.entity(id).is_some());
    assert!(!scene.entity_clicked(id));
    assert!(!scene.entity_clicked(uuid::Uuid::new_v4()));
    assert_eq!(scene.master_origin(), Vec3::ZERO);
}
