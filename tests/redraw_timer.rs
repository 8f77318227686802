use calview::config::ViewerConfig;
use calview::draw_context::DrawMode;
use calview::gpu::recording::RecordingBackend;
use calview::scene::{Gesture, Modifiers, ViewKey};
use calview::SceneWidget;
use std::time::{Duration, Instant};

fn setup(config: ViewerConfig) -> (SceneWidget, RecordingBackend) {
    let mut gpu = RecordingBackend::new(320, 240);
    let mut scene = SceneWidget::new(config).expect("scene");
    scene.initialize(&mut gpu);
    (scene, gpu)
}

#[test]
fn draft_frame_is_followed_by_a_full_redraw() {
    let (mut scene, mut gpu) = setup(ViewerConfig::default());
    let t0 = Instant::now();
    assert!(scene.handle(Gesture::Key(ViewKey::F3)));
    assert!(scene.take_redraw_request());
    assert_eq!(scene.next_mode(), DrawMode::Draft);

    scene.paint(&mut gpu, t0).expect("draft");
    assert_eq!(scene.draw_context().mode, DrawMode::Draft);
    assert_eq!(scene.next_mode(), DrawMode::Normal);
    assert!(scene.next_deadline() <= t0 + Duration::from_millis(500));

    scene.tick(&mut gpu, t0 + Duration::from_millis(100));
    assert!(!scene.take_redraw_request(), "debounce still running");
    scene.tick(&mut gpu, t0 + Duration::from_millis(500));
    assert!(scene.take_redraw_request());

    scene.paint(&mut gpu, t0 + Duration::from_millis(520)).expect("normal");
    assert_eq!(scene.draw_context().mode, DrawMode::Normal);
    scene.tick(&mut gpu, t0 + Duration::from_secs(5));
    assert!(!scene.take_redraw_request(), "normal frames schedule nothing");
    assert_eq!(gpu.frames().len(), 2);
}

#[test]
fn interaction_during_the_debounce_restarts_it() {
    let (mut scene, mut gpu) = setup(ViewerConfig::default());
    let t0 = Instant::now();
    scene.draft_update();
    scene.paint(&mut gpu, t0).expect("draft");

    scene.handle(Gesture::Wheel { delta: 120.0, modifiers: Modifiers::empty() });
    scene.paint(&mut gpu, t0 + Duration::from_millis(400)).expect("second draft");
    scene.take_redraw_request();
    scene.tick(&mut gpu, t0 + Duration::from_millis(600));
    assert!(!scene.take_redraw_request(), "deadline moved with the second draft");
    scene.tick(&mut gpu, t0 + Duration::from_millis(900));
    assert!(scene.take_redraw_request());
}

#[test]
fn draft_only_views_never_schedule_a_full_frame() {
    let mut config = ViewerConfig::default();
    config.view.draft_only = true;
    let (mut scene, mut gpu) = setup(config);
    let t0 = Instant::now();
    scene.draft_update();
    scene.paint(&mut gpu, t0).expect("draft");
    assert_eq!(scene.next_mode(), DrawMode::Draft);
    scene.tick(&mut gpu, t0 + Duration::from_secs(2));
    assert!(!scene.take_redraw_request());
}

#[test]
fn resize_rebuilds_the_viewport_and_drafts() {
    let (mut scene, mut gpu) = setup(ViewerConfig::default());
    scene.take_redraw_request();
    scene.resize(&mut gpu, 200, 100);
    assert_eq!(scene.draw_context().aspect, 2.0);
    assert_eq!((scene.depth().width(), scene.depth().height()), (200, 100));
    assert!(scene.take_redraw_request());

    scene.resize(&mut gpu, 0, 0);
    assert_eq!((scene.draw_context().width, scene.draw_context().height), (1, 1));
}
