//! Hosts a [`SceneWidget`] in a winit window, or renders one offscreen frame for `--headless`.

use crate::config::ViewerConfig;
use crate::draw_context::DrawMode;
use crate::gpu::recording::RecordingBackend;
use crate::gpu::wgpu_backend::WgpuBackend;
use crate::gpu::GpuBackend;
use crate::input::{Input, InputEvent};
use crate::scene::{EntityKind, SceneWidget};

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

/// Longest a headless run waits for its files to parse.
const HEADLESS_LOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// What to load once the GPU is up.
#[derive(Debug, Clone, Default)]
pub struct Launch {
    pub files: Vec<(EntityKind, PathBuf)>,
    /// Model drawn at every pose of the pose files.
    pub reference: Option<PathBuf>,
}

impl Launch {
    /// Queues every file on the scene's loader. Pose files share one reference model.
    fn queue(self, scene: &SceneWidget) -> usize {
        let has_poses = self.files.iter().any(|(kind, _)| *kind == EntityKind::Poses);
        let reference = match self.reference {
            Some(path) if has_poses => Some(scene.load_reference(EntityKind::Model, path)),
            Some(path) => {
                warn!("reference model {} ignored: no pose files given", path.display());
                None
            }
            None => None,
        };
        for (kind, path) in &self.files {
            match kind {
                EntityKind::Poses => scene.load_pose_file(path, reference.clone()),
                _ => scene.load_file(*kind, path),
            };
        }
        self.files.len()
    }
}

pub fn run(config: ViewerConfig, launch: Launch) -> Result<()> {
    let event_loop = EventLoop::new().context("Failed to create winit event loop")?;
    let mut app = App::new(config, launch)?;
    event_loop.run_app(&mut app).context("Event loop execution failed")?;
    Ok(())
}

/// Loads everything, renders one full-quality frame offscreen and reports what was drawn.
/// Falls back to the recording backend when no adapter is available.
pub fn run_headless(config: ViewerConfig, launch: Launch) -> Result<()> {
    let (width, height) = (config.window.width, config.window.height);
    let mut scene = SceneWidget::new(config)?;
    let mut recording = None;
    let mut device = None;
    let gpu: &mut dyn GpuBackend = match WgpuBackend::headless(width, height) {
        Ok(backend) => device.insert(backend),
        Err(err) => {
            warn!("no GPU adapter ({err:#}); rendering into host memory");
            recording.insert(RecordingBackend::new(width, height))
        }
    };

    scene.initialize(gpu);
    let queued = launch.queue(&scene);
    let handled = scene.finish_loading(gpu, HEADLESS_LOAD_TIMEOUT);
    if handled < queued {
        warn!("{} of {queued} files still loading after {HEADLESS_LOAD_TIMEOUT:?}", queued - handled);
    }
    while scene.has_incomplete() {
        scene.partial_prepare(gpu);
    }
    scene.draw_core(gpu, DrawMode::Normal).context("Failed to render the headless frame")?;
    for event in scene.events() {
        info!("{event}");
    }
    info!("rendered {} entities at {width}x{height}", scene.entity_count());
    if let Some(recording) = &recording {
        if let Some(frame) = recording.frames().first() {
            info!("{} draw calls, {} live buffers", frame.all_calls().count(), recording.live_buffers());
        }
    }
    Ok(())
}

pub struct App {
    config: ViewerConfig,
    scene: SceneWidget,
    input: Input,
    window: Option<Arc<Window>>,
    gpu: Option<WgpuBackend>,
    launch: Option<Launch>,
    should_close: bool,
}

impl App {
    pub fn new(config: ViewerConfig, launch: Launch) -> Result<Self> {
        let scene = SceneWidget::new(config.clone())?;
        Ok(Self {
            config,
            scene,
            input: Input::new(),
            window: None,
            gpu: None,
            launch: Some(launch),
            should_close: false,
        })
    }

    pub fn scene(&self) -> &SceneWidget {
        &self.scene
    }

    fn init_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title(self.config.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.window.width, self.config.window.height));
        let window = Arc::new(event_loop.create_window(attributes).context("Failed to create window")?);
        let mut gpu = WgpuBackend::for_window(window.clone(), &self.config.window)?;

        let size = window.inner_size();
        self.scene.resize(&mut gpu, size.width, size.height);
        self.scene.initialize(&mut gpu);
        if let Some(launch) = self.launch.take() {
            let queued = launch.queue(&self.scene);
            if queued > 0 {
                info!("loading {queued} files");
            }
        }
        window.request_redraw();
        self.window = Some(window);
        self.gpu = Some(gpu);
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(err) = self.init_window(event_loop) {
            error!("Renderer initialization error: {err:?}");
            self.should_close = true;
        }
    }

    fn window_event(&mut self, _el: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let (Some(window), Some(gpu)) = (self.window.as_ref(), self.gpu.as_mut()) else {
            return;
        };
        if id != window.id() {
            return;
        }
        match &event {
            WindowEvent::CloseRequested => self.should_close = true,
            WindowEvent::Resized(size) => self.scene.resize(gpu, size.width, size.height),
            WindowEvent::RedrawRequested => {
                if let Err(err) = self.scene.paint(gpu, Instant::now()) {
                    warn!("frame dropped: {err}");
                    self.scene.draft_update();
                }
            }
            _ => {
                let now = Instant::now();
                for gesture in self.input.push(&InputEvent::from_window_event(&event), now) {
                    self.scene.handle(gesture);
                }
            }
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_close {
            event_loop.exit();
            return;
        }
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        self.scene.tick(gpu, Instant::now());
        for event in self.scene.events() {
            info!("{event}");
        }
        if self.scene.take_redraw_request() {
            if let Some(window) = &self.window {
                window.request_redraw();
            }
        }
        event_loop.set_control_flow(ControlFlow::WaitUntil(self.scene.next_deadline()));
    }
}
