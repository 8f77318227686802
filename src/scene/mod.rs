//! The scene widget: entity registry, frame composition, depth picking and camera control.
//!
//! The widget never owns the GPU. The host lends it a [`GpuBackend`] for every call that
//! touches device resources, and drives time through [`SceneWidget::tick`].

pub mod input;
pub mod loader;
pub mod registry;

pub use crate::entity::EntityKind;
pub use input::{Gesture, Modifiers, ViewKey};

use crate::camera3d::OrbitCamera;
use crate::config::ViewerConfig;
use crate::depth::{DepthContext, SearchPattern};
use crate::draw_context::{DrawContext, DrawMode};
use crate::entity::{
    new_handle, AxisIndicator, Entity, EntityCore, EntityFlags, EntityHandle, EntitySource, ModelEntity,
    PointCloudEntity, PolylineEntity, PosesEntity, PrepareContext, SharedOrigin,
};
use crate::events::{EventBus, SceneEvent};
use crate::gpu::{
    CurrentContext, DepthReadError, DrawList, GpuBackend, GpuError, PassKind, ProgramCache, RenderTarget,
};
use anyhow::Result;
use glam::{Mat4, Vec2, Vec3};
use loader::{LoadOutcome, Loader};
use log::{debug, info, warn};
use registry::Registry;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};
use uuid::Uuid;

const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
/// Encoded-depth clear: `0x00ffffff` decodes to the far plane.
const PICK_CLEAR_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 0.0];

fn lock(handle: &EntityHandle) -> std::sync::MutexGuard<'_, Box<dyn Entity>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SceneWidget {
    config: ViewerConfig,
    registry: Registry,
    programs: Arc<ProgramCache>,
    events: EventBus,
    origin: SharedOrigin,
    camera: OrbitCamera,
    draw: DrawContext,
    depth: DepthContext,
    search: SearchPattern,
    loader: Loader,
    poi_indicator: Option<EntityHandle>,
    next_mode: DrawMode,
    redraw_requested: bool,
    redraw_at: Option<Instant>,
    partial_at: Instant,
    alt_depth: bool,
    depth_fallback_logged: bool,
    last_cursor: Option<Vec2>,
}

impl SceneWidget {
    pub fn new(config: ViewerConfig) -> Result<Self> {
        let loader = Loader::new(config.loader.threads)?;
        let mut camera = OrbitCamera::new();
        camera.control = config.view.control_mode;
        camera.set_projection(config.view.camera_mode);
        let (width, height) = (config.window.width.max(1), config.window.height.max(1));
        let draw = DrawContext {
            width,
            height,
            aspect: width as f32 / height as f32,
            anti_alias: config.view.point_anti_alias,
            ..DrawContext::default()
        };
        Ok(Self {
            search: SearchPattern::new(config.picking.search_radius),
            depth: DepthContext::new(width, height),
            registry: Registry::new(),
            programs: Arc::new(ProgramCache::new()),
            events: EventBus::default(),
            origin: Arc::new(RwLock::new(Vec3::ZERO)),
            camera,
            draw,
            loader,
            poi_indicator: None,
            next_mode: DrawMode::Normal,
            redraw_requested: false,
            redraw_at: None,
            partial_at: Instant::now(),
            alt_depth: false,
            depth_fallback_logged: false,
            last_cursor: None,
            config,
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn camera(&self) -> &OrbitCamera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut OrbitCamera {
        &mut self.camera
    }

    pub fn draw_context(&self) -> &DrawContext {
        &self.draw
    }

    /// Drawing options the host may edit; call [`SceneWidget::redraw_entity`] afterwards.
    pub fn draw_context_mut(&mut self) -> &mut DrawContext {
        &mut self.draw
    }

    pub fn depth(&self) -> &DepthContext {
        &self.depth
    }

    pub fn programs(&self) -> &Arc<ProgramCache> {
        &self.programs
    }

    pub fn master_origin(&self) -> Vec3 {
        *self.origin.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alt_depth(&self) -> bool {
        self.alt_depth
    }

    pub fn next_mode(&self) -> DrawMode {
        self.next_mode
    }

    pub fn events(&self) -> Vec<SceneEvent> {
        self.events.drain()
    }

    pub fn entity_count(&self) -> usize {
        self.registry.len()
    }

    pub fn entity_ids(&self) -> Vec<Uuid> {
        self.registry.ids()
    }

    pub fn entity(&self, id: Uuid) -> Option<EntityHandle> {
        self.registry.get(id)
    }

    pub fn poi_indicator(&self) -> Option<&EntityHandle> {
        self.poi_indicator.as_ref()
    }

    pub fn has_incomplete(&self) -> bool {
        self.registry.has_incomplete()
    }

    pub fn loads_in_flight(&self) -> usize {
        self.loader.in_flight()
    }

    fn prepare_context<'a>(&'a self, gpu: &'a mut (dyn GpuBackend + 'a)) -> PrepareContext<'a> {
        PrepareContext {
            gpu,
            programs: &self.programs,
            events: &self.events,
            chunk_points: self.config.loader.chunk_points,
            point_anti_alias: self.config.view.point_anti_alias,
        }
    }

    /// Uploads the POI marker and announces the scene.
    pub fn initialize(&mut self, gpu: &mut dyn GpuBackend) {
        let mut indicator: Box<dyn Entity> = Box::new(AxisIndicator::new());
        indicator.core_mut().caption = "POI".into();
        indicator.core_mut().origin = Some(Arc::clone(&self.origin));
        if let Err(err) = indicator.load() {
            warn!("POI indicator: {err}");
        }
        let handle = new_handle(indicator);
        if self.insert_loaded(gpu, handle.clone()) {
            self.poi_indicator = Some(handle);
        }
        self.partial_at = Instant::now();
        self.events.push(SceneEvent::Initialized);
        info!("scene initialized ({}x{})", self.draw.width, self.draw.height);
    }

    pub fn resize(&mut self, gpu: &mut dyn GpuBackend, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        gpu.resize(width, height);
        self.draw.width = width;
        self.draw.height = height;
        self.draw.aspect = width as f32 / height as f32;
        self.depth = DepthContext::new(width, height);
        self.draft_update();
    }

    // ---------------------------------------------------------------------
    // Loading

    fn new_core(&self, source: EntitySource) -> EntityCore {
        let mut core = EntityCore::new("entity").with_source(source);
        core.origin = Some(Arc::clone(&self.origin));
        core
    }

    fn make_entity(&self, kind: EntityKind, source: EntitySource) -> Box<dyn Entity> {
        let core = self.new_core(source);
        match kind {
            EntityKind::Model => Box::new(ModelEntity::new(core)),
            EntityKind::PointCloud => Box::new(PointCloudEntity::new(core)),
            EntityKind::Poses => Box::new(PosesEntity::new(core, None)),
            EntityKind::Polyline => Box::new(PolylineEntity::new(core)),
            EntityKind::Stock => {
                let mut core = core;
                core.source = EntitySource::Bytes { name: "arrow".into(), data: Vec::<u8>::new().into() };
                core.caption = "arrow".into();
                Box::new(ModelEntity::new(core))
            }
            EntityKind::AxisIndicator => {
                let mut axis = AxisIndicator::new();
                axis.core_mut().origin = core.origin;
                Box::new(axis)
            }
        }
    }

    /// Starts parsing `path` in the background and returns the future entity's id.
    pub fn load_file(&self, kind: EntityKind, path: impl AsRef<Path>) -> Uuid {
        let path = path.as_ref();
        debug!("load {kind:?} from {}", path.display());
        self.spawn(new_handle(self.make_entity(kind, EntitySource::File(path.to_path_buf()))))
    }

    pub fn load_bytes(&self, kind: EntityKind, bytes: impl Into<Arc<[u8]>>, name: &str) -> Uuid {
        let source = EntitySource::Bytes { name: name.to_string(), data: bytes.into() };
        self.spawn(new_handle(self.make_entity(kind, source)))
    }

    /// Loads an entity that is only drawn through a pose sequence. The handle is usable
    /// right away; the passes skip it and it registers once parsed.
    pub fn load_reference(&self, kind: EntityKind, path: impl AsRef<Path>) -> EntityHandle {
        let mut entity = self.make_entity(kind, EntitySource::File(path.as_ref().to_path_buf()));
        entity.core_mut().flags.insert(EntityFlags::REFERENCE);
        let handle = new_handle(entity);
        self.spawn(handle.clone());
        handle
    }

    /// Loads a pose sequence that stamps `reference` at every pose. Never waits on a
    /// reference that a loader worker is still parsing; the pose entity flags it on first draw.
    pub fn load_pose_file(&self, path: impl AsRef<Path>, reference: Option<EntityHandle>) -> Uuid {
        if let Some(reference) = &reference {
            match reference.try_lock() {
                Ok(mut model) => model.core_mut().flags.insert(EntityFlags::REFERENCE),
                Err(TryLockError::Poisoned(poisoned)) => {
                    poisoned.into_inner().core_mut().flags.insert(EntityFlags::REFERENCE)
                }
                Err(TryLockError::WouldBlock) => debug!("reference busy loading; flagged on first draw"),
            }
        }
        let core = self.new_core(EntitySource::File(path.as_ref().to_path_buf()));
        self.spawn(new_handle(Box::new(PosesEntity::new(core, reference))))
    }

    /// Parses an already built entity in the background.
    pub fn load_entity(&self, entity: Box<dyn Entity>) -> Uuid {
        let mut entity = entity;
        if entity.core().origin.is_none() {
            entity.core_mut().origin = Some(Arc::clone(&self.origin));
        }
        self.spawn(new_handle(entity))
    }

    fn spawn(&self, handle: EntityHandle) -> Uuid {
        let id = lock(&handle).id();
        self.loader.spawn(handle);
        id
    }

    /// Blocks until every spawned load has been handled or `timeout` passes.
    /// Returns the number of loads handled.
    pub fn finish_loading(&mut self, gpu: &mut dyn GpuBackend, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut handled = 0;
        while self.loader.in_flight() > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let Some(outcome) = self.loader.wait(left) else {
                break;
            };
            self.entity_loaded(gpu, outcome);
            handled += 1;
        }
        handled
    }

    /// Completes a worker load on the render thread: prepare, register, announce.
    pub fn entity_loaded(&mut self, gpu: &mut dyn GpuBackend, outcome: LoadOutcome) {
        let LoadOutcome { handle, result, elapsed } = outcome;
        let (source, caption, id, valid, local_origin) = {
            let entity = lock(&handle);
            let core = entity.core();
            (core.source.describe(), core.caption.clone(), core.id(), core.valid, core.local_origin)
        };
        if let Err(err) = result {
            warn!("{source}: rejected: {err}");
            return;
        }
        if !valid {
            warn!("{source}: rejected: no usable content");
            return;
        }
        self.seed_master_origin(local_origin);
        if !self.insert_loaded(gpu, handle) {
            return;
        }
        info!("{caption}: loaded from {source} in {:.1} ms", elapsed.as_secs_f64() * 1000.0);
        self.events.push(SceneEvent::EntityLoaded { id, caption });
        self.draft_update();
    }

    /// The first georeferenced entity fixes the master origin.
    fn seed_master_origin(&self, local_origin: Vec3) {
        if local_origin == Vec3::ZERO {
            return;
        }
        let mut master = self.origin.write().unwrap_or_else(PoisonError::into_inner);
        if *master == Vec3::ZERO {
            *master = local_origin;
            debug!("master origin set to {local_origin}");
        }
    }

    fn insert_loaded(&mut self, gpu: &mut dyn GpuBackend, handle: EntityHandle) -> bool {
        let mut entity = lock(&handle);
        let id = entity.id();
        let prepared = {
            let mut current = CurrentContext::new(gpu);
            let mut ctx = self.prepare_context(&mut *current);
            entity.prepare_gpu(&mut ctx)
        };
        let incomplete = match prepared {
            Ok(incomplete) => incomplete,
            Err(err) => {
                warn!("{}: GPU preparation failed: {err}", entity.core().caption);
                let mut current = CurrentContext::new(gpu);
                entity.cleanup(&mut self.prepare_context(&mut *current));
                return false;
            }
        };
        let options_changed = entity.update_draw_options(&mut self.draw);
        drop(entity);
        self.registry.insert(id, handle, incomplete);
        if options_changed {
            self.events.push(SceneEvent::DrawingOptionUpdated);
        }
        true
    }

    /// Removes an entity and releases its GPU resources.
    pub fn unload(&mut self, gpu: &mut dyn GpuBackend, id: Uuid) -> bool {
        let Some(handle) = self.registry.remove(id) else {
            return false;
        };
        self.events.push(SceneEvent::EntityUnloaded { id });
        {
            let mut entity = lock(&handle);
            info!("{}: unloaded", entity.core().caption);
            let mut current = CurrentContext::new(gpu);
            entity.cleanup(&mut self.prepare_context(&mut *current));
        }
        if self.poi_indicator.as_ref().is_some_and(|poi| Arc::ptr_eq(poi, &handle)) {
            self.poi_indicator = None;
        }
        self.draft_update();
        true
    }

    /// Asks an entity to re-upload its buffers through partial preparation.
    pub fn rebuild(&self, id: Uuid) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };
        let accepted = lock(&handle).request_rebuild();
        accepted && self.registry.mark_incomplete(id)
    }

    /// One partial-prepare round over every incomplete entity.
    pub fn partial_prepare(&mut self, gpu: &mut dyn GpuBackend) {
        let pending = self.registry.incomplete();
        if pending.is_empty() {
            return;
        }
        let steps = self.config.timers.partial_steps_per_tick.max(1);
        let mut finished_last = false;
        {
            let mut current = CurrentContext::new(gpu);
            for (id, handle) in pending {
                let mut entity = lock(&handle);
                let mut more = true;
                for _ in 0..steps {
                    more = entity.partial_prepare_gpu(&mut self.prepare_context(&mut *current));
                    if !more {
                        break;
                    }
                }
                if !more {
                    debug!("{}: upload complete", entity.core().caption);
                    finished_last |= self.registry.complete(id);
                }
            }
        }
        if finished_last {
            self.draft_update();
        }
    }

    /// Timer work: load completions, partial uploads and the delayed full-quality redraw.
    pub fn tick(&mut self, gpu: &mut dyn GpuBackend, now: Instant) {
        for outcome in self.loader.drain() {
            self.entity_loaded(gpu, outcome);
        }
        if now >= self.partial_at {
            self.partial_prepare(gpu);
            self.partial_at = now + self.config.timers.partial_prepare_interval();
        }
        if self.redraw_at.is_some_and(|at| now >= at) {
            self.redraw_at = None;
            self.redraw_requested = true;
        }
    }

    /// Earliest instant [`SceneWidget::tick`] has work to do.
    pub fn next_deadline(&self) -> Instant {
        match self.redraw_at {
            Some(at) => at.min(self.partial_at),
            None => self.partial_at,
        }
    }

    // ---------------------------------------------------------------------
    // Drawing

    /// Renders the next frame in draft quality as soon as the host repaints.
    pub fn draft_update(&mut self) {
        self.next_mode = DrawMode::Draft;
        self.redraw_requested = true;
    }

    pub fn redraw_entity(&mut self) {
        self.draft_update();
    }

    /// Whether the host should repaint; clears the request.
    pub fn take_redraw_request(&mut self) -> bool {
        std::mem::take(&mut self.redraw_requested)
    }

    /// Paints one frame in the pending mode and schedules the follow-up redraw.
    pub fn paint(&mut self, gpu: &mut dyn GpuBackend, now: Instant) -> Result<(), GpuError> {
        self.redraw_at = None;
        let mode = self.next_mode;
        {
            let mut current = CurrentContext::new(gpu);
            self.draw_core(&mut *current, mode)?;
        }
        if mode == DrawMode::Draft && !self.config.view.draft_only {
            self.next_mode = DrawMode::Normal;
            self.redraw_at = Some(now + self.config.timers.draft_delay());
        }
        Ok(())
    }

    fn update_draw_context(&mut self, mode: DrawMode) {
        let aspect = self.draw.aspect;
        self.draw.mode = mode;
        self.draw.proj = self.camera.projection_matrix(aspect, &self.config.view);
        self.draw.camera = self.camera.view_matrix();
        self.draw.world = Mat4::IDENTITY;
        self.draw.eye_dir = self.camera.eye_dir();
        self.draw.model_scale = self.camera.model_scale;
        self.draw.point_cloud.point_size = self.camera.point_size;
        self.draw.anti_alias = self.config.view.point_anti_alias;
        if let Some(poi) = &self.poi_indicator {
            lock(poi).core_mut().local = Mat4::from_translation(self.camera.poi);
        }
    }

    /// Composes one pass from a snapshot, skipping reference entities.
    fn collect(snapshot: &[EntityHandle], pass: PassKind, ctx: &DrawContext) -> DrawList {
        let mut out = DrawList::new();
        for handle in snapshot {
            let mut entity = lock(handle);
            let core = entity.core();
            if core.is_reference() {
                continue;
            }
            let selected = match pass {
                PassKind::OpaquePickable => !core.is_alpha_blend() && core.is_pickable(),
                PassKind::OpaqueOther => !core.is_alpha_blend() && !core.is_pickable(),
                PassKind::Alpha { .. } => core.is_alpha_blend(),
            };
            if selected {
                entity.draw(ctx, &mut out);
            }
        }
        out
    }

    /// One frame: pickable opaque, depth capture, other opaque, then alpha.
    pub fn draw_core(&mut self, gpu: &mut dyn GpuBackend, mode: DrawMode) -> Result<(), GpuError> {
        self.update_draw_context(mode);
        let snapshot = self.registry.snapshot();

        gpu.begin_frame(RenderTarget::Screen, CLEAR_COLOR)?;
        let ctx = self.draw;
        gpu.draw_pass(PassKind::OpaquePickable, &Self::collect(&snapshot, PassKind::OpaquePickable, &ctx))?;
        match gpu.read_depth() {
            Ok(image) => {
                self.alt_depth = false;
                if !self.depth.store_float(&image) {
                    debug!("depth read {}x{} does not match the viewport", image.width, image.height);
                }
            }
            Err(DepthReadError::Unavailable(reason)) => {
                if !self.depth_fallback_logged {
                    warn!("depth readback unavailable ({reason}); picking from encoded depth");
                    self.depth_fallback_logged = true;
                }
                self.alt_depth = true;
            }
            Err(err) => warn!("depth read failed: {err}"),
        }
        gpu.draw_pass(PassKind::OpaqueOther, &Self::collect(&snapshot, PassKind::OpaqueOther, &ctx))?;
        let alpha = PassKind::Alpha { blend: !ctx.is_pick() };
        gpu.draw_pass(alpha, &Self::collect(&snapshot, alpha, &ctx))?;
        gpu.end_frame()?;

        if self.alt_depth {
            self.update_depth(gpu, &snapshot)?;
            self.draw.mode = mode;
        }
        Ok(())
    }

    /// Renders a pick frame into the encoded-depth target and captures it.
    fn update_depth(&mut self, gpu: &mut dyn GpuBackend, snapshot: &[EntityHandle]) -> Result<(), GpuError> {
        self.draw.mode = DrawMode::Pick;
        let ctx = self.draw;
        gpu.begin_frame(RenderTarget::EncodedDepth, PICK_CLEAR_COLOR)?;
        for pass in [PassKind::OpaquePickable, PassKind::OpaqueOther, PassKind::Alpha { blend: false }] {
            gpu.draw_pass(pass, &Self::collect(snapshot, pass, &ctx))?;
        }
        match gpu.read_encoded_depth() {
            Ok(image) => {
                if !self.depth.store_encoded(&image) {
                    debug!("encoded depth {}x{} does not match the viewport", image.width, image.height);
                }
            }
            Err(err) => {
                warn!("encoded depth read failed: {err}");
                self.depth.invalidate();
            }
        }
        gpu.end_frame()
    }

    // ---------------------------------------------------------------------
    // Picking and camera

    /// World position under window pixel `(x, y)` (top-left origin), from the last depth capture.
    pub fn unproject(&self, x: f32, y: f32) -> Option<Vec3> {
        let wx = x.round() as i32;
        let wy = self.draw.height as i32 - y.round() as i32;
        self.depth.pick(wx, wy, &self.search, self.draw.view_projection())
    }

    /// Centers the view on a clicked entity by moving the master origin under it.
    pub fn entity_clicked(&mut self, id: Uuid) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };
        let moved = {
            let entity = lock(&handle);
            entity.core().set_master_origin_from_local(entity.center())
        };
        if moved {
            self.camera.poi = Vec3::ZERO;
            self.camera.update_by_poi();
            self.draft_update();
        }
        moved
    }

    /// Sets the point of interest to the surface under `(x, y)`.
    pub fn set_poi_from_window(&mut self, x: f32, y: f32) -> bool {
        if self.registry.is_empty() {
            return false;
        }
        let Some(poi) = self.unproject(x, y) else {
            return false;
        };
        self.camera.poi = poi;
        self.events.push(SceneEvent::poi_updated(poi));
        self.camera.update_by_poi();
        self.draft_update();
        true
    }

    pub fn reset_camera(&mut self) {
        self.camera.reset();
        self.draft_update();
    }
}
