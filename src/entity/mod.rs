//! Scene entities: the polymorphic things the scene loads, uploads and draws.
//!
//! Every variant embeds an [`EntityCore`] holding identity, placement, visibility and
//! flags. The lifecycle is split by thread: [`Entity::load`] parses on a worker, the
//! `*_gpu` methods and [`Entity::draw`] run on the render thread.

pub mod model;
pub mod point_cloud;
pub mod polyline;
pub mod poses;
pub mod stock;

use crate::draw_context::DrawContext;
use crate::events::{EventBus, SceneEvent};
use crate::gpu::{DrawList, GpuBackend, GpuError, ProgramCache};
use crate::packet::FormatError;
use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

pub use model::ModelEntity;
pub use point_cloud::PointCloudEntity;
pub use polyline::PolylineEntity;
pub use poses::PosesEntity;
pub use stock::{AxisIndicator, StockEntity};

/// Offsets longer than this are treated as a broken origin and the entity is not drawn.
pub const ORIGIN_GUARD: f32 = 10_000.0;

/// Scene-wide master origin, shared by every entity of one scene.
pub type SharedOrigin = Arc<RwLock<Vec3>>;

pub type EntityHandle = Arc<Mutex<Box<dyn Entity>>>;

pub fn new_handle(entity: Box<dyn Entity>) -> EntityHandle {
    Arc::new(Mutex::new(entity))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Model,
    PointCloud,
    Poses,
    Polyline,
    Stock,
    AxisIndicator,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntityFlags: u32 {
        /// Drawn only through a parent entity, never by the scene passes.
        const REFERENCE = 0x01;
        const PICKABLE = 0x02;
        const ALPHA_BLEND = 0x04;
        const UNLOADABLE = 0x08;
        const EXPORTABLE = 0x10;
    }
}

impl Default for EntityFlags {
    fn default() -> Self {
        EntityFlags::PICKABLE
    }
}

/// Where [`Entity::load`] reads from.
#[derive(Debug, Clone, Default)]
pub enum EntitySource {
    #[default]
    None,
    File(PathBuf),
    Bytes { name: String, data: Arc<[u8]> },
}

impl EntitySource {
    pub fn read(&self) -> Result<Cow<'_, [u8]>, FormatError> {
        match self {
            EntitySource::None => Err(FormatError::Truncated { what: "entity source" }),
            EntitySource::File(path) => Ok(Cow::Owned(fs::read(path)?)),
            EntitySource::Bytes { data, .. } => Ok(Cow::Borrowed(data)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            EntitySource::File(path) => Some(path),
            _ => None,
        }
    }

    /// File stem for files, the given name for byte buffers.
    pub fn caption(&self) -> Option<String> {
        match self {
            EntitySource::None => None,
            EntitySource::File(path) => path.file_stem().map(|s| s.to_string_lossy().into_owned()),
            EntitySource::Bytes { name, .. } => Some(name.clone()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EntitySource::None => String::new(),
            EntitySource::File(path) => path.display().to_string(),
            EntitySource::Bytes { name, .. } => name.clone(),
        }
    }
}

/// State shared by every entity variant.
#[derive(Debug, Clone)]
pub struct EntityCore {
    id: Uuid,
    pub local: Mat4,
    pub origin: Option<SharedOrigin>,
    pub local_origin: Vec3,
    pub show: bool,
    pub group_show: bool,
    pub flags: EntityFlags,
    pub valid: bool,
    /// `[min, max, center]`
    pub bounding: [Vec3; 3],
    pub caption: String,
    pub source: EntitySource,
}

impl EntityCore {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local: Mat4::IDENTITY,
            origin: None,
            local_origin: Vec3::ZERO,
            show: true,
            group_show: true,
            flags: EntityFlags::default(),
            valid: false,
            bounding: [Vec3::ZERO; 3],
            caption: caption.into(),
            source: EntitySource::None,
        }
    }

    pub fn with_source(mut self, source: EntitySource) -> Self {
        if let Some(caption) = source.caption() {
            self.caption = caption;
        }
        self.source = source;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_visible(&self) -> bool {
        self.show && self.group_show
    }

    pub fn is_reference(&self) -> bool {
        self.flags.contains(EntityFlags::REFERENCE)
    }

    pub fn is_pickable(&self) -> bool {
        self.flags.contains(EntityFlags::PICKABLE)
    }

    pub fn is_alpha_blend(&self) -> bool {
        self.flags.contains(EntityFlags::ALPHA_BLEND)
    }

    pub fn master_origin(&self) -> Vec3 {
        self.origin
            .as_ref()
            .map(|origin| *origin.read().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or(Vec3::ZERO)
    }

    /// `translate(local_origin - master_origin)`, or `None` past [`ORIGIN_GUARD`].
    pub fn origin_offset(&self) -> Option<Mat4> {
        let delta = self.local_origin - self.master_origin();
        if delta.length() > ORIGIN_GUARD {
            return None;
        }
        Some(Mat4::from_translation(delta))
    }

    pub fn set_bounding(&mut self, min: Vec3, max: Vec3) {
        self.bounding = [min, max, (min + max) * 0.5];
    }

    /// Grows the box over `points`; an empty iterator leaves it untouched.
    pub fn bound_points(&mut self, points: impl IntoIterator<Item = Vec3>) {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return;
        };
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        self.set_bounding(min, max);
    }

    pub fn center(&self) -> Vec3 {
        (self.local * Vec4::W).truncate() + self.bounding[2]
    }

    /// Moves the scene's master origin so that `pos`, given in this entity's frame, lands
    /// on the world origin.
    pub fn set_master_origin_from_local(&self, pos: Vec3) -> bool {
        let Some(origin) = &self.origin else {
            return false;
        };
        if pos == Vec3::ZERO || self.local_origin == Vec3::ZERO {
            return false;
        }
        let mut master = origin.write().unwrap_or_else(PoisonError::into_inner);
        if *master == Vec3::ZERO {
            return false;
        }
        *master = self.local_origin + pos;
        true
    }

    pub fn emit_progress(&self, events: &EventBus, current: u64, total: u64, label: &str, done: bool) {
        events.push(SceneEvent::Progress {
            current,
            total,
            label: label.to_string(),
            id: self.id,
            source: self.source.describe(),
            done,
        });
    }
}

/// GPU-thread resources lent to an entity while it prepares, uploads or cleans up.
pub struct PrepareContext<'a> {
    pub gpu: &'a mut (dyn GpuBackend + 'a),
    pub programs: &'a ProgramCache,
    pub events: &'a EventBus,
    /// Points per chunk before the device buffer limit is applied.
    pub chunk_points: usize,
    pub point_anti_alias: bool,
}

pub trait Entity: Send {
    fn core(&self) -> &EntityCore;
    fn core_mut(&mut self) -> &mut EntityCore;
    fn kind(&self) -> EntityKind;

    /// Parses the source into CPU-side buffers. Runs on a loader worker.
    fn load(&mut self) -> Result<(), FormatError>;

    /// Allocates GPU resources. `Ok(true)` means more work remains for
    /// [`Entity::partial_prepare_gpu`].
    fn prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError>;

    /// One incremental upload step; returns whether work remains.
    fn partial_prepare_gpu(&mut self, _ctx: &mut PrepareContext<'_>) -> bool {
        false
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList);

    fn cleanup(&mut self, ctx: &mut PrepareContext<'_>);

    fn center(&self) -> Vec3 {
        self.core().center()
    }

    /// Re-uploads existing GPU buffers from the CPU copy.
    fn request_rebuild(&mut self) -> bool {
        false
    }

    /// Lets an entity push its preferred options into the scene's draw context.
    fn update_draw_options(&self, _ctx: &mut DrawContext) -> bool {
        false
    }

    fn id(&self) -> Uuid {
        self.core().id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(v: Vec3) -> SharedOrigin {
        Arc::new(RwLock::new(v))
    }

    #[test]
    fn origin_offset_is_guarded() {
        let mut core = EntityCore::new("e");
        core.origin = Some(origin(Vec3::ZERO));
        core.local_origin = Vec3::new(20_000.0, 0.0, 0.0);
        assert!(core.origin_offset().is_none());

        core.local_origin = Vec3::new(9_999.0, 0.0, 0.0);
        let offset = core.origin_offset().expect("inside guard");
        assert_eq!(offset.w_axis.truncate(), Vec3::new(9_999.0, 0.0, 0.0));
    }

    #[test]
    fn missing_master_origin_counts_as_zero() {
        let mut core = EntityCore::new("e");
        core.local_origin = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(core.origin_offset(), Some(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0))));
    }

    #[test]
    fn visibility_needs_both_switches() {
        let mut core = EntityCore::new("e");
        for (show, group, expected) in [(true, true, true), (true, false, false), (false, true, false), (false, false, false)]
        {
            core.show = show;
            core.group_show = group;
            assert_eq!(core.is_visible(), expected);
        }
    }

    #[test]
    fn master_origin_moves_only_when_all_origins_are_set() {
        let shared = origin(Vec3::new(1.0, 1.0, 0.0));
        let mut core = EntityCore::new("e");
        assert!(!core.set_master_origin_from_local(Vec3::ONE), "no shared origin");

        core.origin = Some(shared.clone());
        assert!(!core.set_master_origin_from_local(Vec3::ONE), "zero local origin");

        core.local_origin = Vec3::new(100.0, 0.0, 0.0);
        assert!(!core.set_master_origin_from_local(Vec3::ZERO), "zero position");

        assert!(core.set_master_origin_from_local(Vec3::new(0.0, 5.0, 0.0)));
        assert_eq!(*shared.read().unwrap(), Vec3::new(100.0, 5.0, 0.0));
        let offset = core.origin_offset().expect("offset");
        assert_eq!(offset.transform_point3(Vec3::new(0.0, 5.0, 0.0)), Vec3::ZERO);

        *shared.write().unwrap() = Vec3::ZERO;
        assert!(!core.set_master_origin_from_local(Vec3::ONE), "zero master origin");
    }

    #[test]
    fn center_adds_local_translation_to_bounding_center() {
        let mut core = EntityCore::new("e");
        core.set_bounding(Vec3::ZERO, Vec3::new(2.0, 4.0, 6.0));
        core.local = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(core.center(), Vec3::new(11.0, 2.0, 3.0));
    }

    #[test]
    fn file_source_names_the_entity() {
        let core = EntityCore::new("x").with_source(EntitySource::File(PathBuf::from("/data/scan_01.pcd")));
        assert_eq!(core.caption, "scan_01");
        assert!(core.flags.contains(EntityFlags::PICKABLE));
        assert!(!core.valid);
    }
}
