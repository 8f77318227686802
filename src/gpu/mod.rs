//! Backend-neutral GPU surface used by entities and the scene.
//!
//! Entities never talk to wgpu directly: they allocate buffers, textures and programs
//! through [`GpuBackend`] and describe their work as [`DrawCall`]s. The scene hands the
//! collected calls to the backend one pass at a time.

pub mod recording;
pub mod wgpu_backend;

use crate::depth::DepthImage;
use crate::draw_context::Window1;
use glam::{Mat4, Vec3, Vec4};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU device not initialized")]
    NotInitialized,
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("write of {len} bytes at {offset} overruns buffer {id:?} ({size} bytes)")]
    WriteOutOfBounds { id: BufferId, offset: u64, len: usize, size: u64 },
    #[error("no frame in progress")]
    NoFrame,
    #[error("surface error: {0}")]
    Surface(String),
}

#[derive(Debug, Error)]
pub enum DepthReadError {
    /// The platform cannot read back a true depth buffer; callers fall back to encoded depth.
    #[error("depth read unavailable: {0}")]
    Unavailable(String),
    #[error("no frame in progress")]
    NoFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    /// Read by shaders as a flat float array (point chunks).
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Points { anti_alias: bool },
    Mesh,
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    Screen,
    /// RGBA8 offscreen target receiving depth packed by the pick shaders.
    EncodedDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    OpaquePickable,
    OpaqueOther,
    /// Alpha-blended pass. `blend` is off for pick frames.
    Alpha { blend: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineTopology {
    List,
    Strip,
}

/// Float offsets inside one point record. Position always sits at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointLayout {
    pub stride: u32,
    pub rgb: Option<u32>,
    pub amp: Option<u32>,
    pub rng: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointUniforms {
    pub mvp: Mat4,
    pub a_range: Vec3,
    pub r_range: Vec3,
    pub z_range: Vec3,
    pub amp_filter: Window1,
    pub range_filter: Window1,
    /// Height window already shifted by the entity's local origin.
    pub height_filter: Window1,
    pub color_mode: u32,
    pub point_size: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsDraw {
    pub program: ProgramId,
    pub buffer: BufferId,
    pub count: u32,
    /// Draw every n-th point.
    pub decimate: u32,
    pub layout: PointLayout,
    pub uniforms: PointUniforms,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialUniforms {
    pub col: Vec4,
    pub amb: Vec4,
    pub dif: Vec4,
    pub emi: Vec4,
    pub spc: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshDraw {
    pub program: ProgramId,
    pub buffer: BufferId,
    pub first: u32,
    pub count: u32,
    pub proj: Mat4,
    pub modelview: Mat4,
    pub light_pos: Vec3,
    pub material: MaterialUniforms,
    pub shading: bool,
    pub texture: Option<TextureId>,
    pub encode_depth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinesDraw {
    pub program: ProgramId,
    pub buffer: BufferId,
    pub first: u32,
    pub count: u32,
    pub topology: LineTopology,
    pub mvp: Mat4,
    pub point_size: f32,
    pub encode_depth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCall {
    Points(PointsDraw),
    Mesh(MeshDraw),
    Lines(LinesDraw),
}

impl DrawCall {
    pub fn buffer(&self) -> BufferId {
        match self {
            DrawCall::Points(d) => d.buffer,
            DrawCall::Mesh(d) => d.buffer,
            DrawCall::Lines(d) => d.buffer,
        }
    }
}

/// Interleaved model vertex `[u, v, nx, ny, nz, x, y, z]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ModelVertex {
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub position: [f32; 3],
}

impl ModelVertex {
    pub fn new(uv: glam::Vec2, normal: Vec3, position: Vec3) -> Self {
        Self { uv: uv.to_array(), normal: normal.to_array(), position: position.to_array() }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LineVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl LineVertex {
    pub fn new(position: Vec3, color: Vec3) -> Self {
        Self { position: position.to_array(), color: color.to_array() }
    }
}

/// Calls collected for one pass.
pub type DrawList = Vec<DrawCall>;

/// The device-facing half of the renderer.
///
/// One backend is owned by the render thread; nothing here is shared across threads.
pub trait GpuBackend {
    fn max_buffer_size(&self) -> u64;

    fn create_buffer(&mut self, label: &str, usage: BufferUsage, data: &[u8]) -> Result<BufferId, GpuError>;
    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError>;
    fn destroy_buffer(&mut self, id: BufferId);

    fn create_texture(&mut self, label: &str, image: &image::RgbaImage) -> Result<TextureId, GpuError>;
    fn destroy_texture(&mut self, id: TextureId);

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError>;
    fn destroy_program(&mut self, id: ProgramId);

    fn resize(&mut self, width: u32, height: u32);
    fn size(&self) -> (u32, u32);

    fn begin_frame(&mut self, target: RenderTarget, clear: [f32; 4]) -> Result<(), GpuError>;
    fn draw_pass(&mut self, pass: PassKind, calls: &[DrawCall]) -> Result<(), GpuError>;
    /// Float depth of the frame in progress, top row first.
    fn read_depth(&mut self) -> Result<DepthImage<f32>, DepthReadError>;
    /// Encoded depth of an [`RenderTarget::EncodedDepth`] frame, top row first.
    fn read_encoded_depth(&mut self) -> Result<DepthImage<u32>, DepthReadError>;
    fn end_frame(&mut self) -> Result<(), GpuError>;

    fn make_current(&mut self) {}
    fn done_current(&mut self) {}
}

/// Holds the backend current for the lifetime of the guard.
pub struct CurrentContext<'a> {
    gpu: &'a mut (dyn GpuBackend + 'a),
}

impl<'a> CurrentContext<'a> {
    pub fn new(gpu: &'a mut (dyn GpuBackend + 'a)) -> Self {
        gpu.make_current();
        Self { gpu }
    }
}

impl<'a> Deref for CurrentContext<'a> {
    type Target = dyn GpuBackend + 'a;

    fn deref(&self) -> &Self::Target {
        self.gpu
    }
}

impl<'a> DerefMut for CurrentContext<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.gpu
    }
}

impl Drop for CurrentContext<'_> {
    fn drop(&mut self) {
        self.gpu.done_current();
    }
}

#[derive(Debug)]
struct ProgramSlot {
    id: ProgramId,
    refs: usize,
}

/// Reference-counted programs shared by every entity of the scene.
///
/// Owned by the scene and lent to entities through their prepare context. A program is
/// created on first acquire and destroyed when its last user releases it.
#[derive(Debug, Default)]
pub struct ProgramCache {
    slots: Mutex<HashMap<ProgramKind, ProgramSlot>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ProgramKind, ProgramSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self, gpu: &mut dyn GpuBackend, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&kind) {
            slot.refs += 1;
            return Ok(slot.id);
        }
        let id = gpu.create_program(kind)?;
        slots.insert(kind, ProgramSlot { id, refs: 1 });
        Ok(id)
    }

    /// Looks up an already-acquired program without touching its count.
    pub fn get(&self, kind: ProgramKind) -> Option<ProgramId> {
        self.slots().get(&kind).map(|slot| slot.id)
    }

    pub fn release(&self, gpu: &mut dyn GpuBackend, kind: ProgramKind) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&kind) else {
            return;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            let id = slot.id;
            slots.remove(&kind);
            gpu.destroy_program(id);
        }
    }

    pub fn refs(&self, kind: ProgramKind) -> usize {
        self.slots().get(&kind).map_or(0, |slot| slot.refs)
    }
}
