//! Procedural line geometry: generic stock shapes and the POI axis indicator.

use super::{Entity, EntityCore, EntityFlags, EntityKind, PrepareContext};
use crate::draw_context::{DrawContext, DrawMode};
use crate::gpu::{
    BufferId, BufferUsage, DrawCall, DrawList, GpuError, LineTopology, LineVertex, LinesDraw, ProgramId, ProgramKind,
};
use crate::packet::FormatError;
use glam::{Mat4, Vec3, Vec4};
use log::warn;

/// Colored segments drawn as a line list, placed by `local` alone.
pub struct StockEntity {
    core: EntityCore,
    vertices: Vec<LineVertex>,
    vertex_count: u32,
    buffer: Option<BufferId>,
    program: Option<ProgramId>,
}

impl StockEntity {
    pub fn new(core: EntityCore, vertices: Vec<LineVertex>) -> Self {
        Self { core, vertices, vertex_count: 0, buffer: None, program: None }
    }

    pub fn vertices(&self) -> &[LineVertex] {
        &self.vertices
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    fn line_width(mode: DrawMode) -> f32 {
        match mode {
            DrawMode::Normal => 2.0,
            DrawMode::Draft => 1.0,
            DrawMode::Pick => 10.0,
        }
    }
}

impl Entity for StockEntity {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Stock
    }

    fn load(&mut self) -> Result<(), FormatError> {
        self.core.valid = !self.vertices.is_empty();
        Ok(())
    }

    fn prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError> {
        let limit = ctx.gpu.max_buffer_size() / std::mem::size_of::<LineVertex>() as u64;
        let max_vertices = limit.saturating_sub(1) as usize;
        if self.vertices.len() > max_vertices {
            warn!("{}: {} vertices truncated to {max_vertices}", self.core.caption, self.vertices.len());
            self.vertices.truncate(max_vertices);
        }
        self.program = Some(ctx.programs.acquire(&mut *ctx.gpu, ProgramKind::Lines)?);
        let data: &[u8] = bytemuck::cast_slice(self.vertices.as_slice());
        self.buffer = Some(ctx.gpu.create_buffer(&self.core.caption, BufferUsage::Vertex, data)?);
        self.vertex_count = self.vertices.len() as u32;
        // CPU copy is no longer needed
        self.vertices = Vec::new();
        Ok(false)
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList) {
        if !self.core.is_visible() {
            return;
        }
        if ctx.is_pick() && !self.core.is_pickable() {
            return;
        }
        let (Some(buffer), Some(program)) = (self.buffer, self.program) else {
            return;
        };
        out.push(DrawCall::Lines(LinesDraw {
            program,
            buffer,
            first: 0,
            count: self.vertex_count,
            topology: LineTopology::List,
            mvp: ctx.view_projection() * self.core.local,
            point_size: Self::line_width(ctx.mode),
            encode_depth: ctx.is_pick(),
        }));
    }

    fn cleanup(&mut self, ctx: &mut PrepareContext<'_>) {
        if let Some(buffer) = self.buffer.take() {
            ctx.gpu.destroy_buffer(buffer);
        }
        if self.program.take().is_some() {
            ctx.programs.release(&mut *ctx.gpu, ProgramKind::Lines);
        }
    }
}

fn arrow() -> Vec<Vec3> {
    vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.9, -0.05, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.9, 0.05, 0.0),
    ]
}

const GLYPH: f32 = 0.1;

fn glyph_n() -> Vec<Vec3> {
    let (sz, h) = (GLYPH, GLYPH * 0.5);
    vec![
        Vec3::new(1.0, h, 0.0),
        Vec3::new(1.0 + sz, h, 0.0),
        Vec3::new(1.0 + sz, h, 0.0),
        Vec3::new(1.0, -h, 0.0),
        Vec3::new(1.0, -h, 0.0),
        Vec3::new(1.0 + sz, -h, 0.0),
    ]
}

fn glyph_e() -> Vec<Vec3> {
    let (sz, h) = (GLYPH, GLYPH * 0.5);
    vec![
        Vec3::new(1.0 + sz, -h, 0.0),
        Vec3::new(1.0 + sz, h, 0.0),
        Vec3::new(1.0 + sz, h, 0.0),
        Vec3::new(1.0, h, 0.0),
        Vec3::new(1.0, h, 0.0),
        Vec3::new(1.0, -h, 0.0),
        Vec3::new(1.0 + h, -sz * 0.3, 0.0),
        Vec3::new(1.0 + h, h, 0.0),
    ]
}

fn push_rotated(out: &mut Vec<LineVertex>, segments: &[Vec3], rotation: Mat4, color: Vec3) {
    out.extend(segments.iter().map(|v| LineVertex::new((rotation * v.extend(0.0)).truncate(), color)));
}

/// Red east, green north and blue up arrows with "E" and "N" glyphs at the tips.
pub fn axis_vertices() -> Vec<LineVertex> {
    let rx = Mat4::IDENTITY;
    let ry = Mat4::from_axis_angle(Vec3::Z, 90f32.to_radians());
    let rz = Mat4::from_axis_angle(Vec3::NEG_Y, 90f32.to_radians());
    let mut vertices = Vec::new();
    push_rotated(&mut vertices, &arrow(), rx, Vec3::X);
    push_rotated(&mut vertices, &glyph_e(), rx, Vec3::X);
    push_rotated(&mut vertices, &arrow(), ry, Vec3::Y);
    push_rotated(&mut vertices, &glyph_n(), ry, Vec3::Y);
    push_rotated(&mut vertices, &arrow(), rz, Vec3::Z);
    vertices
}

/// Three-axis marker the scene keeps at its point of interest.
pub struct AxisIndicator {
    stock: StockEntity,
}

impl AxisIndicator {
    pub fn new() -> Self {
        let core = EntityCore::new("axis");
        let mut stock = StockEntity::new(core, axis_vertices());
        stock.core.flags.remove(EntityFlags::UNLOADABLE | EntityFlags::EXPORTABLE);
        stock.core.valid = true;
        Self { stock }
    }
}

impl Default for AxisIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Entity for AxisIndicator {
    fn core(&self) -> &EntityCore {
        self.stock.core()
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        self.stock.core_mut()
    }

    fn kind(&self) -> EntityKind {
        EntityKind::AxisIndicator
    }

    fn load(&mut self) -> Result<(), FormatError> {
        self.stock.load()
    }

    fn prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError> {
        self.stock.prepare_gpu(ctx)
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList) {
        self.stock.draw(ctx, out);
    }

    fn cleanup(&mut self, ctx: &mut PrepareContext<'_>) {
        self.stock.cleanup(ctx);
    }

    fn center(&self) -> Vec3 {
        (self.stock.core.local * Vec4::W).truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::gpu::recording::RecordingBackend;
    use crate::gpu::ProgramCache;

    #[test]
    fn axis_has_three_colored_arrows() {
        let vertices = axis_vertices();
        assert_eq!(vertices.len(), 6 * 3 + 8 + 6);
        let blue_tip = vertices.iter().filter(|v| v.color == [0.0, 0.0, 1.0]).nth(1).expect("blue arrow");
        assert!(Vec3::from_array(blue_tip.position).abs_diff_eq(Vec3::Z, 1e-6));
        let green_tip = vertices.iter().filter(|v| v.color == [0.0, 1.0, 0.0]).nth(1).expect("green arrow");
        assert!(Vec3::from_array(green_tip.position).abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn stock_vertices_are_truncated_to_device_limit() {
        // 24-byte vertices, 240-byte limit -> 9 vertices kept
        let mut gpu = RecordingBackend::new(8, 8).with_max_buffer_size(240);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut ctx = PrepareContext {
            gpu: &mut gpu,
            programs: &programs,
            events: &events,
            chunk_points: 16,
            point_anti_alias: false,
        };
        let mut stock = StockEntity::new(EntityCore::new("s"), vec![LineVertex::default(); 20]);
        stock.load().expect("load");
        assert!(stock.core().valid);
        assert!(!stock.prepare_gpu(&mut ctx).expect("prepare"));
        assert_eq!(stock.vertex_count(), 9);
    }

    #[test]
    fn line_width_follows_draw_mode() {
        let mut gpu = RecordingBackend::new(8, 8);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut ctx = PrepareContext {
            gpu: &mut gpu,
            programs: &programs,
            events: &events,
            chunk_points: 16,
            point_anti_alias: false,
        };
        let mut axis = AxisIndicator::new();
        axis.prepare_gpu(&mut ctx).expect("prepare");
        axis.core_mut().local = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(axis.center(), Vec3::new(1.0, 2.0, 3.0));

        for (mode, width) in [(DrawMode::Normal, 2.0), (DrawMode::Draft, 1.0), (DrawMode::Pick, 10.0)] {
            let mut out = DrawList::new();
            axis.draw(&DrawContext::default().with_mode(mode), &mut out);
            let DrawCall::Lines(lines) = out[0] else { panic!("lines expected") };
            assert_eq!(lines.point_size, width);
            assert_eq!(lines.encode_depth, mode == DrawMode::Pick);
        }
    }
}
