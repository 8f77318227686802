use super::{Entity, EntityCore, EntityFlags, EntityKind, PrepareContext};
use crate::draw_context::DrawContext;
use crate::gpu::{
    BufferId, BufferUsage, DrawCall, DrawList, GpuError, LineTopology, LineVertex, LinesDraw, ProgramId, ProgramKind,
};
use crate::packet::{sensor_to_enu, FormatError, PointFormat, PolylinePacket};
use glam::Vec3;

pub const DEFAULT_COLOR: Vec3 = Vec3::new(1.0, 1.0, 0.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripRange {
    pub buffer: BufferId,
    pub first: u32,
    pub count: u32,
}

/// Line strips in the render frame, one GPU strip per wire strip (or per split piece).
pub struct PolylineEntity {
    core: EntityCore,
    pub color: Vec3,
    strips: Vec<Vec<LineVertex>>,
    buffers: Vec<BufferId>,
    ranges: Vec<StripRange>,
    program: Option<ProgramId>,
}

impl PolylineEntity {
    pub fn new(core: EntityCore) -> Self {
        let mut core = core;
        core.flags |= EntityFlags::UNLOADABLE;
        Self {
            core,
            color: DEFAULT_COLOR,
            strips: Vec::new(),
            buffers: Vec::new(),
            ranges: Vec::new(),
            program: None,
        }
    }

    /// Parses a polyline packet and returns the number of vertices read.
    pub fn load_mem(&mut self, buf: &[u8]) -> Result<usize, FormatError> {
        let packet = PolylinePacket::parse(buf)?;
        if let Some(origin) = packet.extras.origin_enu() {
            self.core.local_origin = origin;
        }
        if let Some(label) = &packet.extras.label {
            self.core.caption = label.clone();
        }
        self.strips = packet
            .strips
            .iter()
            .filter(|strip| strip.vertex_count() >= 2)
            .map(|strip| {
                let rgb = strip.format.contains(PointFormat::RGB);
                strip
                    .data
                    .chunks_exact(strip.format.wire_floats())
                    .map(|v| {
                        let color = if rgb { Vec3::new(v[3], v[4], v[5]) } else { self.color };
                        LineVertex::new(sensor_to_enu(v[0], v[1], v[2]), color)
                    })
                    .collect()
            })
            .collect();
        self.core.bound_points(self.strips.iter().flatten().map(|v| Vec3::from_array(v.position)));
        Ok(self.strips.iter().map(Vec::len).sum())
    }

    pub fn strips(&self) -> &[Vec<LineVertex>] {
        &self.strips
    }

    pub fn ranges(&self) -> &[StripRange] {
        &self.ranges
    }
}

/// Splits a strip into pieces of at most `capacity` vertices. Consecutive pieces share
/// their boundary vertex so the drawn line stays continuous.
pub fn split_strip(strip: &[LineVertex], capacity: usize) -> Vec<&[LineVertex]> {
    let capacity = capacity.max(2);
    let mut pieces = Vec::new();
    if strip.len() < 2 {
        return pieces;
    }
    let mut start = 0;
    loop {
        let end = (start + capacity).min(strip.len());
        pieces.push(&strip[start..end]);
        if end == strip.len() {
            break;
        }
        start = end - 1;
    }
    pieces
}

impl Entity for PolylineEntity {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Polyline
    }

    fn load(&mut self) -> Result<(), FormatError> {
        self.core.valid = false;
        let source = self.core.source.clone();
        self.load_mem(&source.read()?)?;
        self.core.valid = !self.strips.is_empty();
        Ok(())
    }

    fn prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError> {
        self.program = Some(ctx.programs.acquire(&mut *ctx.gpu, ProgramKind::Lines)?);
        let device = (ctx.gpu.max_buffer_size() / std::mem::size_of::<LineVertex>() as u64) as usize;
        let capacity = ctx.chunk_points.min(device).max(2);

        let mut batch: Vec<LineVertex> = Vec::new();
        let mut pending: Vec<(u32, u32)> = Vec::new();
        let mut flush = |batch: &mut Vec<LineVertex>, pending: &mut Vec<(u32, u32)>| -> Result<(), GpuError> {
            if batch.is_empty() {
                return Ok(());
            }
            let label = format!("{} lines {}", self.core.caption, self.buffers.len());
            let data: &[u8] = bytemuck::cast_slice(batch.as_slice());
            let buffer = ctx.gpu.create_buffer(&label, BufferUsage::Vertex, data)?;
            self.buffers.push(buffer);
            self.ranges.extend(pending.drain(..).map(|(first, count)| StripRange { buffer, first, count }));
            batch.clear();
            Ok(())
        };
        for strip in &self.strips {
            for piece in split_strip(strip, capacity) {
                if batch.len() + piece.len() > capacity {
                    flush(&mut batch, &mut pending)?;
                }
                pending.push((batch.len() as u32, piece.len() as u32));
                batch.extend_from_slice(piece);
            }
        }
        flush(&mut batch, &mut pending)?;
        Ok(false)
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList) {
        if !self.core.is_visible() {
            return;
        }
        let Some(offset) = self.core.origin_offset() else {
            return;
        };
        let Some(program) = self.program else {
            return;
        };
        if ctx.is_pick() && !self.core.is_pickable() {
            return;
        }
        let mvp = ctx.view_projection() * offset * self.core.local;
        out.extend(self.ranges.iter().map(|range| {
            DrawCall::Lines(LinesDraw {
                program,
                buffer: range.buffer,
                first: range.first,
                count: range.count,
                topology: LineTopology::Strip,
                mvp,
                point_size: 1.0,
                encode_depth: ctx.is_pick(),
            })
        }));
    }

    fn cleanup(&mut self, ctx: &mut PrepareContext<'_>) {
        for buffer in self.buffers.drain(..) {
            ctx.gpu.destroy_buffer(buffer);
        }
        self.ranges.clear();
        if self.program.take().is_some() {
            ctx.programs.release(&mut *ctx.gpu, ProgramKind::Lines);
        }
    }
}
