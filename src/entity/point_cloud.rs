//! Streamed point clouds uploaded to the GPU in bounded chunks.

use super::{Entity, EntityCore, EntityFlags, EntityKind, PrepareContext};
use crate::draw_context::{ColorMode, DrawContext};
use crate::gpu::{
    BufferId, BufferUsage, DrawCall, DrawList, GpuError, PointLayout, PointUniforms, PointsDraw, ProgramId,
    ProgramKind,
};
use crate::packet::{sensor_to_enu, FormatError, PointCloudPacket, PointFormat};
use glam::Vec3;
use log::{debug, warn};

/// Every n-th point survives a draft frame.
pub const DRAFT_DECIMATE: u32 = 4;
pub const PICK_POINT_SIZE: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointChunk {
    pub buffer: BufferId,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadMode {
    Create,
    /// Rewrites the chunks created earlier, in order.
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Upload {
    mode: UploadMode,
    remaining: usize,
    /// First point of the next chunk.
    cursor: usize,
    /// Next chunk to rewrite in write mode.
    counter: usize,
}

pub struct PointCloudEntity {
    core: EntityCore,
    format: PointFormat,
    layout: PointLayout,
    n_points: usize,
    vertices: Vec<f32>,
    chunks: Vec<PointChunk>,
    chunk_capacity: usize,
    upload: Upload,
    program: Option<(ProgramKind, ProgramId)>,
}

impl PointCloudEntity {
    pub fn new(core: EntityCore) -> Self {
        let mut core = core;
        core.flags |= EntityFlags::UNLOADABLE | EntityFlags::EXPORTABLE;
        Self {
            core,
            format: PointFormat::XYZ,
            layout: PointLayout { stride: 4, ..PointLayout::default() },
            n_points: 0,
            vertices: Vec::new(),
            chunks: Vec::new(),
            chunk_capacity: 0,
            upload: Upload { mode: UploadMode::Create, remaining: 0, cursor: 0, counter: 0 },
            program: None,
        }
    }

    /// Parses a point-cloud packet into render-frame records and returns the point count.
    pub fn load_mem(&mut self, buf: &[u8]) -> Result<usize, FormatError> {
        let packet = PointCloudPacket::parse(buf)?;
        if let Some(origin) = packet.extras.origin_enu() {
            self.core.local_origin = origin;
        }
        if let Some(label) = &packet.extras.label {
            self.core.caption = label.clone();
        }

        let format = packet.format;
        let mut layout = PointLayout::default();
        let mut next = 3;
        if format.contains(PointFormat::RGB) {
            layout.rgb = Some(next);
            next += 3;
        }
        if format.contains(PointFormat::AMP) {
            layout.amp = Some(next);
            next += 1;
        }
        if format.contains(PointFormat::RNG) {
            layout.rng = Some(next);
            next += 1;
        }
        // trailing flag float
        layout.stride = next + 1;

        let wire = format.wire_floats();
        let stride = layout.stride as usize;
        let n = packet.n_points as usize;
        let mut vertices = Vec::with_capacity(n * stride);
        for src in packet.data.chunks_exact(wire) {
            let p = sensor_to_enu(src[0], src[1], src[2]);
            vertices.extend_from_slice(&p.to_array());
            vertices.extend_from_slice(&src[3..]);
            vertices.push(0.0);
        }

        self.core.bound_points(vertices.chunks_exact(stride).map(|v| Vec3::new(v[0], v[1], v[2])));
        self.format = format;
        self.layout = layout;
        self.n_points = n;
        self.vertices = vertices;
        self.upload = Upload { mode: UploadMode::Create, remaining: n, cursor: 0, counter: 0 };
        Ok(n)
    }

    pub fn format(&self) -> PointFormat {
        self.format
    }

    pub fn layout(&self) -> PointLayout {
        self.layout
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn vertices(&self) -> &[f32] {
        &self.vertices
    }

    pub fn chunks(&self) -> &[PointChunk] {
        &self.chunks
    }

    pub fn remaining(&self) -> usize {
        self.upload.remaining
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    fn capacity_for(&self, ctx: &PrepareContext<'_>) -> usize {
        let record = u64::from(self.layout.stride) * 4;
        let device = (ctx.gpu.max_buffer_size() / record.max(1)) as usize;
        ctx.chunk_points.min(device).max(1)
    }

    /// Uploads the next chunk. A step with nothing remaining does nothing.
    fn step(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), GpuError> {
        if self.upload.remaining == 0 {
            return Ok(());
        }
        let n = self.upload.remaining.min(self.chunk_capacity);
        let stride = self.layout.stride as usize;
        let start = self.upload.cursor * stride;
        let bytes: &[u8] = bytemuck::cast_slice(&self.vertices[start..start + n * stride]);

        let rewrite = self.upload.mode == UploadMode::Write && self.upload.counter < self.chunks.len();
        if rewrite {
            let chunk = &mut self.chunks[self.upload.counter];
            ctx.gpu.write_buffer(chunk.buffer, 0, bytes)?;
            chunk.count = n as u32;
            self.upload.counter += 1;
        } else {
            let label = format!("{} points {}", self.core.caption, self.chunks.len());
            let buffer = ctx.gpu.create_buffer(&label, BufferUsage::Storage, bytes)?;
            self.chunks.push(PointChunk { buffer, count: n as u32 });
        }

        self.upload.cursor += n;
        self.upload.remaining -= n;
        let total = self.n_points as u64;
        let uploaded = total - self.upload.remaining as u64;
        let done = self.upload.remaining == 0;
        if done {
            debug!("{}: point upload finished ({} chunks)", self.core.caption, self.chunks.len());
        } else {
            debug!("{}: uploaded {n} points, {} left", self.core.caption, self.upload.remaining);
        }
        self.core.emit_progress(ctx.events, uploaded, total, "VBO", done);
        Ok(())
    }

    fn uniforms(&self, ctx: &DrawContext, mvp: glam::Mat4) -> PointUniforms {
        let opt = &ctx.point_cloud;
        let z0 = self.core.local_origin.z;
        let (color_mode, point_size) =
            if ctx.is_pick() { (ColorMode::Depth, PICK_POINT_SIZE) } else { (opt.color_mode, opt.point_size) };
        let mut height_filter = opt.height_filter;
        height_filter.min -= z0;
        height_filter.max -= z0;
        PointUniforms {
            mvp,
            a_range: Vec3::new(opt.amp.min, opt.amp.max, opt.amp.max - opt.amp.min),
            r_range: Vec3::new(opt.range.min, opt.range.max, opt.range.max - opt.range.min),
            z_range: Vec3::new(opt.height.min - z0, opt.height.max - z0, opt.height.max - opt.height.min),
            amp_filter: opt.amp_filter,
            range_filter: opt.range_filter,
            height_filter,
            color_mode: color_mode.as_index(),
            point_size,
        }
    }
}

impl Entity for PointCloudEntity {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn kind(&self) -> EntityKind {
        EntityKind::PointCloud
    }

    fn load(&mut self) -> Result<(), FormatError> {
        self.core.valid = false;
        let source = self.core.source.clone();
        let n = self.load_mem(&source.read()?)?;
        self.core.valid = n > 0;
        Ok(())
    }

    fn prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError> {
        let kind = ProgramKind::Points { anti_alias: ctx.point_anti_alias };
        let id = ctx.programs.acquire(&mut *ctx.gpu, kind)?;
        self.program = Some((kind, id));
        self.chunk_capacity = self.capacity_for(ctx);
        self.step(ctx)?;
        Ok(self.upload.remaining > 0)
    }

    fn partial_prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> bool {
        if let Err(err) = self.step(ctx) {
            warn!("{}: point upload aborted: {err}", self.core.caption);
            self.upload.remaining = 0;
        }
        self.upload.remaining > 0
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList) {
        if !self.core.is_visible() {
            return;
        }
        let Some(offset) = self.core.origin_offset() else {
            return;
        };
        let Some((_, program)) = self.program else {
            return;
        };
        let mvp = ctx.view_projection() * offset * self.core.local;
        let uniforms = self.uniforms(ctx, mvp);
        let decimate = if ctx.is_draft() && !ctx.point_cloud.ignore_draft { DRAFT_DECIMATE } else { 1 };

        let mut left = self.n_points as u32;
        for chunk in &self.chunks {
            let count = chunk.count.min(left);
            if count == 0 {
                break;
            }
            out.push(DrawCall::Points(PointsDraw {
                program,
                buffer: chunk.buffer,
                count,
                decimate,
                layout: self.layout,
                uniforms,
            }));
            left -= count;
        }
    }

    fn cleanup(&mut self, ctx: &mut PrepareContext<'_>) {
        for chunk in self.chunks.drain(..) {
            ctx.gpu.destroy_buffer(chunk.buffer);
        }
        if let Some((kind, _)) = self.program.take() {
            ctx.programs.release(&mut *ctx.gpu, kind);
        }
        self.upload = Upload { mode: UploadMode::Create, remaining: 0, cursor: 0, counter: 0 };
        self.n_points = 0;
        self.vertices = Vec::new();
    }

    /// The first point, so picking a cloud recenters on real data rather than on its box.
    fn center(&self) -> Vec3 {
        if self.n_points > 3 {
            Vec3::new(self.vertices[0], self.vertices[1], self.vertices[2])
        } else {
            Vec3::ZERO
        }
    }

    /// Nothing to rewrite once the host copy is gone.
    fn request_rebuild(&mut self) -> bool {
        if self.vertices.is_empty() {
            return false;
        }
        self.upload = Upload { mode: UploadMode::Write, remaining: self.n_points, cursor: 0, counter: 0 };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntitySource;
    use crate::events::{EventBus, SceneEvent};
    use crate::gpu::recording::RecordingBackend;
    use crate::gpu::ProgramCache;
    use crate::packet::PacketExtras;
    use glam::DVec3;

    fn packet(n: u32, format: PointFormat) -> Vec<u8> {
        let floats = format.wire_floats();
        let data = (0..n as usize * floats).map(|i| i as f32).collect();
        PointCloudPacket {
            extras: PacketExtras { origin: Some(DVec3::new(1.0, 2.0, 3.0)), label: Some("lidar".into()) },
            format,
            n_points: n,
            data,
            ..Default::default()
        }
        .encode()
    }

    fn prepare_ctx<'a>(
        gpu: &'a mut RecordingBackend,
        programs: &'a ProgramCache,
        events: &'a EventBus,
        chunk_points: usize,
    ) -> PrepareContext<'a> {
        PrepareContext { gpu, programs, events, chunk_points, point_anti_alias: false }
    }

    #[test]
    fn load_converts_sensor_axes_and_appends_flag() {
        let mut pc = PointCloudEntity::new(EntityCore::new("pc"));
        let n = pc.load_mem(&packet(2, PointFormat::XYZ | PointFormat::AMP)).expect("parse");
        assert_eq!(n, 2);
        let layout = pc.layout();
        assert_eq!(layout.stride, 5);
        assert_eq!(layout.amp, Some(3));
        assert_eq!(layout.rgb, None);
        // sensor (0, 1, 2) amp 3 -> enu (2, -0, -1) amp 3 flag 0
        assert_eq!(&pc.vertices()[..5], &[2.0, -0.0, -1.0, 3.0, 0.0]);
        assert_eq!(pc.core().local_origin, Vec3::new(3.0, -1.0, -2.0));
        assert_eq!(pc.core().caption, "lidar");
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut bytes = packet(4, PointFormat::XYZ);
        bytes.resize(500, 0);
        bytes[4..8].copy_from_slice(&1000u32.to_le_bytes());
        let mut pc = from_bytes(bytes);
        assert!(pc.load().is_err());
        assert!(!pc.core().valid);
        assert_eq!(pc.n_points(), 0);
    }

    fn from_bytes(bytes: Vec<u8>) -> PointCloudEntity {
        let source = EntitySource::Bytes { name: "net".into(), data: bytes.into() };
        PointCloudEntity::new(EntityCore::new("pc").with_source(source))
    }

    #[test]
    fn chunks_sum_to_point_count_and_remaining_shrinks() {
        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut pc = from_bytes(packet(10, PointFormat::XYZ));
        pc.load().expect("load");

        let mut ctx = prepare_ctx(&mut gpu, &programs, &events, 3);
        assert!(pc.prepare_gpu(&mut ctx).expect("prepare"));
        let mut last = pc.remaining();
        while pc.partial_prepare_gpu(&mut ctx) {
            assert!(pc.remaining() < last);
            last = pc.remaining();
        }
        assert_eq!(pc.remaining(), 0);
        let counts: Vec<u32> = pc.chunks().iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![3, 3, 3, 1]);

        // idempotent once complete
        assert!(!pc.partial_prepare_gpu(&mut ctx));
        assert_eq!(pc.chunks().len(), 4);

        let progress: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                SceneEvent::Progress { current, total, done, .. } => Some((current, total, done)),
                _ => None,
            })
            .collect();
        assert_eq!(progress.last(), Some(&(10, 10, true)));
        assert_eq!(progress.len(), 4);
    }

    #[test]
    fn device_limit_caps_chunk_capacity() {
        // 4 floats per point, 64 bytes -> 4 points per buffer
        let mut gpu = RecordingBackend::new(16, 16).with_max_buffer_size(64);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut pc = from_bytes(packet(9, PointFormat::XYZ));
        pc.load().expect("load");
        let mut ctx = prepare_ctx(&mut gpu, &programs, &events, 0x1ffff);
        pc.prepare_gpu(&mut ctx).expect("prepare");
        while pc.partial_prepare_gpu(&mut ctx) {}
        assert_eq!(pc.chunk_capacity(), 4);
        assert_eq!(pc.chunks().iter().map(|c| c.count).sum::<u32>(), 9);
    }

    #[test]
    fn rebuild_rewrites_existing_chunks() {
        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut pc = from_bytes(packet(5, PointFormat::XYZ | PointFormat::RGB));
        pc.load().expect("load");
        {
            let mut ctx = prepare_ctx(&mut gpu, &programs, &events, 2);
            pc.prepare_gpu(&mut ctx).expect("prepare");
            while pc.partial_prepare_gpu(&mut ctx) {}
            let before: Vec<_> = pc.chunks().to_vec();

            assert!(pc.request_rebuild());
            assert_eq!(pc.remaining(), 5);
            while pc.partial_prepare_gpu(&mut ctx) {}
            assert_eq!(pc.chunks(), &before[..]);
        }
        for chunk in pc.chunks() {
            assert_eq!(gpu.buffer(chunk.buffer).expect("buffer").writes, 1);
        }
    }

    #[test]
    fn pick_and_draft_frames_adjust_draw_calls() {
        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut pc = from_bytes(packet(6, PointFormat::XYZ));
        pc.load().expect("load");
        let mut ctx = prepare_ctx(&mut gpu, &programs, &events, 4);
        pc.prepare_gpu(&mut ctx).expect("prepare");
        while pc.partial_prepare_gpu(&mut ctx) {}

        let mut draw = DrawContext::default().with_mode(crate::draw_context::DrawMode::Pick);
        let mut out = DrawList::new();
        pc.draw(&draw, &mut out);
        assert_eq!(out.len(), 2);
        let DrawCall::Points(first) = out[0] else { panic!("points expected") };
        assert_eq!(first.uniforms.color_mode, ColorMode::Depth.as_index());
        assert_eq!(first.uniforms.point_size, PICK_POINT_SIZE);

        draw.mode = crate::draw_context::DrawMode::Draft;
        draw.point_cloud.ignore_draft = false;
        out.clear();
        pc.draw(&draw, &mut out);
        let DrawCall::Points(first) = out[0] else { panic!("points expected") };
        assert_eq!(first.decimate, DRAFT_DECIMATE);
    }

    #[test]
    fn cleanup_releases_buffers_and_program() {
        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut pc = from_bytes(packet(6, PointFormat::XYZ));
        pc.load().expect("load");
        {
            let mut ctx = prepare_ctx(&mut gpu, &programs, &events, 4);
            pc.prepare_gpu(&mut ctx).expect("prepare");
            while pc.partial_prepare_gpu(&mut ctx) {}
            pc.cleanup(&mut ctx);
        }
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_programs(), 0);
    }

    #[test]
    fn rebuild_after_cleanup_is_refused() {
        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        let events = EventBus::default();
        let mut pc = from_bytes(packet(10, PointFormat::XYZ));
        pc.load().expect("load");
        let mut ctx = prepare_ctx(&mut gpu, &programs, &events, 4);
        pc.prepare_gpu(&mut ctx).expect("prepare");
        while pc.partial_prepare_gpu(&mut ctx) {}
        pc.cleanup(&mut ctx);

        assert_eq!(pc.n_points(), 0);
        assert!(!pc.request_rebuild());
        assert!(!pc.partial_prepare_gpu(&mut ctx), "no chunk left to upload");
        assert_eq!(pc.center(), Vec3::ZERO);
        drop(ctx);
        assert_eq!(gpu.live_buffers(), 0);
    }
}
