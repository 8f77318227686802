//! Headless [`GpuBackend`] that records everything it is asked to do.
//!
//! Used by the test suite and by `--headless` runs: buffers live in host memory, draw
//! passes are captured per frame, and depth reads are served from images the caller
//! installs.

use super::{
    BufferId, BufferUsage, DepthReadError, DrawCall, GpuBackend, GpuError, PassKind, ProgramId, ProgramKind,
    RenderTarget, TextureId,
};
use crate::depth::DepthImage;
use std::collections::HashMap;

/// Default cap mirrors the 256 MiB `max_buffer_size` most adapters report.
const DEFAULT_MAX_BUFFER_SIZE: u64 = 256 << 20;

#[derive(Debug, Clone)]
pub struct RecordedBuffer {
    pub label: String,
    pub usage: BufferUsage,
    pub data: Vec<u8>,
    pub writes: usize,
}

#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub target: RenderTarget,
    pub passes: Vec<(PassKind, Vec<DrawCall>)>,
    pub depth_reads: usize,
}

impl RecordedFrame {
    pub fn calls(&self, pass: PassKind) -> impl Iterator<Item = &DrawCall> {
        self.passes.iter().filter(move |(kind, _)| *kind == pass).flat_map(|(_, calls)| calls.iter())
    }

    pub fn all_calls(&self) -> impl Iterator<Item = &DrawCall> {
        self.passes.iter().flat_map(|(_, calls)| calls.iter())
    }
}

#[derive(Debug)]
pub struct RecordingBackend {
    width: u32,
    height: u32,
    max_buffer_size: u64,
    next_id: u32,
    buffers: HashMap<BufferId, RecordedBuffer>,
    textures: HashMap<TextureId, (u32, u32)>,
    programs: HashMap<ProgramId, ProgramKind>,
    frames: Vec<RecordedFrame>,
    current: Option<RecordedFrame>,
    float_depth: Option<DepthImage<f32>>,
    encoded_depth: Option<DepthImage<u32>>,
    float_depth_supported: bool,
    current_depth: i32,
    make_current_calls: usize,
}

impl RecordingBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            frames: Vec::new(),
            current: None,
            float_depth: None,
            encoded_depth: None,
            float_depth_supported: true,
            current_depth: 0,
            make_current_calls: 0,
        }
    }

    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Makes [`GpuBackend::read_depth`] fail, as on drivers without depth readback.
    pub fn without_float_depth(mut self) -> Self {
        self.float_depth_supported = false;
        self
    }

    pub fn set_float_depth(&mut self, image: DepthImage<f32>) {
        self.float_depth = Some(image);
    }

    pub fn set_encoded_depth(&mut self, image: DepthImage<u32>) {
        self.encoded_depth = Some(image);
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn buffer(&self, id: BufferId) -> Option<&RecordedBuffer> {
        self.buffers.get(&id)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn frames(&self) -> &[RecordedFrame] {
        &self.frames
    }

    pub fn last_frame(&self) -> Option<&RecordedFrame> {
        self.frames.last()
    }

    pub fn clear_frames(&mut self) {
        self.frames.clear();
    }

    pub fn current_depth(&self) -> i32 {
        self.current_depth
    }

    pub fn make_current_calls(&self) -> usize {
        self.make_current_calls
    }

    fn blank<T: Copy>(&self, value: T) -> DepthImage<T> {
        DepthImage { width: self.width, height: self.height, data: vec![value; (self.width * self.height) as usize] }
    }
}

impl GpuBackend for RecordingBackend {
    fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    fn create_buffer(&mut self, label: &str, usage: BufferUsage, data: &[u8]) -> Result<BufferId, GpuError> {
        let id = BufferId(self.next());
        self.buffers
            .insert(id, RecordedBuffer { label: label.to_string(), usage, data: data.to_vec(), writes: 0 });
        Ok(id)
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let buffer = self.buffers.get_mut(&id).ok_or(GpuError::UnknownBuffer(id))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.data.len() {
            return Err(GpuError::WriteOutOfBounds { id, offset, len: data.len(), size: buffer.data.len() as u64 });
        }
        buffer.data[start..end].copy_from_slice(data);
        buffer.writes += 1;
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        self.buffers.remove(&id);
    }

    fn create_texture(&mut self, _label: &str, image: &image::RgbaImage) -> Result<TextureId, GpuError> {
        let id = TextureId(self.next());
        self.textures.insert(id, image.dimensions());
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        let id = ProgramId(self.next());
        self.programs.insert(id, kind);
        Ok(id)
    }

    fn destroy_program(&mut self, id: ProgramId) {
        self.programs.remove(&id);
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self, target: RenderTarget, _clear: [f32; 4]) -> Result<(), GpuError> {
        if let Some(unfinished) = self.current.take() {
            self.frames.push(unfinished);
        }
        self.current = Some(RecordedFrame { target, passes: Vec::new(), depth_reads: 0 });
        Ok(())
    }

    fn draw_pass(&mut self, pass: PassKind, calls: &[DrawCall]) -> Result<(), GpuError> {
        let frame = self.current.as_mut().ok_or(GpuError::NoFrame)?;
        for call in calls {
            if !self.buffers.contains_key(&call.buffer()) {
                return Err(GpuError::UnknownBuffer(call.buffer()));
            }
        }
        frame.passes.push((pass, calls.to_vec()));
        Ok(())
    }

    fn read_depth(&mut self) -> Result<DepthImage<f32>, DepthReadError> {
        if !self.float_depth_supported {
            return Err(DepthReadError::Unavailable("float depth readback disabled".into()));
        }
        let image = self.float_depth.clone().unwrap_or_else(|| self.blank(1.0));
        let frame = self.current.as_mut().ok_or(DepthReadError::NoFrame)?;
        frame.depth_reads += 1;
        Ok(image)
    }

    fn read_encoded_depth(&mut self) -> Result<DepthImage<u32>, DepthReadError> {
        let image = self.encoded_depth.clone().unwrap_or_else(|| self.blank(0x00ff_ffff));
        let frame = self.current.as_mut().ok_or(DepthReadError::NoFrame)?;
        if frame.target != RenderTarget::EncodedDepth {
            return Err(DepthReadError::Unavailable("frame has no encoded depth target".into()));
        }
        frame.depth_reads += 1;
        Ok(image)
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        let frame = self.current.take().ok_or(GpuError::NoFrame)?;
        self.frames.push(frame);
        Ok(())
    }

    fn make_current(&mut self) {
        self.current_depth += 1;
        self.make_current_calls += 1;
    }

    fn done_current(&mut self) {
        self.current_depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_bounds_checked() {
        let mut gpu = RecordingBackend::new(4, 4);
        let id = gpu.create_buffer("chunk", BufferUsage::Storage, &[0u8; 8]).expect("create");
        gpu.write_buffer(id, 4, &[1, 2, 3, 4]).expect("fits");
        assert_eq!(gpu.buffer(id).map(|b| b.data.clone()), Some(vec![0, 0, 0, 0, 1, 2, 3, 4]));
        assert!(matches!(gpu.write_buffer(id, 6, &[0; 4]), Err(GpuError::WriteOutOfBounds { .. })));
    }

    #[test]
    fn encoded_read_requires_encoded_target() {
        let mut gpu = RecordingBackend::new(2, 2);
        gpu.begin_frame(RenderTarget::Screen, [0.0; 4]).expect("frame");
        assert!(gpu.read_encoded_depth().is_err());
        gpu.end_frame().expect("end");
        gpu.begin_frame(RenderTarget::EncodedDepth, [0.0; 4]).expect("frame");
        assert_eq!(gpu.read_encoded_depth().expect("read").data.len(), 4);
    }
}
