//! Depth capture and screen-to-world unprojection.
//!
//! The depth context stores samples bottom-up, in the window convention the unprojection
//! math expects (row 0 is the bottom edge of the viewport).

use glam::{DVec4, Mat4, Vec3};

/// `2^24`, the scale the pick shaders use when packing depth into RGBA8.
pub const DEPTH_ENCODE_SCALE: f64 = 16_777_216.0;
const DEPTH_DECODE_SCALE: f64 = 0x00ff_ffff as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthSource {
    #[default]
    None,
    /// True depth buffer read back as floats.
    Float,
    /// Depth packed into an RGBA8 color target by the pick pass.
    Encoded,
}

/// A depth image as read back from the GPU: row-major, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage<T> {
    pub width: u32,
    pub height: u32,
    pub data: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct DepthContext {
    width: u32,
    height: u32,
    depth: Vec<f32>,
    depth_encoded: Vec<u32>,
    source: DepthSource,
}

impl DepthContext {
    pub fn new(width: u32, height: u32) -> Self {
        let len = (width as usize) * (height as usize);
        Self { width, height, depth: vec![0.0; len], depth_encoded: vec![0; len], source: DepthSource::None }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn source(&self) -> DepthSource {
        self.source
    }

    pub fn invalidate(&mut self) {
        self.source = DepthSource::None;
    }

    fn flip_into<T: Copy>(dst: &mut [T], image: &DepthImage<T>, width: u32, height: u32) -> bool {
        if image.width != width || image.height != height || image.data.len() != dst.len() {
            return false;
        }
        let w = width as usize;
        for (row, src) in image.data.chunks_exact(w).enumerate() {
            let dst_row = height as usize - 1 - row;
            dst[dst_row * w..(dst_row + 1) * w].copy_from_slice(src);
        }
        true
    }

    /// Stores a float depth read. Returns false (and leaves the context invalid) on size mismatch.
    pub fn store_float(&mut self, image: &DepthImage<f32>) -> bool {
        let ok = Self::flip_into(&mut self.depth, image, self.width, self.height);
        self.source = if ok { DepthSource::Float } else { DepthSource::None };
        ok
    }

    pub fn store_encoded(&mut self, image: &DepthImage<u32>) -> bool {
        let ok = Self::flip_into(&mut self.depth_encoded, image, self.width, self.height);
        self.source = if ok { DepthSource::Encoded } else { DepthSource::None };
        ok
    }

    /// Depth at window coordinate `(x, y)` (bottom-up), if a buffer is available.
    pub fn depth_at(&self, x: i32, y: i32) -> Option<f32> {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return None;
        }
        let idx = x as usize + y as usize * self.width as usize;
        match self.source {
            DepthSource::None => None,
            DepthSource::Float => Some(self.depth[idx]),
            DepthSource::Encoded => Some(decode_depth(self.depth_encoded[idx])),
        }
    }

    /// Probes `pattern` around `(x, y)` and unprojects the first usable sample.
    pub fn pick(&self, x: i32, y: i32, pattern: &SearchPattern, view_projection: Mat4) -> Option<Vec3> {
        let r = pattern.margin();
        let (w, h) = (self.width as i32, self.height as i32);
        if !(r < x && x + r < w && r < y && y + r < h) {
            return None;
        }
        let viewport = [0, 0, w, h];
        pattern.offsets().iter().find_map(|&(dx, dy)| {
            let (px, py) = (x + dx, y + dy);
            let z = self.depth_at(px, py)?;
            unproject(Vec3::new(px as f32, py as f32, z), view_projection, viewport)
        })
    }
}

/// Packs a `[0, 1]` depth the way the pick shaders do, as the little-endian RGBA8 word.
pub fn encode_depth(z: f32) -> u32 {
    let depth = (f64::from(z) * DEPTH_ENCODE_SCALE) as i64;
    let r = depth / 16_777_216;
    let rest = depth - r * 16_777_216;
    let g = rest / 65_536;
    let rest = rest - g * 65_536;
    let b = rest / 256;
    let low = rest - b * 256;
    (low as u32) | ((b as u32) << 8) | ((g as u32) << 16) | ((r as u32) << 24)
}

pub fn decode_depth(zi: u32) -> f32 {
    (f64::from(zi) / DEPTH_DECODE_SCALE) as f32
}

/// Maps a window coordinate with depth in (0, 1) back to world space.
///
/// `viewport` is `[x, y, width, height]`; `window.y` is measured from the bottom edge.
pub fn unproject(window: Vec3, view_projection: Mat4, viewport: [i32; 4]) -> Option<Vec3> {
    if !(window.z > 0.0 && window.z < 1.0) || viewport[2] <= 0 || viewport[3] <= 0 {
        return None;
    }
    let m = view_projection.as_dmat4();
    if m.determinant().abs() < f64::EPSILON {
        return None;
    }
    let ndc = DVec4::new(
        2.0 * (f64::from(window.x) - f64::from(viewport[0])) / f64::from(viewport[2]) - 1.0,
        2.0 * (f64::from(window.y) - f64::from(viewport[1])) / f64::from(viewport[3]) - 1.0,
        2.0 * f64::from(window.z) - 1.0,
        1.0,
    );
    let obj = m.inverse() * ndc;
    if obj.w.abs() < f64::EPSILON {
        return None;
    }
    Some((obj.truncate() / obj.w).as_vec3())
}

/// Forward counterpart of [`unproject`], returning window x/y (bottom-up) and depth.
pub fn project(point: Vec3, view_projection: Mat4, viewport: [i32; 4]) -> Option<Vec3> {
    let clip = view_projection.as_dmat4() * point.as_dvec3().extend(1.0);
    if clip.w.abs() < f64::EPSILON {
        return None;
    }
    let ndc = clip.truncate() / clip.w;
    Some(Vec3::new(
        (f64::from(viewport[0]) + (ndc.x + 1.0) * 0.5 * f64::from(viewport[2])) as f32,
        (f64::from(viewport[1]) + (ndc.y + 1.0) * 0.5 * f64::from(viewport[3])) as f32,
        ((ndc.z + 1.0) * 0.5) as f32,
    ))
}

/// Square spiral of pixel offsets around the origin, nearest first.
#[derive(Debug, Clone)]
pub struct SearchPattern {
    radius: i32,
    offsets: Vec<(i32, i32)>,
}

impl SearchPattern {
    pub fn new(radius: u32) -> Self {
        let radius = radius.max(1) as i32;
        let limit = ((radius - 1) * (radius - 1)).max(1) as usize;
        let mut offsets = vec![(0, 0)];
        let (mut x, mut y) = (0i32, 0i32);
        let mut step = 1;
        let mut sign = 1;
        while offsets.len() < limit {
            for _ in 0..step {
                y += sign;
                offsets.push((x, y));
            }
            for _ in 0..step {
                x += sign;
                offsets.push((x, y));
            }
            step += 1;
            sign = -sign;
        }
        Self { radius, offsets }
    }

    pub fn radius(&self) -> i32 {
        self.radius
    }

    /// Distance the probe center must keep from every viewport edge.
    pub fn margin(&self) -> i32 {
        self.radius / 2 + 1
    }

    pub fn offsets(&self) -> &[(i32, i32)] {
        &self.offsets
    }
}

impl Default for SearchPattern {
    fn default() -> Self {
        Self::new(24)
    }
}
