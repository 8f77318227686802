use glam::{Mat4, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawMode {
    #[default]
    Normal,
    /// Offscreen pass that writes encoded depth into the color target.
    Pick,
    /// Reduced-fidelity frame issued while the user is interacting.
    Draft,
}

/// Point-cloud colorization. The discriminants are the values the point shader switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ColorMode {
    #[default]
    Height = 0,
    Range = 1,
    Amp = 2,
    AmpBw = 3,
    Depth = 4,
    HeightAmp = 5,
    Texture = 6,
    Index = 7,
}

impl ColorMode {
    pub fn as_index(self) -> u32 {
        self as u32
    }
}

/// Inclusive scalar window. A filter is active only when `min < max`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Window1 {
    pub min: f32,
    pub max: f32,
}

impl Window1 {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn enabled(&self) -> bool {
        self.min < self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointCloudOptions {
    pub color_mode: ColorMode,
    pub point_size: f32,
    pub amp: Window1,
    pub range: Window1,
    pub height: Window1,
    pub amp_filter: Window1,
    pub range_filter: Window1,
    pub height_filter: Window1,
    /// Draw every point even in draft frames.
    pub ignore_draft: bool,
}

impl Default for PointCloudOptions {
    fn default() -> Self {
        Self {
            color_mode: ColorMode::Height,
            point_size: 3.0,
            amp: Window1::new(0.0, 255.0),
            range: Window1::new(0.0, 255.0),
            height: Window1::new(0.0, 255.0),
            amp_filter: Window1::default(),
            range_filter: Window1::default(),
            height_filter: Window1::default(),
            ignore_draft: true,
        }
    }
}

/// Everything an entity needs to issue its draw calls for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawContext {
    pub width: u32,
    pub height: u32,
    pub aspect: f32,
    pub proj: Mat4,
    pub camera: Mat4,
    pub world: Mat4,
    pub light_pos: Vec3,
    pub eye_dir: Vec3,
    pub mode: DrawMode,
    pub point_cloud: PointCloudOptions,
    pub model_scale: f32,
    pub anti_alias: bool,
    pub eye_dome_lighting: bool,
}

impl Default for DrawContext {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            aspect: 1.0,
            proj: Mat4::IDENTITY,
            camera: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            light_pos: Vec3::new(0.0, 0.0, 100.0),
            eye_dir: Vec3::X,
            mode: DrawMode::Normal,
            point_cloud: PointCloudOptions::default(),
            model_scale: 1.0,
            anti_alias: false,
            eye_dome_lighting: false,
        }
    }
}

impl DrawContext {
    pub fn is_pick(&self) -> bool {
        self.mode == DrawMode::Pick
    }

    pub fn is_draft(&self) -> bool {
        self.mode == DrawMode::Draft
    }

    /// `proj · camera · world`, the matrix unprojection inverts.
    pub fn view_projection(&self) -> Mat4 {
        self.proj * self.camera * self.world
    }

    pub fn with_mode(mut self, mode: DrawMode) -> Self {
        self.mode = mode;
        self
    }
}
