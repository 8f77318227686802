use crate::camera3d::{ControlMode, Projection};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    #[serde(default)]
    pub point_anti_alias: bool,
    #[serde(default = "ViewConfig::default_pers_fov")]
    pub pers_fov: f32,
    #[serde(default = "ViewConfig::default_pers_near")]
    pub pers_near: f32,
    #[serde(default = "ViewConfig::default_pers_far")]
    pub pers_far: f32,
    #[serde(default = "ViewConfig::default_orth_near")]
    pub orth_near: f32,
    #[serde(default = "ViewConfig::default_orth_far")]
    pub orth_far: f32,
    #[serde(default)]
    pub camera_mode: Projection,
    #[serde(default)]
    pub control_mode: ControlMode,
    /// Skip the follow-up full-quality redraw after an interaction.
    #[serde(default)]
    pub draft_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PickingConfig {
    #[serde(default = "PickingConfig::default_search_radius")]
    pub search_radius: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "LoaderConfig::default_threads")]
    pub threads: usize,
    /// Points per GPU chunk before the device limit is applied.
    #[serde(default = "LoaderConfig::default_chunk_points")]
    pub chunk_points: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "TimerConfig::default_draft_delay_ms")]
    pub draft_delay_ms: u64,
    #[serde(default = "TimerConfig::default_partial_prepare_hz")]
    pub partial_prepare_hz: u32,
    #[serde(default = "TimerConfig::default_partial_steps_per_tick")]
    pub partial_steps_per_tick: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ViewerConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub picking: PickingConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ViewerConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vsync: Option<bool>,
    pub camera_mode: Option<Projection>,
    pub control_mode: Option<ControlMode>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { title: "calview".to_string(), width: 1280, height: 720, vsync: true }
    }
}

impl ViewConfig {
    const fn default_pers_fov() -> f32 {
        45.0
    }

    const fn default_pers_near() -> f32 {
        0.1
    }

    const fn default_pers_far() -> f32 {
        10_000.0
    }

    const fn default_orth_near() -> f32 {
        -10_000.0
    }

    const fn default_orth_far() -> f32 {
        10_000.0
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            point_anti_alias: false,
            pers_fov: Self::default_pers_fov(),
            pers_near: Self::default_pers_near(),
            pers_far: Self::default_pers_far(),
            orth_near: Self::default_orth_near(),
            orth_far: Self::default_orth_far(),
            camera_mode: Projection::default(),
            control_mode: ControlMode::default(),
            draft_only: false,
        }
    }
}

impl PickingConfig {
    const fn default_search_radius() -> u32 {
        24
    }
}

impl Default for PickingConfig {
    fn default() -> Self {
        Self { search_radius: Self::default_search_radius() }
    }
}

impl LoaderConfig {
    const fn default_threads() -> usize {
        4
    }

    const fn default_chunk_points() -> usize {
        0x1ffff
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { threads: Self::default_threads(), chunk_points: Self::default_chunk_points() }
    }
}

impl TimerConfig {
    const fn default_draft_delay_ms() -> u64 {
        500
    }

    const fn default_partial_prepare_hz() -> u32 {
        60
    }

    const fn default_partial_steps_per_tick() -> u32 {
        4
    }

    pub fn draft_delay(&self) -> Duration {
        Duration::from_millis(self.draft_delay_ms)
    }

    pub fn partial_prepare_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.partial_prepare_hz.max(1)))
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            draft_delay_ms: Self::default_draft_delay_ms(),
            partial_prepare_hz: Self::default_partial_prepare_hz(),
            partial_steps_per_tick: Self::default_partial_steps_per_tick(),
        }
    }
}

impl ViewerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ViewerConfigOverrides) {
        if let Some(width) = overrides.width {
            self.window.width = width;
        }
        if let Some(height) = overrides.height {
            self.window.height = height;
        }
        if let Some(vsync) = overrides.vsync {
            self.window.vsync = vsync;
        }
        if let Some(mode) = overrides.camera_mode {
            self.view.camera_mode = mode;
        }
        if let Some(mode) = overrides.control_mode {
            self.view.control_mode = mode;
        }
    }
}

impl ViewerConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.vsync.is_none()
            && self.camera_mode.is_none()
            && self.control_mode.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.width.is_some() {
            fields.push("width");
        }
        if self.height.is_some() {
            fields.push("height");
        }
        if self.vsync.is_some() {
            fields.push("vsync");
        }
        if self.camera_mode.is_some() {
            fields.push("camera_mode");
        }
        if self.control_mode.is_some() {
            fields.push("control_mode");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_section_defaults() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{ "view": {{ "point_anti_alias": true, "camera_mode": "ortho" }}, "loader": {{ "threads": 2 }} }}"#
        )
        .expect("write");
        let cfg = ViewerConfig::load(file.path()).expect("config parses");
        assert!(cfg.view.point_anti_alias);
        assert_eq!(cfg.view.camera_mode, Projection::Ortho);
        assert_eq!(cfg.view.control_mode, ControlMode::Trackball);
        assert_eq!(cfg.loader.threads, 2);
        assert_eq!(cfg.loader.chunk_points, 0x1ffff);
        assert_eq!(cfg.picking.search_radius, 24);
        assert_eq!(cfg.timers.draft_delay_ms, 500);
        assert_eq!(cfg.window.width, 1280);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ViewerConfig::load_or_default("/definitely/not/here.json");
        assert_eq!(cfg.timers.partial_prepare_hz, 60);
        assert_eq!(cfg.timers.partial_steps_per_tick, 4);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut cfg = ViewerConfig::default();
        let overrides = ViewerConfigOverrides {
            width: Some(640),
            control_mode: Some(ControlMode::PottersWheel),
            ..Default::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.window.width, 640);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.view.control_mode, ControlMode::PottersWheel);
        assert_eq!(overrides.applied_fields(), vec!["width", "control_mode"]);
        assert!(!overrides.is_empty());
    }
}
