//! Orbit camera driven by a quaternion attitude around a point of interest.
//!
//! The camera looks along the body x axis of its attitude; body z is up. Two control
//! schemes share the same state: a free trackball and a potter's wheel that keeps the
//! horizon level by composing separate tilt and yaw rotations.

use crate::config::ViewConfig;
use crate::rot;
use glam::{DMat3, DQuat, DVec3, Mat4, Vec3};
use serde::Deserialize;

pub const RANGE_MIN: f64 = 1.0;
pub const RANGE_MAX: f64 = 10_000.0;
const TRACKBALL_GAIN: f64 = 100.0;
const POTTER_GAIN: f64 = 150.0;
const MODEL_SCALE_WINDOW: (f32, f32) = (0.1, 10.0);
const POINT_SIZE_WINDOW: (f32, f32) = (1.0, 10.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    #[default]
    Perspective,
    Ortho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    Trackball,
    PottersWheel,
}

#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub quat: DQuat,
    pub poi: Vec3,
    pub poc: Vec3,
    range: f64,
    /// Potter's wheel `[tilt, yaw]` in degrees.
    pot: [f64; 2],
    pub model_scale: f32,
    pub point_size: f32,
    pub projection: Projection,
    pub control: ControlMode,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl OrbitCamera {
    pub fn new() -> Self {
        let mut camera = Self {
            quat: DQuat::IDENTITY,
            poi: Vec3::ZERO,
            poc: Vec3::ZERO,
            range: 50.0,
            pot: [0.0; 2],
            model_scale: 1.0,
            point_size: 2.0,
            projection: Projection::Perspective,
            control: ControlMode::Trackball,
        };
        camera.reset();
        camera
    }

    pub fn reset(&mut self) {
        let euler = DVec3::new(10.0, 20.0, 30.0) * rot::D2R;
        self.quat = rot::euler_to_quat(euler);
        self.range = 50.0;
        self.poi = Vec3::ZERO;
        self.update_by_poi();

        let dcm = self.dcm();
        self.pot[0] = -(-dcm.col(2).x).atan2(dcm.col(2).z) * rot::R2D;
        self.pot[1] = -dcm.col(0).y.atan2(dcm.col(1).y) * rot::R2D;

        self.model_scale = 1.0;
        self.point_size = 2.0;
    }

    pub fn dcm(&self) -> DMat3 {
        rot::dcm_from_quat(self.quat)
    }

    pub fn range(&self) -> f64 {
        self.range
    }

    pub fn tilt(&self) -> f64 {
        self.pot[0]
    }

    pub fn yaw(&self) -> f64 {
        self.pot[1]
    }

    /// Places the eye `range` behind the point of interest along the view axis.
    pub fn update_by_poi(&mut self) {
        let forward = self.dcm().col(0).as_vec3();
        self.poc = self.poi - forward * self.range as f32;
    }

    pub fn trackball(&mut self, dx: f64, dy: f64, dz: f64) {
        self.quat = rot::rot(-TRACKBALL_GAIN * dz, TRACKBALL_GAIN * dy, -TRACKBALL_GAIN * dx, self.quat);
    }

    pub fn potter(&mut self, dx: f64, dy: f64) {
        self.pot[0] = rot::normalize180(self.pot[0] + POTTER_GAIN * dy);
        self.pot[1] = rot::normalize180(self.pot[1] + POTTER_GAIN * dx);

        let tilt = rot::quat_from_axis_angle(DVec3::new(0.0, -1.0, 0.0), self.pot[0] * rot::D2R);
        let yaw = rot::quat_from_axis_angle(DVec3::Z, self.pot[1] * rot::D2R);
        let dcm = rot::dcm_from_quat(tilt) * rot::dcm_from_quat(yaw);
        self.quat = rot::dcm_to_quat(&dcm);
    }

    pub fn look_down(&mut self) {
        if self.control == ControlMode::Trackball {
            self.pot[1] = 0.0;
        }
        self.pot[0] = 90.0;
        self.potter(0.0, 0.0);
    }

    pub fn zoom(&mut self, d: f64) {
        self.range = (self.range + d * self.range).clamp(RANGE_MIN, RANGE_MAX);
    }

    pub fn translate(&mut self, dx: f64, dy: f64, dz: f64, aspect: f64) {
        let dcm = self.dcm();
        let aspect = if aspect > 0.0 { aspect } else { 1.0 };
        let delta = dcm.col(1) * (self.range * dx * 2.0)
            + dcm.col(2) * (self.range * dy * 2.0 / aspect)
            + dcm.col(0) * dz;
        self.poi += delta.as_vec3();
    }

    pub fn left_axis(&mut self, dx: f64, dy: f64) {
        match self.control {
            ControlMode::Trackball => self.trackball(dx, dy, 0.0),
            ControlMode::PottersWheel => self.potter(dx, dy),
        }
    }

    /// In trackball mode horizontal motion rolls and vertical motion zooms in the same drag.
    pub fn right_axis(&mut self, dx: f64, dy: f64, aspect: f64) {
        match self.control {
            ControlMode::Trackball => {
                self.trackball(0.0, 0.0, dx);
                self.zoom(dy);
            }
            ControlMode::PottersWheel => self.translate(dx, dy, 0.0, aspect),
        }
    }

    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
        self.left_axis(0.0, 0.0);
        self.update_by_poi();
    }

    /// Applies `gain` to the model scale; rejected when the result leaves (0.1, 10).
    pub fn scale_model(&mut self, gain: f32) -> bool {
        let scaled = self.model_scale * gain;
        let accept = MODEL_SCALE_WINDOW.0 < scaled && scaled < MODEL_SCALE_WINDOW.1;
        if accept {
            self.model_scale = scaled;
        }
        accept
    }

    /// Applies `gain` to the point size; rejected when the result leaves (1, 10).
    pub fn scale_point_size(&mut self, gain: f32) -> bool {
        let scaled = self.point_size * gain;
        let accept = POINT_SIZE_WINDOW.0 < scaled && scaled < POINT_SIZE_WINDOW.1;
        if accept {
            self.point_size = scaled;
        }
        accept
    }

    pub fn projection_matrix(&self, aspect: f32, view: &ViewConfig) -> Mat4 {
        let aspect = aspect.max(0.0001);
        match self.projection {
            Projection::Perspective => {
                Mat4::perspective_rh_gl(view.pers_fov.to_radians(), aspect, view.pers_near, view.pers_far)
            }
            Projection::Ortho => {
                let r = self.range as f32;
                Mat4::orthographic_rh_gl(-r, r, -r / aspect, r / aspect, view.orth_near, view.orth_far)
            }
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        let up = self.dcm().col(2).as_vec3();
        Mat4::look_at_rh(self.poc, self.poi, up)
    }

    pub fn eye_dir(&self) -> Vec3 {
        self.poi - self.poc
    }
}
