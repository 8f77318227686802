//! Mouse, wheel and keyboard handling for the scene camera.
//!
//! Events arrive already translated from the windowing layer, so this module does not
//! depend on winit.

use super::SceneWidget;
use crate::camera3d::{ControlMode, Projection};
use bitflags::bitflags;
use glam::Vec2;

/// Wheel notches arrive in eighths of a degree, 120 per notch.
pub const WHEEL_GAIN: f64 = 0.01 / 8.0;
pub const KEY_TRANSLATE_STEP: f64 = 0.5;
pub const KEY_ZOOM_STEP: f64 = 0.15;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u8 {
        const SHIFT = 0x01;
        const CTRL = 0x02;
        const ALT = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKey {
    F3,
    F4,
    F5,
    F6,
    P,
    T,
    PageDown,
    Escape,
    Digit1,
    Digit2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// A user action in window coordinates (pixels, top-left origin).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    Press { button: MouseButton, position: Vec2 },
    Move { position: Vec2, left: bool, right: bool, modifiers: Modifiers },
    Wheel { delta: f32, modifiers: Modifiers },
    Key(ViewKey),
    DoubleClick { position: Vec2 },
}

impl SceneWidget {
    /// Routes one gesture; returns whether the view changed.
    pub fn handle(&mut self, gesture: Gesture) -> bool {
        match gesture {
            Gesture::Press { position, .. } => {
                self.mouse_press(position);
                false
            }
            Gesture::Move { position, left, right, modifiers } => self.mouse_move(position, left, right, modifiers),
            Gesture::Wheel { delta, modifiers } => self.wheel(delta, modifiers),
            Gesture::Key(key) => self.key_press(key),
            Gesture::DoubleClick { position } => self.set_poi_from_window(position.x, position.y),
        }
    }

    pub fn mouse_press(&mut self, position: Vec2) {
        self.last_cursor = Some(position);
    }

    /// Left drag orbits, right drag rolls/zooms or pans depending on the control mode.
    pub fn mouse_move(&mut self, position: Vec2, left: bool, right: bool, modifiers: Modifiers) -> bool {
        let last = self.last_cursor.unwrap_or(position);
        self.last_cursor = Some(position);
        let mut dx = f64::from(position.x - last.x) / f64::from(self.draw.width);
        let mut dy = f64::from(position.y - last.y) / f64::from(self.draw.height);
        if modifiers.contains(Modifiers::CTRL) {
            dx = 0.0;
        }
        if modifiers.contains(Modifiers::ALT) {
            dy = 0.0;
        }

        if left {
            self.camera.left_axis(dx, dy);
        } else if right {
            self.camera.right_axis(dx, dy, f64::from(self.draw.aspect));
        } else {
            return false;
        }
        self.camera.update_by_poi();
        self.draft_update();
        true
    }

    /// Shift scales the model, Ctrl the point size, a bare wheel zooms.
    pub fn wheel(&mut self, delta: f32, modifiers: Modifiers) -> bool {
        let step = f64::from(delta) * WHEEL_GAIN;
        let gain = (1.0 - step) as f32;
        let mut changed = false;
        if modifiers.contains(Modifiers::SHIFT) {
            changed |= self.camera.scale_model(gain);
        }
        if modifiers.contains(Modifiers::CTRL) {
            changed |= self.camera.scale_point_size(gain);
        }
        if modifiers.is_empty() {
            self.camera.zoom(-step);
            self.camera.update_by_poi();
            changed = true;
        }
        if changed {
            self.draft_update();
        }
        changed
    }

    pub fn key_press(&mut self, key: ViewKey) -> bool {
        let aspect = f64::from(self.draw.aspect);
        match key {
            ViewKey::F5 => self.camera.translate(0.0, 0.0, KEY_TRANSLATE_STEP, aspect),
            ViewKey::F6 => self.camera.translate(0.0, 0.0, -KEY_TRANSLATE_STEP, aspect),
            ViewKey::F3 => self.camera.zoom(-KEY_ZOOM_STEP),
            ViewKey::F4 => self.camera.zoom(KEY_ZOOM_STEP),
            ViewKey::P => self.camera.control = ControlMode::PottersWheel,
            ViewKey::T => self.camera.control = ControlMode::Trackball,
            ViewKey::PageDown => self.camera.look_down(),
            ViewKey::Escape => self.camera.reset(),
            ViewKey::Digit1 => self.camera.set_projection(Projection::Perspective),
            ViewKey::Digit2 => self.camera.set_projection(Projection::Ortho),
        }
        self.camera.update_by_poi();
        self.draft_update();
        true
    }
}
