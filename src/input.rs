//! Translates winit window events into scene [`Gesture`]s.
//!
//! Tracks the cursor, held buttons and modifiers between events, and synthesizes the
//! double-click winit does not report.

use crate::scene::input::MouseButton;
use crate::scene::{Gesture, Modifiers, ViewKey};
use glam::Vec2;
use std::time::{Duration, Instant};
use winit::event::{ElementState, MouseScrollDelta, WindowEvent};
use winit::keyboard::{Key, ModifiersState, NamedKey};

pub const DOUBLE_CLICK_INTERVAL: Duration = Duration::from_millis(400);
/// Maximum cursor travel between the two presses of a double-click.
pub const DOUBLE_CLICK_SLOP: f32 = 4.0;
/// Wheel units per line, matching the eighth-degree convention the scene expects.
pub const WHEEL_UNITS_PER_LINE: f32 = 120.0;

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key { key: Key, pressed: bool },
    Modifiers(ModifiersState),
    Wheel { delta: f32 },
    MouseButton { button: winit::event::MouseButton, pressed: bool },
    CursorPos { x: f32, y: f32 },
    Other,
}

impl InputEvent {
    pub fn from_window_event(ev: &WindowEvent) -> Self {
        match ev {
            WindowEvent::MouseWheel { delta, .. } => {
                let d = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y * WHEEL_UNITS_PER_LINE,
                    MouseScrollDelta::PixelDelta(p) => p.y as f32,
                };
                InputEvent::Wheel { delta: d }
            }
            WindowEvent::CursorMoved { position, .. } => {
                InputEvent::CursorPos { x: position.x as f32, y: position.y as f32 }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                InputEvent::MouseButton { button: *button, pressed: *state == ElementState::Pressed }
            }
            WindowEvent::KeyboardInput { event, .. } => InputEvent::Key {
                key: event.logical_key.clone(),
                pressed: event.state == ElementState::Pressed,
            },
            WindowEvent::ModifiersChanged(modifiers) => InputEvent::Modifiers(modifiers.state()),
            _ => InputEvent::Other,
        }
    }
}

fn view_key(key: &Key) -> Option<ViewKey> {
    match key {
        Key::Named(NamedKey::F3) => Some(ViewKey::F3),
        Key::Named(NamedKey::F4) => Some(ViewKey::F4),
        Key::Named(NamedKey::F5) => Some(ViewKey::F5),
        Key::Named(NamedKey::F6) => Some(ViewKey::F6),
        Key::Named(NamedKey::PageDown) => Some(ViewKey::PageDown),
        Key::Named(NamedKey::Escape) => Some(ViewKey::Escape),
        Key::Character(ch) => match ch.to_lowercase().as_str() {
            "p" => Some(ViewKey::P),
            "t" => Some(ViewKey::T),
            "1" => Some(ViewKey::Digit1),
            "2" => Some(ViewKey::Digit2),
            _ => None,
        },
        _ => None,
    }
}

fn modifiers(state: ModifiersState) -> Modifiers {
    let mut out = Modifiers::empty();
    out.set(Modifiers::SHIFT, state.shift_key());
    out.set(Modifiers::CTRL, state.control_key());
    out.set(Modifiers::ALT, state.alt_key());
    out
}

#[derive(Debug, Default)]
pub struct Input {
    cursor: Vec2,
    left_pressed: bool,
    right_pressed: bool,
    modifiers: Modifiers,
    last_click: Option<(Instant, Vec2)>,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor_position(&self) -> Vec2 {
        self.cursor
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// Folds one event into the tracked state and returns the gestures it produces.
    pub fn push(&mut self, ev: &InputEvent, now: Instant) -> Vec<Gesture> {
        let mut out = Vec::new();
        match ev {
            InputEvent::Modifiers(state) => self.modifiers = modifiers(*state),
            InputEvent::CursorPos { x, y } => {
                self.cursor = Vec2::new(*x, *y);
                out.push(Gesture::Move {
                    position: self.cursor,
                    left: self.left_pressed,
                    right: self.right_pressed,
                    modifiers: self.modifiers,
                });
            }
            InputEvent::Wheel { delta } => out.push(Gesture::Wheel { delta: *delta, modifiers: self.modifiers }),
            InputEvent::Key { key, pressed: true } => out.extend(view_key(key).map(Gesture::Key)),
            InputEvent::MouseButton { button, pressed } => {
                let button = match button {
                    winit::event::MouseButton::Left => MouseButton::Left,
                    winit::event::MouseButton::Right => MouseButton::Right,
                    winit::event::MouseButton::Middle => MouseButton::Middle,
                    _ => return out,
                };
                match button {
                    MouseButton::Left => self.left_pressed = *pressed,
                    MouseButton::Right => self.right_pressed = *pressed,
                    MouseButton::Middle => {}
                }
                if *pressed {
                    out.push(Gesture::Press { button, position: self.cursor });
                    if button == MouseButton::Left && self.is_double_click(now) {
                        self.last_click = None;
                        out.push(Gesture::DoubleClick { position: self.cursor });
                    } else if button == MouseButton::Left {
                        self.last_click = Some((now, self.cursor));
                    }
                }
            }
            InputEvent::Key { .. } | InputEvent::Other => {}
        }
        out
    }

    fn is_double_click(&self, now: Instant) -> bool {
        self.last_click.is_some_and(|(at, position)| {
            now.duration_since(at) <= DOUBLE_CLICK_INTERVAL && position.distance(self.cursor) <= DOUBLE_CLICK_SLOP
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(input: &mut Input, now: Instant) -> Vec<Gesture> {
        input.push(&InputEvent::MouseButton { button: winit::event::MouseButton::Left, pressed: true }, now)
    }

    fn release(input: &mut Input, now: Instant) {
        input.push(&InputEvent::MouseButton { button: winit::event::MouseButton::Left, pressed: false }, now);
    }

    #[test]
    fn drag_reports_held_buttons_and_modifiers() {
        let mut input = Input::new();
        let now = Instant::now();
        input.push(&InputEvent::Modifiers(ModifiersState::CONTROL), now);
        press(&mut input, now);
        let gestures = input.push(&InputEvent::CursorPos { x: 5.0, y: 6.0 }, now);
        assert_eq!(
            gestures,
            vec![Gesture::Move { position: Vec2::new(5.0, 6.0), left: true, right: false, modifiers: Modifiers::CTRL }]
        );
    }

    #[test]
    fn two_quick_presses_make_a_double_click() {
        let mut input = Input::new();
        let t0 = Instant::now();
        input.push(&InputEvent::CursorPos { x: 100.0, y: 80.0 }, t0);
        assert_eq!(press(&mut input, t0).len(), 1);
        release(&mut input, t0);
        let gestures = press(&mut input, t0 + Duration::from_millis(150));
        assert_eq!(gestures.last(), Some(&Gesture::DoubleClick { position: Vec2::new(100.0, 80.0) }));

        release(&mut input, t0);
        let late = press(&mut input, t0 + Duration::from_secs(2));
        assert!(!late.iter().any(|g| matches!(g, Gesture::DoubleClick { .. })), "third press starts over");
    }

    #[test]
    fn slow_or_distant_presses_stay_single() {
        let mut input = Input::new();
        let t0 = Instant::now();
        press(&mut input, t0);
        release(&mut input, t0);
        assert_eq!(press(&mut input, t0 + Duration::from_millis(900)).len(), 1);

        release(&mut input, t0);
        input.push(&InputEvent::CursorPos { x: 50.0, y: 0.0 }, t0);
        assert_eq!(press(&mut input, t0 + Duration::from_millis(1000)).len(), 1);
    }

    #[test]
    fn only_view_keys_produce_gestures() {
        let mut input = Input::new();
        let now = Instant::now();
        let key = |k: Key| InputEvent::Key { key: k, pressed: true };
        assert_eq!(input.push(&key(Key::Named(NamedKey::F5)), now), vec![Gesture::Key(ViewKey::F5)]);
        assert_eq!(input.push(&key(Key::Character("P".into())), now), vec![Gesture::Key(ViewKey::P)]);
        assert!(input.push(&key(Key::Character("x".into())), now).is_empty());
        let release = InputEvent::Key { key: Key::Named(NamedKey::Escape), pressed: false };
        assert!(input.push(&release, now).is_empty());
    }
}
