//! Scene engine for visualizing camera-calibration data: georeferenced models, point clouds,
//! pose sequences and polylines in one orbit-camera view with depth picking.

pub mod app;
pub mod camera3d;
pub mod cli;
pub mod config;
pub mod depth;
pub mod draw_context;
pub mod entity;
pub mod events;
pub mod gpu;
pub mod import;
pub mod input;
pub mod packet;
pub mod rot;
pub mod scene;

pub use app::{run, run_headless, App, Launch};
pub use scene::SceneWidget;
