use crate::camera3d::{ControlMode, Projection};
use crate::config::ViewerConfigOverrides;
use crate::scene::EntityKind;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
    vsync: Option<bool>,
    ortho: bool,
    trackball: Option<bool>,
    headless: bool,
    reference: Option<PathBuf>,
    files: Vec<(EntityKind, PathBuf)>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                let path = PathBuf::from(flag);
                overrides.files.push((kind_for_path(&path), path));
                continue;
            };
            match key {
                "ortho" => {
                    overrides.ortho = true;
                    continue;
                }
                "trackball" => {
                    overrides.trackball = Some(true);
                    continue;
                }
                "potters-wheel" => {
                    overrides.trackball = Some(false);
                    continue;
                }
                "headless" => {
                    overrides.headless = true;
                    continue;
                }
                _ => {}
            }
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "reference" => overrides.reference = Some(PathBuf::from(value)),
                "width" => {
                    overrides.width =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid width '{value}'"))?);
                }
                "height" => {
                    overrides.height =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid height '{value}'"))?);
                }
                "vsync" => {
                    overrides.vsync = Some(parse_bool_flag("vsync", &value)?);
                }
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --width, --height, --vsync, --ortho, \
                     --trackball, --potters-wheel, --reference, --headless."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Render one offscreen frame and exit instead of opening a window.
    pub fn headless(&self) -> bool {
        self.headless
    }

    /// Model stamped at every pose of the pose files on the command line.
    pub fn reference(&self) -> Option<&Path> {
        self.reference.as_deref()
    }

    /// Entity files named on the command line, in order.
    pub fn files(&self) -> &[(EntityKind, PathBuf)] {
        &self.files
    }

    pub fn to_config_overrides(&self) -> ViewerConfigOverrides {
        ViewerConfigOverrides {
            width: self.width,
            height: self.height,
            vsync: self.vsync,
            camera_mode: self.ortho.then_some(Projection::Ortho),
            control_mode: self
                .trackball
                .map(|trackball| if trackball { ControlMode::Trackball } else { ControlMode::PottersWheel }),
        }
    }

    #[cfg(test)]
    pub fn as_tuple(&self) -> (Option<u32>, Option<u32>, Option<bool>) {
        (self.width, self.height, self.vsync)
    }
}

/// `.pcd`/`.pc` are point clouds, `.pose` pose sequences, `.pl` polylines; anything else is a model.
pub fn kind_for_path(path: &Path) -> EntityKind {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).unwrap_or_default();
    match ext.as_str() {
        "pcd" | "pc" => EntityKind::PointCloud,
        "pose" => EntityKind::Poses,
        "pl" => EntityKind::Polyline,
        _ => EntityKind::Model,
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_width_height_and_vsync() {
        let args = ["calview", "--width", "1600", "--height", "900", "--vsync", "off"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.as_tuple(), (Some(1600), Some(900), Some(false)));
        assert!(overrides.to_config_overrides().camera_mode.is_none());
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["calview", "--width", "800", "--width", "1920", "--vsync", "on", "--vsync", "off"];
        let overrides = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(overrides.as_tuple(), (Some(1920), None, Some(false)));
    }

    #[test]
    fn positional_paths_are_classified_by_extension() {
        let args = ["calview", "scan.PCD", "--ortho", "track.pose", "route.pl", "car.mqo", "--config", "v.json"];
        let overrides = CliOverrides::parse(args).expect("parse");
        let kinds: Vec<_> = overrides.files().iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, vec![EntityKind::PointCloud, EntityKind::Poses, EntityKind::Polyline, EntityKind::Model]);
        assert_eq!(overrides.config_path(), Some(Path::new("v.json")));
        assert_eq!(overrides.to_config_overrides().camera_mode, Some(Projection::Ortho));
    }

    #[test]
    fn control_mode_switches() {
        let overrides = CliOverrides::parse(["calview", "--potters-wheel"]).expect("parse");
        assert_eq!(overrides.to_config_overrides().control_mode, Some(ControlMode::PottersWheel));
        let overrides = CliOverrides::parse(["calview", "--trackball"]).expect("parse");
        assert_eq!(overrides.to_config_overrides().control_mode, Some(ControlMode::Trackball));
    }

    #[test]
    fn reference_and_headless() {
        let args = ["calview", "--headless", "--reference", "camera.obj", "track.pose"];
        let overrides = CliOverrides::parse(args).expect("parse");
        assert!(overrides.headless());
        assert_eq!(overrides.reference(), Some(Path::new("camera.obj")));
        assert_eq!(overrides.files().len(), 1, "the reference is not a positional entity");
        assert!(overrides.to_config_overrides().is_empty());
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["calview", "--width"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = CliOverrides::parse(["calview", "--foo", "bar"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
    }
}
