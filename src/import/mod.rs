//! Mesh import: the format-neutral [`MeshModel`] plus one parser per file format.
//!
//! Importers only build CPU-side data. Compilation into GPU vertex streams lives with the
//! model entity.

pub mod gltf;
pub mod mqo;
pub mod obj;

use crate::packet::FormatError;
use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use image::RgbaImage;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    /// Flat color used when shading is off.
    pub col: Vec4,
    pub dif: Vec4,
    pub amb: Vec4,
    pub emi: Vec4,
    pub spc: Vec4,
    pub power: f32,
    /// Texture file as written in the source, resolved at load time.
    pub texture: Option<String>,
    /// Pixels carried inside the model file itself.
    pub embedded: Option<Arc<RgbaImage>>,
}

impl Default for Material {
    fn default() -> Self {
        let black = Vec4::new(0.0, 0.0, 0.0, 1.0);
        Self {
            name: String::new(),
            col: Vec4::ONE,
            dif: black,
            amb: black,
            emi: black,
            spc: black,
            power: 0.0,
            texture: None,
            embedded: None,
        }
    }
}

impl Material {
    pub fn has_texture(&self) -> bool {
        self.texture.is_some() || self.embedded.is_some()
    }
}

/// Triangle or quad, counter-clockwise seen from the front.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Face {
    pub len: u8,
    pub vertices: [usize; 4],
    pub uv: [Vec2; 4],
    pub material: Option<usize>,
}

impl Face {
    pub fn triangle(vertices: [usize; 3], material: Option<usize>) -> Self {
        let [a, b, c] = vertices;
        Self { len: 3, vertices: [a, b, c, 0], uv: [Vec2::ZERO; 4], material }
    }

    pub fn quad(vertices: [usize; 4], material: Option<usize>) -> Self {
        Self { len: 4, vertices, uv: [Vec2::ZERO; 4], material }
    }

    pub fn corners(&self) -> &[usize] {
        &self.vertices[..self.len as usize]
    }

    /// Flips the winding while keeping each corner's UV attached to its vertex.
    pub fn reverse(&mut self) {
        let n = self.len as usize;
        self.vertices[..n].reverse();
        self.uv[..n].reverse();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub name: String,
    pub visible: bool,
    pub smooth: bool,
    /// Smoothing angle in degrees.
    pub facet: f32,
    /// Own vertex list; empty when faces index the model's shared list.
    pub vertices: Vec<Vec3>,
    pub faces: Vec<Face>,
}

impl Object {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), visible: true, smooth: true, facet: 50.0, vertices: Vec::new(), faces: Vec::new() }
    }

    /// Mean vertex position. Objects on a shared list average the vertices their faces use.
    pub fn cg(&self, shared: &[Vec3]) -> Option<Vec3> {
        if !self.vertices.is_empty() {
            let sum: Vec3 = self.vertices.iter().sum();
            return Some(sum / self.vertices.len() as f32);
        }
        let used: BTreeSet<usize> =
            self.faces.iter().flat_map(|f| f.corners().iter().copied()).filter(|&i| i < shared.len()).collect();
        if used.is_empty() {
            return None;
        }
        let sum: Vec3 = used.iter().map(|&i| shared[i]).sum();
        Some(sum / used.len() as f32)
    }

    /// Group id from a `#OBJ<N>_` name prefix, 0 otherwise.
    pub fn group_id(&self) -> u32 {
        group_id(&self.name)
    }
}

pub fn group_id(name: &str) -> u32 {
    let Some(rest) = name.strip_prefix("#OBJ") else {
        return 0;
    };
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || !rest[digits..].starts_with('_') {
        return 0;
    }
    rest[..digits].parse().unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct MeshModel {
    pub objects: Vec<Object>,
    pub materials: Vec<Material>,
    /// Vertex list shared by objects without their own (OBJ files).
    pub vertices: Vec<Vec3>,
    /// Rotation axis per object group.
    pub joints: BTreeMap<u32, Vec3>,
    pub path: Option<PathBuf>,
}

impl MeshModel {
    pub fn object_vertices<'a>(&'a self, object: &'a Object) -> &'a [Vec3] {
        if object.vertices.is_empty() {
            &self.vertices
        } else {
            &object.vertices
        }
    }

    /// Mean of the per-object centers of the visible objects in `group`.
    pub fn group_cg(&self, group: u32) -> Vec3 {
        let cgs: Vec<Vec3> = self
            .objects
            .iter()
            .filter(|o| o.visible && o.group_id() == group)
            .filter_map(|o| o.cg(&self.vertices))
            .collect();
        if cgs.is_empty() {
            return Vec3::ZERO;
        }
        cgs.iter().sum::<Vec3>() / cgs.len() as f32
    }

    pub fn all_vertices(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.vertices.iter().chain(self.objects.iter().flat_map(|o| o.vertices.iter())).copied()
    }

    pub fn directory(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// Unit arrow along +X: a square shaft with a pyramid head.
    pub fn arrow() -> Self {
        const SHAFT: f32 = 0.8;
        let (w, h) = (0.04, 0.1);
        let vertices = vec![
            Vec3::new(0.0, -w, -w),
            Vec3::new(0.0, w, -w),
            Vec3::new(0.0, w, w),
            Vec3::new(0.0, -w, w),
            Vec3::new(SHAFT, -w, -w),
            Vec3::new(SHAFT, w, -w),
            Vec3::new(SHAFT, w, w),
            Vec3::new(SHAFT, -w, w),
            Vec3::new(SHAFT, -h, -h),
            Vec3::new(SHAFT, h, -h),
            Vec3::new(SHAFT, h, h),
            Vec3::new(SHAFT, -h, h),
            Vec3::new(1.0, 0.0, 0.0),
        ];
        let m = Some(0);
        let faces = vec![
            Face::quad([0, 3, 2, 1], m),
            Face::quad([4, 5, 6, 7], m),
            Face::quad([0, 4, 7, 3], m),
            Face::quad([1, 2, 6, 5], m),
            Face::quad([0, 1, 5, 4], m),
            Face::quad([3, 7, 6, 2], m),
            Face::quad([8, 11, 10, 9], m),
            Face::triangle([8, 9, 12], m),
            Face::triangle([9, 10, 12], m),
            Face::triangle([10, 11, 12], m),
            Face::triangle([11, 8, 12], m),
        ];
        let col = Vec4::new(1.0, 0.6, 0.0, 1.0);
        let material = Material {
            name: "arrow".into(),
            col,
            dif: (col.truncate() * 0.8).extend(1.0),
            amb: (col.truncate() * 0.3).extend(1.0),
            ..Material::default()
        };
        let object = Object { smooth: false, vertices, faces, ..Object::new("arrow") };
        Self { objects: vec![object], materials: vec![material], ..Self::default() }
    }
}

/// Free-form `name = value` settings handed to importers.
///
/// Recognized keys: `discard_hidden` (integer, non-zero drops hidden objects),
/// `vertex_mat` (9 or 16 row-major numbers applied to MQO vertices) and `axis<N>`
/// (`"x y z"` rotation axis of object group N).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportParams {
    entries: BTreeMap<String, String>,
}

impl ImportParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn discard_hidden(&self) -> bool {
        self.get("discard_hidden").and_then(|v| v.trim().parse::<i64>().ok()).is_some_and(|v| v != 0)
    }

    pub fn vertex_matrix(&self) -> Mat4 {
        let Some(value) = self.get("vertex_mat") else {
            return Mat4::IDENTITY;
        };
        let numbers: Vec<f32> = value.split_whitespace().map_while(|t| t.parse().ok()).collect();
        match numbers.len() {
            9 => {
                let mut rows = [0.0; 9];
                rows.copy_from_slice(&numbers);
                Mat4::from_mat3(Mat3::from_cols_array(&rows).transpose())
            }
            16 => {
                let mut rows = [0.0; 16];
                rows.copy_from_slice(&numbers);
                Mat4::from_cols_array(&rows).transpose()
            }
            _ => Mat4::IDENTITY,
        }
    }

    pub fn joints(&self) -> BTreeMap<u32, Vec3> {
        self.entries
            .iter()
            .filter_map(|(key, value)| {
                let group: u32 = key.strip_prefix("axis")?.parse().ok()?;
                let axis: Vec<f32> = value.split_whitespace().map_while(|t| t.parse().ok()).collect();
                (axis.len() == 3).then(|| (group, Vec3::new(axis[0], axis[1], axis[2])))
            })
            .collect()
    }
}

impl Extend<(String, String)> for ImportParams {
    fn extend<T: IntoIterator<Item = (String, String)>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

#[derive(Debug, Clone)]
pub enum Imported {
    Model(MeshModel),
    /// No extension: the caller substitutes a procedural model.
    Stock,
}

fn extension_of(name: &str) -> String {
    Path::new(name).extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).unwrap_or_default()
}

/// Imports a model file, dispatching on its lowercase extension.
pub fn import_model(path: &Path, params: &ImportParams) -> Result<Imported, FormatError> {
    let ext = extension_of(&path.to_string_lossy());
    let mut model = match ext.as_str() {
        "" => return Ok(Imported::Stock),
        "mqo" => mqo::parse(&String::from_utf8_lossy(&fs::read(path)?), params)?,
        "obj" => {
            let text = fs::read(path)?;
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            obj::parse(&String::from_utf8_lossy(&text), |mtl| fs::read(dir.join(mtl)).ok())?
        }
        "gltf" | "glb" => gltf::import(path)?,
        other => return Err(FormatError::UnsupportedExtension(other.to_string())),
    };
    model.path = Some(path.to_path_buf());
    Ok(Imported::Model(model))
}

/// Imports a model held in memory. `name` supplies the extension; OBJ material
/// libraries cannot be resolved and are skipped.
pub fn import_model_bytes(name: &str, data: &[u8], params: &ImportParams) -> Result<Imported, FormatError> {
    let model = match extension_of(name).as_str() {
        "" => return Ok(Imported::Stock),
        "mqo" => mqo::parse(&String::from_utf8_lossy(data), params)?,
        "obj" => obj::parse(&String::from_utf8_lossy(data), |_| None)?,
        "gltf" | "glb" => gltf::import_slice(data)?,
        other => return Err(FormatError::UnsupportedExtension(other.to_string())),
    };
    Ok(Imported::Model(model))
}

/// Line cursor shared by the text importers; tracks 1-based line numbers for errors.
pub(crate) struct TextLines<'a> {
    lines: std::str::Lines<'a>,
    line: usize,
}

impl<'a> TextLines<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self { lines: text.lines(), line: 0 }
    }

    /// Next line, trimmed.
    pub(crate) fn next_line(&mut self) -> Option<&'a str> {
        let line = self.lines.next()?;
        self.line += 1;
        Some(line.trim())
    }

    pub(crate) fn expect(&mut self, what: &str) -> Result<&'a str, FormatError> {
        match self.next_line() {
            Some(line) => Ok(line),
            None => Err(self.error(format!("unexpected end of file in {what}"))),
        }
    }

    pub(crate) fn line(&self) -> usize {
        self.line
    }

    pub(crate) fn error(&self, reason: impl Into<String>) -> FormatError {
        FormatError::Parse { line: self.line, reason: reason.into() }
    }
}
