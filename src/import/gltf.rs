//! glTF 2.0 (`.gltf` / `.glb`) scenes flattened into a [`MeshModel`].
//!
//! Node transforms are baked into vertex positions. Each triangle primitive becomes one
//! object named after its node, so `#OBJ<N>_` node names group parts the same way MQO
//! object names do.

use super::{Face, Material, MeshModel, Object};
use crate::packet::FormatError;
use ::gltf::mesh::Mode;
use glam::{Mat4, Vec2, Vec3, Vec4};
use image::RgbaImage;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;

pub fn import(path: &Path) -> Result<MeshModel, FormatError> {
    let (document, buffers, images) = ::gltf::import(path)?;
    build(&document, &buffers, &images)
}

pub fn import_slice(data: &[u8]) -> Result<MeshModel, FormatError> {
    let (document, buffers, images) = ::gltf::import_slice(data)?;
    build(&document, &buffers, &images)
}

struct Builder<'a> {
    buffers: &'a [::gltf::buffer::Data],
    model: MeshModel,
    default_material: Option<usize>,
}

fn build(
    document: &::gltf::Document,
    buffers: &[::gltf::buffer::Data],
    images: &[::gltf::image::Data],
) -> Result<MeshModel, FormatError> {
    let mut builder = Builder { buffers, model: MeshModel::default(), default_material: None };
    builder.model.materials = document.materials().map(|m| convert_material(&m, images)).collect();

    match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => {
            for node in scene.nodes() {
                builder.visit(&node, Mat4::IDENTITY);
            }
        }
        None => {
            for mesh in document.meshes() {
                builder.add_mesh(&mesh, mesh.name().unwrap_or("mesh"), Mat4::IDENTITY);
            }
        }
    }

    if builder.model.objects.is_empty() {
        return Err(FormatError::Parse { line: 0, reason: "no triangle primitives".into() });
    }
    debug!("gltf: {} objects, {} materials", builder.model.objects.len(), builder.model.materials.len());
    Ok(builder.model)
}

impl Builder<'_> {
    fn visit(&mut self, node: &::gltf::Node<'_>, parent: Mat4) {
        let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
        if let Some(mesh) = node.mesh() {
            let name = node.name().or(mesh.name()).unwrap_or("node").to_string();
            self.add_mesh(&mesh, &name, world);
        }
        for child in node.children() {
            self.visit(&child, world);
        }
    }

    fn default_material(&mut self) -> usize {
        *self.default_material.get_or_insert_with(|| {
            let fallback = Material { name: "default".into(), dif: Vec4::splat(0.8), ..Material::default() };
            self.model.materials.push(fallback);
            self.model.materials.len() - 1
        })
    }

    fn add_mesh(&mut self, mesh: &::gltf::Mesh<'_>, name: &str, world: Mat4) {
        let buffers = self.buffers;
        let primitives: Vec<_> = mesh.primitives().filter(|p| p.mode() == Mode::Triangles).collect();
        for (index, primitive) in primitives.iter().enumerate() {
            let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
            let Some(positions) = reader.read_positions() else {
                warn!("gltf: primitive {index} of {name} has no POSITION attribute");
                continue;
            };
            let vertices: Vec<Vec3> = positions.map(|p| world.transform_point3(Vec3::from_array(p))).collect();
            if vertices.is_empty() {
                continue;
            }
            let uvs: Vec<Vec2> = reader
                .read_tex_coords(0)
                .map(|coords| coords.into_f32().map(Vec2::from_array).collect())
                .unwrap_or_default();
            let indices: Vec<usize> = reader
                .read_indices()
                .map(|read| read.into_u32().map(|i| i as usize).collect())
                .unwrap_or_else(|| (0..vertices.len()).collect());

            let material = match primitive.material().index() {
                Some(i) => i,
                None => self.default_material(),
            };
            let faces = indices
                .chunks_exact(3)
                .filter(|tri| tri.iter().all(|&i| i < vertices.len()))
                .map(|tri| {
                    let mut face = Face::triangle([tri[0], tri[1], tri[2]], Some(material));
                    for (corner, &i) in tri.iter().enumerate() {
                        face.uv[corner] = uvs.get(i).copied().unwrap_or(Vec2::ZERO);
                    }
                    face
                })
                .collect();

            let object_name = if primitives.len() > 1 { format!("{name}.{index}") } else { name.to_string() };
            self.model.objects.push(Object { vertices, faces, ..Object::new(object_name) });
        }
    }
}

fn convert_material(material: &::gltf::Material<'_>, images: &[::gltf::image::Data]) -> Material {
    let pbr = material.pbr_metallic_roughness();
    let base = Vec4::from_array(pbr.base_color_factor());
    let emissive = Vec3::from_array(material.emissive_factor());
    let embedded = pbr.base_color_texture().and_then(|info| {
        let source = info.texture().source().index();
        images.get(source).and_then(convert_image).map(Arc::new)
    });
    Material {
        name: material.name().unwrap_or("material").to_string(),
        col: base,
        dif: base,
        amb: (base.truncate() * 0.2).extend(base.w),
        emi: emissive.extend(1.0),
        power: (1.0 - pbr.roughness_factor()) * 128.0,
        embedded,
        ..Material::default()
    }
}

fn convert_image(image: &::gltf::image::Data) -> Option<RgbaImage> {
    use ::gltf::image::Format;
    let pixels: Vec<u8> = match image.format {
        Format::R8 => image.pixels.iter().flat_map(|&r| [r, r, r, 255]).collect(),
        Format::R8G8 => image.pixels.chunks_exact(2).flat_map(|p| [p[0], p[1], 0, 255]).collect(),
        Format::R8G8B8 => image.pixels.chunks_exact(3).flat_map(|p| [p[0], p[1], p[2], 255]).collect(),
        Format::R8G8B8A8 => image.pixels.clone(),
        other => {
            warn!("gltf: unsupported texture format {other:?}");
            return None;
        }
    };
    RgbaImage::from_raw(image.width, image.height, pixels)
}
