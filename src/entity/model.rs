//! Polygon models compiled into one interleaved vertex stream with per-material ranges.

use super::{Entity, EntityCore, EntityKind, EntitySource, PrepareContext};
use crate::draw_context::DrawContext;
use crate::gpu::{
    BufferId, BufferUsage, DrawCall, DrawList, GpuError, MaterialUniforms, MeshDraw, ModelVertex, ProgramId,
    ProgramKind, TextureId,
};
use crate::import::{self, Face, ImportParams, Imported, MeshModel, Object};
use crate::packet::FormatError;
use glam::{Mat4, Vec2, Vec3};
use image::RgbaImage;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Degrees added to the joint spin on every draw call.
pub const SPIN_STEP: f32 = 10.0;
/// Eye-space light position used by the shading path.
const LIGHT_POS: Vec3 = Vec3::new(0.0, 0.0, 100.0);
/// Corner triples a face is split into; the second applies to quads only.
const TRIANGLES: [[usize; 3]; 2] = [[0, 1, 2], [0, 2, 3]];

/// One draw range: the faces of one object that share a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelElement {
    pub smooth: bool,
    pub material: usize,
    pub first: u32,
    pub count: u32,
    pub group: u32,
    /// First element of its group; the group matrix is computed here and reused after.
    pub group_top: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelGroup {
    pub cg: Vec3,
    pub axis: Vec3,
}

impl ModelGroup {
    /// `T(cg) · R(spin, axis) · T(-cg)`, identity for a zero axis.
    pub fn matrix(&self, spin_degrees: f32) -> Mat4 {
        if self.axis == Vec3::ZERO {
            return Mat4::IDENTITY;
        }
        let rotation = Mat4::from_axis_angle(self.axis.normalize(), (spin_degrees % 360.0).to_radians());
        Mat4::from_translation(self.cg) * rotation * Mat4::from_translation(-self.cg)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledModel {
    pub vertices: Vec<ModelVertex>,
    pub elements: Vec<ModelElement>,
    /// Indexed by group id.
    pub groups: Vec<ModelGroup>,
}

/// Compiles the visible objects group by group, in ascending group id.
pub fn compile(model: &MeshModel) -> CompiledModel {
    let mut out = CompiledModel::default();
    let last_group = model.objects.iter().filter(|o| o.visible).map(Object::group_id).max().unwrap_or(0);
    for group in 0..=last_group {
        let members = model.objects.iter().filter(|o| o.visible && o.group_id() == group);
        for object in members {
            compile_object(model, object, group, &mut out);
        }
        let axis = model.joints.get(&group).copied().unwrap_or(Vec3::ZERO);
        out.groups.push(ModelGroup { cg: model.group_cg(group), axis });
    }
    out
}

fn face_normal(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    (a - c).cross(b - c).normalize_or_zero()
}

fn triangles(face: &Face) -> &'static [[usize; 3]] {
    if face.len == 4 {
        &TRIANGLES
    } else {
        &TRIANGLES[..1]
    }
}

/// Face normals accumulated onto their vertices and normalized.
fn vertex_normals(vertices: &[Vec3], faces: &[&Face]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; vertices.len()];
    for face in faces {
        for tri in triangles(face) {
            let [a, b, c] = tri.map(|k| face.vertices[k]);
            let n = face_normal(vertices[a], vertices[b], vertices[c]);
            for v in [a, b, c] {
                normals[v] += n;
            }
        }
    }
    normals.iter_mut().for_each(|n| *n = n.normalize_or_zero());
    normals
}

/// Keeps the face normal across creases sharper than the smoothing angle.
fn choose_normal(face: Vec3, vertex: Vec3, cos_smooth: f32) -> Vec3 {
    if face.dot(vertex).abs() < cos_smooth {
        face
    } else {
        vertex
    }
}

fn compile_object(model: &MeshModel, object: &Object, group: u32, out: &mut CompiledModel) {
    let vertices = model.object_vertices(object);
    let faces: Vec<&Face> =
        object.faces.iter().filter(|f| f.corners().iter().all(|&i| i < vertices.len())).collect();
    let normals = vertex_normals(vertices, &faces);
    let cos_smooth = object.facet.to_radians().cos();

    let mut streams: Vec<Vec<ModelVertex>> = vec![Vec::new(); model.materials.len()];
    for face in &faces {
        let Some(material) = face.material.filter(|&m| m < model.materials.len()) else {
            continue;
        };
        let textured = model.materials[material].has_texture();
        for tri in triangles(face) {
            let [a, b, c] = tri.map(|k| vertices[face.vertices[k]]);
            let n = face_normal(a, b, c);
            streams[material].extend(tri.iter().map(|&k| {
                let v = face.vertices[k];
                let uv = if textured { face.uv[k] } else { Vec2::ZERO };
                ModelVertex::new(uv, choose_normal(n, normals[v], cos_smooth), vertices[v])
            }));
        }
    }

    for (material, stream) in streams.into_iter().enumerate() {
        if stream.is_empty() {
            continue;
        }
        let group_top = out.elements.last().map_or(true, |e| e.group != group);
        out.elements.push(ModelElement {
            smooth: object.smooth,
            material,
            first: out.vertices.len() as u32,
            count: stream.len() as u32,
            group,
            group_top,
        });
        out.vertices.extend(stream);
    }
}

fn texture_candidates(name: &str, dir: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(name)];
    if let Some(dir) = dir {
        candidates.push(dir.join(name));
        let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
        candidates.push(dir.join(base));
    }
    candidates.dedup();
    candidates
}

/// Decodes a material's texture, flipped so row 0 is the bottom of the image.
fn load_texture(material: &import::Material, dir: Option<&Path>) -> Option<RgbaImage> {
    if let Some(image) = &material.embedded {
        return Some(image::imageops::flip_vertical(image.as_ref()));
    }
    let name = material.texture.as_deref()?;
    for candidate in texture_candidates(name, dir) {
        match image::open(&candidate) {
            Ok(image) => {
                debug!("texture {} loaded", candidate.display());
                return Some(image::imageops::flip_vertical(&image.to_rgba8()));
            }
            Err(err) => debug!("texture {}: {err}", candidate.display()),
        }
    }
    warn!("material {}: texture {name} not found", material.name);
    None
}

pub struct ModelEntity {
    core: EntityCore,
    params: ImportParams,
    model: Option<MeshModel>,
    compiled: CompiledModel,
    images: Vec<Option<RgbaImage>>,
    textures: Vec<Option<TextureId>>,
    buffer: Option<BufferId>,
    program: Option<ProgramId>,
    spin: f32,
}

impl ModelEntity {
    pub fn new(core: EntityCore) -> Self {
        Self {
            core,
            params: ImportParams::default(),
            model: None,
            compiled: CompiledModel::default(),
            images: Vec::new(),
            textures: Vec::new(),
            buffer: None,
            program: None,
            spin: 0.0,
        }
    }

    /// An entity whose geometry is already in memory; `load` only compiles it.
    pub fn from_model(core: EntityCore, model: MeshModel) -> Self {
        Self { model: Some(model), ..Self::new(core) }
    }

    pub fn with_params(mut self, params: ImportParams) -> Self {
        self.params = params;
        self
    }

    pub fn model(&self) -> Option<&MeshModel> {
        self.model.as_ref()
    }

    pub fn compiled(&self) -> &CompiledModel {
        &self.compiled
    }

    pub fn spin(&self) -> f32 {
        self.spin
    }

    fn import(&mut self) -> Result<MeshModel, FormatError> {
        let imported = match &self.core.source {
            EntitySource::None => {
                return self.model.take().ok_or(FormatError::Truncated { what: "model source" });
            }
            EntitySource::File(path) => import::import_model(path, &self.params)?,
            EntitySource::Bytes { name, data } => import::import_model_bytes(name, data, &self.params)?,
        };
        Ok(match imported {
            Imported::Model(model) => model,
            Imported::Stock => MeshModel::arrow(),
        })
    }
}

impl Entity for ModelEntity {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Model
    }

    fn load(&mut self) -> Result<(), FormatError> {
        self.core.valid = false;
        let model = self.import()?;
        self.compiled = compile(&model);
        self.images = model.materials.iter().map(|m| load_texture(m, model.directory())).collect();
        self.core.bound_points(model.all_vertices());
        debug!(
            "{}: {} vertices in {} elements, {} groups",
            self.core.caption,
            self.compiled.vertices.len(),
            self.compiled.elements.len(),
            self.compiled.groups.len()
        );
        self.model = Some(model);
        self.core.valid = true;
        Ok(())
    }

    fn prepare_gpu(&mut self, ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError> {
        let capacity = (ctx.gpu.max_buffer_size() / std::mem::size_of::<ModelVertex>() as u64) as usize;
        if self.compiled.vertices.len() > capacity {
            warn!("{}: {} vertices truncated to {capacity}", self.core.caption, self.compiled.vertices.len());
            self.compiled.elements.retain(|e| (e.first + e.count) as usize <= capacity);
            self.compiled.vertices.truncate(capacity);
        }
        self.program = Some(ctx.programs.acquire(&mut *ctx.gpu, ProgramKind::Mesh)?);
        if !self.compiled.vertices.is_empty() {
            let data: &[u8] = bytemuck::cast_slice(self.compiled.vertices.as_slice());
            self.buffer = Some(ctx.gpu.create_buffer(&self.core.caption, BufferUsage::Vertex, data)?);
        }
        let caption = &self.core.caption;
        self.textures = self
            .images
            .drain(..)
            .enumerate()
            .map(|(i, image)| {
                let image = image?;
                ctx.gpu
                    .create_texture(&format!("{caption} material {i}"), &image)
                    .map_err(|err| warn!("{caption}: texture upload failed: {err}"))
                    .ok()
            })
            .collect();
        self.compiled.vertices = Vec::new();
        Ok(false)
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList) {
        if !self.core.is_visible() {
            return;
        }
        let Some(offset) = self.core.origin_offset() else {
            return;
        };
        let (Some(program), Some(buffer), Some(model)) = (self.program, self.buffer, &self.model) else {
            return;
        };
        if ctx.is_pick() && !self.core.is_pickable() {
            return;
        }
        self.spin = (self.spin + SPIN_STEP) % 360.0;

        let base = ctx.camera * ctx.world * offset * self.core.local;
        let scale = Mat4::from_scale(Vec3::splat(ctx.model_scale));
        let mut group = Mat4::IDENTITY;
        for element in &self.compiled.elements {
            if element.group_top {
                let spun = self.compiled.groups.get(element.group as usize).map(|g| g.matrix(self.spin));
                group = spun.unwrap_or(Mat4::IDENTITY);
            }
            let m = &model.materials[element.material];
            out.push(DrawCall::Mesh(MeshDraw {
                program,
                buffer,
                first: element.first,
                count: element.count,
                proj: ctx.proj,
                modelview: base * group * scale,
                light_pos: LIGHT_POS,
                material: MaterialUniforms { col: m.col, amb: m.amb, dif: m.dif, emi: m.emi, spc: m.spc },
                shading: element.smooth,
                texture: self.textures.get(element.material).copied().flatten(),
                encode_depth: ctx.is_pick(),
            }));
        }
    }

    fn cleanup(&mut self, ctx: &mut PrepareContext<'_>) {
        if let Some(buffer) = self.buffer.take() {
            ctx.gpu.destroy_buffer(buffer);
        }
        for texture in self.textures.drain(..).flatten() {
            ctx.gpu.destroy_texture(texture);
        }
        if self.program.take().is_some() {
            ctx.programs.release(&mut *ctx.gpu, ProgramKind::Mesh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw_context::DrawMode;
    use crate::events::EventBus;
    use crate::gpu::recording::RecordingBackend;
    use crate::gpu::ProgramCache;
    use crate::import::Material;
    use std::fs;

    fn square(name: &str, material: Option<usize>) -> Object {
        let mut object = Object::new(name);
        object.vertices = vec![Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0), Vec3::Y];
        object.faces.push(Face::quad([0, 1, 2, 3], material));
        object
    }

    #[test]
    fn zero_axis_leaves_group_untransformed() {
        let group = ModelGroup { cg: Vec3::new(3.0, -2.0, 7.0), axis: Vec3::ZERO };
        for spin in [0.0, 10.0, 90.0, 350.0, 720.0] {
            assert_eq!(group.matrix(spin), Mat4::IDENTITY);
        }
    }

    #[test]
    fn group_spins_about_its_cg() {
        let group = ModelGroup { cg: Vec3::new(1.0, 0.0, 0.0), axis: Vec3::new(0.0, 0.0, 2.0) };
        let m = group.matrix(450.0);
        assert!(m.transform_point3(group.cg).abs_diff_eq(group.cg, 1e-6));
        assert!(m.transform_point3(Vec3::new(2.0, 0.0, 0.0)).abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-5));
    }

    #[test]
    fn objects_compile_in_group_order() {
        let mut model = MeshModel { materials: vec![Material::default(), Material::default()], ..Default::default() };
        model.objects.push(square("#OBJ1_b", Some(0)));
        model.objects.push(square("a", Some(1)));
        model.objects.push(square("#OBJ1_c", Some(0)));
        let mut hidden = square("#OBJ2_hidden", Some(0));
        hidden.visible = false;
        model.objects.push(hidden);
        model.joints.insert(1, Vec3::Z);

        let compiled = compile(&model);
        let order: Vec<(u32, bool, u32)> = compiled.elements.iter().map(|e| (e.group, e.group_top, e.first)).collect();
        assert_eq!(order, vec![(0, true, 0), (1, true, 6), (1, false, 12)]);
        assert_eq!(compiled.vertices.len(), 18, "each quad splits into two triangles");
        assert_eq!(compiled.groups.len(), 2);
        assert_eq!(compiled.groups[0].axis, Vec3::ZERO);
        assert_eq!(compiled.groups[1].axis, Vec3::Z);
        assert_eq!(compiled.groups[1].cg, Vec3::new(0.5, 0.5, 0.0));
    }

    #[test]
    fn group_top_marks_only_the_first_element_of_a_group() {
        let mut model = MeshModel { materials: vec![Material::default(), Material::default()], ..Default::default() };
        model.objects.push(square("#OBJ1_empty", Some(7)));
        let mut two_materials = square("#OBJ1_pair", Some(0));
        two_materials.faces.push(Face::triangle([0, 1, 2], Some(1)));
        model.objects.push(two_materials);
        model.objects.push(square("#OBJ1_tail", Some(1)));

        let compiled = compile(&model);
        let tops: Vec<(u32, bool)> = compiled.elements.iter().map(|e| (e.group, e.group_top)).collect();
        assert_eq!(tops, vec![(1, true), (1, false), (1, false)]);
    }

    #[test]
    fn elements_of_a_spinning_group_share_one_matrix() {
        let mut model = MeshModel { materials: vec![Material::default(), Material::default()], ..Default::default() };
        model.objects.push(square("still", Some(0)));
        model.objects.push(square("#OBJ1_a", Some(0)));
        model.objects.push(square("#OBJ1_b", Some(1)));
        model.joints.insert(1, Vec3::Z);
        let mut entity = ModelEntity::from_model(EntityCore::new("m"), model);
        entity.load().expect("load");

        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        prepare(&mut entity, &mut gpu, &programs);
        let mut out = DrawList::new();
        entity.draw(&DrawContext::default(), &mut out);
        let modelviews: Vec<Mat4> = out
            .iter()
            .map(|call| match call {
                DrawCall::Mesh(mesh) => mesh.modelview,
                _ => panic!("mesh call expected"),
            })
            .collect();
        assert_eq!(modelviews.len(), 3);
        assert_eq!(modelviews[1], modelviews[2]);
        assert_ne!(modelviews[0], modelviews[1], "group 1 spins, group 0 does not");
    }

    #[test]
    fn quads_split_and_bad_materials_are_skipped() {
        let mut model = MeshModel { materials: vec![Material::default()], ..Default::default() };
        let mut object = square("s", Some(0));
        object.faces.push(Face::triangle([0, 1, 2], Some(5)));
        object.faces.push(Face::triangle([0, 1, 2], None));
        object.faces.push(Face::triangle([0, 1, 9], Some(0)));
        model.objects.push(object);

        let compiled = compile(&model);
        assert_eq!(compiled.elements.len(), 1);
        let positions: Vec<[f32; 3]> = compiled.vertices.iter().map(|v| v.position).collect();
        assert_eq!(positions, vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0]
        ]);
        assert!(compiled.vertices.iter().all(|v| v.normal == [0.0, 0.0, 1.0]));
    }

    #[test]
    fn facet_angle_selects_face_or_vertex_normal() {
        // Two faces folded 90 degrees along the x axis.
        let fold = |facet: f32| {
            let mut object = Object::new("fold");
            object.facet = facet;
            object.vertices = vec![Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0)];
            object.faces.push(Face::triangle([0, 1, 2], Some(0)));
            object.faces.push(Face::triangle([1, 0, 3], Some(0)));
            let model = MeshModel { objects: vec![object], materials: vec![Material::default()], ..Default::default() };
            Vec3::from_array(compile(&model).vertices[0].normal)
        };
        assert!(fold(30.0).abs_diff_eq(Vec3::Z, 1e-6), "sharp crease keeps the face normal");
        let blended = Vec3::new(0.0, 1.0, 1.0).normalize();
        assert!(fold(60.0).abs_diff_eq(blended, 1e-6), "soft crease uses the vertex normal");
    }

    fn prepare(entity: &mut ModelEntity, gpu: &mut RecordingBackend, programs: &ProgramCache) {
        let events = EventBus::default();
        let mut ctx = PrepareContext { gpu, programs, events: &events, chunk_points: 1024, point_anti_alias: false };
        assert!(!entity.prepare_gpu(&mut ctx).expect("prepare"));
    }

    #[test]
    fn obj_with_texture_uploads_and_draws() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("plate.mtl"), "newmtl wood\nKd 1 1 1\nmap_Kd wood.png\n").expect("mtl");
        RgbaImage::new(4, 2).save(dir.path().join("wood.png")).expect("png");
        let obj = "mtllib plate.mtl\nv 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvt 0 0\nvt 1 1\ng plate\nusemtl wood\nf 1/1 2/2 3/2 4/1\n";
        let path = dir.path().join("plate.obj");
        fs::write(&path, obj).expect("obj");

        let mut entity = ModelEntity::new(EntityCore::new("m").with_source(EntitySource::File(path)));
        entity.load().expect("load");
        assert!(entity.core().valid);
        assert_eq!(entity.core().caption, "plate");
        assert_eq!(entity.compiled().vertices[1].uv, [1.0, 0.0]);

        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        prepare(&mut entity, &mut gpu, &programs);
        assert_eq!(gpu.live_textures(), 1);
        assert_eq!(programs.refs(ProgramKind::Mesh), 1);

        let mut out = DrawList::new();
        entity.draw(&DrawContext::default().with_mode(DrawMode::Pick), &mut out);
        let DrawCall::Mesh(mesh) = out[0] else { panic!("mesh call expected") };
        assert!(mesh.encode_depth);
        assert!(mesh.texture.is_some());
        assert_eq!(mesh.count, 6);
        assert_eq!(entity.spin(), SPIN_STEP);

        let events = EventBus::default();
        let mut ctx = PrepareContext {
            gpu: &mut gpu,
            programs: &programs,
            events: &events,
            chunk_points: 1024,
            point_anti_alias: false,
        };
        entity.cleanup(&mut ctx);
        drop(ctx);
        assert_eq!((gpu.live_buffers(), gpu.live_textures(), gpu.live_programs()), (0, 0, 0));
    }

    #[test]
    fn missing_texture_keeps_model_valid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mqo = "Material 1 {\n\"m\" col(1 1 1 1) tex(\"nowhere.png\")\n}\nObject \"a\" {\nvertex 3 {\n0 0 0\n1 0 0\n0 1 0\n}\nface 1 {\n3 V(0 1 2) M(0)\n}\n}\n";
        let path = dir.path().join("a.mqo");
        fs::write(&path, mqo).expect("mqo");
        let mut entity = ModelEntity::new(EntityCore::new("m").with_source(EntitySource::File(path)));
        entity.load().expect("load");
        assert!(entity.core().valid);

        let mut gpu = RecordingBackend::new(16, 16);
        let programs = ProgramCache::new();
        prepare(&mut entity, &mut gpu, &programs);
        assert_eq!(gpu.live_textures(), 0);
        let mut out = DrawList::new();
        entity.draw(&DrawContext::default(), &mut out);
        let DrawCall::Mesh(mesh) = out[0] else { panic!("mesh call expected") };
        assert!(mesh.texture.is_none());
        assert!(!mesh.encode_depth);
    }

    #[test]
    fn extensionless_source_loads_stock_arrow() {
        let source = EntitySource::Bytes { name: "arrow".into(), data: Vec::<u8>::new().into() };
        let mut entity = ModelEntity::new(EntityCore::new("m").with_source(source));
        entity.load().expect("load");
        assert!(entity.core().valid);
        assert_eq!(entity.compiled().vertices.len(), 18 * 3);
    }

    #[test]
    fn in_memory_model_needs_no_source() {
        let mut entity = ModelEntity::from_model(EntityCore::new("ref"), MeshModel::arrow());
        entity.load().expect("load");
        assert!(entity.core().valid);
        assert!(entity.model().is_some());
        assert_eq!(entity.core().bounding[1].x, 1.0);
    }
}
