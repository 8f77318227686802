//! Wavefront `.obj` geometry and its `.mtl` material libraries.

use super::{Face, Material, MeshModel, Object, TextLines};
use crate::packet::FormatError;
use glam::{Vec2, Vec3, Vec4};
use log::{debug, warn};
use std::collections::HashMap;

/// Parses OBJ text. `read_mtl` resolves a `mtllib` name to its contents; a library it
/// cannot supply is skipped with a warning.
pub fn parse<F>(text: &str, mut read_mtl: F) -> Result<MeshModel, FormatError>
where
    F: FnMut(&str) -> Option<Vec<u8>>,
{
    let mut lines = TextLines::new(text);
    let mut model = MeshModel::default();
    let mut uvs: Vec<Vec2> = Vec::new();
    let mut material_ids: HashMap<String, usize> = HashMap::new();
    let mut current_material = None;
    let mut object = Object::new("");

    while let Some(line) = lines.next_line() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("v") => {
                let v = floats(tokens);
                if v.len() >= 3 {
                    model.vertices.push(Vec3::new(v[0], v[1], v[2]));
                }
            }
            Some("vt") => {
                let t = floats(tokens);
                if t.len() >= 2 {
                    uvs.push(Vec2::new(t[0], 1.0 - t[1]));
                }
            }
            Some("g" | "o") => {
                if let Some(name) = tokens.next() {
                    finish(&mut model, std::mem::replace(&mut object, Object::new(name)));
                }
            }
            Some("f") => {
                if let Some(face) = parse_face(tokens, &model.vertices, &uvs, current_material) {
                    object.faces.push(face);
                }
            }
            Some("usemtl") => {
                current_material = tokens.next().and_then(|name| material_ids.get(name).copied());
            }
            Some("mtllib") => {
                let Some(name) = tokens.next() else {
                    return Err(lines.error("mtllib without a file name"));
                };
                match read_mtl(name) {
                    Some(data) => {
                        for material in parse_mtl(&String::from_utf8_lossy(&data)) {
                            material_ids.insert(material.name.clone(), model.materials.len());
                            model.materials.push(material);
                        }
                    }
                    None => warn!("obj line {}: material library {name} not found", lines.line()),
                }
            }
            _ => {}
        }
    }
    finish(&mut model, object);
    debug!(
        "obj: {} vertices, {} objects, {} materials",
        model.vertices.len(),
        model.objects.len(),
        model.materials.len()
    );
    Ok(model)
}

fn floats<'a>(tokens: impl Iterator<Item = &'a str>) -> Vec<f32> {
    tokens.map_while(|t| t.parse().ok()).collect()
}

/// Keeps named groups and any unnamed geometry that precedes the first group.
fn finish(model: &mut MeshModel, mut object: Object) {
    if object.name.is_empty() {
        if object.faces.is_empty() {
            return;
        }
        object.name = "default".into();
    }
    model.objects.push(object);
}

/// Resolves a 1-based (or negative, relative) OBJ index against `len` entries.
fn resolve(index: i64, len: usize) -> Option<usize> {
    match index {
        i if i > 0 => Some(i as usize - 1),
        i if i < 0 => len.checked_sub(i.unsigned_abs() as usize),
        _ => None,
    }
}

/// `v`, `v/vt`, `v//vn` or `v/vt/vn`.
fn parse_corner(token: &str, vertices: usize, uvs: usize) -> Option<(usize, Option<usize>)> {
    let mut parts = token.split('/');
    let v = resolve(parts.next()?.parse().ok()?, vertices)?;
    let vt = parts.next().filter(|t| !t.is_empty()).and_then(|t| t.parse().ok()).and_then(|t| resolve(t, uvs));
    Some((v, vt))
}

fn parse_face<'a>(
    tokens: impl Iterator<Item = &'a str>,
    vertices: &[Vec3],
    uvs: &[Vec2],
    material: Option<usize>,
) -> Option<Face> {
    let mut face = Face { material, ..Face::default() };
    for token in tokens.take(4) {
        let (v, vt) = parse_corner(token, vertices.len(), uvs.len())?;
        let i = face.len as usize;
        face.vertices[i] = v;
        face.uv[i] = vt.and_then(|t| uvs.get(t)).copied().unwrap_or(Vec2::ZERO);
        face.len += 1;
    }
    (face.len >= 3).then_some(face)
}

/// Parses an `.mtl` library. Shininess `Ns` (0..1000) is rescaled to 0..128 and
/// `d` sets every alpha channel.
pub fn parse_mtl(text: &str) -> Vec<Material> {
    let mut materials = Vec::new();
    let mut current: Option<Material> = None;
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let key = tokens.next();
        if key == Some("newmtl") {
            materials.extend(current.take());
            current = Some(Material { name: tokens.next().unwrap_or_default().to_string(), ..Material::default() });
            continue;
        }
        let Some(m) = current.as_mut() else {
            continue;
        };
        let values = floats(tokens.clone());
        let rgb = |alpha: f32| (values.len() >= 3).then(|| Vec4::new(values[0], values[1], values[2], alpha));
        match key {
            Some("Ns") if !values.is_empty() => m.power = values[0] / 1000.0 * 128.0,
            Some("d") if !values.is_empty() => {
                for c in [&mut m.amb, &mut m.dif, &mut m.emi, &mut m.spc, &mut m.col] {
                    c.w = values[0];
                }
            }
            Some("Ka") => m.amb = rgb(m.amb.w).unwrap_or(m.amb),
            Some("Kd") => m.dif = rgb(m.dif.w).unwrap_or(m.dif),
            Some("Ks") => m.spc = rgb(m.spc.w).unwrap_or(m.spc),
            Some("map_Kd") => m.texture = tokens.next().map(str::to_string),
            _ => {}
        }
    }
    materials.extend(current);
    materials
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTL: &str = "\
newmtl red
Ka 0.1 0.0 0.0
Kd 0.9 0.0 0.0
Ks 0.2 0.2 0.2
Ns 500
d 0.5

newmtl textured
Kd 1 1 1
map_Kd brick.png
";

    const QUAD: &str = "\
# two faces sharing an edge
mtllib scene.mtl
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
g plate
usemtl textured
f 1/1 2/2 3/3 4/3
usemtl red
f 1//1 3//1 4//1
usemtl missing
f -4 -3 -2
";

    #[test]
    fn mtl_fields_map_onto_material() {
        let materials = parse_mtl(MTL);
        assert_eq!(materials.len(), 2);
        let red = &materials[0];
        assert_eq!(red.name, "red");
        assert_eq!(red.amb, Vec4::new(0.1, 0.0, 0.0, 0.5));
        assert_eq!(red.dif, Vec4::new(0.9, 0.0, 0.0, 0.5));
        assert_eq!(red.col, Vec4::new(1.0, 1.0, 1.0, 0.5));
        assert_eq!(red.power, 64.0);
        assert_eq!(materials[1].texture.as_deref(), Some("brick.png"));
    }

    #[test]
    fn faces_resolve_indices_uvs_and_materials() {
        let mut requested = Vec::new();
        let model = parse(QUAD, |name| {
            requested.push(name.to_string());
            Some(MTL.as_bytes().to_vec())
        })
        .expect("parse");
        assert_eq!(requested, vec!["scene.mtl"]);
        assert_eq!(model.vertices.len(), 4);
        assert_eq!(model.objects.len(), 1);

        let plate = &model.objects[0];
        assert!(plate.vertices.is_empty(), "obj faces index the shared list");
        assert_eq!(plate.faces.len(), 3);

        let quad = plate.faces[0];
        assert_eq!(quad.corners(), &[0, 1, 2, 3]);
        assert_eq!(quad.material, Some(1));
        assert_eq!(quad.uv[2], Vec2::new(1.0, 0.0), "vt v is flipped");

        assert_eq!(plate.faces[1].material, Some(0));
        assert_eq!(plate.faces[2].corners(), &[0, 1, 2]);
        assert_eq!(plate.faces[2].material, None);
    }

    #[test]
    fn missing_library_is_not_fatal() {
        let model = parse(QUAD, |_| None).expect("parse");
        assert!(model.materials.is_empty());
        assert!(model.objects[0].faces.iter().all(|f| f.material.is_none()));
    }

    #[test]
    fn ungrouped_faces_land_in_default_object() {
        let model = parse("v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\nf 1 2\n", |_| None).expect("parse");
        assert_eq!(model.objects.len(), 1);
        assert_eq!(model.objects[0].name, "default");
        assert_eq!(model.objects[0].faces.len(), 1, "two-corner faces are dropped");
    }
}
