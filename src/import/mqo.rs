//! Metasequoia (`.mqo`) text models.
//!
//! Recognized chunks: `Material`, `Object` (with nested `vertex` and `face` blocks) and
//! the `W2R` parameter chunk, whose `"name" "value"` pairs feed [`ImportParams`]. Other
//! chunks are skipped.

use super::{Face, ImportParams, Material, MeshModel, Object, TextLines};
use crate::packet::FormatError;
use glam::{Mat4, Vec2, Vec3, Vec4};
use log::debug;

pub fn parse(text: &str, params: &ImportParams) -> Result<MeshModel, FormatError> {
    let mut lines = TextLines::new(text);
    let mut params = params.clone();
    let mut model = MeshModel::default();

    while let Some(line) = lines.next_line() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("Material") => {
                let n = count(&lines, tokens.next())?;
                for _ in 0..n {
                    let line = lines.expect("Material")?;
                    model.materials.push(parse_material(line).map_err(|reason| lines.error(reason))?);
                }
            }
            Some("Object") => {
                let name = quoted(line).ok_or_else(|| lines.error("object without a name"))?;
                let vertex_mat = params.vertex_matrix();
                let discard_hidden = params.discard_hidden();
                parse_object(&mut lines, name, vertex_mat, discard_hidden, &mut model.objects)?;
            }
            Some("W2R") => {
                let n = count(&lines, tokens.next())?;
                for _ in 0..n {
                    let line = lines.expect("W2R")?;
                    let (name, value) =
                        quoted_pair(line).ok_or_else(|| lines.error("W2R entry needs two quoted strings"))?;
                    params.insert(name, value);
                }
            }
            _ => {}
        }
    }
    model.joints = params.joints();
    debug!("mqo: {} objects, {} materials, {} joints", model.objects.len(), model.materials.len(), model.joints.len());
    Ok(model)
}

fn count(lines: &TextLines<'_>, token: Option<&str>) -> Result<usize, FormatError> {
    token.and_then(|t| t.parse().ok()).ok_or_else(|| lines.error("missing element count"))
}

fn quoted(line: &str) -> Option<&str> {
    let start = line.find('"')? + 1;
    let len = line[start..].find('"')?;
    Some(&line[start..start + len])
}

fn quoted_pair(line: &str) -> Option<(String, String)> {
    let name = quoted(line)?;
    let rest = &line[line.find('"')? + name.len() + 2..];
    Some((name.to_string(), quoted(rest)?.to_string()))
}

/// Numbers inside `key(...)`, or `None` when the key is absent.
fn args<'a>(line: &'a str, key: &str) -> Option<Vec<&'a str>> {
    let start = line.find(key)? + key.len();
    let end = line[start..].find(')').map_or(line.len(), |i| start + i);
    Some(line[start..end].split_whitespace().collect())
}

fn numbers<T: std::str::FromStr>(line: &str, key: &str, expected: usize) -> Result<Option<Vec<T>>, String> {
    let Some(raw) = args(line, key) else {
        return Ok(None);
    };
    let values: Vec<T> = raw.iter().map_while(|t| t.parse().ok()).collect();
    if values.len() < expected {
        return Err(format!("{key}...) needs {expected} numbers"));
    }
    Ok(Some(values))
}

fn parse_material(line: &str) -> Result<Material, String> {
    let mut m = Material { name: quoted(line).unwrap_or_default().to_string(), ..Material::default() };
    if let Some(col) = numbers::<f32>(line, "col(", 4)? {
        m.col = Vec4::new(col[0], col[1], col[2], col[3]);
    }
    let factor = |key: &str| -> Result<f32, String> { Ok(numbers::<f32>(line, key, 1)?.map_or(0.0, |v| v[0])) };
    let col = m.col;
    let scaled = |x: f32| (col.truncate() * x).extend(col.w);
    m.dif = scaled(factor("dif(")?);
    m.amb = scaled(factor("amb(")?);
    m.emi = scaled(factor("emi(")?);
    m.spc = scaled(factor("spc(")?);
    m.power = factor("power(")?;
    if let Some(start) = line.find("tex(") {
        m.texture = quoted(&line[start..]).map(str::to_string);
    }
    Ok(m)
}

fn parse_object(
    lines: &mut TextLines<'_>,
    name: &str,
    vertex_mat: Mat4,
    discard_hidden: bool,
    out: &mut Vec<Object>,
) -> Result<(), FormatError> {
    let mut object = Object::new(name);
    let (mut mirror, mut mirror_axis) = (0, 0);
    loop {
        let line = lines.expect("Object")?;
        let mut tokens = line.split_whitespace();
        let key = tokens.next().unwrap_or_default();
        let value = tokens.next();
        let int = |v: Option<&str>| {
            v.and_then(|v| v.parse::<i32>().ok()).ok_or_else(|| lines.error(format!("bad {key}")))
        };
        match key {
            "visible" => object.visible = int(value)? != 0,
            "shading" => object.smooth = int(value)? != 0,
            "mirror" => mirror = int(value)?,
            "mirror_axis" => mirror_axis = int(value)?,
            "facet" => {
                object.facet = value.and_then(|v| v.parse().ok()).ok_or_else(|| lines.error("bad facet"))?;
            }
            "vertex" => {
                let n = int(value)? as usize;
                for _ in 0..n {
                    let line = lines.expect("vertex")?;
                    let v: Vec<f32> = line.split_whitespace().map_while(|t| t.parse().ok()).collect();
                    if v.len() < 3 {
                        return Err(lines.error("vertex needs three coordinates"));
                    }
                    object.vertices.push(vertex_mat.transform_point3(Vec3::new(v[0], v[1], v[2])));
                }
                close_block(lines, "vertex")?;
            }
            "face" => {
                let n = int(value)? as usize;
                for _ in 0..n {
                    let line = lines.expect("face")?;
                    object.faces.push(parse_face(line).map_err(|reason| lines.error(reason))?);
                }
                close_block(lines, "face")?;
            }
            "}" => break,
            _ if line.ends_with('{') => skip_block(lines)?,
            _ => {}
        }
    }

    if !object.visible && discard_hidden {
        return Ok(());
    }
    let mirrored = (mirror != 0 && mirror_axis != 0).then(|| mirror_copy(&object, mirror_axis));
    out.push(object);
    out.extend(mirrored);
    Ok(())
}

fn close_block(lines: &mut TextLines<'_>, what: &str) -> Result<(), FormatError> {
    if lines.expect(what)? == "}" {
        Ok(())
    } else {
        Err(lines.error(format!("{what} block has more entries than declared")))
    }
}

fn skip_block(lines: &mut TextLines<'_>) -> Result<(), FormatError> {
    let mut depth = 1;
    while depth > 0 {
        let line = lines.expect("block")?;
        if line.ends_with('{') {
            depth += 1;
        } else if line == "}" {
            depth -= 1;
        }
    }
    Ok(())
}

/// `3 V(0 1 2) M(0) UV(...)`. UV v is flipped and the winding reversed to counter-clockwise.
fn parse_face(line: &str) -> Result<Face, String> {
    let n: usize = line.split_whitespace().next().and_then(|t| t.parse().ok()).ok_or("face without a corner count")?;
    if n != 3 && n != 4 {
        return Err(format!("faces must have 3 or 4 corners, found {n}"));
    }
    let mut face = Face { len: n as u8, ..Face::default() };
    if let Some(v) = numbers::<usize>(line, "V(", n)? {
        face.vertices[..n].copy_from_slice(&v[..n]);
    }
    if let Some(m) = numbers::<i32>(line, "M(", 1)? {
        face.material = usize::try_from(m[0]).ok();
    }
    if let Some(uv) = numbers::<f32>(line, "UV(", n * 2)? {
        for (i, pair) in uv.chunks_exact(2).take(n).enumerate() {
            face.uv[i] = Vec2::new(pair[0], 1.0 - pair[1]);
        }
    }
    face.reverse();
    Ok(face)
}

fn mirror_copy(object: &Object, axis: i32) -> Object {
    let flip = Vec3::new(
        if axis & 1 != 0 { -1.0 } else { 1.0 },
        if axis & 2 != 0 { -1.0 } else { 1.0 },
        if axis & 4 != 0 { -1.0 } else { 1.0 },
    );
    let mut copy = object.clone();
    copy.name.push_str("(mirror)");
    copy.vertices.iter_mut().for_each(|v| *v *= flip);
    copy.faces.iter_mut().for_each(Face::reverse);
    copy
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUBE_SIDE: &str = r##"Metasequoia Document
Format Text Ver 1.0

Scene {
	pos 0 0 1500
	amb 0.250 0.250 0.250
}
Material 2 {
	"red" shader(3) col(1.000 0.000 0.000 1.000) dif(0.800) amb(0.600) emi(0.000) spc(0.000) power(5.00)
	"tex" shader(3) col(1.000 1.000 1.000 0.500) dif(1.000) amb(0.250) emi(0.000) spc(0.000) power(5.00) tex("wood.png")
}
Object "#OBJ1_panel" {
	visible 15
	shading 0
	facet 59.5
	mirror 1
	mirror_axis 1
	vertexattr {
		uid {
			1
		}
	}
	vertex 4 {
		1.0 0.0 0.0
		2.0 0.0 0.0
		2.0 1.0 0.0
		1.0 1.0 0.0
	}
	face 2 {
		3 V(0 1 2) M(0) UV(0.0 0.0 1.0 0.0 1.0 1.0)
		4 V(0 1 2 3) M(1)
	}
}
Object "hidden" {
	visible 0
	vertex 1 {
		0 0 0
	}
}
W2R 1 {
	"axis1" "0 0 1"
}
Eof
"##;

    #[test]
    fn parses_materials_objects_and_joints() {
        let model = parse(CUBE_SIDE, &ImportParams::new()).expect("parse");

        assert_eq!(model.materials.len(), 2);
        let red = &model.materials[0];
        assert_eq!(red.name, "red");
        assert!(red.dif.abs_diff_eq(Vec4::new(0.8, 0.0, 0.0, 1.0), 1e-6));
        assert!(red.amb.abs_diff_eq(Vec4::new(0.6, 0.0, 0.0, 1.0), 1e-6));
        assert_eq!(model.materials[1].texture.as_deref(), Some("wood.png"));
        assert_eq!(model.materials[1].dif.w, 0.5);

        let names: Vec<&str> = model.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["#OBJ1_panel", "#OBJ1_panel(mirror)", "hidden"]);
        let panel = &model.objects[0];
        assert!(!panel.smooth);
        assert_eq!(panel.facet, 59.5);
        assert_eq!(panel.group_id(), 1);

        let tri = panel.faces[0];
        assert_eq!(tri.corners(), &[2, 1, 0]);
        assert_eq!(tri.material, Some(0));
        assert_eq!(tri.uv[0], Vec2::new(1.0, 0.0), "corner 2 carries flipped uv (1, 1-1)");
        assert_eq!(panel.faces[1].corners(), &[3, 2, 1, 0]);

        let mirror = &model.objects[1];
        assert_eq!(mirror.vertices[1], Vec3::new(-2.0, 0.0, 0.0));
        assert_eq!(mirror.faces[0].corners(), &[0, 1, 2]);

        assert_eq!(model.joints.get(&1), Some(&Vec3::Z));
    }

    #[test]
    fn hidden_objects_can_be_discarded() {
        let params = ImportParams::new().with("discard_hidden", "1");
        let model = parse(CUBE_SIDE, &params).expect("parse");
        assert!(model.objects.iter().all(|o| o.name != "hidden"));
    }

    #[test]
    fn vertex_matrix_applies_to_every_vertex() {
        let params = ImportParams::new().with("vertex_mat", "0 0 1 1 0 0 0 1 0");
        let model = parse(CUBE_SIDE, &params).expect("parse");
        assert_eq!(model.objects[0].vertices[2], Vec3::new(0.0, 2.0, 1.0));
    }

    #[test]
    fn short_vertex_block_reports_line() {
        let text = "Object \"a\" {\n\tvertex 2 {\n\t\t0 0 0\n\t}\n}\n";
        match parse(text, &ImportParams::new()) {
            Err(FormatError::Parse { line, .. }) => assert_eq!(line, 4),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn pentagons_are_rejected() {
        assert!(parse_face("5 V(0 1 2 3 4)").is_err());
        assert!(parse_face("3 V(0 1)").is_err());
    }
}
