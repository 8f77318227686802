//! Little-endian, packed wire formats for streamed geometry.
//!
//! All three packets share a 40-byte header followed by optional origin/text blocks
//! selected by [`PacketType`] bits, then a packet-specific payload. Decoding never trusts
//! a field before checking the declared length against the supplied buffer.

use bitflags::bitflags;
use glam::{DVec3, Vec3};
use thiserror::Error;

pub const POINT_CLOUD_MAGIC: u32 = 0xC311_44AA;
pub const POSE_MAGIC: u32 = 0xC311_44AB;
pub const POLYLINE_MAGIC: u32 = 0xC311_44AC;

pub const HEADER_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic 0x{found:08x} (expected 0x{expected:08x})")]
    BadMagic { expected: u32, found: u32 },
    #[error("declared length {declared} exceeds buffer length {actual}")]
    LengthExceedsBuffer { declared: usize, actual: usize },
    #[error("truncated {what}")]
    Truncated { what: &'static str },
    #[error("invalid utf-8 in text block")]
    Text(#[from] std::str::Utf8Error),
    #[error("unsupported file extension '{0}'")]
    UnsupportedExtension(String),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("glTF: {0}")]
    Gltf(#[from] gltf::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketType: u32 {
        const ORIGIN = 0x0100;
        const TEXT = 0x0200;
    }
}

bitflags! {
    /// Per-point field presence. Field order on the wire is XYZ, RGB, AMP, RNG.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PointFormat: u32 {
        const XYZ = 0x1;
        const RGB = 0x2;
        const AMP = 0x4;
        const RNG = 0x8;
    }
}

impl PointFormat {
    /// Floats per point on the wire.
    pub fn wire_floats(self) -> usize {
        3 + if self.contains(Self::RGB) { 3 } else { 0 }
            + usize::from(self.contains(Self::AMP))
            + usize::from(self.contains(Self::RNG))
    }
}

/// Sensor axes (right, down, forward) to the render frame (east, north, up).
#[inline]
pub fn sensor_to_enu(x: f32, y: f32, z: f32) -> Vec3 {
    Vec3::new(z, -x, -y)
}

#[inline]
pub fn enu_to_sensor(v: Vec3) -> [f32; 3] {
    [-v.y, -v.z, v.x]
}

pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], FormatError> {
        if self.remaining() < len {
            return Err(FormatError::Truncated { what });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, FormatError> {
        Ok(u16::from_le_bytes(self.array(what)?))
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array(what)?))
    }

    pub fn i64(&mut self, what: &'static str) -> Result<i64, FormatError> {
        Ok(i64::from_le_bytes(self.array(what)?))
    }

    pub fn f32(&mut self, what: &'static str) -> Result<f32, FormatError> {
        Ok(f32::from_le_bytes(self.array(what)?))
    }

    pub fn f64(&mut self, what: &'static str) -> Result<f64, FormatError> {
        Ok(f64::from_le_bytes(self.array(what)?))
    }

    pub fn dvec3(&mut self, what: &'static str) -> Result<DVec3, FormatError> {
        Ok(DVec3::new(self.f64(what)?, self.f64(what)?, self.f64(what)?))
    }

    pub fn f32_vec(&mut self, count: usize, what: &'static str) -> Result<Vec<f32>, FormatError> {
        let bytes = self.take(count.checked_mul(4).ok_or(FormatError::Truncated { what })?, what)?;
        Ok(bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub magic: u32,
    pub length: u32,
    pub kind: PacketType,
    /// Pose count or strip count. Point clouds carry their count in the payload.
    pub count: u32,
    pub frame_id: i64,
    pub time: i64,
}

impl PacketHeader {
    /// Reads and validates the header. `counted` selects the pose/polyline layout.
    fn read(reader: &mut ByteReader<'_>, expected: u32, counted: bool) -> Result<Self, FormatError> {
        let actual = reader.remaining();
        let magic = reader.u32("header")?;
        if magic != expected {
            return Err(FormatError::BadMagic { expected, found: magic });
        }
        let length = reader.u32("header")?;
        if length as usize > actual {
            return Err(FormatError::LengthExceedsBuffer { declared: length as usize, actual });
        }
        let kind = PacketType::from_bits_truncate(reader.u32("header")?);
        let count = if counted { reader.u32("header")? } else { 0 };
        let frame_id = reader.i64("header")?;
        let time = reader.i64("header")?;
        let padding = if counted { 8 } else { 12 };
        reader.take(padding, "header")?;
        Ok(Self { magic, length, kind, count, frame_id, time })
    }

    fn write(&self, out: &mut Vec<u8>, counted: bool) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.kind.bits().to_le_bytes());
        if counted {
            out.extend_from_slice(&self.count.to_le_bytes());
        }
        out.extend_from_slice(&self.frame_id.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.resize(out.len() + if counted { 8 } else { 12 }, 0);
    }
}

/// Origin and text label blocks shared by every packet kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketExtras {
    pub origin: Option<DVec3>,
    pub label: Option<String>,
}

impl PacketExtras {
    fn read(reader: &mut ByteReader<'_>, kind: PacketType) -> Result<Self, FormatError> {
        let mut extras = Self::default();
        if kind.contains(PacketType::ORIGIN) {
            extras.origin = Some(reader.dvec3("origin block")?);
        }
        if kind.contains(PacketType::TEXT) {
            let len = reader.u16("text block")? as usize;
            let bytes = reader.take(len, "text block")?;
            extras.label = Some(std::str::from_utf8(bytes)?.to_string());
        }
        Ok(extras)
    }

    fn kind(&self) -> PacketType {
        let mut kind = PacketType::empty();
        kind.set(PacketType::ORIGIN, self.origin.is_some());
        kind.set(PacketType::TEXT, self.label.is_some());
        kind
    }

    fn write(&self, out: &mut Vec<u8>) {
        if let Some(origin) = self.origin {
            for v in origin.to_array() {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        if let Some(label) = &self.label {
            let bytes = label.as_bytes();
            let len = bytes.len().min(u16::MAX as usize);
            out.extend_from_slice(&(len as u16).to_le_bytes());
            out.extend_from_slice(&bytes[..len]);
        }
    }

    /// Origin converted into the render frame.
    pub fn origin_enu(&self) -> Option<Vec3> {
        self.origin.map(|o| sensor_to_enu(o.x as f32, o.y as f32, o.z as f32))
    }
}

fn patch_length(out: &mut [u8]) {
    let len = out.len() as u32;
    out[4..8].copy_from_slice(&len.to_le_bytes());
}

/// Point cloud in sensor axes, as it came off the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointCloudPacket {
    pub header: PacketHeader,
    pub extras: PacketExtras,
    pub format: PointFormat,
    pub n_points: u32,
    /// `n_points * format.wire_floats()` floats.
    pub data: Vec<f32>,
}

impl PointCloudPacket {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(buf);
        let header = PacketHeader::read(&mut reader, POINT_CLOUD_MAGIC, false)?;
        let extras = PacketExtras::read(&mut reader, header.kind)?;
        let n_points = reader.u32("payload header")?;
        let format = PointFormat::from_bits_truncate(reader.u32("payload header")?) | PointFormat::XYZ;
        let count = (n_points as usize).checked_mul(format.wire_floats()).ok_or(FormatError::Truncated {
            what: "point payload",
        })?;
        let data = reader.f32_vec(count, "point payload")?;
        Ok(Self { header, extras, format, n_points, data })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 8 + self.data.len() * 4);
        let header = PacketHeader { magic: POINT_CLOUD_MAGIC, kind: self.extras.kind(), ..self.header };
        header.write(&mut out, false);
        self.extras.write(&mut out);
        out.extend_from_slice(&self.n_points.to_le_bytes());
        out.extend_from_slice(&(self.format | PointFormat::XYZ).bits().to_le_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        patch_length(&mut out);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WirePose {
    /// Rodrigues rotation vector, sensor axes.
    pub rvec: DVec3,
    /// Translation, sensor axes.
    pub tvec: DVec3,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PosePacket {
    pub header: PacketHeader,
    pub extras: PacketExtras,
    pub poses: Vec<WirePose>,
}

impl PosePacket {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(buf);
        let header = PacketHeader::read(&mut reader, POSE_MAGIC, true)?;
        let extras = PacketExtras::read(&mut reader, header.kind)?;
        if reader.remaining() < header.count as usize * 48 {
            return Err(FormatError::Truncated { what: "pose payload" });
        }
        let mut poses = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let rvec = reader.dvec3("pose payload")?;
            let tvec = reader.dvec3("pose payload")?;
            poses.push(WirePose { rvec, tvec });
        }
        Ok(Self { header, extras, poses })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.poses.len() * 48);
        let header = PacketHeader {
            magic: POSE_MAGIC,
            kind: self.extras.kind(),
            count: self.poses.len() as u32,
            ..self.header
        };
        header.write(&mut out, true);
        self.extras.write(&mut out);
        for pose in &self.poses {
            for v in pose.rvec.to_array().into_iter().chain(pose.tvec.to_array()) {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        patch_length(&mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WireStrip {
    pub format: PointFormat,
    /// Sensor-axis floats, `format.wire_floats()` per vertex (only XYZ and RGB are honored).
    pub data: Vec<f32>,
}

impl WireStrip {
    pub fn vertex_count(&self) -> usize {
        self.data.len() / self.format.wire_floats()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolylinePacket {
    pub header: PacketHeader,
    pub extras: PacketExtras,
    pub strips: Vec<WireStrip>,
}

impl PolylinePacket {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(buf);
        let header = PacketHeader::read(&mut reader, POLYLINE_MAGIC, true)?;
        let extras = PacketExtras::read(&mut reader, header.kind)?;
        let mut strips = Vec::new();
        for _ in 0..header.count {
            let n = reader.u32("strip header")? as usize;
            let bits = reader.u32("strip header")?;
            let format = PointFormat::from_bits_truncate(bits) & (PointFormat::XYZ | PointFormat::RGB)
                | PointFormat::XYZ;
            let count = n.checked_mul(format.wire_floats()).ok_or(FormatError::Truncated { what: "strip" })?;
            let data = reader.f32_vec(count, "strip")?;
            strips.push(WireStrip { format, data });
        }
        Ok(Self { header, extras, strips })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let header = PacketHeader {
            magic: POLYLINE_MAGIC,
            kind: self.extras.kind(),
            count: self.strips.len() as u32,
            ..self.header
        };
        header.write(&mut out, true);
        self.extras.write(&mut out);
        for strip in &self.strips {
            out.extend_from_slice(&(strip.vertex_count() as u32).to_le_bytes());
            out.extend_from_slice(&strip.format.bits().to_le_bytes());
            for v in &strip.data {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        patch_length(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cloud() -> PointCloudPacket {
        PointCloudPacket {
            header: PacketHeader { frame_id: 7, time: 1234, ..Default::default() },
            extras: PacketExtras { origin: Some(DVec3::new(1.0, 2.0, 3.0)), label: Some("lidar".into()) },
            format: PointFormat::XYZ | PointFormat::AMP,
            n_points: 2,
            data: vec![1.0, 2.0, 3.0, 10.0, 4.0, 5.0, 6.0, 20.0],
        }
    }

    #[test]
    fn header_is_forty_bytes() {
        let bytes = PointCloudPacket::default().encode();
        assert_eq!(bytes.len(), HEADER_LEN + 8);
        let bytes = PosePacket::default().encode();
        assert_eq!(bytes.len(), HEADER_LEN);
    }

    #[test]
    fn point_cloud_parses_optional_blocks() {
        let packet = sample_cloud();
        let parsed = PointCloudPacket::parse(&packet.encode()).expect("parse");
        assert_eq!(parsed.extras.label.as_deref(), Some("lidar"));
        assert_eq!(parsed.extras.origin, Some(DVec3::new(1.0, 2.0, 3.0)));
        assert_eq!(parsed.header.frame_id, 7);
        assert_eq!(parsed.format.wire_floats(), 4);
        assert_eq!(parsed.data, packet.data);
    }

    #[test]
    fn rejects_declared_length_beyond_buffer() {
        let mut bytes = vec![0u8; 500];
        bytes[0..4].copy_from_slice(&POINT_CLOUD_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&1000u32.to_le_bytes());
        let err = PointCloudPacket::parse(&bytes).unwrap_err();
        assert!(matches!(err, FormatError::LengthExceedsBuffer { declared: 1000, actual: 500 }));
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = sample_cloud().encode();
        assert!(matches!(PosePacket::parse(&bytes), Err(FormatError::BadMagic { .. })));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut bytes = sample_cloud().encode();
        bytes.truncate(bytes.len() - 4);
        let len = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(PointCloudPacket::parse(&bytes), Err(FormatError::Truncated { .. })));
    }

    #[test]
    fn sensor_frame_conversion_is_lossless() {
        let v = sensor_to_enu(1.5, -2.25, 8.0);
        assert_eq!(v, Vec3::new(8.0, -1.5, 2.25));
        assert_eq!(enu_to_sensor(v), [1.5, -2.25, 8.0]);
    }

    #[test]
    fn polyline_strips_keep_their_formats() {
        let packet = PolylinePacket {
            strips: vec![
                WireStrip { format: PointFormat::XYZ, data: vec![0.0; 9] },
                WireStrip { format: PointFormat::XYZ | PointFormat::RGB, data: vec![1.0; 12] },
            ],
            ..Default::default()
        };
        let parsed = PolylinePacket::parse(&packet.encode()).expect("parse");
        assert_eq!(parsed.strips.len(), 2);
        assert_eq!(parsed.strips[0].vertex_count(), 3);
        assert_eq!(parsed.strips[1].vertex_count(), 2);
    }
}
