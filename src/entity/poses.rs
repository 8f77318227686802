//! A sequence of poses drawn by stamping a shared reference model at each one.

use super::{Entity, EntityCore, EntityFlags, EntityHandle, EntityKind, PrepareContext};
use crate::draw_context::DrawContext;
use crate::gpu::{DrawList, GpuError};
use crate::packet::{FormatError, PosePacket};
use crate::rot;
use glam::{DQuat, DVec3, Mat4, Vec3};
use std::sync::TryLockError;

const POSE_SCALE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Body to navigation frame.
    pub q: DQuat,
    /// East-north-up position.
    pub p: Vec3,
}

impl Pose {
    /// `T(origin) · T(p) · R(q) · S(2)`
    pub fn model_matrix(&self, origin: Vec3) -> Mat4 {
        let r = rot::dcm4x4(&rot::dcm_from_quat(self.q));
        Mat4::from_translation(origin) * Mat4::from_translation(self.p) * r * Mat4::from_scale(Vec3::splat(POSE_SCALE))
    }
}

fn sensor_to_enu64(v: DVec3) -> DVec3 {
    DVec3::new(v.z, -v.x, -v.y)
}

pub struct PosesEntity {
    core: EntityCore,
    poses: Vec<Pose>,
    reference: Option<EntityHandle>,
}

impl PosesEntity {
    pub fn new(core: EntityCore, reference: Option<EntityHandle>) -> Self {
        let mut core = core;
        core.flags |= EntityFlags::UNLOADABLE;
        Self { core, poses: Vec::new(), reference }
    }

    pub fn load_mem(&mut self, buf: &[u8]) -> Result<usize, FormatError> {
        let packet = PosePacket::parse(buf)?;
        if let Some(origin) = packet.extras.origin_enu() {
            self.core.local_origin = origin;
        }
        if let Some(label) = &packet.extras.label {
            self.core.caption = label.clone();
        }
        self.poses.extend(packet.poses.iter().map(|wire| {
            let dcm = rot::dcm_from_rodrigues(sensor_to_enu64(wire.rvec));
            Pose { q: rot::dcm_to_quat(&dcm), p: sensor_to_enu64(wire.tvec).as_vec3() }
        }));
        self.core.bound_points(self.poses.iter().map(|pose| pose.p));
        Ok(packet.poses.len())
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn reference(&self) -> Option<&EntityHandle> {
        self.reference.as_ref()
    }
}

impl Entity for PosesEntity {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Poses
    }

    fn load(&mut self) -> Result<(), FormatError> {
        self.core.valid = false;
        let source = self.core.source.clone();
        self.load_mem(&source.read()?)?;
        self.core.valid = !self.poses.is_empty();
        Ok(())
    }

    fn prepare_gpu(&mut self, _ctx: &mut PrepareContext<'_>) -> Result<bool, GpuError> {
        Ok(false)
    }

    fn draw(&mut self, ctx: &DrawContext, out: &mut DrawList) {
        let Some(reference) = &self.reference else {
            return;
        };
        if !self.core.is_visible() {
            return;
        }
        // A reference still parsing on a loader worker is skipped for this frame.
        let mut model = match reference.try_lock() {
            Ok(model) => model,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        model.core_mut().flags.insert(EntityFlags::REFERENCE);
        for pose in &self.poses {
            model.core_mut().local = pose.model_matrix(self.core.local_origin);
            model.draw(ctx, out);
        }
    }

    fn cleanup(&mut self, _ctx: &mut PrepareContext<'_>) {}

    fn center(&self) -> Vec3 {
        self.poses.first().map_or(Vec3::ZERO, |pose| pose.p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{new_handle, AxisIndicator, EntitySource};
    use crate::packet::WirePose;

    fn packet(poses: &[WirePose]) -> Vec<u8> {
        PosePacket { poses: poses.to_vec(), ..Default::default() }.encode()
    }

    #[test]
    fn wire_poses_are_converted_to_enu() {
        let wire = WirePose { rvec: DVec3::ZERO, tvec: DVec3::new(1.0, 2.0, 3.0) };
        let mut poses = PosesEntity::new(EntityCore::new("p"), None);
        assert_eq!(poses.load_mem(&packet(&[wire])).expect("parse"), 1);
        let pose = poses.poses()[0];
        assert_eq!(pose.p, Vec3::new(3.0, -1.0, -2.0));
        assert!(pose.q.abs_diff_eq(DQuat::IDENTITY, 1e-12) || pose.q.abs_diff_eq(-DQuat::IDENTITY, 1e-12));
        assert_eq!(poses.center(), Vec3::new(3.0, -1.0, -2.0));
    }

    #[test]
    fn empty_sequence_is_invalid() {
        let source = EntitySource::Bytes { name: "none".into(), data: packet(&[]).into() };
        let mut poses = PosesEntity::new(EntityCore::new("p").with_source(source), None);
        poses.load().expect("parses");
        assert!(!poses.core().valid);
    }

    #[test]
    fn model_matrix_places_scaled_reference() {
        let pose = Pose { q: DQuat::IDENTITY, p: Vec3::new(1.0, 0.0, 0.0) };
        let m = pose.model_matrix(Vec3::new(0.0, 10.0, 0.0));
        assert!(m.transform_point3(Vec3::X).abs_diff_eq(Vec3::new(3.0, 10.0, 0.0), 1e-6));
    }

    #[test]
    fn draw_places_reference_at_each_pose() {
        let reference = new_handle(Box::new(AxisIndicator::new()));
        let wire = WirePose { rvec: DVec3::new(0.0, 0.1, 0.0), tvec: DVec3::ZERO };
        let mut poses = PosesEntity::new(EntityCore::new("p"), Some(reference.clone()));
        poses.load_mem(&packet(&[wire, wire, wire])).expect("parse");
        // Unprepared reference emits nothing, but its placement is still updated.
        let mut out = DrawList::new();
        poses.draw(&DrawContext::default(), &mut out);
        let local = reference.lock().unwrap().core().local;
        assert_ne!(local, Mat4::IDENTITY);
    }

    #[test]
    fn draw_flags_an_unflagged_reference() {
        let reference = new_handle(Box::new(AxisIndicator::new()));
        let wire = WirePose { rvec: DVec3::ZERO, tvec: DVec3::ZERO };
        let mut poses = PosesEntity::new(EntityCore::new("p"), Some(reference.clone()));
        poses.load_mem(&packet(&[wire])).expect("parse");
        assert!(!reference.lock().unwrap().core().is_reference());
        poses.draw(&DrawContext::default(), &mut DrawList::new());
        assert!(reference.lock().unwrap().core().is_reference());
    }
}
