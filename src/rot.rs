//! Attitude helpers shared by the camera and the pose entity.
//!
//! Quaternions are scalar-first in the math below (`q0` is `w`), stored in a [`DQuat`].
//! A DCM is a [`DMat3`] whose columns are the body axes expressed in the navigation frame.

use glam::{DMat3, DQuat, DVec3, Mat4};

pub const D2R: f64 = std::f64::consts::PI / 180.0;
pub const R2D: f64 = 180.0 / std::f64::consts::PI;

/// sin²(89.9°); anything past this is treated as gimbal lock.
const SQ_SIN_89_9: f64 = 0.999_996_953_828_895_2;

#[inline]
fn at(dcm: &DMat3, row: usize, col: usize) -> f64 {
    dcm.col(col)[row]
}

/// Roll/pitch/yaw (radians) to quaternion.
pub fn euler_to_quat(euler: DVec3) -> DQuat {
    let (sr, cr) = (euler.x * 0.5).sin_cos();
    let (sp, cp) = (euler.y * 0.5).sin_cos();
    let (sy, cy) = (euler.z * 0.5).sin_cos();
    DQuat::from_xyzw(
        -cr * sp * sy + sr * cp * cy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
        cr * cp * cy + sr * sp * sy,
    )
}

pub fn dcm_from_quat(q: DQuat) -> DMat3 {
    let (q0, q1, q2, q3) = (q.w, q.x, q.y, q.z);
    let m00 = q0 * q0 + q1 * q1 - q2 * q2 - q3 * q3;
    let m01 = 2.0 * (q1 * q2 - q0 * q3);
    let m02 = 2.0 * (q1 * q3 + q0 * q2);
    let m10 = 2.0 * (q1 * q2 + q0 * q3);
    let m11 = q0 * q0 - q1 * q1 + q2 * q2 - q3 * q3;
    let m12 = 2.0 * (q2 * q3 - q0 * q1);
    let m20 = 2.0 * (q1 * q3 - q0 * q2);
    let m21 = 2.0 * (q2 * q3 + q0 * q1);
    let m22 = q0 * q0 - q1 * q1 - q2 * q2 + q3 * q3;
    DMat3::from_cols(DVec3::new(m00, m10, m20), DVec3::new(m01, m11, m21), DVec3::new(m02, m12, m22))
}

/// Quaternion derivative `0.5 * Ω(rate) * q`.
pub fn quat_rate(rate: DVec3, q: DQuat) -> DQuat {
    let (wp, wq, wr) = (0.5 * rate.x, 0.5 * rate.y, 0.5 * rate.z);
    let (q0, q1, q2, q3) = (q.w, q.x, q.y, q.z);
    DQuat::from_xyzw(
        wp * q0 - wr * q2 + wq * q3,
        wq * q0 + wr * q1 - wp * q3,
        wr * q0 - wq * q1 + wp * q2,
        -wp * q1 - wq * q2 - wr * q3,
    )
}

/// `axis` is expected to be unit length; `angle` is in radians.
pub fn quat_from_axis_angle(axis: DVec3, angle: f64) -> DQuat {
    let (s, c) = (0.5 * angle).sin_cos();
    DQuat::from_xyzw(axis.x * s, axis.y * s, axis.z * s, c)
}

pub fn dcm_to_quat(dcm: &DMat3) -> DQuat {
    let c = |r, k| at(dcm, r, k);
    let tr = c(0, 0) + c(1, 1) + c(2, 2);
    if tr > 0.0 {
        let p0 = (1.0 + tr).sqrt();
        DQuat::from_xyzw(
            0.5 * (c(2, 1) - c(1, 2)) / p0,
            0.5 * (c(0, 2) - c(2, 0)) / p0,
            0.5 * (c(1, 0) - c(0, 1)) / p0,
            0.5 * p0,
        )
    } else if c(0, 0) > c(1, 1) && c(0, 0) > c(2, 2) {
        let s = 2.0 * (1.0 + c(0, 0) - c(1, 1) - c(2, 2)).sqrt();
        DQuat::from_xyzw(s * 0.25, (c(1, 0) + c(0, 1)) / s, (c(0, 2) + c(2, 0)) / s, (c(2, 1) - c(1, 2)) / s)
    } else if c(1, 1) > c(2, 2) {
        let s = 2.0 * (1.0 - c(0, 0) + c(1, 1) - c(2, 2)).sqrt();
        DQuat::from_xyzw((c(1, 0) + c(0, 1)) / s, s * 0.25, (c(2, 1) + c(1, 2)) / s, (c(0, 2) - c(2, 0)) / s)
    } else {
        let s = 2.0 * (1.0 - c(0, 0) - c(1, 1) + c(2, 2)).sqrt();
        DQuat::from_xyzw((c(0, 2) + c(2, 0)) / s, (c(2, 1) + c(1, 2)) / s, s * 0.25, (c(1, 0) - c(0, 1)) / s)
    }
}

/// Integrates body-frame angular increments (degrees) into `q`.
///
/// The body rates are mapped to the navigation frame through the current DCM before
/// the quaternion update, so the rotation is about screen-relative axes.
pub fn rot(wp: f64, wq: f64, wr: f64, q: DQuat) -> DQuat {
    let wc = DVec3::new(wp * D2R, wq * D2R, wr * D2R);
    let wg = dcm_from_quat(q) * wc;
    let dq = quat_rate(wg, q);
    let next = DQuat::from_xyzw(q.x + dq.x, q.y + dq.y, q.z + dq.z, q.w + dq.w);
    next.normalize()
}

/// Folds an angle in degrees into (-180, 180], whatever the number of turns.
pub fn normalize180(x: f64) -> f64 {
    let y = (x + 180.0).rem_euclid(360.0) - 180.0;
    if y <= -180.0 {
        180.0
    } else {
        y
    }
}

/// Rotation vector (axis * angle) to DCM.
pub fn dcm_from_rodrigues(r: DVec3) -> DMat3 {
    let theta = r.length();
    if theta < f64::from(f32::EPSILON) {
        return DMat3::IDENTITY;
    }
    let (s, c) = theta.sin_cos();
    let c1 = 1.0 - c;
    let r = r / theta;
    let rrt = DMat3::from_cols(r * r.x, r * r.y, r * r.z);
    let r_x = DMat3::from_cols(DVec3::new(0.0, r.z, -r.y), DVec3::new(-r.z, 0.0, r.x), DVec3::new(r.y, -r.x, 0.0));
    DMat3::IDENTITY * c + rrt * c1 + r_x * s
}

/// DCM to roll/pitch/yaw (radians). `None` near gimbal lock.
pub fn dcm_to_euler(dcm: &DMat3) -> Option<DVec3> {
    let sq_sp = at(dcm, 2, 0) * at(dcm, 2, 0);
    if sq_sp > SQ_SIN_89_9 {
        return None;
    }
    Some(DVec3::new(
        at(dcm, 2, 1).atan2(at(dcm, 2, 2)),
        (-at(dcm, 2, 0)).atan2((1.0 - sq_sp).sqrt()),
        at(dcm, 1, 0).atan2(at(dcm, 0, 0)),
    ))
}

/// Embeds a DCM into the rotation block of a render matrix.
pub fn dcm4x4(dcm: &DMat3) -> Mat4 {
    Mat4::from_mat3(dcm.as_mat3())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_mat_close(a: &DMat3, b: &DMat3) {
        for (x, y) in a.to_cols_array().iter().zip(b.to_cols_array().iter()) {
            assert!((x - y).abs() < 1e-6, "matrices differ: {a:?} vs {b:?}");
        }
    }

    #[test]
    fn dcm_matches_glam_rotation_for_unit_quaternions() {
        let q = euler_to_quat(DVec3::new(10.0 * D2R, 20.0 * D2R, 30.0 * D2R));
        assert_mat_close(&dcm_from_quat(q), &DMat3::from_quat(q));
    }

    #[test]
    fn quat_dcm_round_trip_covers_all_branches() {
        let cases = [
            DVec3::new(0.1, 0.2, 0.3),
            DVec3::new(std::f64::consts::PI - 0.01, 0.0, 0.0),
            DVec3::new(0.0, std::f64::consts::PI - 0.01, 0.0),
            DVec3::new(0.0, 0.0, std::f64::consts::PI - 0.01),
        ];
        for rv in cases {
            let dcm = dcm_from_rodrigues(rv);
            let q = dcm_to_quat(&dcm);
            assert!((q.length() - 1.0).abs() < 1e-9);
            assert_mat_close(&dcm_from_quat(q), &dcm);
        }
    }

    #[test]
    fn rodrigues_matches_axis_angle() {
        let axis = DVec3::new(1.0, 2.0, -0.5).normalize();
        let angle = 0.7;
        let dcm = dcm_from_rodrigues(axis * angle);
        assert_mat_close(&dcm, &dcm_from_quat(quat_from_axis_angle(axis, angle)));
        assert_eq!(dcm_from_rodrigues(DVec3::ZERO), DMat3::IDENTITY);
    }

    #[test]
    fn euler_round_trip() {
        let euler = DVec3::new(0.2, -0.4, 1.1);
        let dcm = dcm_from_quat(euler_to_quat(euler));
        let back = dcm_to_euler(&dcm).expect("not gimbal locked");
        assert!((back - euler).length() < 1e-9);
    }

    #[test]
    fn euler_reports_gimbal_lock() {
        let dcm = dcm_from_quat(euler_to_quat(DVec3::new(0.0, 90.0 * D2R, 0.0)));
        assert!(dcm_to_euler(&dcm).is_none());
    }

    #[test]
    fn normalize180_folds_one_turn() {
        assert!((normalize180(185.0) + 175.0).abs() < EPS);
        assert!((normalize180(-185.0) - 175.0).abs() < EPS);
        assert!((normalize180(180.0) - 180.0).abs() < EPS);
        assert!((normalize180(-180.0) - 180.0).abs() < EPS);
    }

    #[test]
    fn normalize180_folds_many_turns() {
        assert!((normalize180(545.0) + 175.0).abs() < EPS);
        assert!((normalize180(-545.0) - 175.0).abs() < EPS);
        assert!((normalize180(900.0) - 180.0).abs() < EPS);
        assert!((normalize180(-900.0) - 180.0).abs() < EPS);
        assert!((normalize180(720.0)).abs() < EPS);
        for step in -40..40 {
            let a = normalize180(step as f64 * 97.5);
            assert!(a > -180.0 && a <= 180.0, "{a}");
        }
    }

    #[test]
    fn rot_about_body_z_keeps_unit_length() {
        let mut q = DQuat::IDENTITY;
        for _ in 0..90 {
            q = rot(0.0, 0.0, 1.0, q);
        }
        assert!((q.length() - 1.0).abs() < EPS);
        let x = dcm_from_quat(q).x_axis;
        assert!(x.y > 0.9, "ninety small yaw steps should turn x towards y, got {x:?}");
    }

    #[test]
    fn dcm4x4_embeds_rotation_block() {
        let dcm = dcm_from_quat(quat_from_axis_angle(DVec3::Z, std::f64::consts::FRAC_PI_2));
        let m = dcm4x4(&dcm);
        let v = m.transform_point3(glam::Vec3::X);
        assert!((v - glam::Vec3::Y).length() < 1e-6);
        assert_eq!(m.w_axis, glam::Vec4::W);
    }
}
