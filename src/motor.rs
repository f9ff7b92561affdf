//! Single-bone constraints: the motors controls are built from.
//!
//! These run the same solve protocol as two-bone joints, but the jacobian
//! has one body block and there is no pinning to consider; the solver
//! never lets a control target a pinned bone.

use crate::{
    bone::Bone,
    constraint::ConstraintParams,
    math::{self as m, Mat3, Quat, Vec3},
    rig::BoneKey,
};

const DEFAULT_MOTOR_RIGIDITY: f32 = 1.0;

#[derive(Clone, Copy, Debug)]
pub(crate) enum MotorKind {
    /// Pulls a point on the bone toward a world-space position.
    Linear {
        target_position: Vec3,
        local_offset: Vec3,
    },
    /// Pulls the bone's orientation toward a goal orientation.
    Angular { target_orientation: Quat },
    /// Pulls an axis fixed to the bone into alignment with a world axis.
    Revolute {
        free_axis: Vec3,
        constrained_axis_1: Vec3,
        constrained_axis_2: Vec3,
        bone_local_free_axis: Vec3,
    },
    /// Pulls an axis fixed to the bone into a plane.
    AngularPlane {
        plane_normal: Vec3,
        bone_local_axis: Vec3,
    },
}

pub(crate) struct BoneMotor {
    pub target_bone: BoneKey,
    pub params: ConstraintParams,
    pub kind: MotorKind,

    linear_jacobian: Mat3,
    angular_jacobian: Mat3,
    effective_mass: Mat3,
    velocity_bias: Vec3,
    pub accumulated_impulse: Vec3,
}

impl BoneMotor {
    pub fn new(target_bone: BoneKey, kind: MotorKind) -> Self {
        BoneMotor {
            target_bone,
            params: ConstraintParams::new(DEFAULT_MOTOR_RIGIDITY),
            kind,
            linear_jacobian: Mat3::zeros(),
            angular_jacobian: Mat3::zeros(),
            effective_mass: Mat3::zeros(),
            velocity_bias: Vec3::zeros(),
            accumulated_impulse: Vec3::zeros(),
        }
    }

    pub fn preupdate(&mut self, dt: f32, update_rate: f32) {
        self.params.preupdate(dt, update_rate);
    }

    pub fn update_jacobians_and_velocity_bias(&mut self, bone: &Bone) {
        let error_correction_factor = self.params.error_correction_factor;
        match self.kind {
            MotorKind::Linear {
                target_position,
                local_offset,
            } => {
                self.linear_jacobian = Mat3::identity();
                let r = m::rotate(local_offset, bone.orientation);
                // Transposing a skew symmetric matrix is equivalent to
                // negating it.
                self.angular_jacobian = m::cross_matrix(r).transpose();

                let world_position = bone.position + r;
                // World-space error projected onto the linear jacobian,
                // which happens to be the identity.
                let linear_error = target_position - world_position;
                self.velocity_bias = linear_error * error_correction_factor;
            }
            MotorKind::Angular { target_orientation } => {
                self.linear_jacobian = Mat3::zeros();
                self.angular_jacobian = Mat3::identity();

                let error_quaternion = target_orientation * bone.orientation.conjugate();
                let (axis, angle) = m::axis_angle(error_quaternion);
                self.velocity_bias = axis * angle * error_correction_factor;
            }
            MotorKind::Revolute {
                free_axis,
                constrained_axis_1,
                constrained_axis_2,
                bone_local_free_axis,
            } => {
                self.linear_jacobian = Mat3::zeros();

                let bone_axis = m::rotate(bone_local_free_axis, bone.orientation);
                self.angular_jacobian = m::two_rows(constrained_axis_1, constrained_axis_2);

                let error = bone_axis.cross(&free_axis);
                self.velocity_bias = Vec3::new(
                    error_correction_factor * error.dot(&constrained_axis_1),
                    error_correction_factor * error.dot(&constrained_axis_2),
                    0.0,
                );
            }
            MotorKind::AngularPlane {
                plane_normal,
                bone_local_axis,
            } => {
                self.linear_jacobian = Mat3::zeros();

                let bone_axis = m::rotate(bone_local_axis, bone.orientation);
                self.angular_jacobian = m::single_row(bone_axis.cross(&plane_normal));

                self.velocity_bias = Vec3::new(
                    -error_correction_factor * bone_axis.dot(&plane_normal),
                    0.0,
                    0.0,
                );
            }
        }
    }

    pub fn compute_effective_mass(&mut self, bone: &Bone) {
        let linear_w = Mat3::from_diagonal_element(bone.inverse_mass);
        let linear = (self.linear_jacobian * linear_w) * self.linear_jacobian.transpose();
        let angular =
            (self.angular_jacobian * bone.inertia_tensor_inverse) * self.angular_jacobian.transpose();

        let mut effective_mass = linear + angular;
        let softness = self.params.softness;
        for i in 0..3 {
            if effective_mass[(i, i)] != 0.0 {
                effective_mass[(i, i)] += softness;
            }
        }

        self.effective_mass = m::adaptive_invert(&effective_mass);
    }

    pub fn warm_start(&mut self, bone: &mut Bone) {
        bone.apply_linear_impulse(self.linear_jacobian.tr_mul(&self.accumulated_impulse));
        bone.apply_angular_impulse(self.angular_jacobian.tr_mul(&self.accumulated_impulse));
    }

    pub fn solve_velocity_iteration(&mut self, bone: &mut Bone) {
        let mut constraint_velocity_error = self.linear_jacobian * bone.linear_velocity
            + self.angular_jacobian * bone.angular_velocity;
        constraint_velocity_error -= self.velocity_bias;
        constraint_velocity_error -= self.accumulated_impulse * -self.params.softness;

        let constraint_space_impulse = -self.effective_mass.tr_mul(&constraint_velocity_error);

        let preadd = self.accumulated_impulse;
        self.accumulated_impulse += constraint_space_impulse;
        let impulse_squared = self.accumulated_impulse.norm_squared();
        if impulse_squared > self.params.maximum_impulse_squared {
            self.accumulated_impulse *= self.params.maximum_impulse / impulse_squared.sqrt();
        }
        let constraint_space_impulse = self.accumulated_impulse - preadd;

        bone.apply_linear_impulse(self.linear_jacobian.tr_mul(&constraint_space_impulse));
        bone.apply_angular_impulse(self.angular_jacobian.tr_mul(&constraint_space_impulse));
    }

    pub fn clear_accumulated_impulses(&mut self) {
        self.accumulated_impulse = Vec3::zeros();
    }
}

/// Builds the constrained axes for a revolute motor from its free axis.
pub(crate) fn revolute_constrained_axes(free_axis: Vec3) -> (Vec3, Vec3) {
    let mut constrained_axis_1 = free_axis.cross(&m::up());
    if constrained_axis_1.norm_squared() < m::EPSILON {
        constrained_axis_1 = free_axis.cross(&m::right());
    }
    let constrained_axis_1 = constrained_axis_1.normalize();
    let constrained_axis_2 = free_axis.cross(&constrained_axis_1);
    (constrained_axis_1, constrained_axis_2)
}
