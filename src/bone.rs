//! Rigid bodies moved by the solver.

use crate::{
    math::{self as m, Mat3, Quat, Vec3},
    rig::{BoneKey, JointKey},
};

/// A piece of the rig which is moved by constraints.
///
/// Bones are capsules for inertia purposes; their radius and height feed
/// the inertia tensor but are never used for collision (there is none).
#[derive(Clone, Debug)]
pub struct Bone {
    /// Position of the bone.
    pub position: Vec3,
    /// Orientation of the bone. Kept unit length by the solver.
    pub orientation: Quat,
    /// Whether the bone is pinned. Pinned bones cannot be moved by
    /// constraints and terminate graph traversals.
    pub pinned: bool,

    pub(crate) inverse_mass: f32,
    inertia_tensor_scaling: f32,
    pub(crate) inertia_tensor_inverse: Mat3,
    local_inertia_tensor_inverse: Mat3,
    radius: f32,
    half_height: f32,

    // Mid-iteration velocities, computed during the velocity
    // subiterations and consumed by `update_position`.
    pub(crate) linear_velocity: Vec3,
    pub(crate) angular_velocity: Vec3,

    /// Joints attached to this bone. Kept in sync with joint `enabled`
    /// state by [`Rig`](crate::Rig).
    pub(crate) joints: Vec<JointKey>,

    // Traversal state used by the active set passes. Every pass that
    // writes these is responsible for clearing them afterwards.
    pub(crate) active: bool,
    pub(crate) traversed: bool,
    pub(crate) stress_count: i32,
    pub(crate) unstressed_cycle: bool,
    pub(crate) targeted_by_other_control: bool,
    pub(crate) predecessors: Vec<BoneKey>,
}

impl Bone {
    pub fn new(position: Vec3, orientation: Quat, radius: f32, height: f32, mass: f32) -> Self {
        let mut bone = Bone {
            position,
            orientation,
            pinned: false,
            inverse_mass: 1.0,
            inertia_tensor_scaling: 2.5,
            inertia_tensor_inverse: Mat3::zeros(),
            local_inertia_tensor_inverse: Mat3::zeros(),
            radius,
            half_height: height / 2.0,
            linear_velocity: Vec3::zeros(),
            angular_velocity: Vec3::zeros(),
            joints: Vec::new(),
            active: false,
            traversed: false,
            stress_count: 0,
            unstressed_cycle: false,
            targeted_by_other_control: false,
            predecessors: Vec::new(),
        };
        bone.set_mass(mass);
        bone
    }

    pub fn mass(&self) -> f32 {
        1.0 / self.inverse_mass
    }

    /// Sets the mass of the bone and recomputes its inertia tensor.
    ///
    /// Long chains produce exceptionally small automass values; inverting
    /// them would produce NaNs, so masses at or below epsilon clamp the
    /// inverse mass to 1e7.
    pub fn set_mass(&mut self, value: f32) {
        if value > m::EPSILON {
            self.inverse_mass = 1.0 / value;
        } else {
            self.inverse_mass = 1e7;
        }
        self.compute_local_inertia_tensor();
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn set_radius(&mut self, value: f32) {
        self.radius = value;
        self.compute_local_inertia_tensor();
    }

    pub fn half_height(&self) -> f32 {
        self.half_height
    }

    pub fn set_half_height(&mut self, value: f32) {
        self.half_height = value;
        self.compute_local_inertia_tensor();
    }

    pub fn height(&self) -> f32 {
        self.half_height * 2.0
    }

    pub fn set_height(&mut self, value: f32) {
        self.half_height = value / 2.0;
        self.compute_local_inertia_tensor();
    }

    pub fn inertia_tensor_scaling(&self) -> f32 {
        self.inertia_tensor_scaling
    }

    /// Sets the arbitrary scaling factor applied to the inertia tensor.
    /// Larger values improve stability at the cost of responsiveness.
    pub fn set_inertia_tensor_scaling(&mut self, value: f32) {
        self.inertia_tensor_scaling = value;
        self.compute_local_inertia_tensor();
    }

    /// Whether the bone was a member of the active set in the last solver
    /// execution.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Joints attached to this bone.
    pub fn joints(&self) -> &[JointKey] {
        &self.joints
    }

    fn compute_local_inertia_tensor(&mut self) {
        let multiplier = self.mass() * self.inertia_tensor_scaling;
        let diag_value =
            (0.083_333_333 * self.height() * self.height() + 0.25 * self.radius * self.radius)
                * multiplier;
        let local_inertia_tensor = Mat3::new(
            diag_value,
            0.0,
            0.0,
            0.0,
            0.5 * self.radius * self.radius * multiplier,
            0.0,
            0.0,
            0.0,
            diag_value,
        );
        self.local_inertia_tensor_inverse = m::invert(&local_inertia_tensor);
    }

    /// Updates the world inverse inertia tensor from the local tensor and
    /// the current orientation.
    ///
    /// Separate from `update_position` because the orientation can change
    /// outside the iteration loop, so this runs first in every iteration.
    pub(crate) fn update_inertia_tensor(&mut self) {
        let orientation_matrix = m::matrix_from_quaternion(self.orientation);
        self.inertia_tensor_inverse =
            orientation_matrix.tr_mul(&self.local_inertia_tensor_inverse) * orientation_matrix;
    }

    /// Integrates position and orientation forward from the accumulated
    /// velocities, then zeroes the velocities.
    ///
    /// No `dt` factor: velocities are cleared every step, so at most one
    /// iteration's worth accumulates, and the constraint softness already
    /// carries the time step.
    pub(crate) fn update_position(&mut self) {
        self.position += self.linear_velocity;

        let increment = self.angular_velocity * 0.5;
        let multiplier = Quat::new(0.0, increment.x, increment.y, increment.z) * self.orientation;
        self.orientation = (self.orientation + multiplier).normalize();

        self.linear_velocity = Vec3::zeros();
        self.angular_velocity = Vec3::zeros();
    }

    pub(crate) fn apply_linear_impulse(&mut self, impulse: Vec3) {
        self.linear_velocity += impulse * self.inverse_mass;
    }

    pub(crate) fn apply_angular_impulse(&mut self, impulse: Vec3) {
        self.angular_velocity += self.inertia_tensor_inverse.tr_mul(&impulse);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mass_floor_clamps_inverse_mass() {
        let mut bone = Bone::new(Vec3::zeros(), Quat::identity(), 0.5, 1.0, 1.0);
        bone.set_mass(0.0);
        assert_eq!(bone.inverse_mass, 1e7);
        bone.set_mass(2.0);
        assert_relative_eq!(bone.inverse_mass, 0.5);
    }

    #[test]
    fn update_position_keeps_orientation_normalized_and_zeroes_velocities() {
        let mut bone = Bone::new(Vec3::zeros(), Quat::identity(), 0.5, 1.0, 1.0);
        bone.linear_velocity = Vec3::new(1.0, 2.0, 3.0);
        bone.angular_velocity = Vec3::new(0.5, -0.25, 0.1);
        bone.update_position();
        assert_eq!(bone.position, Vec3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(bone.orientation.norm(), 1.0, epsilon = 1e-6);
        assert_eq!(bone.linear_velocity, Vec3::zeros());
        assert_eq!(bone.angular_velocity, Vec3::zeros());
    }

    #[test]
    fn angular_impulse_goes_through_world_inertia() {
        let mut bone = Bone::new(Vec3::zeros(), Quat::identity(), 0.5, 1.0, 1.0);
        bone.update_inertia_tensor();
        bone.apply_angular_impulse(Vec3::new(0.0, 1.0, 0.0));
        // Capsule tensor: the y axis is the cheap spin axis.
        let expected = 1.0 / (0.5 * 0.5 * 0.5 * 2.5);
        assert_relative_eq!(bone.angular_velocity.y, expected, epsilon = 1e-4);
        assert_relative_eq!(bone.angular_velocity.x, 0.0);
        assert_relative_eq!(bone.angular_velocity.z, 0.0);
    }
}
