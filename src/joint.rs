//! Two-bone constraints: joints, which hold a relation bidirectionally,
//! and limits, which can only push the relation back inside a bound.
//!
//! Every kind shares one solve protocol: update jacobians and the error
//! bias, build and invert the effective mass, warm start from the last
//! accumulated impulse, then run projected velocity iterations. Only the
//! jacobian construction differs per kind, so that step is dispatched
//! over [`JointKind`] while the rest lives on [`Joint`] itself.

use crate::{
    bone::Bone,
    constraint::ConstraintParams,
    math::{self as m, Mat3, Quat, Vec3},
    rig::{BoneKey, Rig},
    ConfigError,
};

const DEFAULT_JOINT_RIGIDITY: f32 = 16.0;

#[derive(Clone, Copy, Debug)]
pub(crate) enum JointKind {
    BallSocket {
        local_offset_a: Vec3,
        local_offset_b: Vec3,
    },
    Angular {
        goal_relative_orientation: Quat,
    },
    Distance {
        local_anchor_a: Vec3,
        local_anchor_b: Vec3,
        distance: f32,
    },
    PointOnLine {
        local_line_anchor: Vec3,
        local_line_direction: Vec3,
        local_restricted_axis_1: Vec3,
        local_restricted_axis_2: Vec3,
        local_anchor_b: Vec3,
    },
    PointOnPlane {
        local_plane_anchor: Vec3,
        local_plane_normal: Vec3,
        local_anchor_b: Vec3,
    },
    Revolute {
        local_free_axis_a: Vec3,
        local_free_axis_b: Vec3,
        local_constrained_axis_1: Vec3,
        local_constrained_axis_2: Vec3,
    },
    SwivelHinge {
        local_hinge_axis: Vec3,
        local_twist_axis: Vec3,
    },
    Twist {
        local_axis_a: Vec3,
        local_axis_b: Vec3,
        local_measurement_axis_a: Vec3,
        local_measurement_axis_b: Vec3,
    },
    SwingLimit {
        local_axis_a: Vec3,
        local_axis_b: Vec3,
        maximum_angle: f32,
    },
    TwistLimit {
        local_axis_a: Vec3,
        local_axis_b: Vec3,
        local_measurement_axis_a: Vec3,
        local_measurement_axis_b: Vec3,
        maximum_angle: f32,
    },
    EllipseSwingLimit {
        local_axis_a: Vec3,
        local_axis_b: Vec3,
        local_x_axis: Vec3,
        local_y_axis: Vec3,
        maximum_angle_x: f32,
        maximum_angle_y: f32,
    },
    DistanceLimit {
        local_anchor_a: Vec3,
        local_anchor_b: Vec3,
        minimum_distance: f32,
        maximum_distance: f32,
    },
    LinearAxisLimit {
        local_line_anchor: Vec3,
        local_line_direction: Vec3,
        local_anchor_b: Vec3,
        minimum_distance: f32,
        maximum_distance: f32,
    },
}

impl JointKind {
    /// Limits are one-sided: they can push a violated relation back but
    /// never pull, which shows up as a componentwise non-negativity clamp
    /// on the accumulated impulse.
    fn is_limit(&self) -> bool {
        matches!(
            self,
            JointKind::SwingLimit { .. }
                | JointKind::TwistLimit { .. }
                | JointKind::EllipseSwingLimit { .. }
                | JointKind::DistanceLimit { .. }
                | JointKind::LinearAxisLimit { .. }
        )
    }
}

/// Connects two bones.
pub struct Joint {
    pub(crate) bone_a: BoneKey,
    pub(crate) bone_b: BoneKey,
    pub(crate) enabled: bool,
    /// Member of the active set in the last solver execution.
    pub(crate) is_active: bool,
    pub(crate) params: ConstraintParams,
    pub(crate) kind: JointKind,

    linear_jacobian_a: Mat3,
    angular_jacobian_a: Mat3,
    linear_jacobian_b: Mat3,
    angular_jacobian_b: Mat3,
    effective_mass: Mat3,
    velocity_bias: Vec3,
    pub(crate) accumulated_impulse: Vec3,
}

// constructors

impl Joint {
    fn with_kind(bone_a: BoneKey, bone_b: BoneKey, kind: JointKind) -> Joint {
        Joint {
            bone_a,
            bone_b,
            enabled: true,
            is_active: false,
            params: ConstraintParams::new(DEFAULT_JOINT_RIGIDITY),
            kind,
            linear_jacobian_a: Mat3::zeros(),
            angular_jacobian_a: Mat3::zeros(),
            linear_jacobian_b: Mat3::zeros(),
            angular_jacobian_b: Mat3::zeros(),
            effective_mass: Mat3::zeros(),
            velocity_bias: Vec3::zeros(),
            accumulated_impulse: Vec3::zeros(),
        }
    }

    /// Keeps an anchor point on each bone at the same world location.
    pub fn ball_socket(rig: &Rig, bone_a: BoneKey, bone_b: BoneKey, anchor: Vec3) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::BallSocket {
                local_offset_a: m::rotate(anchor - a.position, a.orientation.conjugate()),
                local_offset_b: m::rotate(anchor - b.position, b.orientation.conjugate()),
            },
        )
    }

    /// Keeps the two bones' relative orientation at its initial value.
    pub fn angular(rig: &Rig, bone_a: BoneKey, bone_b: BoneKey) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::Angular {
                // The orientation from A to B in A's local space.
                goal_relative_orientation: m::concatenate(
                    b.orientation,
                    a.orientation.conjugate(),
                ),
            },
        )
    }

    /// Keeps two anchor points exactly as far apart as they start.
    pub fn distance(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        anchor_a: Vec3,
        anchor_b: Vec3,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::Distance {
                local_anchor_a: m::rotate(anchor_a - a.position, a.orientation.conjugate()),
                local_anchor_b: m::rotate(anchor_b - b.position, b.orientation.conjugate()),
                distance: (anchor_a - anchor_b).norm().max(0.0),
            },
        )
    }

    /// Keeps an anchor on bone B on a line fixed to bone A.
    pub fn point_on_line(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        line_anchor: Vec3,
        line_direction: Vec3,
        anchor_b: Vec3,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        let local_line_direction = m::rotate(line_direction, a.orientation.conjugate());
        let (local_restricted_axis_1, local_restricted_axis_2) =
            restricted_axes(local_line_direction);
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::PointOnLine {
                local_line_anchor: m::rotate(line_anchor - a.position, a.orientation.conjugate()),
                local_line_direction,
                local_restricted_axis_1,
                local_restricted_axis_2,
                local_anchor_b: m::rotate(anchor_b - b.position, b.orientation.conjugate()),
            },
        )
    }

    /// Keeps an anchor on bone B on a plane fixed to bone A.
    pub fn point_on_plane(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        plane_anchor: Vec3,
        plane_normal: Vec3,
        anchor_b: Vec3,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::PointOnPlane {
                local_plane_anchor: m::rotate(plane_anchor - a.position, a.orientation.conjugate()),
                local_plane_normal: m::rotate(plane_normal, a.orientation.conjugate()),
                local_anchor_b: m::rotate(anchor_b - b.position, b.orientation.conjugate()),
            },
        )
    }

    /// Keeps one axis on each bone aligned, leaving rotation around that
    /// axis free.
    pub fn revolute(rig: &Rig, bone_a: BoneKey, bone_b: BoneKey, free_axis: Vec3) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        let local_free_axis_a = m::rotate(free_axis, a.orientation.conjugate());
        let local_free_axis_b = m::rotate(free_axis, b.orientation.conjugate());

        // Complete an orthonormal basis around A's axis and keep it in A's
        // local space; the two constrained axes are the restricted rows.
        let world_axis_a = free_axis;
        let world_axis_b = m::rotate(local_free_axis_b, b.orientation);
        let error = world_axis_a.cross(&world_axis_b);
        let length_squared = error.norm_squared();
        let world_constrained_axis_1 = if length_squared > m::EPSILON {
            error / length_squared.sqrt()
        } else {
            // Not enough error to use as an axis; pick arbitrarily.
            let candidate = m::up().cross(&world_axis_a);
            let length_squared = candidate.norm_squared();
            if length_squared > m::EPSILON {
                candidate / length_squared.sqrt()
            } else {
                m::right().cross(&world_axis_a).normalize()
            }
        };
        let world_constrained_axis_2 = world_axis_a.cross(&world_constrained_axis_1);

        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::Revolute {
                local_free_axis_a,
                local_free_axis_b,
                local_constrained_axis_1: m::rotate(
                    world_constrained_axis_1,
                    a.orientation.conjugate(),
                ),
                local_constrained_axis_2: m::rotate(
                    world_constrained_axis_2,
                    a.orientation.conjugate(),
                ),
            },
        )
    }

    /// Keeps a hinge axis on bone A perpendicular to a twist axis on bone
    /// B, permitting both hinge and twist rotation but no third rotation.
    pub fn swivel_hinge(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        world_hinge_axis: Vec3,
        world_twist_axis: Vec3,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::SwivelHinge {
                local_hinge_axis: m::rotate(world_hinge_axis, a.orientation.conjugate()),
                local_twist_axis: m::rotate(world_twist_axis, b.orientation.conjugate()),
            },
        )
    }

    /// Keeps the rotation around the bones' twist axes at its initial
    /// value while leaving swing free.
    pub fn twist(rig: &Rig, bone_a: BoneKey, bone_b: BoneKey, axis_a: Vec3, axis_b: Vec3) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        let (local_measurement_axis_a, local_measurement_axis_b) =
            measurement_axes(a, b, axis_a, axis_b);
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::Twist {
                local_axis_a: m::rotate(axis_a, a.orientation.conjugate()),
                local_axis_b: m::rotate(axis_b, b.orientation.conjugate()),
                local_measurement_axis_a,
                local_measurement_axis_b,
            },
        )
    }

    /// Limits the angle between two bone axes to a cone.
    pub fn swing_limit(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        axis_a: Vec3,
        axis_b: Vec3,
        maximum_angle: f32,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::SwingLimit {
                local_axis_a: m::rotate(axis_a, a.orientation.conjugate()),
                local_axis_b: m::rotate(axis_b, b.orientation.conjugate()),
                maximum_angle: maximum_angle.max(0.0),
            },
        )
    }

    /// Limits the twist rotation around the bones' axes.
    pub fn twist_limit(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        axis_a: Vec3,
        axis_b: Vec3,
        maximum_angle: f32,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        let (local_measurement_axis_a, local_measurement_axis_b) =
            measurement_axes(a, b, axis_a, axis_b);
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::TwistLimit {
                local_axis_a: m::rotate(axis_a, a.orientation.conjugate()),
                local_axis_b: m::rotate(axis_b, b.orientation.conjugate()),
                local_measurement_axis_a,
                local_measurement_axis_b,
                maximum_angle: maximum_angle.max(0.0),
            },
        )
    }

    /// Limits swing to an elliptical cone with separate angular extents
    /// around two basis axes perpendicular to the twist axis.
    pub fn ellipse_swing_limit(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        axis_a: Vec3,
        axis_b: Vec3,
        maximum_angle_x: f32,
        maximum_angle_y: f32,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        let twist_axis = axis_b;
        let mut x_axis = twist_axis.cross(&m::up());
        if x_axis.norm_squared() < m::EPSILON {
            x_axis = twist_axis.cross(&m::right());
        }
        let y_axis = twist_axis.cross(&x_axis);
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::EllipseSwingLimit {
                local_axis_a: m::rotate(axis_a, a.orientation.conjugate()),
                local_axis_b: m::rotate(axis_b, b.orientation.conjugate()),
                local_x_axis: m::rotate(x_axis.normalize(), a.orientation.conjugate()),
                local_y_axis: m::rotate(y_axis.normalize(), a.orientation.conjugate()),
                maximum_angle_x: maximum_angle_x.max(0.0),
                maximum_angle_y: maximum_angle_y.max(0.0),
            },
        )
    }

    /// Keeps the distance between two anchor points inside a band.
    pub fn distance_limit(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        anchor_a: Vec3,
        anchor_b: Vec3,
        minimum_distance: f32,
        maximum_distance: f32,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::DistanceLimit {
                local_anchor_a: m::rotate(anchor_a - a.position, a.orientation.conjugate()),
                local_anchor_b: m::rotate(anchor_b - b.position, b.orientation.conjugate()),
                minimum_distance: minimum_distance.max(0.0),
                maximum_distance: maximum_distance.max(0.0),
            },
        )
    }

    /// Keeps an anchor on bone B inside a distance band measured along a
    /// line fixed to bone A.
    #[allow(clippy::too_many_arguments)]
    pub fn linear_axis_limit(
        rig: &Rig,
        bone_a: BoneKey,
        bone_b: BoneKey,
        line_anchor: Vec3,
        line_direction: Vec3,
        anchor_b: Vec3,
        minimum_distance: f32,
        maximum_distance: f32,
    ) -> Joint {
        let a = &rig.bones[bone_a];
        let b = &rig.bones[bone_b];
        Joint::with_kind(
            bone_a,
            bone_b,
            JointKind::LinearAxisLimit {
                local_line_anchor: m::rotate(line_anchor - a.position, a.orientation.conjugate()),
                local_line_direction: m::rotate(line_direction, a.orientation.conjugate()),
                local_anchor_b: m::rotate(anchor_b - b.position, b.orientation.conjugate()),
                minimum_distance,
                maximum_distance,
            },
        )
    }
}

// public surface

impl Joint {
    /// The first bone connected by this joint.
    pub fn connection_a(&self) -> BoneKey {
        self.bone_a
    }

    /// The second bone connected by this joint.
    pub fn connection_b(&self) -> BoneKey {
        self.bone_b
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the joint was a member of the active set in the last
    /// solver execution.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Whether this constraint is a one-sided limit.
    pub fn is_limit(&self) -> bool {
        self.kind.is_limit()
    }

    pub fn rigidity(&self) -> f32 {
        self.params.rigidity
    }

    pub fn set_rigidity(&mut self, value: f32) -> Result<(), ConfigError> {
        self.params.set_rigidity(value)
    }

    pub fn maximum_force(&self) -> f32 {
        self.params.maximum_force
    }

    pub fn set_maximum_force(&mut self, value: f32) {
        self.params.set_maximum_force(value);
    }
}

// solve protocol

impl Joint {
    pub(crate) fn preupdate(&mut self, dt: f32, update_rate: f32) {
        self.params.preupdate(dt, update_rate);
    }

    pub(crate) fn update_jacobians_and_velocity_bias(&mut self, a: &Bone, b: &Bone) {
        let error_correction_factor = self.params.error_correction_factor;
        match self.kind {
            JointKind::BallSocket {
                local_offset_a,
                local_offset_b,
            } => {
                // Relative velocity is computed as A minus B, so B's
                // jacobians are negated.
                self.linear_jacobian_a = Mat3::identity();
                self.linear_jacobian_b = Mat3::from_diagonal_element(-1.0);
                let r_a = m::rotate(local_offset_a, a.orientation);
                self.angular_jacobian_a = m::cross_matrix(r_a).transpose();
                let r_b = m::rotate(local_offset_b, b.orientation);
                self.angular_jacobian_b = m::cross_matrix(r_b);

                let world_position_a = a.position + r_a;
                let world_position_b = b.position + r_b;
                let linear_error = world_position_b - world_position_a;
                self.velocity_bias = linear_error * error_correction_factor;
            }
            JointKind::Angular {
                goal_relative_orientation,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();
                self.angular_jacobian_a = Mat3::identity();
                self.angular_jacobian_b = Mat3::from_diagonal_element(-1.0);

                // Where B should be is the goal relative orientation
                // applied on top of A; the error is what remains between
                // that and where B actually is.
                let b_target = m::concatenate(goal_relative_orientation, a.orientation);
                let error = m::concatenate(b_target.conjugate(), b.orientation);
                let (axis, angle) = m::axis_angle(error);
                self.velocity_bias = axis * angle * error_correction_factor;
            }
            JointKind::Distance {
                local_anchor_a,
                local_anchor_b,
                distance,
            } => {
                let offset_a = m::rotate(local_anchor_a, a.orientation);
                let offset_b = m::rotate(local_anchor_b, b.orientation);
                let anchor_a = a.position + offset_a;
                let anchor_b = b.position + offset_b;

                let separation = anchor_b - anchor_a;
                let current_distance = separation.norm();

                let linear_a = if current_distance > m::EPSILON {
                    self.velocity_bias = Vec3::new(
                        error_correction_factor * (current_distance - distance),
                        0.0,
                        0.0,
                    );
                    separation / current_distance
                } else {
                    self.velocity_bias = Vec3::zeros();
                    Vec3::zeros()
                };

                self.linear_jacobian_a = m::single_row(linear_a);
                self.linear_jacobian_b = m::single_row(-linear_a);
                self.angular_jacobian_a = m::single_row(offset_a.cross(&linear_a));
                // linearB is -linearA, so swap the cross product order.
                self.angular_jacobian_b = m::single_row(linear_a.cross(&offset_b));
            }
            JointKind::PointOnLine {
                local_line_anchor,
                local_line_direction,
                local_restricted_axis_1,
                local_restricted_axis_2,
                local_anchor_b,
            } => {
                let restricted_axis_1 = m::rotate(local_restricted_axis_1, a.orientation);
                let restricted_axis_2 = m::rotate(local_restricted_axis_2, a.orientation);
                let line_anchor = a.position + m::rotate(local_line_anchor, a.orientation);
                let line_direction = m::rotate(local_line_direction, a.orientation);

                let r_b = m::rotate(local_anchor_b, b.orientation);
                let world_point = b.position + r_b;

                // Closest point on the line to the world point.
                let offset = world_point - line_anchor;
                let distance_along_axis = offset.dot(&line_direction);
                let world_near_point = line_anchor + line_direction * distance_along_axis;
                let r_a = world_near_point - a.position;

                let error = world_point - world_near_point;
                self.velocity_bias = Vec3::new(
                    error_correction_factor * error.dot(&restricted_axis_1),
                    error_correction_factor * error.dot(&restricted_axis_2),
                    0.0,
                );

                self.linear_jacobian_a = m::two_rows(restricted_axis_1, restricted_axis_2);
                self.linear_jacobian_b = -self.linear_jacobian_a;
                self.angular_jacobian_a =
                    m::two_rows(r_a.cross(&restricted_axis_1), r_a.cross(&restricted_axis_2));
                self.angular_jacobian_b =
                    m::two_rows(restricted_axis_1.cross(&r_b), restricted_axis_2.cross(&r_b));
            }
            JointKind::PointOnPlane {
                local_plane_anchor,
                local_plane_normal,
                local_anchor_b,
            } => {
                let offset_a = m::rotate(local_plane_anchor, a.orientation);
                let plane_normal = m::rotate(local_plane_normal, a.orientation);
                let offset_b = m::rotate(local_anchor_b, b.orientation);
                let anchor_a = a.position + offset_a;
                let anchor_b = b.position + offset_b;

                // Distance, measured along the plane normal.
                let separation = anchor_b - anchor_a;
                let current_distance = separation.dot(&plane_normal);
                self.velocity_bias =
                    Vec3::new(error_correction_factor * current_distance, 0.0, 0.0);

                // The 'collision' location is at anchorB, not A's own
                // anchor, so A's angular jacobian uses the full offset.
                let r_a = anchor_b - a.position;
                self.linear_jacobian_a = m::single_row(plane_normal);
                self.linear_jacobian_b = m::single_row(-plane_normal);
                self.angular_jacobian_a = m::single_row(r_a.cross(&plane_normal));
                self.angular_jacobian_b = m::single_row(plane_normal.cross(&offset_b));
            }
            JointKind::Revolute {
                local_free_axis_a,
                local_free_axis_b,
                local_constrained_axis_1,
                local_constrained_axis_2,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();

                let world_axis_a = m::rotate(local_free_axis_a, a.orientation);
                let world_axis_b = m::rotate(local_free_axis_b, b.orientation);
                let error = world_axis_a.cross(&world_axis_b);

                let constrained_axis_1 = m::rotate(local_constrained_axis_1, a.orientation);
                let constrained_axis_2 = m::rotate(local_constrained_axis_2, a.orientation);

                self.angular_jacobian_a = m::two_rows(constrained_axis_1, constrained_axis_2);
                self.angular_jacobian_b = -self.angular_jacobian_a;

                self.velocity_bias = Vec3::new(
                    error_correction_factor * error.dot(&constrained_axis_1),
                    error_correction_factor * error.dot(&constrained_axis_2),
                    0.0,
                );
            }
            JointKind::SwivelHinge {
                local_hinge_axis,
                local_twist_axis,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();

                // Two free axes, one restricted: the cross product of the
                // hinge axis on A and the twist axis on B.
                let world_hinge_axis = m::rotate(local_hinge_axis, a.orientation);
                let world_twist_axis = m::rotate(local_twist_axis, b.orientation);

                let mut restricted_axis = world_hinge_axis.cross(&world_twist_axis);
                let length_squared = restricted_axis.norm_squared();
                if length_squared > m::EPSILON {
                    restricted_axis /= length_squared.sqrt();
                } else {
                    restricted_axis = Vec3::zeros();
                }

                self.angular_jacobian_a = m::single_row(restricted_axis);
                self.angular_jacobian_b = -self.angular_jacobian_a;

                let error = world_hinge_axis
                    .dot(&world_twist_axis)
                    .clamp(-1.0, 1.0)
                    .acos()
                    - std::f32::consts::FRAC_PI_2;
                self.velocity_bias = Vec3::new(error_correction_factor * error, 0.0, 0.0);
            }
            JointKind::Twist {
                local_axis_a,
                local_axis_b,
                local_measurement_axis_a,
                local_measurement_axis_b,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();

                let axis_a = m::rotate(local_axis_a, a.orientation);
                let axis_b = m::rotate(local_axis_b, b.orientation);
                let twist_measure_axis_a = m::rotate(local_measurement_axis_a, a.orientation);
                let mut twist_measure_axis_b = m::rotate(local_measurement_axis_b, b.orientation);

                // Remove the swing component before comparing measurement
                // axes so only the twist angle remains.
                let alignment_rotation = m::between_unit_vectors(axis_b, axis_a);
                twist_measure_axis_b = m::rotate(twist_measure_axis_b, alignment_rotation);

                let mut error = twist_measure_axis_a
                    .dot(&twist_measure_axis_b)
                    .clamp(-1.0, 1.0)
                    .acos();
                let cross = twist_measure_axis_a.cross(&twist_measure_axis_b);
                if cross.dot(&axis_a) < 0.0 {
                    error = -error;
                }
                self.velocity_bias = Vec3::new(error_correction_factor * error, 0.0, 0.0);

                // The axes can't be used directly as jacobians; consider
                // 'cranking' one bone around the other.
                let mut jacobian = axis_a + axis_b;
                let length_squared = jacobian.norm_squared();
                if length_squared > m::EPSILON {
                    jacobian /= length_squared.sqrt();
                } else {
                    // Invalid configuration; just ignore it.
                    jacobian = Vec3::zeros();
                }

                self.angular_jacobian_a = m::single_row(jacobian);
                self.angular_jacobian_b = m::single_row(-jacobian);
            }
            JointKind::SwingLimit {
                local_axis_a,
                local_axis_b,
                maximum_angle,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();

                let axis_a = m::rotate(local_axis_a, a.orientation);
                let axis_b = m::rotate(local_axis_b, b.orientation);
                let angle = axis_a.dot(&axis_b).clamp(-1.0, 1.0).acos();

                let hinge_axis = axis_a.cross(&axis_b);
                self.angular_jacobian_a = m::single_row(hinge_axis);
                self.angular_jacobian_b = m::single_row(-hinge_axis);

                // Jacobians are computed even while the limit is inactive
                // so it can act speculatively: the negative bias permits
                // only as much motion as stays inside the limit.
                if angle >= maximum_angle {
                    self.velocity_bias = Vec3::new(
                        error_correction_factor * (angle - maximum_angle),
                        0.0,
                        0.0,
                    );
                } else {
                    self.velocity_bias = Vec3::new(angle - maximum_angle, 0.0, 0.0);
                }
            }
            JointKind::TwistLimit {
                local_axis_a,
                local_axis_b,
                local_measurement_axis_a,
                local_measurement_axis_b,
                maximum_angle,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();

                let axis_a = m::rotate(local_axis_a, a.orientation);
                let axis_b = m::rotate(local_axis_b, b.orientation);
                let twist_measure_axis_a = m::rotate(local_measurement_axis_a, a.orientation);
                let mut twist_measure_axis_b = m::rotate(local_measurement_axis_b, b.orientation);

                let alignment_rotation = m::between_unit_vectors(axis_b, axis_a);
                twist_measure_axis_b = m::rotate(twist_measure_axis_b, alignment_rotation);

                let angle = twist_measure_axis_a
                    .dot(&twist_measure_axis_b)
                    .clamp(-1.0, 1.0)
                    .acos();

                if angle > maximum_angle {
                    self.velocity_bias = Vec3::new(
                        error_correction_factor * (angle - maximum_angle),
                        0.0,
                        0.0,
                    );
                } else {
                    // Unviolated; speculative bias only.
                    self.velocity_bias = Vec3::new(angle - maximum_angle, 0.0, 0.0);
                }

                let mut jacobian = axis_a + axis_b;
                let length_squared = jacobian.norm_squared();
                if length_squared > m::EPSILON {
                    jacobian /= length_squared.sqrt();
                } else {
                    jacobian = Vec3::zeros();
                }

                // Limits can only push one way; flip the jacobian on the
                // far side so both ends don't push the same direction.
                let cross = twist_measure_axis_a.cross(&twist_measure_axis_b);
                if cross.dot(&axis_a) < 0.0 {
                    jacobian = -jacobian;
                }

                self.angular_jacobian_a = m::single_row(jacobian);
                self.angular_jacobian_b = m::single_row(-jacobian);
            }
            JointKind::EllipseSwingLimit {
                local_axis_a,
                local_axis_b,
                local_x_axis,
                local_y_axis,
                maximum_angle_x,
                maximum_angle_y,
            } => {
                self.linear_jacobian_a = Mat3::zeros();
                self.linear_jacobian_b = Mat3::zeros();

                let axis_a = m::rotate(local_axis_a, a.orientation);
                let axis_b = m::rotate(local_axis_b, b.orientation);

                // The combined axis-angle vector describes the swing the
                // way angular velocity describes a rotation; dotting it
                // with a basis axis yields the swing angle around that
                // axis.
                let relative_rotation = m::between_unit_vectors(axis_b, axis_a);
                let (axis, angle) = m::axis_angle(relative_rotation);
                let axis_angle = axis * angle;

                let basis_x = m::rotate(local_x_axis, a.orientation);
                let basis_y = m::rotate(local_y_axis, a.orientation);
                let angle_x = axis_angle.dot(&basis_x);
                let angle_y = axis_angle.dot(&basis_y);

                // Reorganized x^2 / a^2 + y^2 / b^2 <= 1 ellipse area test.
                let max_x_squared = maximum_angle_x * maximum_angle_x;
                let max_y_squared = maximum_angle_y * maximum_angle_y;
                let error = angle_x * angle_x * max_y_squared + angle_y * angle_y * max_x_squared
                    - max_x_squared * max_y_squared;

                let hinge_axis = axis_a.cross(&axis_b);
                self.angular_jacobian_a = m::single_row(hinge_axis);
                self.angular_jacobian_b = m::single_row(-hinge_axis);

                if error >= 0.0 {
                    self.velocity_bias = Vec3::new(error_correction_factor * error, 0.0, 0.0);
                } else {
                    self.velocity_bias = Vec3::new(error, 0.0, 0.0);
                }
            }
            JointKind::DistanceLimit {
                local_anchor_a,
                local_anchor_b,
                minimum_distance,
                maximum_distance,
            } => {
                let offset_a = m::rotate(local_anchor_a, a.orientation);
                let offset_b = m::rotate(local_anchor_b, b.orientation);
                let anchor_a = a.position + offset_a;
                let anchor_b = b.position + offset_b;

                let separation = anchor_b - anchor_a;
                let current_distance = separation.norm();

                let mut linear_a = Vec3::zeros();
                if current_distance > m::EPSILON {
                    linear_a = separation / current_distance;
                    if current_distance > maximum_distance {
                        self.velocity_bias = Vec3::new(
                            error_correction_factor * (current_distance - maximum_distance),
                            0.0,
                            0.0,
                        );
                    } else if current_distance < minimum_distance {
                        self.velocity_bias = Vec3::new(
                            error_correction_factor * (minimum_distance - current_distance),
                            0.0,
                            0.0,
                        );
                        // The limit can only push one way; flip toward the
                        // violated bound.
                        linear_a = -linear_a;
                    } else if current_distance - minimum_distance
                        > (maximum_distance - minimum_distance) * 0.5
                    {
                        // Nearer the maximum; speculative bias toward it.
                        self.velocity_bias =
                            Vec3::new(current_distance - maximum_distance, 0.0, 0.0);
                    } else {
                        self.velocity_bias =
                            Vec3::new(minimum_distance - current_distance, 0.0, 0.0);
                        linear_a = -linear_a;
                    }
                } else {
                    self.velocity_bias = Vec3::zeros();
                }

                self.linear_jacobian_a = m::single_row(linear_a);
                self.linear_jacobian_b = m::single_row(-linear_a);
                self.angular_jacobian_a = m::single_row(offset_a.cross(&linear_a));
                self.angular_jacobian_b = m::single_row(linear_a.cross(&offset_b));
            }
            JointKind::LinearAxisLimit {
                local_line_anchor,
                local_line_direction,
                local_anchor_b,
                minimum_distance,
                maximum_distance,
            } => {
                let offset_a = m::rotate(local_line_anchor, a.orientation);
                let mut line_direction = m::rotate(local_line_direction, a.orientation);
                let offset_b = m::rotate(local_anchor_b, b.orientation);
                let anchor_a = a.position + offset_a;
                let anchor_b = b.position + offset_b;

                // Like the distance limit, except distance is measured
                // along the line.
                let separation = anchor_b - anchor_a;
                let current_distance = separation.dot(&line_direction);

                if current_distance > maximum_distance {
                    self.velocity_bias = Vec3::new(
                        error_correction_factor * (current_distance - maximum_distance),
                        0.0,
                        0.0,
                    );
                } else if current_distance < minimum_distance {
                    self.velocity_bias = Vec3::new(
                        error_correction_factor * (minimum_distance - current_distance),
                        0.0,
                        0.0,
                    );
                    line_direction = -line_direction;
                } else if current_distance - minimum_distance
                    > (maximum_distance - minimum_distance) * 0.5
                {
                    self.velocity_bias = Vec3::new(current_distance - maximum_distance, 0.0, 0.0);
                } else {
                    self.velocity_bias = Vec3::new(minimum_distance - current_distance, 0.0, 0.0);
                    line_direction = -line_direction;
                }

                let r_a = anchor_b - a.position;
                self.linear_jacobian_a = m::single_row(line_direction);
                self.linear_jacobian_b = m::single_row(-line_direction);
                self.angular_jacobian_a = m::single_row(r_a.cross(&line_direction));
                self.angular_jacobian_b = m::single_row(line_direction.cross(&offset_b));
            }
        }
    }

    /// Builds and inverts `J * W * J^T`, with pinned bones contributing
    /// zero blocks and softness added on populated diagonal entries.
    pub(crate) fn compute_effective_mass(&mut self, a: &Bone, b: &Bone) {
        let (linear_a, angular_a) = if !a.pinned {
            let linear_w = Mat3::from_diagonal_element(a.inverse_mass);
            (
                (self.linear_jacobian_a * linear_w) * self.linear_jacobian_a.transpose(),
                (self.angular_jacobian_a * a.inertia_tensor_inverse)
                    * self.angular_jacobian_a.transpose(),
            )
        } else {
            (Mat3::zeros(), Mat3::zeros())
        };
        let (linear_b, angular_b) = if !b.pinned {
            let linear_w = Mat3::from_diagonal_element(b.inverse_mass);
            (
                (self.linear_jacobian_b * linear_w) * self.linear_jacobian_b.transpose(),
                (self.angular_jacobian_b * b.inertia_tensor_inverse)
                    * self.angular_jacobian_b.transpose(),
            )
        } else {
            (Mat3::zeros(), Mat3::zeros())
        };

        let mut effective_mass = linear_a + angular_a + linear_b + angular_b;

        // Softness regularizes populated diagonal entries away from
        // singularity; zero rows stay zero for the adaptive inverse.
        let softness = self.params.softness;
        for i in 0..3 {
            if effective_mass[(i, i)] != 0.0 {
                effective_mass[(i, i)] += softness;
            }
        }

        self.effective_mass = m::adaptive_invert(&effective_mass);
    }

    /// Applies the previously accumulated impulse to bootstrap
    /// convergence.
    pub(crate) fn warm_start(&mut self, a: &mut Bone, b: &mut Bone) {
        // P = J^T * lambda, applied per endpoint; pinned bones are
        // treated as having infinite inertia.
        if !a.pinned {
            a.apply_linear_impulse(self.linear_jacobian_a.tr_mul(&self.accumulated_impulse));
            a.apply_angular_impulse(self.angular_jacobian_a.tr_mul(&self.accumulated_impulse));
        }
        if !b.pinned {
            b.apply_linear_impulse(self.linear_jacobian_b.tr_mul(&self.accumulated_impulse));
            b.apply_angular_impulse(self.angular_jacobian_b.tr_mul(&self.accumulated_impulse));
        }
    }

    pub(crate) fn solve_velocity_iteration(&mut self, a: &mut Bone, b: &mut Bone) {
        // Pull the bone velocities into constraint space.
        let mut constraint_velocity_error = self.linear_jacobian_a * a.linear_velocity
            + self.angular_jacobian_a * a.angular_velocity
            + self.linear_jacobian_b * b.linear_velocity
            + self.angular_jacobian_b * b.angular_velocity;
        // Two extra velocity sources move the target away from zero: the
        // position correction bias and the softness feedback.
        constraint_velocity_error -= self.velocity_bias;
        constraint_velocity_error -= self.accumulated_impulse * -self.params.softness;

        let constraint_space_impulse = -self.effective_mass.tr_mul(&constraint_velocity_error);

        let preadd = self.accumulated_impulse;
        self.accumulated_impulse += constraint_space_impulse;
        if self.kind.is_limit() {
            // Limits can only apply positive impulses.
            self.accumulated_impulse = self.accumulated_impulse.sup(&Vec3::zeros());
        }
        let impulse_squared = self.accumulated_impulse.norm_squared();
        if impulse_squared > self.params.maximum_impulse_squared {
            self.accumulated_impulse *= self.params.maximum_impulse / impulse_squared.sqrt();
        }
        // The delta actually applied is whatever survived the clamps.
        let constraint_space_impulse = self.accumulated_impulse - preadd;

        if !a.pinned {
            a.apply_linear_impulse(self.linear_jacobian_a.tr_mul(&constraint_space_impulse));
            a.apply_angular_impulse(self.angular_jacobian_a.tr_mul(&constraint_space_impulse));
        }
        if !b.pinned {
            b.apply_linear_impulse(self.linear_jacobian_b.tr_mul(&constraint_space_impulse));
            b.apply_angular_impulse(self.angular_jacobian_b.tr_mul(&constraint_space_impulse));
        }
    }

    pub(crate) fn clear_accumulated_impulses(&mut self) {
        self.accumulated_impulse = Vec3::zeros();
    }
}

/// Picks a measurement axis perpendicular to `axis_a` and pushes it onto
/// B through the swing-aligning rotation, producing one twist reference
/// axis in each bone's local space.
fn measurement_axes(a: &Bone, b: &Bone, axis_a: Vec3, axis_b: Vec3) -> (Vec3, Vec3) {
    let mut world_measurement_axis_a = m::up().cross(&axis_a);
    let length_squared = world_measurement_axis_a.norm_squared();
    if length_squared > m::EPSILON {
        world_measurement_axis_a /= length_squared.sqrt();
    } else {
        // Parallel to the up vector; use the right vector instead.
        world_measurement_axis_a = m::right().cross(&axis_a).normalize();
    }
    let alignment_rotation = m::between_unit_vectors(axis_a, axis_b);
    let world_measurement_axis_b = m::rotate(world_measurement_axis_a, alignment_rotation);
    (
        m::rotate(world_measurement_axis_a, a.orientation.conjugate()),
        m::rotate(world_measurement_axis_b, b.orientation.conjugate()),
    )
}

/// Completes an orthonormal pair perpendicular to a local line direction.
fn restricted_axes(local_line_direction: Vec3) -> (Vec3, Vec3) {
    let cross = local_line_direction.cross(&m::up());
    let length_squared = cross.norm_squared();
    let axis_1 = if length_squared > m::EPSILON {
        cross / length_squared.sqrt()
    } else {
        // The direction is aligned with the up vector.
        local_line_direction.cross(&m::right()).normalize()
    };
    let axis_2 = axis_1.cross(&local_line_direction);
    (axis_1, axis_2)
}
