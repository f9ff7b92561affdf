//! Goals: user-facing constraints that pull a bone toward a target.
//!
//! Controls group one or two motors on a target bone. The solver treats
//! them like any other constraint, but they also seed the active set
//! traversals, so every control knows which bone it drives.

use slotmap::SlotMap;

use crate::{
    bone::Bone,
    math::{self as m, Quat, Vec3},
    motor::{revolute_constrained_axes, BoneMotor, MotorKind},
    rig::{BoneKey, Rig},
    ConfigError,
};

/// Pulls a point on a bone toward a world-space position.
pub struct DragControl {
    pub(crate) linear_motor: BoneMotor,
}

impl DragControl {
    pub fn new(target_bone: BoneKey, target_position: Vec3) -> Self {
        DragControl {
            linear_motor: BoneMotor::new(
                target_bone,
                MotorKind::Linear {
                    target_position,
                    local_offset: Vec3::zeros(),
                },
            ),
        }
    }

    pub fn target_position(&self) -> Vec3 {
        match self.linear_motor.kind {
            MotorKind::Linear {
                target_position, ..
            } => target_position,
            _ => unreachable!(),
        }
    }

    pub fn set_target_position(&mut self, value: Vec3) {
        if let MotorKind::Linear {
            target_position, ..
        } = &mut self.linear_motor.kind
        {
            *target_position = value;
        }
    }

    /// The world-space offset from the bone's center to the dragged point.
    pub fn offset(&self, rig: &Rig) -> Vec3 {
        match self.linear_motor.kind {
            MotorKind::Linear { local_offset, .. } => m::rotate(
                local_offset,
                rig.bones[self.linear_motor.target_bone].orientation,
            ),
            _ => unreachable!(),
        }
    }

    pub fn set_offset(&mut self, rig: &Rig, value: Vec3) {
        let orientation = rig.bones[self.linear_motor.target_bone].orientation;
        if let MotorKind::Linear { local_offset, .. } = &mut self.linear_motor.kind {
            *local_offset = m::rotate(value, orientation.conjugate());
        }
    }
}

/// A drag whose target orientation overwrites the bone orientation once
/// solving finishes. The orientation does not participate in the solve.
pub struct OrientedDragControl {
    pub(crate) drag: DragControl,
    target_orientation: Quat,
}

impl OrientedDragControl {
    pub fn new(target_bone: BoneKey, target_position: Vec3) -> Self {
        OrientedDragControl {
            drag: DragControl::new(target_bone, target_position),
            target_orientation: Quat::identity(),
        }
    }

    pub fn target_orientation(&self) -> Quat {
        self.target_orientation
    }

    pub fn set_target_orientation(&mut self, value: Quat) {
        self.target_orientation = value;
    }

    pub fn target_position(&self) -> Vec3 {
        self.drag.target_position()
    }

    pub fn set_target_position(&mut self, value: Vec3) {
        self.drag.set_target_position(value);
    }
}

/// Pulls a bone toward a full position and orientation goal.
pub struct StateControl {
    pub(crate) linear_motor: BoneMotor,
    pub(crate) angular_motor: BoneMotor,
}

impl StateControl {
    /// Creates a state control targeting the bone's current pose.
    pub fn new(rig: &Rig, target_bone: BoneKey) -> Self {
        let bone = &rig.bones[target_bone];
        StateControl {
            linear_motor: BoneMotor::new(
                target_bone,
                MotorKind::Linear {
                    target_position: bone.position,
                    local_offset: Vec3::zeros(),
                },
            ),
            angular_motor: BoneMotor::new(
                target_bone,
                MotorKind::Angular {
                    target_orientation: bone.orientation,
                },
            ),
        }
    }

    pub fn target_position(&self) -> Vec3 {
        match self.linear_motor.kind {
            MotorKind::Linear {
                target_position, ..
            } => target_position,
            _ => unreachable!(),
        }
    }

    pub fn set_target_position(&mut self, value: Vec3) {
        if let MotorKind::Linear {
            target_position, ..
        } = &mut self.linear_motor.kind
        {
            *target_position = value;
        }
    }

    pub fn target_orientation(&self) -> Quat {
        match self.angular_motor.kind {
            MotorKind::Angular { target_orientation } => target_orientation,
            _ => unreachable!(),
        }
    }

    pub fn set_target_orientation(&mut self, value: Quat) {
        if let MotorKind::Angular { target_orientation } = &mut self.angular_motor.kind {
            *target_orientation = value;
        }
    }
}

/// Pulls an axis fixed to a bone into a world-space plane.
pub struct AngularPlaneControl {
    pub(crate) angular_motor: BoneMotor,
}

impl AngularPlaneControl {
    pub fn new(target_bone: BoneKey, plane_normal: Vec3, bone_local_axis: Vec3) -> Self {
        AngularPlaneControl {
            angular_motor: BoneMotor::new(
                target_bone,
                MotorKind::AngularPlane {
                    plane_normal,
                    bone_local_axis,
                },
            ),
        }
    }

    pub fn plane_normal(&self) -> Vec3 {
        match self.angular_motor.kind {
            MotorKind::AngularPlane { plane_normal, .. } => plane_normal,
            _ => unreachable!(),
        }
    }

    pub fn set_plane_normal(&mut self, value: Vec3) {
        if let MotorKind::AngularPlane { plane_normal, .. } = &mut self.angular_motor.kind {
            *plane_normal = value;
        }
    }

    pub fn bone_local_axis(&self) -> Vec3 {
        match self.angular_motor.kind {
            MotorKind::AngularPlane {
                bone_local_axis, ..
            } => bone_local_axis,
            _ => unreachable!(),
        }
    }

    pub fn set_bone_local_axis(&mut self, value: Vec3) {
        if let MotorKind::AngularPlane {
            bone_local_axis, ..
        } = &mut self.angular_motor.kind
        {
            *bone_local_axis = value;
        }
    }
}

/// Pulls an axis fixed to a bone into alignment with a world-space axis.
pub struct RevoluteControl {
    pub(crate) angular_motor: BoneMotor,
}

impl RevoluteControl {
    /// Creates a revolute control whose bone-local axis starts out as the
    /// goal axis expressed in the bone's current local space.
    pub fn new(rig: &Rig, target_bone: BoneKey, free_axis: Vec3) -> Self {
        let (constrained_axis_1, constrained_axis_2) = revolute_constrained_axes(free_axis);
        let bone_local_free_axis = m::rotate(
            free_axis,
            rig.bones[target_bone].orientation.conjugate(),
        );
        RevoluteControl {
            angular_motor: BoneMotor::new(
                target_bone,
                MotorKind::Revolute {
                    free_axis,
                    constrained_axis_1,
                    constrained_axis_2,
                    bone_local_free_axis,
                },
            ),
        }
    }

    pub fn free_axis(&self) -> Vec3 {
        match self.angular_motor.kind {
            MotorKind::Revolute { free_axis, .. } => free_axis,
            _ => unreachable!(),
        }
    }

    /// Sets the goal axis, rebuilding the constrained axes around it.
    pub fn set_free_axis(&mut self, value: Vec3) {
        let (axis_1, axis_2) = revolute_constrained_axes(value);
        if let MotorKind::Revolute {
            free_axis,
            constrained_axis_1,
            constrained_axis_2,
            ..
        } = &mut self.angular_motor.kind
        {
            *free_axis = value;
            *constrained_axis_1 = axis_1;
            *constrained_axis_2 = axis_2;
        }
    }

    pub fn bone_local_free_axis(&self) -> Vec3 {
        match self.angular_motor.kind {
            MotorKind::Revolute {
                bone_local_free_axis,
                ..
            } => bone_local_free_axis,
            _ => unreachable!(),
        }
    }

    pub fn set_bone_local_free_axis(&mut self, value: Vec3) {
        if let MotorKind::Revolute {
            bone_local_free_axis,
            ..
        } = &mut self.angular_motor.kind
        {
            *bone_local_free_axis = value;
        }
    }
}

/// A goal driving one bone. See the variant types for what each pulls on.
pub enum Control {
    Drag(DragControl),
    OrientedDrag(OrientedDragControl),
    State(StateControl),
    AngularPlane(AngularPlaneControl),
    Revolute(RevoluteControl),
}

impl From<DragControl> for Control {
    fn from(c: DragControl) -> Self {
        Control::Drag(c)
    }
}
impl From<OrientedDragControl> for Control {
    fn from(c: OrientedDragControl) -> Self {
        Control::OrientedDrag(c)
    }
}
impl From<StateControl> for Control {
    fn from(c: StateControl) -> Self {
        Control::State(c)
    }
}
impl From<AngularPlaneControl> for Control {
    fn from(c: AngularPlaneControl) -> Self {
        Control::AngularPlane(c)
    }
}
impl From<RevoluteControl> for Control {
    fn from(c: RevoluteControl) -> Self {
        Control::Revolute(c)
    }
}

impl Control {
    fn motors(&self) -> [Option<&BoneMotor>; 2] {
        match self {
            Control::Drag(c) => [Some(&c.linear_motor), None],
            Control::OrientedDrag(c) => [Some(&c.drag.linear_motor), None],
            Control::State(c) => [Some(&c.linear_motor), Some(&c.angular_motor)],
            Control::AngularPlane(c) => [Some(&c.angular_motor), None],
            Control::Revolute(c) => [Some(&c.angular_motor), None],
        }
    }

    fn motors_mut(&mut self) -> [Option<&mut BoneMotor>; 2] {
        match self {
            Control::Drag(c) => [Some(&mut c.linear_motor), None],
            Control::OrientedDrag(c) => [Some(&mut c.drag.linear_motor), None],
            Control::State(c) => [Some(&mut c.linear_motor), Some(&mut c.angular_motor)],
            Control::AngularPlane(c) => [Some(&mut c.angular_motor), None],
            Control::Revolute(c) => [Some(&mut c.angular_motor), None],
        }
    }

    /// The bone this control drives.
    pub fn target_bone(&self) -> BoneKey {
        self.motors()[0]
            .expect("every control has at least one motor")
            .target_bone
    }

    pub fn rigidity(&self) -> f32 {
        self.motors()[0]
            .expect("every control has at least one motor")
            .params
            .rigidity
    }

    pub fn set_rigidity(&mut self, value: f32) -> Result<(), ConfigError> {
        for motor in self.motors_mut().into_iter().flatten() {
            motor.params.set_rigidity(value)?;
        }
        Ok(())
    }

    pub fn maximum_force(&self) -> f32 {
        self.motors()[0]
            .expect("every control has at least one motor")
            .params
            .maximum_force
    }

    pub fn set_maximum_force(&mut self, value: f32) {
        for motor in self.motors_mut().into_iter().flatten() {
            motor.params.set_maximum_force(value);
        }
    }

    pub(crate) fn preupdate(&mut self, dt: f32, update_rate: f32) {
        for motor in self.motors_mut().into_iter().flatten() {
            motor.preupdate(dt, update_rate);
        }
    }

    pub(crate) fn update_jacobians_and_velocity_bias(
        &mut self,
        bones: &SlotMap<BoneKey, Bone>,
    ) {
        for motor in self.motors_mut().into_iter().flatten() {
            let bone = &bones[motor.target_bone];
            motor.update_jacobians_and_velocity_bias(bone);
        }
    }

    pub(crate) fn compute_effective_mass(&mut self, bones: &SlotMap<BoneKey, Bone>) {
        for motor in self.motors_mut().into_iter().flatten() {
            let bone = &bones[motor.target_bone];
            motor.compute_effective_mass(bone);
        }
    }

    pub(crate) fn warm_start(&mut self, bones: &mut SlotMap<BoneKey, Bone>) {
        for motor in self.motors_mut().into_iter().flatten() {
            let bone = &mut bones[motor.target_bone];
            motor.warm_start(bone);
        }
    }

    pub(crate) fn solve_velocity_iteration(&mut self, bones: &mut SlotMap<BoneKey, Bone>) {
        for motor in self.motors_mut().into_iter().flatten() {
            let bone = &mut bones[motor.target_bone];
            motor.solve_velocity_iteration(bone);
        }
    }

    pub(crate) fn clear_accumulated_impulses(&mut self, bones: &mut SlotMap<BoneKey, Bone>) {
        for motor in self.motors_mut().into_iter().flatten() {
            motor.clear_accumulated_impulses();
        }
        // The oriented drag writes its goal orientation straight onto the
        // bone once solving is over; it never participates in the solve.
        if let Control::OrientedDrag(c) = self {
            bones[c.drag.linear_motor.target_bone].orientation = c.target_orientation;
        }
    }
}
