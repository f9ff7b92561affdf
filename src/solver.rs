//! The solving loop: converges bone poses toward control goals while
//! respecting joint constraints.
//!
//! One solve is a standalone pass, not a step of a continuous
//! simulation. Bone velocities are zeroed at every position integration,
//! so nothing persists between solves except the poses themselves.

use crate::{
    active_set::ActiveSet,
    control::Control,
    permutation::PermutationMapper,
    rig::{JointKey, Rig},
    ConfigError,
};

pub struct IkSolver {
    /// The active bone and joint set from the last solver execution.
    pub active_set: ActiveSet,
    /// Number of solver iterations performed while goals drive the rig.
    pub control_iteration_count: usize,
    /// Number of goal-less iterations performed afterwards to reduce the
    /// constraint error that unreachable goals leave behind.
    pub fixer_iteration_count: usize,
    /// Number of velocity iterations per control or fixer iteration.
    pub velocity_subiteration_count: usize,
    /// Whether to scale control maximum forces to the mass of their
    /// target bones. This cancels out the automass scaling when sizing
    /// control strength.
    pub autoscale_control_impulses: bool,
    /// The maximum force per unit of mass that controls push with when
    /// autoscaling is enabled.
    pub autoscale_control_maximum_force: f32,

    permutation_mapper: PermutationMapper,
    time_step_duration: f32,
}

impl Default for IkSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IkSolver {
    pub fn new() -> Self {
        IkSolver {
            active_set: ActiveSet::new(),
            control_iteration_count: 50,
            fixer_iteration_count: 20,
            velocity_subiteration_count: 3,
            autoscale_control_impulses: true,
            autoscale_control_maximum_force: f32::MAX,
            permutation_mapper: PermutationMapper::new(),
            time_step_duration: 1.0,
        }
    }

    /// The time step duration elapsed by each position iteration.
    pub fn time_step_duration(&self) -> f32 {
        self.time_step_duration
    }

    pub fn set_time_step_duration(&mut self, value: f32) -> Result<(), ConfigError> {
        if value <= 0.0 {
            return Err(ConfigError::NonPositiveTimeStep);
        }
        self.time_step_duration = value;
        Ok(())
    }

    /// Updates the poses of the bones acted upon by the given joints.
    ///
    /// Usable when no goal-driven controls exist; it amounts to running
    /// just the fixer iterations of a control-driven solve.
    pub fn solve_with_joints(&mut self, rig: &mut Rig, joints: &[JointKey]) {
        self.active_set.update_with_joints(rig, joints);

        // Reset the permutation index; every solve proceeds in exactly
        // the same order.
        self.permutation_mapper.set_permutation_index(0);

        let dt = self.time_step_duration;
        let update_rate = 1.0 / dt;
        for &joint_key in &self.active_set.joints {
            rig.joints[joint_key].preupdate(dt, update_rate);
        }

        for _ in 0..self.fixer_iteration_count {
            self.run_iteration(rig, None);
        }

        self.clear_joint_impulses(rig);
    }

    /// Updates the poses of the bones acted upon by the given controls.
    pub fn solve_with_controls(&mut self, rig: &mut Rig, controls: &mut [Control]) {
        self.active_set.update_with_controls(rig, controls);

        if self.autoscale_control_impulses {
            // Match control strength to the mass of the target bones.
            for control in controls.iter_mut() {
                let mass = rig.bones[control.target_bone()].mass();
                control.set_maximum_force(mass * self.autoscale_control_maximum_force);
            }
        }

        // Reset the permutation index; every solve proceeds in exactly
        // the same order.
        self.permutation_mapper.set_permutation_index(0);

        let dt = self.time_step_duration;
        let update_rate = 1.0 / dt;
        for &joint_key in &self.active_set.joints {
            rig.joints[joint_key].preupdate(dt, update_rate);
        }
        for control in controls.iter_mut() {
            control.preupdate(dt, update_rate);
        }

        for _ in 0..self.control_iteration_count {
            self.run_iteration(rig, Some(&mut *controls));
        }

        // Don't let the control iterations' accumulated impulses prime
        // the fixer pass: the stresses are potentially totally different,
        // and stale high-stress guesses make the system harder to solve.
        self.clear_joint_impulses(rig);

        // The control iterations can leave significant joint error behind
        // when goals are unreachable. Run a secondary pass without the
        // controls' interference; with enough control iterations first,
        // the result stays a good approximation of the goals.
        for _ in 0..self.fixer_iteration_count {
            self.run_iteration(rig, None);
        }

        self.clear_joint_impulses(rig);
        for control in controls.iter_mut() {
            control.clear_accumulated_impulses(&mut rig.bones);
        }
    }

    /// One position iteration: refresh per-bone and per-constraint state,
    /// run the velocity subiterations, then integrate poses.
    ///
    /// The ordering here is load-bearing for convergence: inertia updates
    /// precede jacobian updates precede warm starts precede
    /// subiterations precede position integration, and within a
    /// subiteration every control solve precedes the joint solves.
    fn run_iteration(&mut self, rig: &mut Rig, mut controls: Option<&mut [Control]>) {
        // World inertia tensors for the latest orientations.
        for &bone in &self.active_set.bones {
            rig.bones[bone].update_inertia_tensor();
        }

        // Per-constraint jacobians and effective masses for the current
        // poses, plus the warm start.
        {
            let Rig { bones, joints } = rig;
            for &joint_key in &self.active_set.joints {
                let joint = &mut joints[joint_key];
                let [a, b] = bones
                    .get_disjoint_mut([joint.bone_a, joint.bone_b])
                    .expect("joint endpoints must be distinct live bones");
                joint.update_jacobians_and_velocity_bias(a, b);
                joint.compute_effective_mass(a, b);
                joint.warm_start(a, b);
            }
        }

        if let Some(controls) = controls.as_deref_mut() {
            for control in controls.iter_mut() {
                let pinned = rig.bones[control.target_bone()].pinned;
                debug_assert!(!pinned, "controls cannot target pinned bones");
                if pinned {
                    continue;
                }
                control.update_jacobians_and_velocity_bias(&rig.bones);
                control.compute_effective_mass(&rig.bones);
                control.warm_start(&mut rig.bones);
            }
        }

        for _ in 0..self.velocity_subiteration_count {
            // Controls are solved first.
            if let Some(controls) = controls.as_deref_mut() {
                for control in controls.iter_mut() {
                    if rig.bones[control.target_bone()].pinned {
                        continue;
                    }
                    control.solve_velocity_iteration(&mut rig.bones);
                }
            }

            // Joints are solved in a permuted order; the shuffle avoids
            // solve-order bias in corner cases.
            let joint_count = self.active_set.joints.len();
            {
                let Rig { bones, joints } = rig;
                for joint_index in 0..joint_count {
                    let remapped = self
                        .permutation_mapper
                        .get_mapped_index(joint_index as i64, joint_count);
                    let joint = &mut joints[self.active_set.joints[remapped]];
                    let [a, b] = bones
                        .get_disjoint_mut([joint.bone_a, joint.bone_b])
                        .expect("joint endpoints must be distinct live bones");
                    joint.solve_velocity_iteration(a, b);
                }
            }
            self.permutation_mapper
                .set_permutation_index(self.permutation_mapper.permutation_index() + 1);
        }

        // Integrate the bone poses forward.
        for &bone in &self.active_set.bones {
            rig.bones[bone].update_position();
        }
    }

    /// Accumulated impulses never persist to another solving round; the
    /// state could be arbitrarily different by then.
    fn clear_joint_impulses(&self, rig: &mut Rig) {
        for &joint_key in &self.active_set.joints {
            rig.joints[joint_key].clear_accumulated_impulses();
        }
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bone::Bone,
        control::{DragControl, StateControl},
        joint::{Joint, JointKind},
        math::{self as m, Quat, Vec3},
        rig::BoneKey,
    };
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_4;

    fn capsule(position: Vec3) -> Bone {
        Bone::new(position, Quat::identity(), 0.5, 1.0, 1.0)
    }

    /// Three unit-spaced bones along x, ball-socketed together.
    fn chain(rig: &mut Rig) -> ([BoneKey; 3], [JointKey; 2]) {
        let b0 = rig.add_bone(capsule(Vec3::new(0.0, 0.0, 0.0)));
        let b1 = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        let b2 = rig.add_bone(capsule(Vec3::new(2.0, 0.0, 0.0)));
        let j0 = rig.add_joint(Joint::ball_socket(rig, b0, b1, Vec3::new(1.0, 0.0, 0.0)));
        let j1 = rig.add_joint(Joint::ball_socket(rig, b1, b2, Vec3::new(2.0, 0.0, 0.0)));
        ([b0, b1, b2], [j0, j1])
    }

    fn ball_socket_anchors(rig: &Rig, key: JointKey) -> (Vec3, Vec3) {
        let joint = rig.joint(key);
        match joint.kind {
            JointKind::BallSocket {
                local_offset_a,
                local_offset_b,
            } => {
                let a = rig.bone(joint.bone_a);
                let b = rig.bone(joint.bone_b);
                (
                    a.position + m::rotate(local_offset_a, a.orientation),
                    b.position + m::rotate(local_offset_b, b.orientation),
                )
            }
            _ => panic!("not a ball socket"),
        }
    }

    fn assert_post_solve_invariants(rig: &Rig) {
        for (_, bone) in rig.bones() {
            assert!((bone.orientation.norm() - 1.0).abs() < 1e-4);
            assert_eq!(bone.linear_velocity, Vec3::zeros());
            assert_eq!(bone.angular_velocity, Vec3::zeros());
        }
        for (_, joint) in rig.joints() {
            assert_eq!(joint.accumulated_impulse, Vec3::zeros());
        }
    }

    #[test]
    fn single_chain_reach() {
        let mut rig = Rig::new();
        let ([_, _, b2], joints) = chain(&mut rig);
        let target = Vec3::new(2.0, 1.0, 0.0);
        let mut controls = vec![Control::from(DragControl::new(b2, target))];

        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        assert!(
            (rig.bone(b2).position - target).norm() < 0.1,
            "tip should approach the drag target, ended at {:?}",
            rig.bone(b2).position
        );
        for joint in joints {
            let (anchor_a, anchor_b) = ball_socket_anchors(&rig, joint);
            assert!((anchor_a - anchor_b).norm() < 1e-3, "chain came apart");
        }
        if let Control::Drag(drag) = &controls[0] {
            assert_eq!(drag.linear_motor.accumulated_impulse, Vec3::zeros());
        }
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn pinned_root_stays_put() {
        let mut rig = Rig::new();
        let ([b0, _, b2], joints) = chain(&mut rig);
        rig.bone_mut(b0).pinned = true;
        let mut controls = vec![Control::from(DragControl::new(
            b2,
            Vec3::new(2.0, 1.0, 0.0),
        ))];

        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        assert_eq!(rig.bone(b0).position, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(rig.bone(b0).orientation, Quat::identity());
        assert!(rig.bone(b2).position.y > 0.5);
        for joint in joints {
            let (anchor_a, anchor_b) = ball_socket_anchors(&rig, joint);
            assert!((anchor_a - anchor_b).norm() < 1e-3);
        }
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn pinned_chain_gets_stress_masses() {
        let mut rig = Rig::new();
        let ([b0, b1, b2], _) = chain(&mut rig);
        rig.bone_mut(b0).pinned = true;
        let controls = vec![Control::from(DragControl::new(
            b2,
            Vec3::new(2.0, 1.0, 0.0),
        ))];

        let mut solver = IkSolver::new();
        solver
            .active_set
            .update_with_controls(&mut rig, &controls);

        // Both unpinned bones lie on the single control-to-pin path, so
        // both carry one stressed path's worth of (normalized) mass.
        assert_relative_eq!(rig.bone(b1).mass(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(rig.bone(b2).mass(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn unstressed_chain_gets_falloff_masses() {
        let mut rig = Rig::new();
        let ([b0, b1, b2], _) = chain(&mut rig);
        let controls = vec![Control::from(DragControl::new(
            b2,
            Vec3::new(2.0, 1.0, 0.0),
        ))];

        let mut solver = IkSolver::new();
        solver
            .active_set
            .update_with_controls(&mut rig, &controls);

        // No pins and a single control: the whole chain is unstressed,
        // so masses fall off geometrically from the target and the
        // heaviest bone is normalized to the automass target.
        assert_relative_eq!(rig.bone(b2).mass(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(rig.bone(b1).mass(), 0.9, epsilon = 1e-5);
        assert_relative_eq!(rig.bone(b0).mass(), 0.81, epsilon = 1e-5);
    }

    #[test]
    fn revolute_joint_restricts_off_axis_rotation() {
        let mut rig = Rig::new();
        let a = rig.add_bone(capsule(Vec3::new(0.0, 0.0, 0.0)));
        let b = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        rig.bone_mut(a).pinned = true;
        rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::new(0.0, 0.0, 0.0)));
        rig.add_joint(Joint::revolute(&rig, a, b, Vec3::new(0.0, 0.0, 1.0)));

        // Pull the bone out of the xy-plane, which would need rotation
        // about an axis the revolute joint restricts.
        let mut controls = vec![Control::from(DragControl::new(
            b,
            Vec3::new(0.5, 0.0, 0.8),
        ))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        let (axis, angle) = m::axis_angle(rig.bone(b).orientation);
        assert!(
            (axis.x * angle).abs() < 0.05,
            "rotation about x leaked through: {}",
            axis.x * angle
        );
        assert!(
            (axis.y * angle).abs() < 0.05,
            "rotation about y leaked through: {}",
            axis.y * angle
        );
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn repeated_solves_are_deterministic() {
        let build = || {
            let mut rig = Rig::new();
            let (bones, _) = chain(&mut rig);
            (rig, bones)
        };
        let run = |rig: &mut Rig, tip: BoneKey| {
            let mut controls = vec![Control::from(DragControl::new(
                tip,
                Vec3::new(1.2, 1.4, -0.3),
            ))];
            let mut solver = IkSolver::new();
            solver.solve_with_controls(rig, &mut controls);
        };

        let (mut rig_a, bones_a) = build();
        let (mut rig_b, bones_b) = build();
        run(&mut rig_a, bones_a[2]);
        run(&mut rig_b, bones_b[2]);

        for (&ka, &kb) in bones_a.iter().zip(bones_b.iter()) {
            let a = rig_a.bone(ka);
            let b = rig_b.bone(kb);
            assert_eq!(a.position, b.position);
            assert_eq!(a.orientation, b.orientation);
        }
    }

    #[test]
    fn automass_normalizes_star_topology() {
        let mut rig = Rig::new();
        let center = rig.add_bone(capsule(Vec3::zeros()));
        rig.bone_mut(center).pinned = true;
        let leaf_positions = [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
        ];
        let mut controls = Vec::new();
        let mut leaves = Vec::new();
        for position in leaf_positions {
            let leaf = rig.add_bone(capsule(position));
            rig.add_joint(Joint::ball_socket(&rig, center, leaf, position * 0.5));
            controls.push(Control::from(DragControl::new(leaf, position * 2.0)));
            leaves.push(leaf);
        }

        let mut solver = IkSolver::new();
        solver
            .active_set
            .update_with_controls(&mut rig, &controls);

        let heaviest = leaves
            .iter()
            .map(|&leaf| rig.bone(leaf).mass())
            .fold(f32::MIN, f32::max);
        assert_relative_eq!(
            heaviest,
            solver.active_set.automass_target(),
            epsilon = 1e-5
        );
        for &leaf in &leaves {
            assert!(rig.bone(leaf).mass() <= solver.active_set.automass_target() + 1e-5);
        }
    }

    #[test]
    fn swing_limit_brakes_before_violation() {
        let mut rig = Rig::new();
        let a = rig.add_bone(capsule(Vec3::new(0.0, 0.0, 0.0)));
        let b = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        rig.bone_mut(a).pinned = true;
        rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::new(0.0, 0.0, 0.0)));
        rig.add_joint(Joint::swing_limit(
            &rig,
            a,
            b,
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            FRAC_PI_4,
        ));

        // Try to swing the bone a full quarter turn; the limit should
        // stop it near forty-five degrees without pulling back early.
        let mut controls = vec![Control::from(DragControl::new(
            b,
            Vec3::new(0.0, 1.0, 0.0),
        ))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        let axis_b = m::rotate(Vec3::new(1.0, 0.0, 0.0), rig.bone(b).orientation);
        let swing = axis_b
            .dot(&Vec3::new(1.0, 0.0, 0.0))
            .clamp(-1.0, 1.0)
            .acos();
        assert!(
            swing >= FRAC_PI_4 - 0.05 && swing <= FRAC_PI_4 + 0.02,
            "swing ended at {swing} rad"
        );
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn distance_joint_holds_separation() {
        let mut rig = Rig::new();
        let a = rig.add_bone(capsule(Vec3::zeros()));
        let b = rig.add_bone(capsule(Vec3::new(2.0, 0.0, 0.0)));
        rig.bone_mut(a).pinned = true;
        rig.add_joint(Joint::distance(
            &rig,
            a,
            b,
            Vec3::zeros(),
            Vec3::new(2.0, 0.0, 0.0),
        ));

        let mut controls = vec![Control::from(DragControl::new(
            b,
            Vec3::new(3.0, 1.0, 0.0),
        ))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        // The drag target is out of reach; the bone should settle on the
        // sphere of the joint's rest distance.
        assert_relative_eq!(rig.bone(b).position.norm(), 2.0, epsilon = 0.05);
        assert!(rig.bone(b).position.y > 0.3, "bone should still swing toward the goal");
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn angular_joint_locks_relative_orientation() {
        let mut rig = Rig::new();
        let a = rig.add_bone(capsule(Vec3::zeros()));
        let b = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        rig.bone_mut(a).pinned = true;
        rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::zeros()));
        rig.add_joint(Joint::angular(&rig, a, b));

        // With both position and relative orientation constrained to a
        // pinned bone, the drag has nothing it is allowed to move.
        let mut controls = vec![Control::from(DragControl::new(
            b,
            Vec3::new(0.0, 1.0, 0.0),
        ))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        let (_, angle) = m::axis_angle(rig.bone(b).orientation);
        assert!(angle.abs() < 0.05, "bone rotated {angle} rad");
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn distance_limit_caps_reach_but_does_not_stick() {
        let build = || {
            let mut rig = Rig::new();
            let a = rig.add_bone(capsule(Vec3::zeros()));
            let b = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
            rig.bone_mut(a).pinned = true;
            rig.add_joint(Joint::distance_limit(
                &rig,
                a,
                b,
                Vec3::zeros(),
                Vec3::new(1.0, 0.0, 0.0),
                0.5,
                1.5,
            ));
            (rig, b)
        };

        // Dragging past the band stops at the maximum distance.
        let (mut rig, b) = build();
        let mut controls = vec![Control::from(DragControl::new(
            b,
            Vec3::new(3.0, 0.0, 0.0),
        ))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);
        assert!(
            rig.bone(b).position.norm() <= 1.5 + 0.05,
            "limit overshot to {}",
            rig.bone(b).position.norm()
        );

        // Dragging to a point inside the band is not resisted.
        let (mut rig, b) = build();
        let mut controls = vec![Control::from(DragControl::new(
            b,
            Vec3::new(1.2, 0.0, 0.0),
        ))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);
        assert_relative_eq!(rig.bone(b).position.x, 1.2, epsilon = 0.05);
    }

    #[test]
    fn controls_at_rest_leave_the_rig_alone() {
        let mut rig = Rig::new();
        let (bones, _) = chain(&mut rig);
        let before: Vec<(Vec3, Quat)> = bones
            .iter()
            .map(|&key| (rig.bone(key).position, rig.bone(key).orientation))
            .collect();

        let mut controls = vec![Control::from(StateControl::new(&rig, bones[2]))];
        let mut solver = IkSolver::new();
        solver.solve_with_controls(&mut rig, &mut controls);

        for (&key, (position, orientation)) in bones.iter().zip(before) {
            assert!((rig.bone(key).position - position).norm() < 1e-5);
            assert!((rig.bone(key).orientation - orientation).norm() < 1e-5);
        }
    }

    #[test]
    fn fixer_only_solve_repairs_joint_error() {
        let mut rig = Rig::new();
        let ([b0, b1, _], joints) = chain(&mut rig);
        rig.bone_mut(b0).pinned = true;
        // Tear the middle bone away from its anchors.
        rig.bone_mut(b1).position = Vec3::new(1.0, 0.6, 0.0);

        let mut solver = IkSolver::new();
        solver.solve_with_joints(&mut rig, &joints);

        for joint in joints {
            let (anchor_a, anchor_b) = ball_socket_anchors(&rig, joint);
            assert!(
                (anchor_a - anchor_b).norm() < 0.02,
                "anchors still {} apart",
                (anchor_a - anchor_b).norm()
            );
        }
        assert_eq!(rig.bone(b0).position, Vec3::zeros());
        assert_post_solve_invariants(&rig);
    }

    #[test]
    fn nonpositive_time_step_is_rejected() {
        let mut solver = IkSolver::new();
        assert!(solver.set_time_step_duration(0.0).is_err());
        assert!(solver.set_time_step_duration(-1.0).is_err());
        assert!(solver.set_time_step_duration(0.5).is_ok());
        assert_eq!(solver.time_step_duration(), 0.5);
    }
}
