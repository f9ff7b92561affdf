//! Manages the subset of bones and joints which potentially need solving.
//!
//! The active set contains the connected components of the joint-bone
//! graph which interact with controls, bounded by pinned bones, which do
//! not transfer any motion. Rebuilding it also runs the automass passes:
//! a stressed-path search that counts the load-bearing paths through each
//! bone, and a mass distribution that gives unstressed limbs a geometric
//! falloff for responsiveness.

use std::collections::VecDeque;

use crate::{
    control::Control,
    rig::{BoneKey, JointKey, Rig},
    ConfigError,
};

pub struct ActiveSet {
    pub(crate) bones: Vec<BoneKey>,
    pub(crate) joints: Vec<JointKey>,

    /// Whether to automatically configure bone masses from their graph
    /// dependencies when the set is rebuilt. Overwrites any manually set
    /// masses.
    pub use_automass: bool,
    automass_unstressed_falloff: f32,
    automass_target: f32,

    bones_to_visit: VecDeque<BoneKey>,
    unique_children: Vec<BoneKey>,
}

impl Default for ActiveSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveSet {
    pub fn new() -> Self {
        ActiveSet {
            bones: Vec::new(),
            joints: Vec::new(),
            use_automass: true,
            automass_unstressed_falloff: 0.9,
            automass_target: 1.0,
            bones_to_visit: VecDeque::new(),
            unique_children: Vec::new(),
        }
    }

    /// Active bones, in breadth-first order from the control targets.
    pub fn bones(&self) -> &[BoneKey] {
        &self.bones
    }

    /// Active joints. Joints closer to the controls come first.
    pub fn joints(&self) -> &[JointKey] {
        &self.joints
    }

    pub fn automass_unstressed_falloff(&self) -> f32 {
        self.automass_unstressed_falloff
    }

    /// Sets the multiplier applied to a bone's mass before distributing
    /// it to child bones in unstressed limbs.
    pub fn set_automass_unstressed_falloff(&mut self, value: f32) {
        self.automass_unstressed_falloff = value.max(0.0);
    }

    pub fn automass_target(&self) -> f32 {
        self.automass_target
    }

    /// Sets the mass the heaviest bones end up with when automass is on.
    pub fn set_automass_target(&mut self, value: f32) -> Result<(), ConfigError> {
        if value <= 0.0 {
            return Err(ConfigError::NonPositiveAutomassTarget);
        }
        self.automass_target = value;
        Ok(())
    }

    /// Clears the previous active set and resets every flag it touched.
    ///
    /// The flag usage here is why two solvers cannot operate on the same
    /// rig: the traversal state lives on the bones themselves.
    fn clear(&mut self, rig: &mut Rig) {
        for &bone in &self.bones {
            let bone = &mut rig.bones[bone];
            bone.active = false;
            bone.stress_count = 0;
            bone.predecessors.clear();
            bone.set_mass(0.01);
        }
        for &joint in &self.joints {
            rig.joints[joint].is_active = false;
        }
        self.bones.clear();
        self.joints.clear();
    }

    /// Rebuilds the active set from every enabled joint in the given
    /// list, without any controls to guide it.
    pub(crate) fn update_with_joints(&mut self, rig: &mut Rig, joints: &[JointKey]) {
        self.clear(rig);

        for &joint_key in joints {
            let joint = &rig.joints[joint_key];
            if !joint.enabled {
                continue;
            }
            let (a, b) = (joint.bone_a, joint.bone_b);
            if !rig.bones[a].active {
                rig.bones[a].active = true;
                self.bones.push(a);
            }
            if !rig.bones[b].active {
                rig.bones[b].active = true;
                self.bones.push(b);
            }
            self.joints.push(joint_key);
        }

        // Without controls there is nothing to infer stress from; just
        // use an arbitrary uniform mass.
        if self.use_automass {
            for &bone in &self.bones {
                let target = self.automass_target;
                rig.bones[bone].set_mass(target);
            }
        }

        log::debug!(
            "active set rebuilt from joints: {} bones, {} joints",
            self.bones.len(),
            self.joints.len()
        );
    }

    /// Rebuilds the active set from the bones targeted by the given
    /// controls, running the automass passes if enabled.
    pub(crate) fn update_with_controls(&mut self, rig: &mut Rig, controls: &[Control]) {
        self.clear(rig);

        if self.use_automass {
            self.find_stressed_paths(rig, controls);
            self.distribute_mass(rig, controls);
        }

        // The stress analysis traversed the whole reachable graph, but a
        // proper breadth-first constraint ordering is built separately:
        // joints near the controls must be solved before joints far from
        // them.
        for control in controls {
            let target = control.target_bone();
            self.bones_to_visit.push_back(target);
            rig.bones[target].active = true;
            self.bones.push(target);
        }

        while let Some(bone) = self.bones_to_visit.pop_front() {
            for i in 0..rig.bones[bone].joints.len() {
                let joint_key = rig.bones[bone].joints[i];
                let joint = &mut rig.joints[joint_key];
                if !joint.is_active {
                    joint.is_active = true;
                    self.joints.push(joint_key);
                }
                let bone_to_add = if joint.bone_a == bone {
                    joint.bone_b
                } else {
                    joint.bone_a
                };
                // Pinned bones are dead ends; bones are marked before
                // they are processed so nothing enters the queue twice.
                if !rig.bones[bone_to_add].pinned && !rig.bones[bone_to_add].active {
                    rig.bones[bone_to_add].active = true;
                    self.bones_to_visit.push_back(bone_to_add);
                    self.bones.push(bone_to_add);
                }
            }
        }

        log::debug!(
            "active set rebuilt from controls: {} bones, {} joints",
            self.bones.len(),
            self.joints.len()
        );
    }

    //
    // stress analysis
    //

    /// Runs a depth first search from each controlled bone looking for
    /// pinned bones and other controls. Every simple path from a control
    /// to such a stress source is 'stressed', and the bones along it get
    /// their stress counts incremented.
    fn find_stressed_paths(&mut self, rig: &mut Rig, controls: &[Control]) {
        for (index, control) in controls.iter().enumerate() {
            // Paths connecting controls count as stressed in case the
            // controls try to pull the structure apart. Mark the other
            // controls' bones so the traversal can recognize them.
            for (other_index, other) in controls.iter().enumerate() {
                if other_index != index {
                    rig.bones[other.target_bone()].targeted_by_other_control = true;
                }
            }

            self.find_stressed_paths_from(rig, control.target_bone());

            // The whole graph has been analyzed for this control. Clean
            // up the temporary traversal state; stress counts accumulate
            // across controls.
            for &bone in &self.bones {
                let bone = &mut rig.bones[bone];
                bone.traversed = false;
                bone.active = false;
                bone.predecessors.clear();
            }
            self.bones.clear();

            for other in controls {
                rig.bones[other.target_bone()].targeted_by_other_control = false;
            }
        }
    }

    fn find_stressed_paths_from(&mut self, rig: &mut Rig, bone: BoneKey) {
        // Track visited bones through the active flag.
        rig.bones[bone].active = true;
        self.bones.push(bone);
        for i in 0..rig.bones[bone].joints.len() {
            let joint_key = rig.bones[bone].joints[i];
            let joint = &rig.joints[joint_key];
            let bone_to_analyze = if joint.bone_a == bone {
                joint.bone_b
            } else {
                joint.bone_a
            };
            // Don't revisit the edge we came in on, and don't re-explore
            // a bone this one already explored.
            if bones_have_interacted(rig, bone, bone_to_analyze) {
                continue;
            }

            if !rig.bones[bone_to_analyze].pinned {
                // Record the path taken regardless of whether the search
                // descends further. Never create paths to pinned bones.
                rig.bones[bone_to_analyze].predecessors.push(bone);
            }

            if rig.bones[bone_to_analyze].pinned || rig.bones[bone_to_analyze].traversed {
                // Connected, directly or indirectly, to a pinned bone:
                // this bone and all of its predecessors are part of a
                // stressed path. The backwards notification is needed
                // because a deep branch can wind its way back to a part
                // of the graph that should be marked stressed but has not
                // popped off the stack yet.
                self.notify_predecessors_of_stress(rig, bone);
                continue;
            }

            if rig.bones[bone_to_analyze].targeted_by_other_control {
                // Other controls are stress sources too, but unlike pins
                // the traversal continues through them.
                self.notify_predecessors_of_stress(rig, bone);
            }
            if rig.bones[bone_to_analyze].active {
                // Already visited but not stressed: either not fully
                // explored yet or fully explored. Since this is an
                // unexplored path into it, some parent on the stack owns
                // its exploration; don't descend.
                continue;
            }

            self.find_stressed_paths_from(rig, bone_to_analyze);
        }
    }

    fn notify_predecessors_of_stress(&mut self, rig: &mut Rig, bone: BoneKey) {
        // Already-stressed bones have already notified their own
        // predecessors; stop there.
        if !rig.bones[bone].traversed {
            rig.bones[bone].traversed = true;
            rig.bones[bone].stress_count += 1;
            for i in 0..rig.bones[bone].predecessors.len() {
                let predecessor = rig.bones[bone].predecessors[i];
                self.notify_predecessors_of_stress(rig, predecessor);
            }
        }
    }

    //
    // mass distribution
    //

    /// Multi-origin breadth-first search from every control. Stressed
    /// bones weigh in proportion to their stress count; each unstressed
    /// limb hanging off the stressed component gets geometric-falloff
    /// masses via a nested DFS. Finishes by normalizing so the heaviest
    /// active bone has exactly the automass target mass.
    fn distribute_mass(&mut self, rig: &mut Rig, controls: &[Control]) {
        for control in controls {
            let target = control.target_bone();
            self.bones_to_visit.push_back(target);
            // Marked before processing so nothing queues twice. The
            // second flag is needed by the per-limb distribution phase.
            rig.bones[target].active = true;
            rig.bones[target].traversed = true;
            self.bones.push(target);
        }

        while let Some(bone) = self.bones_to_visit.pop_front() {
            if rig.bones[bone].stress_count == 0 {
                // The root of an isolated limb: there is exactly one
                // bone-to-bone connection between it and the stressed
                // component, so a traversal away from the stressed graph
                // never returns to it.
                let falloff = self.automass_unstressed_falloff;
                rig.bones[bone].set_mass(falloff);
                // Cycles inside the limb must keep equal mass; find and
                // mark them before distributing.
                self.find_cycles(rig, bone);
                self.distribute_mass_down(rig, bone);
                // Do not continue the BFS into the unstressed limb.
                continue;
            } else {
                let stress = rig.bones[bone].stress_count as f32;
                rig.bones[bone].set_mass(stress);
            }

            for i in 0..rig.bones[bone].joints.len() {
                let joint_key = rig.bones[bone].joints[i];
                let joint = &rig.joints[joint_key];
                let bone_to_add = if joint.bone_a == bone {
                    joint.bone_b
                } else {
                    joint.bone_a
                };
                if !rig.bones[bone_to_add].pinned && !rig.bones[bone_to_add].active {
                    let child = &mut rig.bones[bone_to_add];
                    child.active = true;
                    child.traversed = true;
                    child.predecessors.push(bone);
                    self.bones_to_visit.push_back(bone_to_add);
                    self.bones.push(bone_to_add);
                }
            }
        }

        // Normalize so the heaviest bones have exactly the target mass.
        let mut lowest_inverse_mass = f32::MAX;
        for &bone in &self.bones {
            lowest_inverse_mass = lowest_inverse_mass.min(rig.bones[bone].inverse_mass);
        }
        let inverse_mass_scale = 1.0 / (self.automass_target * lowest_inverse_mass);
        for &bone in &self.bones {
            let bone = &mut rig.bones[bone];
            bone.inverse_mass *= inverse_mass_scale;

            // Clear the traversal flags while we're at it.
            bone.active = false;
            bone.traversed = false;
            bone.stress_count = 0;
            bone.unstressed_cycle = false;
            bone.predecessors.clear();
        }
        self.bones.clear();
    }

    /// DFS through an unstressed limb marking cycle members. A revisited
    /// active bone means the walk found a second route to it, which in an
    /// unstressed component can only be a cycle.
    fn find_cycles(&mut self, rig: &mut Rig, bone: BoneKey) {
        for i in 0..rig.bones[bone].joints.len() {
            let joint_key = rig.bones[bone].joints[i];
            let joint = &rig.joints[joint_key];
            let bone_to_analyze = if joint.bone_a == bone {
                joint.bone_b
            } else {
                joint.bone_a
            };
            if bones_have_interacted(rig, bone, bone_to_analyze) {
                continue;
            }
            // Record the path regardless of what happens next.
            rig.bones[bone_to_analyze].predecessors.push(bone);

            if rig.bones[bone_to_analyze].active {
                // Butting up against a previously visited bone that is
                // not our immediate parent: an unstressed cycle. Marking
                // every predecessor up to the limb root is simpler than
                // isolating the cycle itself.
                self.notify_predecessors_of_cycle(rig, bone);
                continue;
            }
            // No pinned-bone test needed: the stressed path search
            // already proved unstressed bones reach no pins.
            rig.bones[bone_to_analyze].active = true;
            self.bones.push(bone_to_analyze);
            self.find_cycles(rig, bone_to_analyze);
        }
    }

    fn notify_predecessors_of_cycle(&mut self, rig: &mut Rig, bone: BoneKey) {
        if !rig.bones[bone].unstressed_cycle && rig.bones[bone].stress_count == 0 {
            rig.bones[bone].unstressed_cycle = true;
            for i in 0..rig.bones[bone].predecessors.len() {
                let predecessor = rig.bones[bone].predecessors[i];
                self.notify_predecessors_of_cycle(rig, predecessor);
            }
        }
    }

    /// Splits a bone's mass between its unvisited children, multiplied by
    /// the unstressed falloff. The falloff bounds the cumulative weight
    /// of a chain by a convergent geometric series. Cycle members are
    /// exempt: they inherit the parent's full mass, since a lighter
    /// member would destabilize the loop.
    fn distribute_mass_down(&mut self, rig: &mut Rig, bone: BoneKey) {
        // Count the children receiving a share. Multiple joints can
        // involve the same pair of bones; don't double count them.
        for i in 0..rig.bones[bone].joints.len() {
            let joint_key = rig.bones[bone].joints[i];
            let joint = &rig.joints[joint_key];
            let bone_to_analyze = if joint.bone_a == bone {
                joint.bone_b
            } else {
                joint.bone_a
            };
            if rig.bones[bone_to_analyze].traversed
                || rig.bones[bone_to_analyze].unstressed_cycle
                || self.unique_children.contains(&bone_to_analyze)
            {
                continue;
            }
            self.unique_children.push(bone_to_analyze);
        }

        // If there are no noncycle children, the only neighbors are
        // already-traversed bones or cycle members inheriting the full
        // parent weight, so the zero never gets used.
        let mass_per_child = if !self.unique_children.is_empty() {
            self.automass_unstressed_falloff * rig.bones[bone].mass()
                / self.unique_children.len() as f32
        } else {
            0.0
        };
        self.unique_children.clear();

        for i in 0..rig.bones[bone].joints.len() {
            let joint_key = rig.bones[bone].joints[i];
            let joint = &rig.joints[joint_key];
            let bone_to_analyze = if joint.bone_a == bone {
                joint.bone_b
            } else {
                joint.bone_a
            };
            if rig.bones[bone_to_analyze].traversed {
                continue;
            }

            if rig.bones[bone_to_analyze].unstressed_cycle {
                let mass = rig.bones[bone].mass();
                rig.bones[bone_to_analyze].set_mass(mass);
            } else {
                rig.bones[bone_to_analyze].set_mass(mass_per_child);
            }
            rig.bones[bone_to_analyze].traversed = true;
            // The earlier cycle search already put the limb's bones in
            // the active list; no need to add them here.
            self.distribute_mass_down(rig, bone_to_analyze);
        }
    }
}

/// Two bones have interacted if either lists the other as a predecessor.
fn bones_have_interacted(rig: &Rig, bone: BoneKey, child: BoneKey) -> bool {
    rig.bones[bone].predecessors.contains(&child)
        || rig.bones[child].predecessors.contains(&bone)
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bone::Bone,
        control::DragControl,
        joint::Joint,
        math::{Quat, Vec3},
    };
    use approx::assert_relative_eq;

    fn capsule(position: Vec3) -> Bone {
        Bone::new(position, Quat::identity(), 0.5, 1.0, 1.0)
    }

    fn drag(bone: BoneKey) -> Control {
        Control::from(DragControl::new(bone, Vec3::zeros()))
    }

    #[test]
    fn joints_near_controls_come_first() {
        let mut rig = Rig::new();
        let bones: Vec<BoneKey> = (0..4)
            .map(|i| rig.add_bone(capsule(Vec3::new(i as f32, 0.0, 0.0))))
            .collect();
        let joints: Vec<JointKey> = (0..3)
            .map(|i| {
                let anchor = Vec3::new(i as f32 + 1.0, 0.0, 0.0);
                rig.add_joint(Joint::ball_socket(&rig, bones[i], bones[i + 1], anchor))
            })
            .collect();

        let mut set = ActiveSet::new();
        set.update_with_controls(&mut rig, &[drag(bones[3])]);

        // Breadth-first from the controlled tip: joints closer to the
        // control precede joints further away.
        itertools::assert_equal(set.joints().iter().copied(), [joints[2], joints[1], joints[0]]);
        itertools::assert_equal(
            set.bones().iter().copied(),
            [bones[3], bones[2], bones[1], bones[0]],
        );
    }

    #[test]
    fn pinned_bones_terminate_the_traversal() {
        let mut rig = Rig::new();
        let bones: Vec<BoneKey> = (0..4)
            .map(|i| rig.add_bone(capsule(Vec3::new(i as f32, 0.0, 0.0))))
            .collect();
        for i in 0..3 {
            let anchor = Vec3::new(i as f32 + 1.0, 0.0, 0.0);
            rig.add_joint(Joint::ball_socket(&rig, bones[i], bones[i + 1], anchor));
        }
        rig.bones[bones[1]].pinned = true;

        let mut set = ActiveSet::new();
        set.update_with_controls(&mut rig, &[drag(bones[3])]);

        // The pin blocks the walk; the far side of it stays inactive.
        assert!(!set.bones().contains(&bones[1]));
        assert!(!set.bones().contains(&bones[0]));
        assert!(!rig.bones[bones[0]].active);
        // The joint into the pin is still solved, though.
        assert_eq!(set.joints().len(), 2);
    }

    #[test]
    fn traversal_flags_are_clean_after_update() {
        let mut rig = Rig::new();
        let root = rig.add_bone(capsule(Vec3::zeros()));
        rig.bones[root].pinned = true;
        let mid = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        let tip_a = rig.add_bone(capsule(Vec3::new(2.0, 0.0, 0.0)));
        let tip_b = rig.add_bone(capsule(Vec3::new(1.0, 1.0, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, root, mid, Vec3::new(0.5, 0.0, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, mid, tip_a, Vec3::new(1.5, 0.0, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, mid, tip_b, Vec3::new(1.0, 0.5, 0.0)));

        let mut set = ActiveSet::new();
        set.update_with_controls(&mut rig, &[drag(tip_a), drag(tip_b)]);

        for (key, bone) in rig.bones.iter() {
            assert!(!bone.traversed);
            assert!(!bone.unstressed_cycle);
            assert!(!bone.targeted_by_other_control);
            assert!(bone.predecessors.is_empty());
            assert_eq!(bone.stress_count, 0);
            assert_eq!(bone.active, set.bones().contains(&key));
        }
    }

    #[test]
    fn unstressed_cycles_share_mass() {
        // A triangle of bones hanging off the controlled bone: an
        // unstressed cycle, so every member keeps the same mass instead
        // of the falloff split.
        let mut rig = Rig::new();
        let target = rig.add_bone(capsule(Vec3::new(0.0, 0.0, 0.0)));
        let a = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        let b = rig.add_bone(capsule(Vec3::new(2.0, 0.0, 0.0)));
        let c = rig.add_bone(capsule(Vec3::new(1.5, 1.0, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, target, a, Vec3::new(0.5, 0.0, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::new(1.5, 0.0, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, b, c, Vec3::new(1.75, 0.5, 0.0)));
        rig.add_joint(Joint::ball_socket(&rig, c, a, Vec3::new(1.25, 0.5, 0.0)));

        let mut set = ActiveSet::new();
        set.update_with_controls(&mut rig, &[drag(target)]);

        let mass_a = rig.bones[a].mass();
        assert_relative_eq!(rig.bones[b].mass(), mass_a, epsilon = 1e-5);
        assert_relative_eq!(rig.bones[c].mass(), mass_a, epsilon = 1e-5);
        assert_relative_eq!(rig.bones[target].mass(), mass_a, epsilon = 1e-5);
    }

    #[test]
    fn bones_between_controls_carry_combined_stress() {
        // Two controls at the ends of a three-bone chain: the middle bone
        // sits on a control-to-control path from each side, so it carries
        // twice the stress mass of the tips.
        let mut rig = Rig::new();
        let bones: Vec<BoneKey> = (0..3)
            .map(|i| rig.add_bone(capsule(Vec3::new(i as f32, 0.0, 0.0))))
            .collect();
        for i in 0..2 {
            let anchor = Vec3::new(i as f32 + 0.5, 0.0, 0.0);
            rig.add_joint(Joint::ball_socket(&rig, bones[i], bones[i + 1], anchor));
        }

        let mut set = ActiveSet::new();
        set.update_with_controls(&mut rig, &[drag(bones[0]), drag(bones[2])]);

        assert_relative_eq!(rig.bones[bones[1]].mass(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(rig.bones[bones[0]].mass(), 0.5, epsilon = 1e-5);
        assert_relative_eq!(rig.bones[bones[2]].mass(), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn joints_variant_assigns_uniform_mass() {
        let mut rig = Rig::new();
        let a = rig.add_bone(capsule(Vec3::zeros()));
        let b = rig.add_bone(capsule(Vec3::new(1.0, 0.0, 0.0)));
        let joint = rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::new(0.5, 0.0, 0.0)));

        let mut set = ActiveSet::new();
        set.update_with_joints(&mut rig, &[joint]);

        assert_eq!(set.bones().len(), 2);
        assert_eq!(set.joints(), &[joint]);
        assert_relative_eq!(rig.bones[a].mass(), set.automass_target(), epsilon = 1e-6);
        assert_relative_eq!(rig.bones[b].mass(), set.automass_target(), epsilon = 1e-6);
    }

    #[test]
    fn automass_target_must_be_positive() {
        let mut set = ActiveSet::new();
        assert!(set.set_automass_target(0.0).is_err());
        assert!(set.set_automass_target(2.0).is_ok());
        assert_eq!(set.automass_target(), 2.0);
        set.set_automass_unstressed_falloff(-1.0);
        assert_eq!(set.automass_unstressed_falloff(), 0.0);
    }
}
