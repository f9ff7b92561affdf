//! The owning container for bones and joints.
//!
//! Bones and joints form a cyclic bidirectional graph. Rather than a
//! shared-ownership pointer soup, both live in keyed arenas and reference
//! each other by key; the traversal passes walk those key lists.

use slotmap::SlotMap;

use crate::{bone::Bone, joint::Joint};

slotmap::new_key_type! {
    pub struct BoneKey;
    pub struct JointKey;
}

/// A rig: the bone-joint graph one solver operates on.
///
/// Two solvers must not share a rig; the traversal flags on bones are
/// mutable state owned by whichever active set is currently rebuilding.
#[derive(Default)]
pub struct Rig {
    pub(crate) bones: SlotMap<BoneKey, Bone>,
    pub(crate) joints: SlotMap<JointKey, Joint>,
}

impl Rig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bone(&mut self, bone: Bone) -> BoneKey {
        self.bones.insert(bone)
    }

    /// Adds a joint to the rig, attaching it to both endpoint bones.
    pub fn add_joint(&mut self, joint: Joint) -> JointKey {
        let (a, b, enabled) = (joint.bone_a, joint.bone_b, joint.enabled);
        let key = self.joints.insert(joint);
        if enabled {
            self.bones[a].joints.push(key);
            self.bones[b].joints.push(key);
        }
        key
    }

    pub fn bone(&self, key: BoneKey) -> &Bone {
        &self.bones[key]
    }

    pub fn bone_mut(&mut self, key: BoneKey) -> &mut Bone {
        &mut self.bones[key]
    }

    pub fn joint(&self, key: JointKey) -> &Joint {
        &self.joints[key]
    }

    pub fn joint_mut(&mut self, key: JointKey) -> &mut Joint {
        &mut self.joints[key]
    }

    pub fn bones(&self) -> impl Iterator<Item = (BoneKey, &Bone)> {
        self.bones.iter()
    }

    pub fn joints(&self) -> impl Iterator<Item = (JointKey, &Joint)> {
        self.joints.iter()
    }

    /// Enables or disables a joint. An enabled joint is part of the joint
    /// graph and appears in both endpoints' joint lists; a disabled joint
    /// is detached from both and no longer traversable.
    pub fn set_joint_enabled(&mut self, key: JointKey, value: bool) {
        let joint = &mut self.joints[key];
        let (a, b) = (joint.bone_a, joint.bone_b);
        if joint.enabled && !value {
            self.bones[a].joints.retain(|&j| j != key);
            self.bones[b].joints.retain(|&j| j != key);
        } else if !joint.enabled && value {
            self.bones[a].joints.push(key);
            self.bones[b].joints.push(key);
        }
        self.joints[key].enabled = value;
    }

    /// Removes a joint, detaching it from its endpoint bones.
    pub fn remove_joint(&mut self, key: JointKey) -> Option<Joint> {
        let joint = self.joints.remove(key)?;
        if joint.enabled {
            self.bones[joint.bone_a].joints.retain(|&j| j != key);
            self.bones[joint.bone_b].joints.retain(|&j| j != key);
        }
        Some(joint)
    }

    /// Removes a bone along with every joint attached to it.
    pub fn remove_bone(&mut self, key: BoneKey) -> Option<Bone> {
        let bone = self.bones.remove(key)?;
        for &joint_key in &bone.joints {
            if let Some(joint) = self.joints.remove(joint_key) {
                let other = if joint.bone_a == key {
                    joint.bone_b
                } else {
                    joint.bone_a
                };
                if let Some(other_bone) = self.bones.get_mut(other) {
                    other_bone.joints.retain(|&j| j != joint_key);
                }
            }
        }
        Some(bone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{Quat, Vec3};

    fn test_bone(x: f32) -> Bone {
        Bone::new(Vec3::new(x, 0.0, 0.0), Quat::identity(), 0.5, 1.0, 1.0)
    }

    #[test]
    fn joint_membership_tracks_enabled_state() {
        let mut rig = Rig::new();
        let a = rig.add_bone(test_bone(0.0));
        let b = rig.add_bone(test_bone(1.0));
        let j = rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::new(0.5, 0.0, 0.0)));

        assert!(rig.bone(a).joints().contains(&j));
        assert!(rig.bone(b).joints().contains(&j));

        rig.set_joint_enabled(j, false);
        assert!(!rig.bone(a).joints().contains(&j));
        assert!(!rig.bone(b).joints().contains(&j));
        assert!(!rig.joint(j).is_enabled());

        rig.set_joint_enabled(j, true);
        assert!(rig.bone(a).joints().contains(&j));
        assert!(rig.bone(b).joints().contains(&j));
    }

    #[test]
    fn removing_a_bone_detaches_its_joints() {
        let mut rig = Rig::new();
        let a = rig.add_bone(test_bone(0.0));
        let b = rig.add_bone(test_bone(1.0));
        let c = rig.add_bone(test_bone(2.0));
        let j_ab = rig.add_joint(Joint::ball_socket(&rig, a, b, Vec3::new(0.5, 0.0, 0.0)));
        let j_bc = rig.add_joint(Joint::ball_socket(&rig, b, c, Vec3::new(1.5, 0.0, 0.0)));

        rig.remove_bone(b);
        assert!(rig.joints.get(j_ab).is_none());
        assert!(rig.joints.get(j_bc).is_none());
        assert!(rig.bone(a).joints().is_empty());
        assert!(rig.bone(c).joints().is_empty());
    }
}
