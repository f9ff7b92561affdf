//! A constraint-based full-body inverse kinematics solver.
//!
//! A rig is a graph of rigid [`Bone`]s connected by [`Joint`]s. Given a
//! set of [`Control`] goals, the [`IkSolver`] iteratively moves bone
//! poses so the goals are approached while joint constraints and limits
//! are respected. Each solve is a standalone converge-to-goals pass;
//! there is no continuous dynamics integration across time.

pub mod math;

mod bone;
pub use bone::Bone;

mod rig;
pub use rig::{BoneKey, JointKey, Rig};

mod constraint;

mod joint;
pub use joint::Joint;

mod motor;

mod control;
pub use control::{
    AngularPlaneControl, Control, DragControl, OrientedDragControl, RevoluteControl, StateControl,
};

mod active_set;
pub use active_set::ActiveSet;

mod permutation;
pub use permutation::PermutationMapper;

mod solver;
pub use solver::IkSolver;

/// Configuration errors. Setters reject bad values outright instead of
/// coercing them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("rigidity must be positive")]
    NonPositiveRigidity,
    #[error("time step duration must be positive")]
    NonPositiveTimeStep,
    #[error("automass target must be positive")]
    NonPositiveAutomassTarget,
}
