//! Trajectory control modules
//!
//! Bicycle-model MPC over a pluggable nonlinear-program solver, plus the
//! guidance glue that turns position estimates into controller inputs.

pub mod augmented_lagrangian;
pub mod guidance;
pub mod kinematics;
pub mod mpc;
pub mod nlp;

pub use augmented_lagrangian::AugmentedLagrangian;
pub use guidance::{HeadingTracker, WaypointPath};
pub use kinematics::{normalize_angle, to_vehicle_frame, BicycleModel, ReferencePolynomial};
pub use mpc::{HorizonLayout, MpcProblem, MpcSolution, TrajectoryController};
pub use nlp::{NlpProblem, NlpSolution, NlpSolver, SolveError, SparseJacobian};
