//! TDOA localization and model-predictive trajectory control.
//!
//! A constant-velocity EKF turns range-difference observations against
//! surveyed anchors into a position estimate; a bicycle-model MPC turns
//! the estimate and a reference path into steering and speed commands.

pub mod config;
pub mod control;
pub mod error;
pub mod filters;
pub mod live_status;
pub mod measurement;
pub mod replay_log;
pub mod shared;
pub mod types;

pub use config::{AnchorConfig, ControllerConfig, EstimatorConfig, NavConfig, SolverConfig};
pub use control::{MpcSolution, ReferencePolynomial, TrajectoryController};
pub use error::{NavError, NavResult};
pub use filters::{AnchorRegistry, TdoaEkf, TdoaEkfState, MAX_ANCHORS};
pub use measurement::{predicted_range_difference, PairScheme, TdoaSimulator};
pub use replay_log::{replay, ReplayLog, ReplaySummary};
pub use shared::{EstimateSnapshot, SharedEstimate};
pub use types::{ControlCommand, LocalState, TdoaObservation, VehicleState};
