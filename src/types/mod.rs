pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// One scalar TDOA observation: `d(other) - d(reference)` in meters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TdoaObservation {
    #[serde(default)]
    pub timestamp: f64,
    pub reference: usize,
    pub other: usize,
    pub range_difference: f64,
    /// Ground-truth position when the observation comes from a simulator or a surveyed log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truth: Option<[f64; 3]>,
}

/// Actuation pair sent to the drive: steering angle [rad] and speed [m/s]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub steering: f64,
    pub speed: f64,
}

/// Planar vehicle pose in the world frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

/// Controller input: pose plus tracking errors, expressed in the vehicle's own frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    pub cte: f64,
    pub heading_error: f64,
}

impl LocalState {
    /// Vehicle at its own origin with the given tracking errors
    pub fn at_origin(cte: f64, heading_error: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            cte,
            heading_error,
        }
    }

    pub fn as_array(&self) -> [f64; 5] {
        [self.x, self.y, self.heading, self.cte, self.heading_error]
    }

    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }
}
