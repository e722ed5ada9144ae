use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};
use crate::types::{ControlCommand, LocalState, VehicleState};

/// Singular values below this are treated as zero in the least-squares fit
const FIT_RCOND: f64 = 1e-12;

/// Kinematic bicycle model referenced to the rear axle
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BicycleModel {
    pub rear_axle_length: f64,
}

impl BicycleModel {
    pub fn new(rear_axle_length: f64) -> NavResult<Self> {
        if !(rear_axle_length.is_finite() && rear_axle_length > 0.0) {
            return Err(NavError::Configuration(format!(
                "rear axle length must be positive, got {rear_axle_length}"
            )));
        }
        Ok(Self { rear_axle_length })
    }

    /// Advance the pose by one explicit Euler step
    pub fn step(&self, state: &VehicleState, command: &ControlCommand, dt: f64) -> VehicleState {
        let v = command.speed;
        VehicleState {
            x: state.x + v * state.heading.cos() * dt,
            y: state.y + v * state.heading.sin() * dt,
            heading: normalize_angle(
                state.heading + v * command.steering.tan() * dt / self.rear_axle_length,
            ),
        }
    }
}

/// Wrap an angle into (-pi, pi]
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * std::f64::consts::PI);
    if wrapped > std::f64::consts::PI {
        wrapped - 2.0 * std::f64::consts::PI
    } else {
        wrapped
    }
}

/// Cubic `c0 + c1 x + c2 x^2 + c3 x^3` in the vehicle frame, lowest order first
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferencePolynomial {
    pub coefficients: [f64; 4],
}

impl ReferencePolynomial {
    pub fn new(coefficients: [f64; 4]) -> Self {
        Self { coefficients }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let [c0, c1, c2, c3] = self.coefficients;
        c0 + x * (c1 + x * (c2 + x * c3))
    }

    pub fn slope(&self, x: f64) -> f64 {
        let [_, c1, c2, c3] = self.coefficients;
        c1 + x * (2.0 * c2 + 3.0 * c3 * x)
    }

    pub fn second_derivative(&self, x: f64) -> f64 {
        let [_, _, c2, c3] = self.coefficients;
        2.0 * c2 + 6.0 * c3 * x
    }

    /// Path tangent angle at `x`
    pub fn desired_heading(&self, x: f64) -> f64 {
        self.slope(x).atan()
    }

    /// `(cte, heading_error)` for a vehicle at the frame origin facing +x
    pub fn tracking_error(&self) -> (f64, f64) {
        (self.evaluate(0.0), -self.desired_heading(0.0))
    }

    /// Controller input for a vehicle at the frame origin
    pub fn local_state(&self) -> LocalState {
        let (cte, heading_error) = self.tracking_error();
        LocalState::at_origin(cte, heading_error)
    }

    pub fn is_finite(&self) -> bool {
        self.coefficients.iter().all(|c| c.is_finite())
    }

    /// Least-squares fit of order 1..=3 through `points`
    pub fn fit(points: &[(f64, f64)], order: usize) -> NavResult<Self> {
        if !(1..=3).contains(&order) {
            return Err(NavError::Configuration(format!(
                "polynomial order must be 1..=3, got {order}"
            )));
        }
        if points.len() < order + 1 {
            return Err(NavError::Configuration(format!(
                "order {order} fit needs {} points, got {}",
                order + 1,
                points.len()
            )));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(NavError::NumericalInstability(
                "non-finite point in polynomial fit".into(),
            ));
        }

        let vandermonde = DMatrix::from_fn(points.len(), order + 1, |r, c| {
            points[r].0.powi(c as i32)
        });
        let rhs = DVector::from_iterator(points.len(), points.iter().map(|p| p.1));
        let solution = vandermonde
            .svd(true, true)
            .solve(&rhs, FIT_RCOND)
            .map_err(|e| NavError::NumericalInstability(format!("polynomial fit: {e}")))?;

        let mut coefficients = [0.0; 4];
        for (c, value) in coefficients.iter_mut().zip(solution.iter()) {
            *c = *value;
        }
        let poly = Self { coefficients };
        if !poly.is_finite() {
            return Err(NavError::NumericalInstability(
                "polynomial fit produced non-finite coefficients".into(),
            ));
        }
        Ok(poly)
    }
}

/// Express world-frame points in the frame of `pose` (x forward, y left)
pub fn to_vehicle_frame(pose: &VehicleState, points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let (sin, cos) = pose.heading.sin_cos();
    points
        .iter()
        .map(|&(px, py)| {
            let dx = px - pose.x;
            let dy = py - pose.y;
            (dx * cos + dy * sin, -dx * sin + dy * cos)
        })
        .collect()
}
