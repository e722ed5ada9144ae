//! 6-Dimensional TDOA Extended Kalman Filter
//!
//! State Vector (6D, constant velocity):
//! [0-2]: Position (X, Y, Z) in the anchor frame (meters)
//! [3-5]: Velocity (Vx, Vy, Vz) (m/s)
//!
//! Observations are scalar range differences `d(other) - d(reference)`
//! between the tag and two surveyed anchors.

use nalgebra::Vector3;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::config::{AnchorConfig, EstimatorConfig};
use crate::error::{NavError, NavResult};
use crate::filters::anchors::AnchorRegistry;
use crate::shared::EstimateSnapshot;
use crate::types::{
    state_matrix_from_nd, state_matrix_to_nd, state_vector_to_nd, KalmanGain, ObservationRow,
    Position3, StateMat6, StateVec6, STATE_DIM, STATE_VX, STATE_VY, STATE_VZ, STATE_X, STATE_Y,
    STATE_Z,
};

/// Distances below this make the range-difference Jacobian undefined
const MIN_ANCHOR_DISTANCE: f64 = 1e-9;

/// Allowed asymmetry when a covariance is set from outside
const SYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TdoaEkfState {
    /// Position estimate [meters]
    pub position: (f64, f64, f64),

    /// Velocity estimate [m/s]
    pub velocity: (f64, f64, f64),

    /// Covariance trace for uncertainty
    pub covariance_trace: f64,

    /// RMS of the position standard deviations [meters]
    pub position_std: f64,

    /// Update counters
    pub tdoa_updates: u64,
    pub rejected_updates: u64,
    pub predictions: u64,
}

pub struct TdoaEkf {
    config: EstimatorConfig,

    /// State vector [6D]
    state: StateVec6,

    /// Covariance matrix [6x6]
    covariance: StateMat6,

    /// Transition matrix [6x6]
    transition: StateMat6,

    /// Process noise matrix [6x6], zero unless configured
    process_noise: StateMat6,

    anchors: AnchorRegistry,

    /// Update counters
    tdoa_updates: u64,
    rejected_updates: u64,
    predictions: u64,
}

impl TdoaEkf {
    /// Create a filter from configuration and an anchor survey
    pub fn new(config: EstimatorConfig, survey: &[AnchorConfig]) -> NavResult<Self> {
        config.validate()?;
        let anchors = AnchorRegistry::from_survey(survey)?;
        let transition = Self::constant_velocity_transition(config.timestep);
        let process_noise = StateMat6::from_diagonal(&StateVec6::from(config.process_noise));

        let mut ekf = Self {
            config,
            state: StateVec6::zeros(),
            covariance: StateMat6::zeros(),
            transition,
            process_noise,
            anchors,
            tdoa_updates: 0,
            rejected_updates: 0,
            predictions: 0,
        };
        ekf.initialize();
        Ok(ekf)
    }

    /// Reset state and covariance to the configured initial guess.
    ///
    /// Position starts with low confidence, velocity with high confidence
    /// in a near-zero initial value.
    pub fn initialize(&mut self) {
        self.state = StateVec6::from(self.config.initial_state);

        let [var_x, var_y, var_z] = self.config.initial_position_variance;
        let var_v = self.config.initial_velocity_variance;
        self.covariance =
            StateMat6::from_diagonal(&StateVec6::from([var_x, var_y, var_z, var_v, var_v, var_v]));

        self.tdoa_updates = 0;
        self.rejected_updates = 0;
        self.predictions = 0;
    }

    /// Identity with `dt` on the position/velocity coupling terms
    pub fn constant_velocity_transition(dt: f64) -> StateMat6 {
        let mut a = StateMat6::identity();
        a[(STATE_X, STATE_VX)] = dt;
        a[(STATE_Y, STATE_VY)] = dt;
        a[(STATE_Z, STATE_VZ)] = dt;
        a
    }

    /// Rebuild the default transition matrix for a new prediction timestep
    pub fn set_timestep(&mut self, dt: f64) -> NavResult<()> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(NavError::Configuration(format!(
                "timestep must be positive, got {dt}"
            )));
        }
        self.config.timestep = dt;
        self.transition = Self::constant_velocity_transition(dt);
        Ok(())
    }

    pub fn set_transition_matrix(&mut self, transition: &Array2<f64>) -> NavResult<()> {
        self.transition = state_matrix_from_nd(transition, "transition matrix")?;
        Ok(())
    }

    pub fn set_covariance_matrix(&mut self, covariance: &Array2<f64>) -> NavResult<()> {
        let p = state_matrix_from_nd(covariance, "covariance matrix")?;
        if (p - p.transpose()).amax() > SYMMETRY_TOLERANCE {
            return Err(NavError::Configuration(
                "covariance matrix must be symmetric".into(),
            ));
        }
        if p.diagonal().iter().any(|v| *v < 0.0) {
            return Err(NavError::Configuration(
                "covariance matrix has a negative variance".into(),
            ));
        }
        self.covariance = p;
        Ok(())
    }

    pub fn set_anchor_position(&mut self, id: usize, x: f64, y: f64, z: f64) -> NavResult<()> {
        self.anchors.set(id, Position3::new(x, y, z))
    }

    pub fn anchor_position(&self, id: usize) -> NavResult<Position3> {
        self.anchors.get(id)
    }

    pub fn anchors(&self) -> &AnchorRegistry {
        &self.anchors
    }

    /// Predict step: `P = A * P * A^T + Q`, optionally advancing the mean as well
    pub fn predict(&mut self) {
        if self.config.propagate_state {
            self.state = self.transition * self.state;
        }
        self.covariance =
            self.transition * self.covariance * self.transition.transpose() + self.process_noise;
        self.predictions += 1;
    }

    /// Range-difference update against a pair of anchors.
    ///
    /// Measurement equation: `diff = d(other) - d(reference)`.
    /// Returns the pre-update residual.
    pub fn scalar_range_difference_update(
        &mut self,
        reference: usize,
        other: usize,
        measured_diff: f64,
    ) -> NavResult<f64> {
        if reference == other {
            return Err(NavError::Configuration(format!(
                "range difference needs two distinct anchors, got {reference} twice"
            )));
        }
        let anchor_ref = self.anchors.get(reference)?;
        let anchor_other = self.anchors.get(other)?;

        let position = self.location();
        let to_other = position - anchor_other;
        let to_ref = position - anchor_ref;
        let d_other = to_other.norm();
        let d_ref = to_ref.norm();
        if d_other < MIN_ANCHOR_DISTANCE || d_ref < MIN_ANCHOR_DISTANCE {
            self.rejected_updates += 1;
            return Err(NavError::NumericalInstability(format!(
                "position estimate coincides with anchor {}",
                if d_ref < MIN_ANCHOR_DISTANCE { reference } else { other }
            )));
        }

        let predicted = d_other - d_ref;
        let residual = measured_diff - predicted;

        // Gradient of the range difference w.r.t. position; velocity columns stay zero
        let gradient = to_other / d_other - to_ref / d_ref;
        let mut h = ObservationRow::zeros();
        h[STATE_X] = gradient.x;
        h[STATE_Y] = gradient.y;
        h[STATE_Z] = gradient.z;

        self.scalar_update(&h, residual, self.config.measurement_noise_std)?;
        Ok(residual)
    }

    /// Generic scalar Kalman update, independent of the measurement model.
    ///
    /// Rejected updates leave state and covariance untouched.
    pub fn scalar_update(
        &mut self,
        h: &ObservationRow,
        residual: f64,
        noise_std: f64,
    ) -> NavResult<()> {
        if !residual.is_finite() || !noise_std.is_finite() || h.iter().any(|v| !v.is_finite()) {
            self.rejected_updates += 1;
            return Err(NavError::NumericalInstability(
                "non-finite measurement input".into(),
            ));
        }

        // Innovation variance: S = H * P * H^T + R
        let ph_t: KalmanGain = self.covariance * h.transpose();
        let innovation_var = (h * ph_t)[0] + noise_std * noise_std;
        if !innovation_var.is_finite() || innovation_var < self.config.min_innovation_variance {
            self.rejected_updates += 1;
            log::warn!(
                "rejecting TDOA update: innovation variance {:e} below floor {:e}",
                innovation_var,
                self.config.min_innovation_variance
            );
            return Err(NavError::NumericalInstability(format!(
                "innovation variance {innovation_var:e} below {:e}",
                self.config.min_innovation_variance
            )));
        }

        if let Some(gate) = self.config.innovation_gate {
            let nis = residual * residual / innovation_var;
            if nis > gate {
                self.rejected_updates += 1;
                log::debug!("gating TDOA update: NIS {nis:.2} > {gate:.2}");
                return Err(NavError::MeasurementRejected { nis, gate });
            }
        }

        // Kalman gain: K = P * H^T / S
        let k: KalmanGain = ph_t / innovation_var;

        // State update: x += K * residual
        self.state += k * residual;

        // Covariance update: P = (I - K*H) * P
        let i_minus_kh = StateMat6::identity() - k * h;
        self.covariance = i_minus_kh * self.covariance;

        // Force symmetry
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;

        self.tdoa_updates += 1;
        Ok(())
    }

    /// Current position estimate
    pub fn location(&self) -> Position3 {
        Vector3::new(self.state[STATE_X], self.state[STATE_Y], self.state[STATE_Z])
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(
            self.state[STATE_VX],
            self.state[STATE_VY],
            self.state[STATE_VZ],
        )
    }

    pub fn state(&self) -> &StateVec6 {
        &self.state
    }

    pub fn covariance(&self) -> &StateMat6 {
        &self.covariance
    }

    pub fn transition_matrix(&self) -> &StateMat6 {
        &self.transition
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Get current state snapshot
    pub fn get_state(&self) -> TdoaEkfState {
        let pos = self.location();
        let vel = self.velocity();
        let pos_var = self.covariance[(STATE_X, STATE_X)]
            + self.covariance[(STATE_Y, STATE_Y)]
            + self.covariance[(STATE_Z, STATE_Z)];
        TdoaEkfState {
            position: (pos.x, pos.y, pos.z),
            velocity: (vel.x, vel.y, vel.z),
            covariance_trace: self.covariance.trace(),
            position_std: (pos_var.max(0.0) / 3.0).sqrt(),
            tdoa_updates: self.tdoa_updates,
            rejected_updates: self.rejected_updates,
            predictions: self.predictions,
        }
    }

    /// State and covariance as ndarray copies
    pub fn export_state(&self) -> (Array1<f64>, Array2<f64>) {
        (
            state_vector_to_nd(&self.state),
            state_matrix_to_nd(&self.covariance),
        )
    }

    /// Copyable state/covariance pair for publishing to other loops
    pub fn snapshot(&self, timestamp: f64) -> EstimateSnapshot {
        let mut covariance = [[0.0; STATE_DIM]; STATE_DIM];
        for (r, row) in covariance.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = self.covariance[(r, c)];
            }
        }
        EstimateSnapshot {
            timestamp,
            sequence: self.predictions,
            state: self.state.into(),
            covariance,
        }
    }
}

impl Default for TdoaEkf {
    fn default() -> Self {
        let config = EstimatorConfig::default();
        let transition = Self::constant_velocity_transition(config.timestep);
        let mut ekf = Self {
            config,
            state: StateVec6::zeros(),
            covariance: StateMat6::zeros(),
            transition,
            process_noise: StateMat6::zeros(),
            anchors: AnchorRegistry::default(),
            tdoa_updates: 0,
            rejected_updates: 0,
            predictions: 0,
        };
        ekf.initialize();
        ekf
    }
}
