use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{NavError, NavResult};

/// Estimator tuning. Defaults reproduce the surveyed lab setup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Prediction timestep baked into the transition matrix [s]
    pub timestep: f64,
    /// Range-difference measurement noise [m]
    pub measurement_noise_std: f64,
    /// Initial guess [x, y, z, vx, vy, vz]
    pub initial_state: [f64; 6],
    /// Initial position variances [m²]
    pub initial_position_variance: [f64; 3],
    /// Initial velocity variance, applied to all axes [m²/s²]
    pub initial_velocity_variance: f64,
    /// Diagonal of the process noise added on every predict (zeros = pure A·P·Aᵀ)
    pub process_noise: [f64; 6],
    /// Advance the state mean with the transition matrix on predict
    pub propagate_state: bool,
    /// Updates with a smaller innovation variance are rejected
    pub min_innovation_variance: f64,
    /// Normalized innovation squared threshold; `None` disables gating
    pub innovation_gate: Option<f64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            timestep: 0.016,
            measurement_noise_std: 0.15,
            initial_state: [2.0, 2.6, 0.0, 0.0, 0.0, 0.0],
            initial_position_variance: [100.0 * 100.0, 100.0 * 100.0, 1.0],
            initial_velocity_variance: 0.01 * 0.01,
            process_noise: [0.0; 6],
            propagate_state: true,
            min_innovation_variance: 1e-9,
            innovation_gate: None,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> NavResult<()> {
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err(NavError::Configuration(format!(
                "estimator timestep must be positive, got {}",
                self.timestep
            )));
        }
        if !(self.measurement_noise_std.is_finite() && self.measurement_noise_std > 0.0) {
            return Err(NavError::Configuration(format!(
                "measurement noise std must be positive, got {}",
                self.measurement_noise_std
            )));
        }
        if self.initial_state.iter().any(|v| !v.is_finite()) {
            return Err(NavError::Configuration("initial state must be finite".into()));
        }
        let variances = self
            .initial_position_variance
            .iter()
            .chain(std::iter::once(&self.initial_velocity_variance))
            .chain(self.process_noise.iter());
        for v in variances {
            if !v.is_finite() || *v < 0.0 {
                return Err(NavError::Configuration(format!(
                    "variances must be finite and non-negative, got {v}"
                )));
            }
        }
        if !(self.min_innovation_variance.is_finite() && self.min_innovation_variance > 0.0) {
            return Err(NavError::Configuration(
                "min innovation variance must be positive".into(),
            ));
        }
        if let Some(gate) = self.innovation_gate {
            if !(gate.is_finite() && gate > 0.0) {
                return Err(NavError::Configuration(format!(
                    "innovation gate must be positive, got {gate}"
                )));
            }
        }
        Ok(())
    }
}

/// Surveyed anchor position
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub id: usize,
    pub position: [f64; 3],
}

/// Survey of the lab arena (meters)
pub fn default_anchor_survey() -> Vec<AnchorConfig> {
    vec![
        AnchorConfig { id: 0, position: [4.628, 0.600, 1.312] },
        AnchorConfig { id: 1, position: [4.628, 3.810, 1.297] },
        AnchorConfig { id: 2, position: [0.043, 4.210, 1.302] },
        AnchorConfig { id: 3, position: [0.123, 1.673, 1.903] },
    ]
}

/// MPC cost weights. Tracking, effort and smoothness terms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub cte: f64,
    pub heading_error: f64,
    pub steering: f64,
    pub speed: f64,
    pub steering_rate: f64,
    pub speed_rate: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            cte: 1.0,
            heading_error: 1.0,
            steering: 200.0,
            speed: 50.0,
            steering_rate: 250.0,
            speed_rate: 200.0,
        }
    }
}

impl CostWeights {
    fn as_array(&self) -> [f64; 6] {
        [
            self.cte,
            self.heading_error,
            self.steering,
            self.speed,
            self.steering_rate,
            self.speed_rate,
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of horizon steps N
    pub horizon: usize,
    /// Horizon discretization [s]
    pub timestep: f64,
    /// Rear-axle reference length of the bicycle model [m]
    pub rear_axle_length: f64,
    /// Symmetric steering bound [rad]
    pub steering_limit: f64,
    /// Symmetric speed bound [m/s]
    pub speed_limit: f64,
    /// Set point of the speed effort term [m/s]
    pub reference_speed: f64,
    /// Sentinel used as "unbounded" for state variables
    pub unbounded: f64,
    pub weights: CostWeights,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            horizon: 10,
            timestep: 0.1,
            rear_axle_length: 0.3,
            steering_limit: 0.35,
            speed_limit: 3.0,
            reference_speed: 1.0,
            unbounded: 1.0e19,
            weights: CostWeights::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> NavResult<()> {
        if self.horizon < 2 {
            return Err(NavError::Configuration(format!(
                "horizon must have at least 2 steps, got {}",
                self.horizon
            )));
        }
        let positive = [
            ("timestep", self.timestep),
            ("rear_axle_length", self.rear_axle_length),
            ("steering_limit", self.steering_limit),
            ("speed_limit", self.speed_limit),
            ("unbounded", self.unbounded),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(NavError::Configuration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.steering_limit >= std::f64::consts::FRAC_PI_2 {
            return Err(NavError::Configuration(
                "steering_limit must stay below pi/2".into(),
            ));
        }
        if !self.reference_speed.is_finite() || self.reference_speed.abs() > self.speed_limit {
            return Err(NavError::Configuration(format!(
                "reference_speed {} outside speed limit {}",
                self.reference_speed, self.speed_limit
            )));
        }
        if self.weights.as_array().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(NavError::Configuration(
                "cost weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Options for the bundled augmented-Lagrangian NLP backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Projected-gradient optimality tolerance
    pub tolerance: f64,
    /// Max-norm constraint violation tolerance
    pub constraint_tolerance: f64,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub initial_penalty: f64,
    pub max_penalty: f64,
    /// Wall-clock budget per solve [s]
    pub max_solve_time: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            constraint_tolerance: 1e-6,
            max_outer_iterations: 30,
            max_inner_iterations: 100,
            initial_penalty: 10.0,
            max_penalty: 1e8,
            max_solve_time: 0.1,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> NavResult<()> {
        let positive = [
            ("tolerance", self.tolerance),
            ("constraint_tolerance", self.constraint_tolerance),
            ("initial_penalty", self.initial_penalty),
            ("max_penalty", self.max_penalty),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(NavError::Configuration(format!(
                    "solver {name} must be positive, got {value}"
                )));
            }
        }
        if !(self.max_solve_time.is_finite() && self.max_solve_time >= 0.0) {
            return Err(NavError::Configuration(format!(
                "max_solve_time must be non-negative, got {}",
                self.max_solve_time
            )));
        }
        if self.max_outer_iterations == 0 || self.max_inner_iterations == 0 {
            return Err(NavError::Configuration(
                "solver iteration limits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    pub estimator: EstimatorConfig,
    pub anchors: Vec<AnchorConfig>,
    pub controller: ControllerConfig,
    pub solver: SolverConfig,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            anchors: default_anchor_survey(),
            controller: ControllerConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl NavConfig {
    pub fn load(path: impl AsRef<Path>) -> NavResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: NavConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> NavResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> NavResult<()> {
        self.estimator.validate()?;
        self.controller.validate()?;
        self.solver.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NavConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "controller": { "horizon": 15, "weights": { "steering": 100.0 } } }"#;
        let config: NavConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.controller.horizon, 15);
        assert_eq!(config.controller.weights.steering, 100.0);
        assert_eq!(config.controller.weights.steering_rate, 250.0);
        assert_eq!(config.estimator.measurement_noise_std, 0.15);
        assert_eq!(config.anchors.len(), 4);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("tdoa_nav_cfg_{}.json", std::process::id()));
        let mut config = NavConfig::default();
        config.estimator.innovation_gate = Some(16.0);
        config.solver.max_solve_time = 0.25;
        config.save(&path).unwrap();

        let loaded = NavConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_controller_rejected() {
        let mut config = ControllerConfig::default();
        config.horizon = 1;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.reference_speed = 5.0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.weights.steering = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_estimator_rejected() {
        let mut config = EstimatorConfig::default();
        config.measurement_noise_std = 0.0;
        assert!(config.validate().is_err());

        let mut config = EstimatorConfig::default();
        config.process_noise[2] = -1e-3;
        assert!(config.validate().is_err());
    }
}
