use thiserror::Error;

use crate::control::nlp::SolveError;

/// Localization and control error types
#[derive(Error, Debug)]
pub enum NavError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Anchor {0} has no position set")]
    AnchorNotFound(usize),

    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("Measurement rejected by innovation gate (NIS {nis:.2} > {gate:.2})")]
    MeasurementRejected { nis: f64, gate: f64 },

    #[error("Control solve failed: {0}")]
    ControlSolveFailure(#[from] SolveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for estimator and controller operations
pub type NavResult<T> = Result<T, NavError>;

impl NavError {
    /// True for errors that reject a single measurement but leave the filter usable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NavError::NumericalInstability(_)
                | NavError::MeasurementRejected { .. }
                | NavError::ControlSolveFailure(_)
        )
    }
}
