//! Linear algebra type system for the TDOA estimator
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the constant-velocity Kalman filter, plus the ndarray boundary
//! used by the matrix setters.

use nalgebra::{RowSVector, SMatrix, SVector, Vector3};
use ndarray::{Array1, Array2};

use crate::error::{NavError, NavResult};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 6;

// ===== State Indices =====
pub const STATE_X: usize = 0;
pub const STATE_Y: usize = 1;
pub const STATE_Z: usize = 2;
pub const STATE_VX: usize = 3;
pub const STATE_VY: usize = 4;
pub const STATE_VZ: usize = 5;

// ===== Constant-Velocity Filter Types =====
pub type StateVec6 = SVector<f64, STATE_DIM>;
pub type StateMat6 = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Scalar observation Jacobian (1×6) and matching gain (6×1)
pub type ObservationRow = RowSVector<f64, STATE_DIM>;
pub type KalmanGain = SVector<f64, STATE_DIM>;

pub type Position3 = Vector3<f64>;

/// Convert a dynamically-sized ndarray matrix into a 6×6 filter matrix.
///
/// Rejects anything that is not exactly `STATE_DIM × STATE_DIM` or that
/// carries non-finite entries.
pub fn state_matrix_from_nd(array: &Array2<f64>, what: &str) -> NavResult<StateMat6> {
    let (rows, cols) = array.dim();
    if rows != STATE_DIM || cols != STATE_DIM {
        return Err(NavError::Configuration(format!(
            "{what} must be {STATE_DIM}x{STATE_DIM}, got {rows}x{cols}"
        )));
    }
    if array.iter().any(|v| !v.is_finite()) {
        return Err(NavError::Configuration(format!(
            "{what} contains non-finite entries"
        )));
    }
    Ok(StateMat6::from_fn(|r, c| array[[r, c]]))
}

pub fn state_matrix_to_nd(matrix: &StateMat6) -> Array2<f64> {
    Array2::from_shape_fn((STATE_DIM, STATE_DIM), |(r, c)| matrix[(r, c)])
}

pub fn state_vector_to_nd(vector: &StateVec6) -> Array1<f64> {
    Array1::from_iter(vector.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_nd_preserves_layout() {
        let array = Array2::from_shape_fn((6, 6), |(r, c)| (r * 10 + c) as f64);
        let m = state_matrix_from_nd(&array, "transition").unwrap();
        assert_eq!(m[(2, 5)], 25.0);
        assert_eq!(m[(5, 2)], 52.0);
        assert_eq!(state_matrix_to_nd(&m), array);
    }

    #[test]
    fn test_from_nd_rejects_wrong_shape() {
        let array = Array2::<f64>::eye(5);
        let err = state_matrix_from_nd(&array, "covariance").unwrap_err();
        assert!(err.to_string().contains("5x5"));
    }

    #[test]
    fn test_from_nd_rejects_nan() {
        let mut array = Array2::<f64>::eye(6);
        array[[1, 1]] = f64::NAN;
        assert!(state_matrix_from_nd(&array, "covariance").is_err());
    }
}
