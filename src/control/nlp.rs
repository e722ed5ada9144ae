//! Nonlinear program capability
//!
//! `minimize f(x)` subject to `g_l <= g(x) <= g_u` and `x_l <= x <= x_u`.
//! Problems supply values and first derivatives; solvers return a
//! stationary point or a typed failure.

use nalgebra::DMatrix;
use thiserror::Error;

/// Why a solve did not produce a usable point
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("Solver exceeded its time budget after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Solver did not converge within {iterations} iterations")]
    IterationLimit { iterations: usize },

    #[error("Line search failed at iteration {iteration}")]
    LineSearchFailure { iteration: usize },

    #[error("Hessian could not be regularized")]
    IllConditioned,

    #[error("Non-finite value encountered: {0}")]
    NonFinite(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Constraint Jacobian as `(row, col, value)` triplets.
///
/// Duplicate coordinates are summed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseJacobian {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl SparseJacobian {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(rows: usize, cols: usize, nnz: usize) -> Self {
        Self {
            rows,
            cols,
            entries: Vec::with_capacity(nnz),
        }
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.rows && col < self.cols);
        self.entries.push((row, col, value));
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    /// `J * v`
    pub fn mul(&self, v: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.rows];
        for &(r, c, value) in &self.entries {
            out[r] += value * v[c];
        }
        out
    }

    /// `J^T * w`
    pub fn transpose_mul(&self, w: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.cols];
        for &(r, c, value) in &self.entries {
            out[c] += value * w[r];
        }
        out
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.cols);
        for &(r, c, value) in &self.entries {
            dense[(r, c)] += value;
        }
        dense
    }
}

/// A smooth constrained minimization problem
pub trait NlpProblem {
    fn num_variables(&self) -> usize;

    fn num_constraints(&self) -> usize;

    /// `(lower, upper)` per variable; equal entries fix a variable
    fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>);

    /// `(lower, upper)` per constraint row; equal entries make it an equality
    fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>);

    fn initial_point(&self) -> Vec<f64>;

    fn objective(&self, x: &[f64]) -> f64;

    fn gradient(&self, x: &[f64], grad: &mut [f64]);

    fn constraints(&self, x: &[f64], g: &mut [f64]);

    fn jacobian(&self, x: &[f64]) -> SparseJacobian;
}

/// Converged point plus diagnostics
#[derive(Clone, Debug)]
pub struct NlpSolution {
    pub x: Vec<f64>,
    pub objective: f64,
    /// Constraint multipliers, one per row
    pub multipliers: Vec<f64>,
    /// Max-norm violation of the constraint rows at `x`
    pub constraint_violation: f64,
    pub iterations: usize,
}

/// Anything that can solve an `NlpProblem`
pub trait NlpSolver {
    fn solve(&self, problem: &dyn NlpProblem) -> Result<NlpSolution, SolveError>;
}

/// Check a problem's reported sizes against what its methods return
pub fn check_dimensions(problem: &dyn NlpProblem) -> Result<(), SolveError> {
    let n = problem.num_variables();
    let m = problem.num_constraints();
    let (xl, xu) = problem.variable_bounds();
    let (gl, gu) = problem.constraint_bounds();
    let x0 = problem.initial_point();

    if xl.len() != n || xu.len() != n {
        return Err(SolveError::DimensionMismatch(format!(
            "variable bounds have {}/{} entries, expected {n}",
            xl.len(),
            xu.len()
        )));
    }
    if gl.len() != m || gu.len() != m {
        return Err(SolveError::DimensionMismatch(format!(
            "constraint bounds have {}/{} entries, expected {m}",
            gl.len(),
            gu.len()
        )));
    }
    if x0.len() != n {
        return Err(SolveError::DimensionMismatch(format!(
            "initial point has {} entries, expected {n}",
            x0.len()
        )));
    }
    let bounds_ok = xl.iter().zip(&xu).chain(gl.iter().zip(&gu)).all(|(l, u)| l <= u);
    if !bounds_ok {
        return Err(SolveError::DimensionMismatch(
            "a lower bound exceeds its upper bound".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_products() {
        let mut j = SparseJacobian::new(2, 3);
        j.push(0, 0, 1.0);
        j.push(0, 2, -2.0);
        j.push(1, 1, 3.0);
        j.push(1, 1, 1.0);

        assert_eq!(j.mul(&[1.0, 1.0, 1.0]), vec![-1.0, 4.0]);
        assert_eq!(j.transpose_mul(&[1.0, 2.0]), vec![1.0, 8.0, -2.0]);

        let dense = j.to_dense();
        assert_eq!(dense[(1, 1)], 4.0);
        assert_eq!(dense[(0, 2)], -2.0);
        assert_eq!(j.nnz(), 4);
    }
}
