//! Bundled NLP backend: augmented Lagrangian outer loop with a
//! projected-Newton inner loop over the box bounds.
//!
//! Inequality rows get a slack variable bounded by the row's limits, so
//! every row becomes an equality `h(z) = 0`. Box bounds are never
//! penalized, they are kept by projection.

use nalgebra::{Cholesky, DMatrix, DVector};
use std::time::{Duration, Instant};

use super::nlp::{check_dimensions, NlpProblem, NlpSolution, NlpSolver, SolveError};
use crate::config::SolverConfig;
use crate::error::NavResult;

/// Variables within this distance of a bound count as sitting on it
const ACTIVE_EPS: f64 = 1e-10;
const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;
const FD_STEP: f64 = 1e-6;
const MIN_REGULARIZATION: f64 = 1e-8;
const MAX_REGULARIZATION: f64 = 1e12;

pub struct AugmentedLagrangian {
    options: SolverConfig,
}

impl AugmentedLagrangian {
    pub fn new(options: SolverConfig) -> NavResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }
}

impl Default for AugmentedLagrangian {
    fn default() -> Self {
        Self {
            options: SolverConfig::default(),
        }
    }
}

/// Problem rewritten over `z = [x, s]` with all rows as equalities
struct Reformulated<'a> {
    problem: &'a dyn NlpProblem,
    n: usize,
    m: usize,
    /// Slack column for each row, `None` for equality rows
    slack_of_row: Vec<Option<usize>>,
    /// Right-hand side of equality rows
    target: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl<'a> Reformulated<'a> {
    fn new(problem: &'a dyn NlpProblem) -> Self {
        let n = problem.num_variables();
        let m = problem.num_constraints();
        let (mut lower, mut upper) = problem.variable_bounds();
        let (gl, gu) = problem.constraint_bounds();

        let mut slack_of_row = vec![None; m];
        for row in 0..m {
            if gl[row] < gu[row] {
                slack_of_row[row] = Some(lower.len());
                lower.push(gl[row]);
                upper.push(gu[row]);
            }
        }

        Self {
            problem,
            n,
            m,
            slack_of_row,
            target: gl,
            lower,
            upper,
        }
    }

    fn dim(&self) -> usize {
        self.lower.len()
    }

    fn project(&self, z: &mut [f64]) {
        for (j, v) in z.iter_mut().enumerate() {
            *v = v.clamp(self.lower[j], self.upper[j]);
        }
    }

    fn initial_point(&self) -> Vec<f64> {
        let mut z = self.problem.initial_point();
        let mut g = vec![0.0; self.m];
        self.problem.constraints(&z, &mut g);
        z.resize(self.dim(), 0.0);
        for (row, slack) in self.slack_of_row.iter().enumerate() {
            if let Some(col) = *slack {
                z[col] = g[row];
            }
        }
        self.project(&mut z);
        z
    }

    fn residuals(&self, z: &[f64]) -> Vec<f64> {
        let mut h = vec![0.0; self.m];
        self.problem.constraints(&z[..self.n], &mut h);
        for (row, value) in h.iter_mut().enumerate() {
            *value -= match self.slack_of_row[row] {
                Some(col) => z[col],
                None => self.target[row],
            };
        }
        h
    }

    /// `f + lambda^T h + rho/2 |h|^2`
    fn merit(&self, z: &[f64], lambda: &[f64], rho: f64) -> f64 {
        let h = self.residuals(z);
        let penalty: f64 = h
            .iter()
            .zip(lambda)
            .map(|(hi, li)| li * hi + 0.5 * rho * hi * hi)
            .sum();
        self.problem.objective(&z[..self.n]) + penalty
    }

    fn merit_gradient(&self, z: &[f64], lambda: &[f64], rho: f64) -> Vec<f64> {
        let h = self.residuals(z);
        let weights: Vec<f64> = h
            .iter()
            .zip(lambda)
            .map(|(hi, li)| li + rho * hi)
            .collect();

        let mut grad = vec![0.0; self.dim()];
        self.problem.gradient(&z[..self.n], &mut grad[..self.n]);
        if self.m > 0 {
            let jt_w = self.problem.jacobian(&z[..self.n]).transpose_mul(&weights);
            for (g, v) in grad.iter_mut().zip(jt_w) {
                *g += v;
            }
        }
        for (row, slack) in self.slack_of_row.iter().enumerate() {
            if let Some(col) = *slack {
                grad[col] -= weights[row];
            }
        }
        grad
    }

    /// Max-norm of `z - P(z - grad)`
    fn projected_gradient_norm(&self, z: &[f64], grad: &[f64]) -> f64 {
        z.iter()
            .zip(grad)
            .enumerate()
            .map(|(j, (zj, gj))| (zj - (zj - gj).clamp(self.lower[j], self.upper[j])).abs())
            .fold(0.0, f64::max)
    }

    fn free_set(&self, z: &[f64], grad: &[f64]) -> Vec<usize> {
        (0..self.dim())
            .filter(|&j| {
                let fixed = self.lower[j] == self.upper[j];
                let pinned_low = z[j] <= self.lower[j] + ACTIVE_EPS && grad[j] > 0.0;
                let pinned_high = z[j] >= self.upper[j] - ACTIVE_EPS && grad[j] < 0.0;
                !(fixed || pinned_low || pinned_high)
            })
            .collect()
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

impl AugmentedLagrangian {
    fn check_deadline(&self, start: Instant, deadline: Instant) -> Result<(), SolveError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(SolveError::Timeout {
                elapsed_ms: now.duration_since(start).as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Forward-difference Hessian of the merit gradient over the free set
    fn reduced_hessian(
        &self,
        rf: &Reformulated,
        z: &[f64],
        grad: &[f64],
        free: &[usize],
        lambda: &[f64],
        rho: f64,
    ) -> DMatrix<f64> {
        let k = free.len();
        let mut hess = DMatrix::zeros(k, k);
        let mut nudged = z.to_vec();
        for (col, &j) in free.iter().enumerate() {
            let step = FD_STEP * z[j].abs().max(1.0);
            nudged[j] = z[j] + step;
            let shifted = rf.merit_gradient(&nudged, lambda, rho);
            nudged[j] = z[j];
            for (row, &i) in free.iter().enumerate() {
                hess[(row, col)] = (shifted[i] - grad[i]) / step;
            }
        }
        (&hess + hess.transpose()) * 0.5
    }

    /// Cholesky of `H + mu I`, raising `mu` until it succeeds
    fn regularized_cholesky(hess: DMatrix<f64>) -> Result<Cholesky<f64, nalgebra::Dyn>, SolveError> {
        if let Some(chol) = Cholesky::new(hess.clone()) {
            return Ok(chol);
        }
        let k = hess.nrows();
        let mut mu = MIN_REGULARIZATION;
        while mu <= MAX_REGULARIZATION {
            let shifted = &hess + DMatrix::identity(k, k) * mu;
            if let Some(chol) = Cholesky::new(shifted) {
                return Ok(chol);
            }
            mu *= 10.0;
        }
        Err(SolveError::IllConditioned)
    }

    /// Minimize the merit function over the box to projected-gradient tolerance `omega`
    #[allow(clippy::too_many_arguments)]
    fn minimize_merit(
        &self,
        rf: &Reformulated,
        z: &mut [f64],
        lambda: &[f64],
        rho: f64,
        omega: f64,
        start: Instant,
        deadline: Instant,
        outer: usize,
    ) -> Result<(), SolveError> {
        for _ in 0..self.options.max_inner_iterations {
            self.check_deadline(start, deadline)?;

            let grad = rf.merit_gradient(z, lambda, rho);
            if grad.iter().any(|g| !g.is_finite()) {
                return Err(SolveError::NonFinite("merit gradient".into()));
            }
            if rf.projected_gradient_norm(z, &grad) <= omega {
                return Ok(());
            }

            let free = rf.free_set(z, &grad);
            if free.is_empty() {
                return Ok(());
            }

            let hess = self.reduced_hessian(rf, z, &grad, &free, lambda, rho);
            let chol = Self::regularized_cholesky(hess)?;
            let g_free = DVector::from_iterator(free.len(), free.iter().map(|&j| grad[j]));
            let d_free = -chol.solve(&g_free);

            let merit0 = rf.merit(z, lambda, rho);
            if !merit0.is_finite() {
                return Err(SolveError::NonFinite("merit value".into()));
            }

            // Projected Armijo backtracking
            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let mut trial = z.to_vec();
                for (k, &j) in free.iter().enumerate() {
                    trial[j] += alpha * d_free[k];
                }
                rf.project(&mut trial);

                let decrease: f64 = grad
                    .iter()
                    .zip(trial.iter().zip(z.iter()))
                    .map(|(g, (t, c))| g * (t - c))
                    .sum();
                let merit = rf.merit(&trial, lambda, rho);
                if merit.is_finite() && merit <= merit0 + ARMIJO_C1 * decrease {
                    accepted = Some(trial);
                    break;
                }
                alpha *= 0.5;
            }

            match accepted {
                Some(trial) => z.copy_from_slice(&trial),
                None => return Err(SolveError::LineSearchFailure { iteration: outer }),
            }
        }
        Ok(())
    }
}

impl NlpSolver for AugmentedLagrangian {
    fn solve(&self, problem: &dyn NlpProblem) -> Result<NlpSolution, SolveError> {
        check_dimensions(problem)?;
        let start = Instant::now();
        let deadline = start + Duration::from_secs_f64(self.options.max_solve_time);

        let rf = Reformulated::new(problem);
        let mut z = rf.initial_point();
        let mut lambda = vec![0.0; rf.m];
        let mut rho = self.options.initial_penalty;
        let mut previous_violation = f64::INFINITY;

        for outer in 0..self.options.max_outer_iterations {
            let omega = self.options.tolerance.max(0.1f64.powi(outer as i32 + 1));
            self.minimize_merit(&rf, &mut z, &lambda, rho, omega, start, deadline, outer)?;

            let h = rf.residuals(&z);
            let violation = max_abs(&h);
            if !violation.is_finite() {
                return Err(SolveError::NonFinite("constraint residual".into()));
            }
            for (l, hi) in lambda.iter_mut().zip(&h) {
                *l += rho * hi;
            }

            let grad = rf.merit_gradient(&z, &lambda, rho);
            let stationarity = rf.projected_gradient_norm(&z, &grad);
            log::debug!(
                "AL outer {outer}: violation {violation:.3e}, stationarity {stationarity:.3e}, rho {rho:.1e}"
            );

            if violation <= self.options.constraint_tolerance
                && stationarity <= 10.0 * self.options.tolerance
            {
                let x = z[..rf.n].to_vec();
                return Ok(NlpSolution {
                    objective: problem.objective(&x),
                    x,
                    multipliers: lambda,
                    constraint_violation: violation,
                    iterations: outer + 1,
                });
            }

            if violation > 0.25 * previous_violation {
                rho = (rho * 10.0).min(self.options.max_penalty);
            }
            previous_violation = violation;
        }

        Err(SolveError::IterationLimit {
            iterations: self.options.max_outer_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::nlp::SparseJacobian;
    use approx::assert_abs_diff_eq;

    const INF: f64 = 1e19;

    fn solver() -> AugmentedLagrangian {
        AugmentedLagrangian::new(SolverConfig {
            max_solve_time: 10.0,
            ..SolverConfig::default()
        })
        .unwrap()
    }

    /// min (x-1)^2 + (y-2)^2  s.t.  x + y = 1
    struct LinearEquality;

    impl NlpProblem for LinearEquality {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            1
        }
        fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-INF; 2], vec![INF; 2])
        }
        fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![1.0], vec![1.0])
        }
        fn initial_point(&self) -> Vec<f64> {
            vec![0.0, 0.0]
        }
        fn objective(&self, x: &[f64]) -> f64 {
            (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2)
        }
        fn gradient(&self, x: &[f64], grad: &mut [f64]) {
            grad[0] = 2.0 * (x[0] - 1.0);
            grad[1] = 2.0 * (x[1] - 2.0);
        }
        fn constraints(&self, x: &[f64], g: &mut [f64]) {
            g[0] = x[0] + x[1];
        }
        fn jacobian(&self, _x: &[f64]) -> SparseJacobian {
            let mut j = SparseJacobian::new(1, 2);
            j.push(0, 0, 1.0);
            j.push(0, 1, 1.0);
            j
        }
    }

    /// min x^2 + y^2  s.t.  x + y >= 2
    struct HalfPlane;

    impl NlpProblem for HalfPlane {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            1
        }
        fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-INF; 2], vec![INF; 2])
        }
        fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![2.0], vec![INF])
        }
        fn initial_point(&self) -> Vec<f64> {
            vec![0.0, 0.0]
        }
        fn objective(&self, x: &[f64]) -> f64 {
            x[0] * x[0] + x[1] * x[1]
        }
        fn gradient(&self, x: &[f64], grad: &mut [f64]) {
            grad[0] = 2.0 * x[0];
            grad[1] = 2.0 * x[1];
        }
        fn constraints(&self, x: &[f64], g: &mut [f64]) {
            g[0] = x[0] + x[1];
        }
        fn jacobian(&self, _x: &[f64]) -> SparseJacobian {
            let mut j = SparseJacobian::new(1, 2);
            j.push(0, 0, 1.0);
            j.push(0, 1, 1.0);
            j
        }
    }

    /// min (x-3)^2  s.t.  -1 <= x <= 1
    struct BoxOnly;

    impl NlpProblem for BoxOnly {
        fn num_variables(&self) -> usize {
            1
        }
        fn num_constraints(&self) -> usize {
            0
        }
        fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-1.0], vec![1.0])
        }
        fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![], vec![])
        }
        fn initial_point(&self) -> Vec<f64> {
            vec![0.0]
        }
        fn objective(&self, x: &[f64]) -> f64 {
            (x[0] - 3.0).powi(2)
        }
        fn gradient(&self, x: &[f64], grad: &mut [f64]) {
            grad[0] = 2.0 * (x[0] - 3.0);
        }
        fn constraints(&self, _x: &[f64], _g: &mut [f64]) {}
        fn jacobian(&self, _x: &[f64]) -> SparseJacobian {
            SparseJacobian::new(0, 1)
        }
    }

    /// min x + y  s.t.  x^2 + y^2 = 2
    struct Circle;

    impl NlpProblem for Circle {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            1
        }
        fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-INF; 2], vec![INF; 2])
        }
        fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![2.0], vec![2.0])
        }
        fn initial_point(&self) -> Vec<f64> {
            vec![-1.2, -0.8]
        }
        fn objective(&self, x: &[f64]) -> f64 {
            x[0] + x[1]
        }
        fn gradient(&self, _x: &[f64], grad: &mut [f64]) {
            grad[0] = 1.0;
            grad[1] = 1.0;
        }
        fn constraints(&self, x: &[f64], g: &mut [f64]) {
            g[0] = x[0] * x[0] + x[1] * x[1];
        }
        fn jacobian(&self, x: &[f64]) -> SparseJacobian {
            let mut j = SparseJacobian::new(1, 2);
            j.push(0, 0, 2.0 * x[0]);
            j.push(0, 1, 2.0 * x[1]);
            j
        }
    }

    /// Reports three variables but starts from a two-element point
    struct BadInitialPoint;

    impl NlpProblem for BadInitialPoint {
        fn num_variables(&self) -> usize {
            3
        }
        fn num_constraints(&self) -> usize {
            0
        }
        fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![-1.0; 3], vec![1.0; 3])
        }
        fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
            (vec![], vec![])
        }
        fn initial_point(&self) -> Vec<f64> {
            vec![0.0; 2]
        }
        fn objective(&self, _x: &[f64]) -> f64 {
            0.0
        }
        fn gradient(&self, _x: &[f64], _grad: &mut [f64]) {}
        fn constraints(&self, _x: &[f64], _g: &mut [f64]) {}
        fn jacobian(&self, _x: &[f64]) -> SparseJacobian {
            SparseJacobian::new(0, 3)
        }
    }

    #[test]
    fn test_linear_equality() {
        let sol = solver().solve(&LinearEquality).unwrap();
        assert_abs_diff_eq!(sol.x[0], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.x[1], 1.0, epsilon = 1e-5);
        assert!(sol.constraint_violation <= 1e-6);
        // Stationarity: 2(x-1) + lambda = 0
        assert_abs_diff_eq!(sol.multipliers[0], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_inequality_becomes_active() {
        let sol = solver().solve(&HalfPlane).unwrap();
        assert_abs_diff_eq!(sol.x[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.x[1], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(sol.objective, 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_bound_constrained_minimum() {
        let sol = solver().solve(&BoxOnly).unwrap();
        assert_eq!(sol.x[0], 1.0);
        assert!(sol.multipliers.is_empty());
    }

    #[test]
    fn test_nonlinear_equality() {
        let sol = solver().solve(&Circle).unwrap();
        assert_abs_diff_eq!(sol.x[0], -1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(sol.x[1], -1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_deadline_times_out() {
        let solver = AugmentedLagrangian::new(SolverConfig {
            max_solve_time: 0.0,
            ..SolverConfig::default()
        })
        .unwrap();
        assert!(matches!(
            solver.solve(&LinearEquality),
            Err(SolveError::Timeout { .. })
        ));
    }

    #[test]
    fn test_iteration_limit() {
        let solver = AugmentedLagrangian::new(SolverConfig {
            max_outer_iterations: 1,
            max_solve_time: 10.0,
            ..SolverConfig::default()
        })
        .unwrap();
        assert_eq!(
            solver.solve(&LinearEquality).unwrap_err(),
            SolveError::IterationLimit { iterations: 1 }
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        assert!(matches!(
            solver().solve(&BadInitialPoint),
            Err(SolveError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = SolverConfig {
            tolerance: 0.0,
            ..SolverConfig::default()
        };
        assert!(AugmentedLagrangian::new(options).is_err());
    }
}
