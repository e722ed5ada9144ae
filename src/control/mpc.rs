//! Receding-horizon trajectory controller
//!
//! Decision vector, all of one field contiguous across the horizon:
//! `x[N] y[N] psi[N] cte[N] epsi[N] v[N-1] delta[N-1]`.
//! Constraint row `k` for `k < 5N` belongs to state variable `k`: row
//! `field + 0` pins the measured state, rows `field + t` for `t >= 1`
//! carry the bicycle-model dynamics.

use serde::{Deserialize, Serialize};

use super::augmented_lagrangian::AugmentedLagrangian;
use super::kinematics::ReferencePolynomial;
use super::nlp::{NlpProblem, NlpSolver, SparseJacobian};
use crate::config::{ControllerConfig, CostWeights, SolverConfig};
use crate::error::{NavError, NavResult};
use crate::types::{ControlCommand, LocalState};

/// Offsets of each field in the flat decision vector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HorizonLayout {
    pub steps: usize,
}

impl HorizonLayout {
    pub fn new(steps: usize) -> Self {
        Self { steps }
    }

    pub fn x(&self) -> usize {
        0
    }
    pub fn y(&self) -> usize {
        self.steps
    }
    pub fn psi(&self) -> usize {
        2 * self.steps
    }
    pub fn cte(&self) -> usize {
        3 * self.steps
    }
    pub fn epsi(&self) -> usize {
        4 * self.steps
    }
    pub fn speed(&self) -> usize {
        5 * self.steps
    }
    pub fn steering(&self) -> usize {
        self.speed() + self.steps - 1
    }

    /// `5N + 2(N - 1)`
    pub fn num_variables(&self) -> usize {
        self.steering() + self.steps - 1
    }

    pub fn num_constraints(&self) -> usize {
        5 * self.steps
    }
}

/// One horizon's nonlinear program
pub struct MpcProblem<'a> {
    layout: HorizonLayout,
    config: &'a ControllerConfig,
    state: LocalState,
    reference: ReferencePolynomial,
}

impl<'a> MpcProblem<'a> {
    /// Fails with `Configuration` for a horizon shorter than two steps or
    /// any other invalid controller setting.
    pub fn new(
        config: &'a ControllerConfig,
        state: LocalState,
        reference: ReferencePolynomial,
    ) -> NavResult<Self> {
        config.validate()?;
        Ok(Self {
            layout: HorizonLayout::new(config.horizon),
            config,
            state,
            reference,
        })
    }

    pub fn layout(&self) -> HorizonLayout {
        self.layout
    }

    fn weights(&self) -> &CostWeights {
        &self.config.weights
    }

    /// Start offsets of the five state fields, in `LocalState::as_array` order
    fn state_offsets(&self) -> [usize; 5] {
        let l = &self.layout;
        [l.x(), l.y(), l.psi(), l.cte(), l.epsi()]
    }
}

impl NlpProblem for MpcProblem<'_> {
    fn num_variables(&self) -> usize {
        self.layout.num_variables()
    }

    fn num_constraints(&self) -> usize {
        self.layout.num_constraints()
    }

    fn variable_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.layout.num_variables();
        let big = self.config.unbounded;
        let mut lower = vec![-big; n];
        let mut upper = vec![big; n];

        let v0 = self.layout.speed();
        let d0 = self.layout.steering();
        for i in v0..d0 {
            lower[i] = -self.config.speed_limit;
            upper[i] = self.config.speed_limit;
        }
        for i in d0..n {
            lower[i] = -self.config.steering_limit;
            upper[i] = self.config.steering_limit;
        }
        (lower, upper)
    }

    fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let m = self.layout.num_constraints();
        let mut lower = vec![0.0; m];
        let mut upper = vec![0.0; m];
        for (offset, value) in self.state_offsets().into_iter().zip(self.state.as_array()) {
            lower[offset] = value;
            upper[offset] = value;
        }
        (lower, upper)
    }

    fn initial_point(&self) -> Vec<f64> {
        let mut x = vec![0.0; self.layout.num_variables()];
        for (offset, value) in self.state_offsets().into_iter().zip(self.state.as_array()) {
            x[offset] = value;
        }
        x
    }

    fn objective(&self, z: &[f64]) -> f64 {
        let l = &self.layout;
        let w = self.weights();
        let n = l.steps;
        let mut cost = 0.0;

        for t in 0..n {
            cost += w.cte * z[l.cte() + t].powi(2);
            cost += w.heading_error * z[l.epsi() + t].powi(2);
        }
        for t in 0..n - 1 {
            cost += w.steering * z[l.steering() + t].powi(2);
            cost += w.speed * (z[l.speed() + t] - self.config.reference_speed).powi(2);
        }
        for t in 0..n.saturating_sub(2) {
            cost += w.steering_rate * (z[l.steering() + t + 1] - z[l.steering() + t]).powi(2);
            cost += w.speed_rate * (z[l.speed() + t + 1] - z[l.speed() + t]).powi(2);
        }
        cost
    }

    fn gradient(&self, z: &[f64], grad: &mut [f64]) {
        let l = &self.layout;
        let w = self.weights();
        let n = l.steps;
        grad.fill(0.0);

        for t in 0..n {
            grad[l.cte() + t] += 2.0 * w.cte * z[l.cte() + t];
            grad[l.epsi() + t] += 2.0 * w.heading_error * z[l.epsi() + t];
        }
        for t in 0..n - 1 {
            grad[l.steering() + t] += 2.0 * w.steering * z[l.steering() + t];
            grad[l.speed() + t] +=
                2.0 * w.speed * (z[l.speed() + t] - self.config.reference_speed);
        }
        for t in 0..n.saturating_sub(2) {
            let dd = 2.0 * w.steering_rate * (z[l.steering() + t + 1] - z[l.steering() + t]);
            grad[l.steering() + t + 1] += dd;
            grad[l.steering() + t] -= dd;

            let dv = 2.0 * w.speed_rate * (z[l.speed() + t + 1] - z[l.speed() + t]);
            grad[l.speed() + t + 1] += dv;
            grad[l.speed() + t] -= dv;
        }
    }

    fn constraints(&self, z: &[f64], g: &mut [f64]) {
        let l = &self.layout;
        let dt = self.config.timestep;
        let lr = self.config.rear_axle_length;

        for offset in self.state_offsets() {
            g[offset] = z[offset];
        }

        for t in 1..l.steps {
            let p = t - 1;
            let x0 = z[l.x() + p];
            let y0 = z[l.y() + p];
            let psi0 = z[l.psi() + p];
            let epsi0 = z[l.epsi() + p];
            let v0 = z[l.speed() + p];
            let delta0 = z[l.steering() + p];

            let f0 = self.reference.evaluate(x0);
            let psi_des0 = self.reference.desired_heading(x0);

            g[l.x() + t] = z[l.x() + t] - (x0 + v0 * psi0.cos() * dt);
            g[l.y() + t] = z[l.y() + t] - (y0 + v0 * psi0.sin() * dt);
            g[l.psi() + t] = z[l.psi() + t] - (psi0 + v0 * delta0.tan() * dt / lr);
            g[l.cte() + t] = z[l.cte() + t] - ((f0 - y0) + v0 * epsi0.sin() * dt);
            g[l.epsi() + t] = z[l.epsi() + t] - ((psi0 - psi_des0) + v0 * delta0 / lr * dt);
        }
    }

    fn jacobian(&self, z: &[f64]) -> SparseJacobian {
        let l = &self.layout;
        let dt = self.config.timestep;
        let lr = self.config.rear_axle_length;
        let mut jac = SparseJacobian::with_capacity(
            l.num_constraints(),
            l.num_variables(),
            5 + 22 * (l.steps - 1),
        );

        for offset in self.state_offsets() {
            jac.push(offset, offset, 1.0);
        }

        for t in 1..l.steps {
            let p = t - 1;
            let x0 = z[l.x() + p];
            let psi0 = z[l.psi() + p];
            let epsi0 = z[l.epsi() + p];
            let v0 = z[l.speed() + p];
            let delta0 = z[l.steering() + p];

            let slope = self.reference.slope(x0);
            let curvature = self.reference.second_derivative(x0);
            let (sin_psi, cos_psi) = psi0.sin_cos();
            let (sin_e, cos_e) = epsi0.sin_cos();
            let sec2 = 1.0 / delta0.cos().powi(2);

            let row = l.x() + t;
            jac.push(row, l.x() + t, 1.0);
            jac.push(row, l.x() + p, -1.0);
            jac.push(row, l.speed() + p, -cos_psi * dt);
            jac.push(row, l.psi() + p, v0 * sin_psi * dt);

            let row = l.y() + t;
            jac.push(row, l.y() + t, 1.0);
            jac.push(row, l.y() + p, -1.0);
            jac.push(row, l.speed() + p, -sin_psi * dt);
            jac.push(row, l.psi() + p, -v0 * cos_psi * dt);

            let row = l.psi() + t;
            jac.push(row, l.psi() + t, 1.0);
            jac.push(row, l.psi() + p, -1.0);
            jac.push(row, l.speed() + p, -delta0.tan() * dt / lr);
            jac.push(row, l.steering() + p, -v0 * sec2 * dt / lr);

            let row = l.cte() + t;
            jac.push(row, l.cte() + t, 1.0);
            jac.push(row, l.x() + p, -slope);
            jac.push(row, l.y() + p, 1.0);
            jac.push(row, l.speed() + p, -sin_e * dt);
            jac.push(row, l.epsi() + p, -v0 * cos_e * dt);

            let row = l.epsi() + t;
            jac.push(row, l.epsi() + t, 1.0);
            jac.push(row, l.psi() + p, -1.0);
            jac.push(row, l.x() + p, curvature / (1.0 + slope * slope));
            jac.push(row, l.speed() + p, -delta0 * dt / lr);
            jac.push(row, l.steering() + p, -v0 * dt / lr);
        }
        jac
    }
}

/// First actuation of the optimal plan plus the predicted path
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MpcSolution {
    pub command: ControlCommand,
    /// Predicted `(x, y)` for horizon steps `1..N`, vehicle frame
    pub predicted: Vec<(f64, f64)>,
    pub cost: f64,
    pub iterations: usize,
}

/// Stateless receding-horizon controller over a pluggable NLP backend
pub struct TrajectoryController<S: NlpSolver = AugmentedLagrangian> {
    config: ControllerConfig,
    solver: S,
}

impl TrajectoryController<AugmentedLagrangian> {
    /// Controller backed by the bundled augmented-Lagrangian solver
    pub fn with_solver_config(config: ControllerConfig, solver: SolverConfig) -> NavResult<Self> {
        Self::new(config, AugmentedLagrangian::new(solver)?)
    }
}

impl<S: NlpSolver> TrajectoryController<S> {
    pub fn new(config: ControllerConfig, solver: S) -> NavResult<Self> {
        config.validate()?;
        Ok(Self { config, solver })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn layout(&self) -> HorizonLayout {
        HorizonLayout::new(self.config.horizon)
    }

    /// Solve one horizon and return the first command.
    ///
    /// A solver failure is returned as an error, never as a stale command.
    pub fn solve(
        &self,
        state: &LocalState,
        reference: &ReferencePolynomial,
    ) -> NavResult<MpcSolution> {
        if !state.is_finite() || !reference.is_finite() {
            return Err(NavError::NumericalInstability(
                "non-finite controller input".into(),
            ));
        }

        let problem = MpcProblem::new(&self.config, *state, *reference)?;
        let solution = self.solver.solve(&problem).map_err(|e| {
            log::warn!("MPC solve failed: {e}");
            NavError::from(e)
        })?;

        let l = problem.layout();
        let steering = solution.x[l.steering()];
        let speed = solution.x[l.speed()];
        if !steering.is_finite() || !speed.is_finite() {
            return Err(NavError::NumericalInstability(
                "solver returned a non-finite command".into(),
            ));
        }

        let predicted = (1..l.steps)
            .map(|t| (solution.x[l.x() + t], solution.x[l.y() + t]))
            .collect();

        log::debug!(
            "MPC: steering {steering:.4} rad, speed {speed:.3} m/s, cost {:.4}, {} iterations",
            solution.objective,
            solution.iterations
        );

        Ok(MpcSolution {
            command: ControlCommand {
                steering: steering.clamp(-self.config.steering_limit, self.config.steering_limit),
                speed: speed.clamp(-self.config.speed_limit, self.config.speed_limit),
            },
            predicted,
            cost: solution.objective,
            iterations: solution.iterations,
        })
    }
}
