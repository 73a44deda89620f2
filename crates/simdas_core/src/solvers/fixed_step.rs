use super::base::{cancelled, interruptible, unknown_parameter, Solver, SolverConfig, SolverCore};
use super::{ProgressCallback, SolverKind};
use crate::control::RunControl;
use crate::error::SolverError;
use crate::numerics::{fd_increment, l2_norm, solve_linear_system, JacobianProbe, Perturbation};
use crate::solution::Solution;
use crate::traits::DaeSystem;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// One step of a fixed-step scheme.
///
/// On entry `y`/`y_prime` hold a consistent point at `t`; on return they must hold the
/// consistent point at `t + dt`.
pub trait FixedStepMethod: Send {
    const KIND: SolverKind;

    fn new(dim: usize) -> Self;

    fn step(
        &mut self,
        core: &SolverCore,
        t: f64,
        dt: f64,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<(), SolverError>;
}

/// Shared driver for fixed-step schemes: `intervals` equal steps from `start_time` to exactly
/// `end_time`, logging `intervals + 1` points.
pub struct FixedStepSolver<M> {
    core: SolverCore,
    method: M,
}

pub type ExplicitEuler = FixedStepSolver<ExplicitEulerMethod>;
pub type ImplicitEuler = FixedStepSolver<ImplicitEulerMethod>;
pub type RungeKutta4 = FixedStepSolver<RK4>;

impl<M: FixedStepMethod> FixedStepSolver<M> {
    pub fn new(system: Arc<dyn DaeSystem>, config: SolverConfig) -> Self {
        let dim = system.dimension();
        Self {
            core: SolverCore::new(system, config),
            method: M::new(dim),
        }
    }

    pub fn algebraic(&self) -> &[bool] {
        &self.core.algebraic
    }
}

impl<M: FixedStepMethod> Solver for FixedStepSolver<M> {
    fn kind(&self) -> SolverKind {
        M::KIND
    }

    fn config(&self) -> &SolverConfig {
        &self.core.config
    }

    fn set_config(&mut self, config: SolverConfig) {
        self.core.set_config(config);
    }

    fn initialize(&mut self, parameters: &HashMap<String, f64>) -> Result<(), SolverError> {
        for (key, &value) in parameters {
            if !self.core.apply_newton_parameter(key, value)? {
                return Err(unknown_parameter(self.name(), key));
            }
        }
        self.core.prepare()?;
        self.method = M::new(self.core.system.dimension());
        Ok(())
    }

    #[instrument(skip_all, fields(solver = M::KIND.name()))]
    fn solve(&mut self, control: &RunControl) -> Result<Solution, SolverError> {
        self.core.ensure_initialized()?;
        let SolverConfig {
            intervals,
            start_time,
            end_time,
            ref initial_state,
        } = self.core.config;
        let dt = (end_time - start_time) / intervals as f64;
        let mut y = initial_state.clone();
        let mut y_prime = vec![0.0; y.len()];
        let mut solution = Solution::with_capacity(intervals + 1);

        info!(intervals, dt, "starting fixed-step integration");
        if interruptible(self.core.consistent_start(&mut y, &mut y_prime, control))?.is_none() {
            return Ok(cancelled(solution));
        }
        solution.log_step(start_time, &y, &y_prime);

        let mut t = start_time;
        for k in 1..=intervals {
            if control.checkpoint().is_err() {
                info!(t, "integration cancelled");
                return Ok(cancelled(solution));
            }

            let t_next = if k == intervals {
                end_time
            } else {
                start_time + k as f64 * dt
            };
            let h = t_next - t;
            let stepped = self
                .method
                .step(&self.core, t, h, &mut y, &mut y_prime, control)
                .map_err(|err| {
                    error!(t, %err, "step failed");
                    err
                });
            if interruptible(stepped)?.is_none() {
                info!(t, "integration cancelled");
                return Ok(cancelled(solution));
            }

            t = t_next;
            solution.log_step(t, &y, &y_prime);
            self.core
                .report(t, format!("Time: {t:.3}/{end_time:.3}, Step size: {h:.3e}"));
        }

        Ok(solution)
    }

    fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.core.set_progress_callback(callback);
    }

    fn cleanup(&mut self) {
        self.core.reset();
        self.method = M::new(0);
    }
}

/// Resolves algebraic states and derivatives at the end of an explicit step.
fn finish_explicit_step(
    core: &SolverCore,
    t: f64,
    y: &mut [f64],
    y_prime: &mut [f64],
    control: &RunControl,
) -> Result<(), SolverError> {
    core.resolve_algebraic(t, y, y_prime, control)?;
    core.resolve_derivatives(t, y, y_prime, control)?;
    Ok(())
}

/// `y_{n+1} = y_n + Δt·y'_n` on differential variables.
pub struct ExplicitEulerMethod;

impl FixedStepMethod for ExplicitEulerMethod {
    const KIND: SolverKind = SolverKind::ExplicitEuler;

    fn new(_dim: usize) -> Self {
        Self
    }

    fn step(
        &mut self,
        core: &SolverCore,
        t: f64,
        dt: f64,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<(), SolverError> {
        for ((value, &rate), &algebraic) in y.iter_mut().zip(y_prime.iter()).zip(&core.algebraic) {
            if !algebraic {
                *value += dt * rate;
            }
        }
        finish_explicit_step(core, t + dt, y, y_prime, control)
    }
}

/// Backward Euler: Newton on `F(t+Δt, y, (y − y_n)/Δt) = 0` from an explicit predictor.
pub struct ImplicitEulerMethod {
    previous: Vec<f64>,
    rates: Vec<f64>,
}

impl FixedStepMethod for ImplicitEulerMethod {
    const KIND: SolverKind = SolverKind::ImplicitEuler;

    fn new(dim: usize) -> Self {
        Self {
            previous: vec![0.0; dim],
            rates: vec![0.0; dim],
        }
    }

    fn step(
        &mut self,
        core: &SolverCore,
        t: f64,
        dt: f64,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<(), SolverError> {
        let system = core.system.as_ref();
        let t_next = t + dt;
        self.previous.clear();
        self.previous.extend_from_slice(y);
        for ((value, &rate), &algebraic) in y.iter_mut().zip(y_prime.iter()).zip(&core.algebraic) {
            if !algebraic {
                *value += dt * rate;
            }
        }

        let columns: Vec<usize> = (0..y.len()).collect();
        let mut converged = false;
        let mut norm = f64::INFINITY;
        for iteration in 0..=core.newton.max_iterations {
            for ((rate, &value), &previous) in self.rates.iter_mut().zip(y.iter()).zip(&self.previous) {
                *rate = (value - previous) / dt;
            }
            let residual = system.evaluate(t_next, y, &self.rates)?;
            norm = l2_norm(&residual);
            if norm < core.newton.tolerance {
                converged = true;
                break;
            }
            if iteration == core.newton.max_iterations {
                break;
            }
            control.ensure_active()?;

            let increments: Vec<f64> = y.iter().map(|&v| fd_increment(v, 1.0)).collect();
            let jacobian = JacobianProbe::new(system, t_next, y, &self.rates)
                .with_control(control)
                .columns(
                    &residual,
                    &columns,
                    Perturbation::Combined {
                        derivative_weight: 1.0 / dt,
                    },
                    &increments,
                    None,
                )?;
            let rhs: Vec<f64> = residual.iter().map(|r| -r).collect();
            let Ok(delta) = solve_linear_system(jacobian, &rhs) else {
                warn!(t = t_next, "singular iteration matrix in implicit Euler step");
                break;
            };
            for (value, d) in y.iter_mut().zip(delta) {
                *value += d;
            }
        }
        if !converged {
            warn!(t = t_next, residual = norm, "implicit Euler Newton did not converge; accepting step");
        }

        for (((rate, &value), &previous), &algebraic) in y_prime
            .iter_mut()
            .zip(y.iter())
            .zip(&self.previous)
            .zip(&core.algebraic)
        {
            *rate = if algebraic { 0.0 } else { (value - previous) / dt };
        }
        Ok(())
    }
}

/// Classic Runge-Kutta 4th order on the differential variables; algebraic variables are held
/// through the stages.
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    /// Sets `tmp = y + scale·k` on differential variables and solves for the stage derivative
    /// at `(t, tmp)`, starting from `k` as the guess.
    #[allow(clippy::too_many_arguments)]
    fn stage(
        core: &SolverCore,
        t: f64,
        scale: f64,
        y: &[f64],
        k: &[f64],
        tmp: &mut [f64],
        out: &mut [f64],
        control: &RunControl,
    ) -> Result<(), SolverError> {
        for i in 0..y.len() {
            tmp[i] = if core.algebraic[i] {
                y[i]
            } else {
                y[i] + scale * k[i]
            };
        }
        out.copy_from_slice(k);
        core.resolve_derivatives(t, tmp, out, control)?;
        Ok(())
    }
}

impl FixedStepMethod for RK4 {
    const KIND: SolverKind = SolverKind::RungeKutta4;

    fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    fn step(
        &mut self,
        core: &SolverCore,
        t: f64,
        dt: f64,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<(), SolverError> {
        let half = 0.5 * dt;

        // k1 = y'(t, y)
        self.k1.copy_from_slice(y_prime);
        // k2 = y'(t + dt/2, y + dt*k1/2)
        Self::stage(core, t + half, half, y, &self.k1, &mut self.tmp, &mut self.k2, control)?;
        // k3 = y'(t + dt/2, y + dt*k2/2)
        Self::stage(core, t + half, half, y, &self.k2, &mut self.tmp, &mut self.k3, control)?;
        // k4 = y'(t + dt, y + dt*k3)
        Self::stage(core, t + dt, dt, y, &self.k3, &mut self.tmp, &mut self.k4, control)?;

        for i in 0..y.len() {
            if !core.algebraic[i] {
                y[i] += dt * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]) / 6.0;
            }
        }
        finish_explicit_step(core, t + dt, y, y_prime, control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solution::Termination;
    use crate::traits::FnResidual;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    fn decay() -> Arc<dyn DaeSystem> {
        Arc::new(FnResidual::new(
            1,
            |_t, y: &[f64], yp: &[f64], out: &mut [f64]| out[0] = yp[0] + y[0],
        ))
    }

    fn run<S: Solver>(mut solver: S) -> Solution {
        solver.initialize(&HashMap::new()).unwrap();
        solver.solve(&RunControl::new()).unwrap()
    }

    #[test]
    fn explicit_euler_matches_closed_form() {
        let config = SolverConfig::new(0.0, 1.0, 4, vec![1.0]);
        let solution = run(ExplicitEuler::new(decay(), config));
        assert_eq!(solution.len(), 5);
        assert_relative_eq!(solution.states[4][0], 0.75f64.powi(4), epsilon = 1e-5);
        assert_relative_eq!(solution.derivatives[0][0], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn implicit_euler_matches_closed_form() {
        let config = SolverConfig::new(0.0, 1.0, 4, vec![1.0]);
        let solution = run(ImplicitEuler::new(decay(), config));
        assert_eq!(solution.len(), 5);
        assert_relative_eq!(solution.states[4][0], 0.8f64.powi(4), epsilon = 1e-5);
        assert_eq!(solution.final_time(), Some(1.0));
    }

    #[test]
    fn rk4_is_fourth_order_accurate() {
        let config = SolverConfig::new(0.0, 1.0, 10, vec![1.0]);
        let solution = run(RungeKutta4::new(decay(), config));
        assert_relative_eq!(solution.states[10][0], (-1.0f64).exp(), epsilon = 1e-5);
    }

    #[test]
    fn algebraic_variables_track_their_constraint() {
        // x' = -x, z = 2x
        let system: Arc<dyn DaeSystem> = Arc::new(FnResidual::new(
            2,
            |_t, y: &[f64], yp: &[f64], out: &mut [f64]| {
                out[0] = yp[0] + y[0];
                out[1] = y[1] - 2.0 * y[0];
            },
        ));
        let config = SolverConfig::new(0.0, 1.0, 20, vec![1.0, 0.0]);
        let solvers: Vec<Box<dyn Solver>> = vec![
            Box::new(ExplicitEuler::new(system.clone(), config.clone())),
            Box::new(ImplicitEuler::new(system.clone(), config.clone())),
            Box::new(RungeKutta4::new(system, config)),
        ];
        for mut solver in solvers {
            solver.initialize(&HashMap::new()).unwrap();
            let solution = solver.solve(&RunControl::new()).unwrap();
            for state in &solution.states {
                assert_relative_eq!(state[1], 2.0 * state[0], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn reports_progress_every_step() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut solver = ExplicitEuler::new(decay(), SolverConfig::new(0.0, 2.0, 4, vec![1.0]));
        let sink = events.clone();
        solver.set_progress_callback(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        run(solver);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].status, "Time: 0.500/2.000, Step size: 5.000e-1");
        assert_relative_eq!(events[3].percentage(), 100.0);
    }

    #[test]
    fn solve_requires_initialize() {
        let mut solver = RungeKutta4::new(decay(), SolverConfig::new(0.0, 1.0, 4, vec![1.0]));
        assert_eq!(
            solver.solve(&RunControl::new()).unwrap_err(),
            SolverError::NotInitialized
        );
        solver.initialize(&HashMap::new()).unwrap();
        solver.set_config(SolverConfig::new(0.0, 2.0, 4, vec![1.0]));
        assert_eq!(
            solver.solve(&RunControl::new()).unwrap_err(),
            SolverError::NotInitialized
        );
    }

    #[test]
    fn rejects_unknown_settings() {
        let mut solver = ExplicitEuler::new(decay(), SolverConfig::new(0.0, 1.0, 4, vec![1.0]));
        let parameters = HashMap::from([("relative_tolerance".to_string(), 1e-3)]);
        let err = solver.initialize(&parameters).unwrap_err();
        assert!(err.to_string().contains("Unknown Explicit Euler setting"));
    }

    #[test]
    fn cancelled_run_keeps_partial_solution() {
        let control = RunControl::new();
        let mut solver = ExplicitEuler::new(decay(), SolverConfig::new(0.0, 1.0, 100, vec![1.0]));
        let canceller = control.clone();
        solver.set_progress_callback(Box::new(move |event| {
            if event.current_time >= 0.1 {
                canceller.cancel();
            }
        }));
        solver.initialize(&HashMap::new()).unwrap();
        let solution = solver.solve(&control).unwrap();
        assert_eq!(solution.termination, Termination::Cancelled);
        assert!(solution.len() > 1 && solution.len() < 101);
    }
}
