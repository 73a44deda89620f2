//! Variable-step, variable-order BDF integrator in the DASSL family.
//!
//! The history is kept in Nordsieck form: column `j` of the history holds `h^j / j! · y^(j)`
//! for the current step `h`. A step predicts by Pascal-triangle extrapolation, corrects with a
//! Newton iteration on `F(t, y, y'_p + (l₁/h)(y − y_p)) = 0`, and accepts or rejects the result
//! from a weighted local error estimate.

use super::base::{
    cancelled, interruptible, positive, positive_count, unknown_parameter, Solver, SolverConfig,
    SolverCore,
};
use super::{ProgressCallback, SolverKind};
use crate::control::RunControl;
use crate::error::SolverError;
use crate::numerics::{
    fd_increment, l2_norm, solve_linear_system, wrms_norm, JacobianProbe, Perturbation,
};
use crate::solution::Solution;
use crate::traits::DaeSystem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace};

/// Highest BDF order supported.
pub const MAX_ORDER: usize = 5;

/// Smallest magnitude used when scaling a variable.
const NOMINAL_FLOOR: f64 = 1e-6;

/// Consecutive failures after which the order drops back to 1.
const ORDER_RESET_FAILURES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DasslSettings {
    pub relative_tolerance: f64,
    pub absolute_tolerance: f64,
    pub initial_step: f64,
    pub min_step: f64,
    /// Bound on the proposed step. Logged time differences `t_{n+1} - t_n` respect it only up
    /// to the rounding of `t + h`.
    pub max_step: f64,
    pub max_order: usize,
    pub safety_factor: f64,
    pub max_consecutive_failures: usize,
    /// Newton stops once the weighted RMS of the update drops below this.
    pub corrector_tolerance: f64,
}

impl Default for DasslSettings {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-6,
            absolute_tolerance: 1e-8,
            initial_step: 1e-4,
            min_step: 1e-10,
            max_step: 1e-2,
            max_order: MAX_ORDER,
            safety_factor: 0.6,
            max_consecutive_failures: 10,
            corrector_tolerance: 1e-3,
        }
    }
}

impl DasslSettings {
    /// Applies one named override. Returns `false` for keys it does not own.
    pub fn apply(&mut self, key: &str, value: f64) -> Result<bool, SolverError> {
        match key {
            "relative_tolerance" => self.relative_tolerance = positive(key, value)?,
            "absolute_tolerance" => self.absolute_tolerance = positive(key, value)?,
            "initial_step" => self.initial_step = positive(key, value)?,
            "min_step" => self.min_step = positive(key, value)?,
            "max_step" => self.max_step = positive(key, value)?,
            "max_order" => self.max_order = positive_count(key, value)?,
            "safety_factor" => self.safety_factor = positive(key, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn validate(&self) -> Result<(), SolverError> {
        for (name, value) in [
            ("relative_tolerance", self.relative_tolerance),
            ("absolute_tolerance", self.absolute_tolerance),
            ("initial_step", self.initial_step),
            ("min_step", self.min_step),
            ("max_step", self.max_step),
            ("safety_factor", self.safety_factor),
            ("corrector_tolerance", self.corrector_tolerance),
        ] {
            positive(name, value)?;
        }
        if self.min_step > self.max_step {
            return Err(SolverError::InvalidInput(format!(
                "min_step ({}) must not exceed max_step ({})",
                self.min_step, self.max_step
            )));
        }
        if !(1..=MAX_ORDER).contains(&self.max_order) {
            return Err(SolverError::InvalidInput(format!(
                "max_order must be between 1 and {MAX_ORDER}, got {}",
                self.max_order
            )));
        }
        if self.safety_factor > 1.0 {
            return Err(SolverError::InvalidInput(format!(
                "safety_factor must not exceed 1, got {}",
                self.safety_factor
            )));
        }
        Ok(())
    }
}

/// Coefficients `l_j` of `Π_{k=1..q} (1 + x/k)`, the Nordsieck correction vector of the
/// order-`q` BDF formula. `l_1` is the leading coefficient `β₀`.
pub fn bdf_coefficients(order: usize) -> [f64; MAX_ORDER + 1] {
    let mut l = [0.0; MAX_ORDER + 1];
    l[0] = 1.0;
    for k in 1..=order.min(MAX_ORDER) {
        let inv = 1.0 / k as f64;
        for j in (1..=k).rev() {
            l[j] += l[j - 1] * inv;
        }
    }
    l
}

struct IntegrationState {
    /// `history[j][i] = h^j / j! · y_i^(j)`
    history: Vec<Vec<f64>>,
    order: usize,
    step: f64,
    steps_at_order: usize,
    consecutive_failures: usize,
    nominal: Vec<f64>,
}

impl IntegrationState {
    fn new(y: &[f64], y_prime: &[f64], step: f64) -> Self {
        let n = y.len();
        let mut history = vec![vec![0.0; n]; MAX_ORDER + 1];
        history[0].copy_from_slice(y);
        for (slot, &rate) in history[1].iter_mut().zip(y_prime) {
            *slot = step * rate;
        }
        Self {
            history,
            order: 1,
            step,
            steps_at_order: 0,
            consecutive_failures: 0,
            nominal: y.iter().map(|v| v.abs().max(NOMINAL_FLOOR)).collect(),
        }
    }

    /// Changes the step to `ratio · h`, rescaling the history columns.
    fn rescale(&mut self, ratio: f64) {
        let mut factor = 1.0;
        for column in self.history.iter_mut().skip(1) {
            factor *= ratio;
            for value in column.iter_mut() {
                *value *= factor;
            }
        }
        self.step *= ratio;
    }

    fn set_order(&mut self, order: usize) {
        for column in self.history.iter_mut().skip(order + 1) {
            column.fill(0.0);
        }
        self.order = order;
        self.steps_at_order = 0;
    }

    /// Error weights `rtol·max(|y|, nominal) + atol` at the current point.
    fn weights(&self, settings: &DasslSettings) -> Vec<f64> {
        self.history[0]
            .iter()
            .zip(&self.nominal)
            .map(|(y, nominal)| {
                settings.relative_tolerance * y.abs().max(*nominal) + settings.absolute_tolerance
            })
            .collect()
    }

    /// Pascal-triangle extrapolation of the first `order + 1` columns to `t + h`.
    fn predict(&self) -> Vec<Vec<f64>> {
        let q = self.order;
        let mut predicted: Vec<Vec<f64>> = self.history[..=q].to_vec();
        for k in 1..=q {
            for j in (k..=q).rev() {
                let (lower, upper) = predicted.split_at_mut(j);
                for (a, b) in lower[j - 1].iter_mut().zip(&upper[0]) {
                    *a += b;
                }
            }
        }
        predicted
    }
}

enum StepOutcome {
    Accepted {
        error: f64,
        state: Vec<f64>,
        derivatives: Vec<f64>,
    },
    Rejected {
        error: f64,
    },
    NotConverged,
}

/// Predicts, corrects and tests one step to `t_next`. Accepted steps update the history.
fn attempt_step(
    core: &SolverCore,
    settings: &DasslSettings,
    state: &mut IntegrationState,
    t_next: f64,
    control: &RunControl,
) -> Result<StepOutcome, SolverError> {
    let system = core.system.as_ref();
    let algebraic = &core.algebraic;
    let q = state.order;
    let h = state.step;
    let l = bdf_coefficients(q);
    let alpha = l[1] / h;
    let weights = state.weights(settings);
    let predicted = state.predict();

    let mut y = predicted[0].clone();
    let mut y_prime: Vec<f64> = predicted[1]
        .iter()
        .zip(algebraic)
        .map(|(&z1, &alg)| if alg { 0.0 } else { z1 / h })
        .collect();

    let columns: Vec<usize> = (0..y.len()).collect();
    let mut converged = false;
    for _ in 0..core.newton.max_iterations {
        let residual = system.evaluate(t_next, &y, &y_prime)?;
        control.ensure_active()?;

        let increments: Vec<f64> = y
            .iter()
            .zip(&state.nominal)
            .map(|(&v, &nominal)| fd_increment(v, nominal))
            .collect();
        let jacobian = JacobianProbe::new(system, t_next, &y, &y_prime)
            .with_control(control)
            .columns(
                &residual,
                &columns,
                Perturbation::Combined {
                    derivative_weight: alpha,
                },
                &increments,
                None,
            )?;
        let rhs: Vec<f64> = residual.iter().map(|r| -r).collect();
        let Ok(delta) = solve_linear_system(jacobian, &rhs) else {
            trace!(t = t_next, "singular iteration matrix");
            return Ok(StepOutcome::NotConverged);
        };

        for (i, &d) in delta.iter().enumerate() {
            y[i] += d;
            if !algebraic[i] {
                y_prime[i] += alpha * d;
            }
        }
        if wrms_norm(&delta, &weights) <= settings.corrector_tolerance {
            converged = true;
            break;
        }
    }
    if !converged {
        return Ok(StepOutcome::NotConverged);
    }

    let residual = system.evaluate(t_next, &y, &y_prime)?;
    let scaled: Vec<f64> = (0..y.len())
        .map(|i| {
            if algebraic[i] {
                residual[i] / settings.absolute_tolerance
            } else {
                (y[i] - predicted[0][i]) / ((q + 1) as f64 * weights[i])
            }
        })
        .collect();
    let error = l2_norm(&scaled) / (scaled.len() as f64).sqrt();
    // NaN counts as a failed test.
    if !(error <= 1.0) {
        return Ok(StepOutcome::Rejected { error });
    }

    for i in 0..y.len() {
        if algebraic[i] {
            state.history[0][i] = y[i];
            continue;
        }
        let correction = y[i] - predicted[0][i];
        for j in 0..=q {
            state.history[j][i] = predicted[j][i] + l[j] * correction;
        }
    }
    Ok(StepOutcome::Accepted {
        error,
        state: y,
        derivatives: y_prime,
    })
}

/// Variable-order BDF solver (orders 1 to 5) with local error control.
pub struct DasslSolver {
    core: SolverCore,
    settings: DasslSettings,
}

impl DasslSolver {
    pub fn new(system: Arc<dyn DaeSystem>, config: SolverConfig) -> Self {
        Self {
            core: SolverCore::new(system, config),
            settings: DasslSettings::default(),
        }
    }

    /// Replaces the advanced settings; like [`DasslSolver::set_settings`] this requires a new
    /// `initialize`, which validates them.
    pub fn with_settings(mut self, settings: DasslSettings) -> Self {
        self.set_settings(settings);
        self
    }

    pub fn settings(&self) -> &DasslSettings {
        &self.settings
    }

    /// Replaces the advanced settings. The solver must be initialized again afterwards.
    pub fn set_settings(&mut self, settings: DasslSettings) {
        self.settings = settings;
        self.core.reset();
    }

    pub fn algebraic(&self) -> &[bool] {
        &self.core.algebraic
    }

    /// Step to take from `t` given the desired step, landing exactly on the end time without
    /// leaving a remainder below `min_step`.
    fn fit_step(&self, remaining: f64, desired: f64) -> f64 {
        if remaining <= desired + self.settings.min_step {
            if remaining <= self.settings.max_step {
                remaining
            } else {
                0.5 * remaining
            }
        } else {
            desired
        }
    }
}

impl Solver for DasslSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Dassl
    }

    fn config(&self) -> &SolverConfig {
        &self.core.config
    }

    fn set_config(&mut self, config: SolverConfig) {
        self.core.set_config(config);
    }

    fn initialize(&mut self, parameters: &HashMap<String, f64>) -> Result<(), SolverError> {
        self.core.reset();
        // overrides are committed only once the whole set validates
        let newton = self.core.newton;
        let mut settings = self.settings.clone();
        let staged = parameters.iter().try_for_each(|(key, &value)| {
            let applied =
                self.core.apply_newton_parameter(key, value)? || settings.apply(key, value)?;
            if applied {
                Ok(())
            } else {
                Err(unknown_parameter(SolverKind::Dassl.name(), key))
            }
        });
        if let Err(err) = staged.and_then(|()| settings.validate()) {
            self.core.newton = newton;
            return Err(err);
        }
        self.settings = settings;
        self.core.prepare()
    }

    #[instrument(skip_all, fields(solver = "DASSL"))]
    fn solve(&mut self, control: &RunControl) -> Result<Solution, SolverError> {
        self.core.ensure_initialized()?;
        let settings = self.settings.clone();
        let start_time = self.core.config.start_time;
        let end_time = self.core.config.end_time;
        let mut y = self.core.config.initial_state.clone();
        let mut y_prime = vec![0.0; y.len()];
        let mut solution = Solution::new();

        if interruptible(self.core.consistent_start(&mut y, &mut y_prime, control))?.is_none() {
            return Ok(cancelled(solution));
        }
        solution.log_step(start_time, &y, &y_prime);

        let initial_step = settings
            .initial_step
            .clamp(settings.min_step, settings.max_step);
        let mut state = IntegrationState::new(&y, &y_prime, initial_step);
        let mut t = start_time;
        info!(
            initial_step,
            rtol = settings.relative_tolerance,
            atol = settings.absolute_tolerance,
            "starting variable-order integration"
        );

        while t < end_time {
            if control.checkpoint().is_err() {
                info!(t, "integration cancelled");
                return Ok(cancelled(solution));
            }

            let remaining = end_time - t;
            let h = self.fit_step(remaining, state.step);
            if h != state.step {
                state.rescale(h / state.step);
            }
            let t_next = if h >= remaining { end_time } else { t + h };

            let attempt = attempt_step(&self.core, &settings, &mut state, t_next, control);
            let Some(outcome) = interruptible(attempt)? else {
                info!(t, "integration cancelled");
                return Ok(cancelled(solution));
            };

            match outcome {
                StepOutcome::Accepted {
                    error,
                    state: accepted,
                    derivatives,
                } => {
                    let recent_failure = state.consecutive_failures > 0;
                    state.consecutive_failures = 0;
                    state.steps_at_order += 1;
                    t = t_next;
                    solution.log_step(t, &accepted, &derivatives);

                    let q = state.order;
                    if !recent_failure
                        && error < 0.5
                        && q < settings.max_order
                        && state.steps_at_order > q
                    {
                        state.set_order(q + 1);
                    } else if error > 0.9 && q > 1 {
                        state.set_order(q - 1);
                    }

                    let factor = if error > 0.0 {
                        settings.safety_factor * (1.0 / error).powf(1.0 / (q + 1) as f64)
                    } else {
                        2.0
                    };
                    let next = (h * factor.clamp(0.5, 2.0)).clamp(settings.min_step, settings.max_step);
                    state.rescale(next / h);

                    debug!(t, h, order = state.order, error, "step accepted");
                    self.core.report(
                        t,
                        format!(
                            "Time: {t:.3}/{end_time:.3}, Step size: {:.3e}, Order: {}",
                            state.step, state.order
                        ),
                    );
                }
                rejected => {
                    state.consecutive_failures += 1;
                    match rejected {
                        StepOutcome::Rejected { error } => {
                            debug!(t, h, error, "error test failed");
                        }
                        _ => debug!(t, h, "corrector failed to converge"),
                    }
                    if state.consecutive_failures > settings.max_consecutive_failures {
                        error!(t, failures = state.consecutive_failures, "too many failures");
                        return Err(SolverError::TooManyFailures {
                            time: t,
                            failures: state.consecutive_failures,
                        });
                    }
                    if state.consecutive_failures >= ORDER_RESET_FAILURES && state.order > 1 {
                        state.set_order(1);
                    }
                    if 0.5 * h < settings.min_step {
                        error!(t, step = 0.5 * h, "step size too small");
                        return Err(SolverError::StepSizeTooSmall {
                            time: t,
                            step: 0.5 * h,
                        });
                    }
                    state.rescale(0.5);
                }
            }
        }

        info!(steps = solution.len() - 1, "integration finished");
        Ok(solution)
    }

    fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.core.set_progress_callback(callback);
    }

    fn cleanup(&mut self) {
        self.core.reset();
    }
}
