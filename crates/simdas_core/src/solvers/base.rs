use super::SolverKind;
use crate::control::RunControl;
use crate::error::SolverError;
use crate::numerics::{
    classify_algebraic, fd_increment, l2_norm, solve_linear_system, JacobianProbe, Perturbation,
};
use crate::solution::{Solution, Termination};
use crate::traits::DaeSystem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Perturbation applied to each `y'[i]` when classifying variables.
pub const CLASSIFICATION_PERTURBATION: f64 = 1e-6;

/// Integration interval and initial state shared by every solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Number of output intervals (fixed-step solvers take exactly this many steps).
    pub intervals: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub initial_state: Vec<f64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            intervals: 100,
            start_time: 0.0,
            end_time: 1.0,
            initial_state: Vec::new(),
        }
    }
}

impl SolverConfig {
    pub fn new(start_time: f64, end_time: f64, intervals: usize, initial_state: Vec<f64>) -> Self {
        Self {
            intervals,
            start_time,
            end_time,
            initial_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-6,
        }
    }
}

/// Progress report emitted once per accepted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub current_time: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub status: String,
}

impl ProgressEvent {
    /// Fraction of the integration span covered, in percent.
    pub fn percentage(&self) -> f64 {
        let span = self.end_time - self.start_time;
        if span <= 0.0 {
            return 100.0;
        }
        ((self.current_time - self.start_time) / span * 100.0).clamp(0.0, 100.0)
    }
}

pub type ProgressCallback = Box<dyn FnMut(&ProgressEvent) + Send>;

/// Common interface of the time integrators.
///
/// Pausing and resuming go through the [`RunControl`] handed to [`Solver::solve`]; clone it
/// before starting the solve to steer the run from another thread.
pub trait Solver: Send {
    fn kind(&self) -> SolverKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn is_fixed_step(&self) -> bool {
        self.kind().is_fixed_step()
    }

    fn config(&self) -> &SolverConfig;

    /// Replaces the configuration. The solver must be initialized again afterwards.
    fn set_config(&mut self, config: SolverConfig);

    /// Validates inputs, applies tuning overrides from `parameters` and classifies variables.
    fn initialize(&mut self, parameters: &HashMap<String, f64>) -> Result<(), SolverError>;

    /// Integrates over the configured interval. A cancelled run returns the points accepted
    /// so far with [`Termination::Cancelled`].
    fn solve(&mut self, control: &RunControl) -> Result<Solution, SolverError>;

    fn set_progress_callback(&mut self, callback: ProgressCallback);

    /// Releases scratch state; the solver must be initialized again before the next solve.
    fn cleanup(&mut self);
}

/// Result of a bounded Newton iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonOutcome {
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: f64,
    pub singular: bool,
}

/// Which unknowns a subset Newton iteration adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unknowns {
    State,
    Derivative,
}

/// State shared by all solvers: the system, configuration, Newton settings, variable kinds
/// and the progress sink.
pub struct SolverCore {
    pub system: Arc<dyn DaeSystem>,
    pub config: SolverConfig,
    pub newton: NewtonSettings,
    pub algebraic: Vec<bool>,
    progress: Option<ProgressCallback>,
    initialized: bool,
}

impl SolverCore {
    pub fn new(system: Arc<dyn DaeSystem>, config: SolverConfig) -> Self {
        Self {
            system,
            config,
            newton: NewtonSettings::default(),
            algebraic: Vec::new(),
            progress: None,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_config(&mut self, config: SolverConfig) {
        self.config = config;
        self.initialized = false;
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    pub fn reset(&mut self) {
        self.algebraic.clear();
        self.initialized = false;
    }

    pub fn validate(&self) -> Result<(), SolverError> {
        let config = &self.config;
        if config.initial_state.is_empty() {
            return Err(SolverError::InvalidInput(
                "Initial state is not set".to_string(),
            ));
        }
        let dim = self.system.dimension();
        if config.initial_state.len() != dim {
            return Err(SolverError::InvalidInput(format!(
                "Initial state dimension ({}) does not match system dimension ({dim})",
                config.initial_state.len()
            )));
        }
        if config.initial_state.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::InvalidInput(
                "Initial state must be finite".to_string(),
            ));
        }
        if !config.start_time.is_finite() || !config.end_time.is_finite() {
            return Err(SolverError::InvalidInput(
                "Start and end time must be finite".to_string(),
            ));
        }
        if config.end_time <= config.start_time {
            return Err(SolverError::InvalidInput(
                "End time must be greater than start time".to_string(),
            ));
        }
        if config.intervals == 0 {
            return Err(SolverError::InvalidInput(
                "Number of intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies a Newton tuning override. Returns `false` for keys it does not own.
    pub fn apply_newton_parameter(&mut self, key: &str, value: f64) -> Result<bool, SolverError> {
        match key {
            "newton_max_iterations" => {
                self.newton.max_iterations = positive_count(key, value)?;
                Ok(true)
            }
            "newton_tolerance" => {
                self.newton.tolerance = positive(key, value)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Validates the configuration and classifies variables at the initial point.
    pub fn prepare(&mut self) -> Result<(), SolverError> {
        self.validate()?;
        let y0 = &self.config.initial_state;
        let zeros = vec![0.0; y0.len()];
        self.algebraic = classify_algebraic(
            self.system.as_ref(),
            self.config.start_time,
            y0,
            &zeros,
            CLASSIFICATION_PERTURBATION,
        )?;
        self.initialized = true;
        debug!(
            dimension = y0.len(),
            algebraic = self.algebraic.iter().filter(|&&a| a).count(),
            "solver initialized"
        );
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<(), SolverError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SolverError::NotInitialized)
        }
    }

    pub fn algebraic_indices(&self) -> Vec<usize> {
        indices_where(&self.algebraic, true)
    }

    pub fn differential_indices(&self) -> Vec<usize> {
        indices_where(&self.algebraic, false)
    }

    pub fn report(&mut self, current_time: f64, status: String) {
        if let Some(callback) = self.progress.as_mut() {
            callback(&ProgressEvent {
                current_time,
                start_time: self.config.start_time,
                end_time: self.config.end_time,
                status,
            });
        }
    }

    /// Newton iteration on the algebraic rows, adjusting algebraic states with everything
    /// else held fixed.
    pub fn resolve_algebraic(
        &self,
        t: f64,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<NewtonOutcome, SolverError> {
        let indices = self.algebraic_indices();
        let outcome = newton_subset(
            self.system.as_ref(),
            t,
            y,
            y_prime,
            &indices,
            Unknowns::State,
            &self.newton,
            control,
        )?;
        if !outcome.converged {
            warn!(
                t,
                residual = outcome.residual_norm,
                singular = outcome.singular,
                "algebraic constraints not resolved; accepting step"
            );
        }
        Ok(outcome)
    }

    /// Solves the differential rows for `y'` at fixed `y`. Algebraic derivatives are zeroed.
    pub fn resolve_derivatives(
        &self,
        t: f64,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<NewtonOutcome, SolverError> {
        for (slot, &algebraic) in y_prime.iter_mut().zip(&self.algebraic) {
            if algebraic {
                *slot = 0.0;
            }
        }
        let indices = self.differential_indices();
        let outcome = newton_subset(
            self.system.as_ref(),
            t,
            y,
            y_prime,
            &indices,
            Unknowns::Derivative,
            &self.newton,
            control,
        )?;
        if !outcome.converged {
            warn!(
                t,
                residual = outcome.residual_norm,
                singular = outcome.singular,
                "derivatives not resolved; accepting step"
            );
        }
        Ok(outcome)
    }

    /// Brings the initial point to consistency: algebraic states first, then derivatives.
    pub fn consistent_start(
        &self,
        y: &mut [f64],
        y_prime: &mut [f64],
        control: &RunControl,
    ) -> Result<(), SolverError> {
        let t0 = self.config.start_time;
        self.resolve_algebraic(t0, y, y_prime, control)?;
        self.resolve_derivatives(t0, y, y_prime, control)?;
        Ok(())
    }
}

fn indices_where(flags: &[bool], value: bool) -> Vec<usize> {
    flags
        .iter()
        .enumerate()
        .filter(|(_, &flag)| flag == value)
        .map(|(i, _)| i)
        .collect()
}

pub(crate) fn positive(key: &str, value: f64) -> Result<f64, SolverError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(SolverError::InvalidInput(format!(
            "{key} must be positive, got {value}"
        )))
    }
}

pub(crate) fn positive_count(key: &str, value: f64) -> Result<usize, SolverError> {
    let value = positive(key, value)?;
    if value.fract() != 0.0 {
        return Err(SolverError::InvalidInput(format!(
            "{key} must be a whole number, got {value}"
        )));
    }
    Ok(value as usize)
}

pub(crate) fn unknown_parameter(solver: &str, key: &str) -> SolverError {
    SolverError::InvalidInput(format!("Unknown {solver} setting: {key}"))
}

/// Bounded Newton iteration on the residual rows `indices`, adjusting the same coordinates of
/// either `y` or `y'`. Stops when the L2 norm of those rows drops below the tolerance.
#[allow(clippy::too_many_arguments)]
pub fn newton_subset(
    system: &dyn DaeSystem,
    t: f64,
    y: &mut [f64],
    y_prime: &mut [f64],
    indices: &[usize],
    unknowns: Unknowns,
    settings: &NewtonSettings,
    control: &RunControl,
) -> Result<NewtonOutcome, SolverError> {
    let mut outcome = NewtonOutcome {
        converged: true,
        iterations: 0,
        residual_norm: 0.0,
        singular: false,
    };
    if indices.is_empty() {
        return Ok(outcome);
    }

    loop {
        let residual = system.evaluate(t, y, y_prime)?;
        let rows: Vec<f64> = indices.iter().map(|&i| residual[i]).collect();
        outcome.residual_norm = l2_norm(&rows);
        if outcome.residual_norm < settings.tolerance {
            outcome.converged = true;
            return Ok(outcome);
        }
        if outcome.iterations >= settings.max_iterations {
            outcome.converged = false;
            return Ok(outcome);
        }
        control.ensure_active()?;

        let (perturbation, target): (Perturbation, &[f64]) = match unknowns {
            Unknowns::State => (Perturbation::State, y),
            Unknowns::Derivative => (Perturbation::Derivative, y_prime),
        };
        let increments: Vec<f64> = target.iter().map(|&v| fd_increment(v, 1.0)).collect();
        let jacobian = JacobianProbe::new(system, t, y, y_prime)
            .with_control(control)
            .columns(&residual, indices, perturbation, &increments, None)?
            .select_rows(indices.iter());

        let rhs: Vec<f64> = rows.iter().map(|r| -r).collect();
        let Ok(delta) = solve_linear_system(jacobian, &rhs) else {
            outcome.converged = false;
            outcome.singular = true;
            return Ok(outcome);
        };

        let target = match unknowns {
            Unknowns::State => &mut *y,
            Unknowns::Derivative => &mut *y_prime,
        };
        for (&i, d) in indices.iter().zip(delta) {
            target[i] += d;
        }
        outcome.iterations += 1;
    }
}

/// Marks a partially integrated solution as cancelled.
pub(crate) fn cancelled(mut solution: Solution) -> Solution {
    solution.termination = Termination::Cancelled;
    solution
}

/// Turns a cancellation into `Ok(None)` so the caller can return its partial solution.
pub(crate) fn interruptible<T>(result: Result<T, SolverError>) -> Result<Option<T>, SolverError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SolverError::Cancelled) => Ok(None),
        Err(err) => Err(err),
    }
}
