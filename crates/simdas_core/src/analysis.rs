//! Structural and numerical diagnostics for residual-form DAE systems.
//!
//! The analyzer perturbs the residual around an initial point to recover the dependency
//! structure, classifies variables, estimates the structural index and derives Jacobian-based
//! indicators (condition number, eigenvalues, stiffness). Numerical diagnostics are
//! best-effort: failures degrade to sentinel values instead of aborting the analysis.

pub mod graph;

use self::graph::{structural_index, DependencyGraph};
use crate::control::RunControl;
use crate::error::{AnalysisError, JacobianError};
use crate::numerics::{
    classify_algebraic, l2_norm, sensitivity_pattern, solve_matrix, JacobianProbe, Perturbation,
};
use crate::traits::DaeSystem;
use nalgebra::{linalg::Schur, DMatrix};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    /// Step used when probing the dependency structure.
    pub perturbation: f64,
    pub stiffness_threshold: f64,
    /// Upper bound for the structural index search.
    pub max_index: usize,
    /// Jacobian increments are `sqrt(jacobian_tolerance) · max(‖y‖, 1)`.
    pub jacobian_tolerance: f64,
    /// Smallest singular value below which the Jacobian counts as singular.
    pub singular_threshold: f64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            perturbation: 1e-6,
            stiffness_threshold: 1000.0,
            max_index: 4,
            jacobian_tolerance: 1e-12,
            singular_threshold: 1e-10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStage {
    Dependencies,
    Classification,
    Index,
    Jacobian,
    Spectrum,
    Structure,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisProgress {
    pub stage: AnalysisStage,
    pub percentage: f64,
    pub message: String,
}

/// Strongly connected components of the dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStructure {
    /// All components, in reverse topological order.
    pub blocks: Vec<Vec<usize>>,
    /// Components with more than one member (coupled blocks).
    pub sccs: Vec<Vec<usize>>,
    /// Variables forming a component on their own.
    pub single_equations: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaeAnalysis {
    pub index: usize,
    pub algebraic_variables: Vec<bool>,
    pub variable_dependencies: BTreeMap<usize, BTreeSet<usize>>,
    pub has_circular_dependency: bool,
    pub circular_dependency_paths: Vec<String>,
    pub is_stiff: bool,
    /// `NaN` when the Jacobian could not be evaluated, `+∞` when it is nearly singular.
    pub condition_number: f64,
    /// `0` when fewer than two eigenvalues have a negative real part.
    pub stiffness_ratio: f64,
    pub eigenvalues: Vec<Complex<f64>>,
    pub warnings: Vec<String>,
    pub system_structure: SystemStructure,
}

impl DaeAnalysis {
    pub fn algebraic_count(&self) -> usize {
        self.algebraic_variables.iter().filter(|&&a| a).count()
    }
}

struct Spectrum {
    condition_number: f64,
    eigenvalues: Vec<Complex<f64>>,
}

impl Spectrum {
    fn unavailable() -> Self {
        Self {
            condition_number: f64::NAN,
            eigenvalues: Vec::new(),
        }
    }
}

struct Reporter<'a> {
    sink: Option<&'a (dyn Fn(AnalysisProgress) + Sync)>,
}

impl Reporter<'_> {
    fn emit(&self, stage: AnalysisStage, percentage: f64, message: impl Into<String>) {
        if let Some(sink) = self.sink {
            sink(AnalysisProgress {
                stage,
                percentage,
                message: message.into(),
            });
        }
    }

    /// Jacobian columns cover 40% to 80% of the run.
    fn jacobian(&self, done: usize, total: usize) {
        if self.sink.is_some() && total > 0 {
            let percentage = 40.0 + 40.0 * done as f64 / total as f64;
            self.emit(
                AnalysisStage::Jacobian,
                percentage,
                format!("Jacobian column {done}/{total}"),
            );
        }
    }
}

/// Lists, for each coordinate, the rows that react to it.
fn rows_by_column(pattern: &[Vec<bool>]) -> Vec<Vec<usize>> {
    pattern
        .iter()
        .map(|column| {
            column
                .iter()
                .enumerate()
                .filter(|(_, &depends)| depends)
                .map(|(row, _)| row)
                .collect()
        })
        .collect()
}

/// State Jacobian of the underlying ODE, `∂y'_D/∂y_D`, with algebraic variables eliminated.
///
/// Solves `[F_y'(:, D) | F_y(:, A)] · [∂y'_D ; ∂y_A] = −F_y(:, D)`. Returns `None` when that
/// matrix is singular (index above one) or there are no differential variables.
fn reduced_jacobian(
    fy: &DMatrix<f64>,
    fyp: &DMatrix<f64>,
    algebraic: &[bool],
) -> Option<DMatrix<f64>> {
    let differential: Vec<usize> = (0..algebraic.len()).filter(|&j| !algebraic[j]).collect();
    let constrained: Vec<usize> = (0..algebraic.len()).filter(|&j| algebraic[j]).collect();
    if differential.is_empty() {
        return None;
    }

    let n = fy.nrows();
    let mut system = DMatrix::zeros(n, n);
    for (k, &j) in differential.iter().enumerate() {
        system.set_column(k, &fyp.column(j));
    }
    for (k, &j) in constrained.iter().enumerate() {
        system.set_column(differential.len() + k, &fy.column(j));
    }
    let rhs = -fy.select_columns(differential.iter());
    let solution = solve_matrix(system, &rhs).ok()?;
    Some(solution.rows(0, differential.len()).into_owned())
}

fn eigenvalues(matrix: DMatrix<f64>) -> Vec<Complex<f64>> {
    if matrix.is_empty() || matrix.iter().any(|v| !v.is_finite()) {
        return Vec::new();
    }
    match Schur::try_new(matrix, f64::EPSILON, 1000) {
        Some(schur) => schur
            .complex_eigenvalues()
            .iter()
            .copied()
            .filter(|z| z.re.is_finite() && z.im.is_finite())
            .collect(),
        None => {
            warn!("eigenvalue iteration did not converge");
            Vec::new()
        }
    }
}

/// Largest over smallest real part magnitude among eigenvalues with negative real part.
fn stiffness_ratio(eigenvalues: &[Complex<f64>]) -> f64 {
    let decaying: Vec<f64> = eigenvalues
        .iter()
        .filter(|z| z.re < 0.0)
        .map(|z| z.re.abs())
        .collect();
    if decaying.len() < 2 {
        return 0.0;
    }
    let max = decaying.iter().copied().fold(f64::MIN, f64::max);
    let min = decaying.iter().copied().fold(f64::MAX, f64::min);
    max / min
}

/// Handle to an analysis running on a worker thread.
pub struct AnalysisTask {
    handle: JoinHandle<Result<DaeAnalysis, AnalysisError>>,
    control: RunControl,
    progress: Receiver<AnalysisProgress>,
}

impl AnalysisTask {
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn progress(&self) -> &Receiver<AnalysisProgress> {
        &self.progress
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker and returns its result.
    pub fn join(self) -> Result<DaeAnalysis, AnalysisError> {
        self.handle
            .join()
            .map_err(|_| AnalysisError::WorkerPanicked)?
    }
}

#[derive(Debug, Clone, Default)]
pub struct DaeAnalyzer {
    settings: AnalyzerSettings,
    variable_names: Vec<String>,
}

impl DaeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: AnalyzerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Names used when rendering circular-dependency paths and warnings.
    pub fn with_variable_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variable_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    fn name(&self, index: usize) -> String {
        self.variable_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("y{index}"))
    }

    fn render_path(&self, path: &[usize]) -> String {
        path.iter()
            .map(|&i| self.name(i))
            .collect::<Vec<_>>()
            .join(" → ")
    }

    pub fn analyze(
        &self,
        system: &dyn DaeSystem,
        initial_state: &[f64],
        initial_time: f64,
    ) -> Result<DaeAnalysis, AnalysisError> {
        self.analyze_with(system, initial_state, initial_time, &RunControl::new(), None)
    }

    /// Full analysis with cooperative pause/cancel through `control` and optional progress
    /// reports.
    #[instrument(skip_all, fields(dimension = system.dimension()))]
    pub fn analyze_with(
        &self,
        system: &dyn DaeSystem,
        initial_state: &[f64],
        initial_time: f64,
        control: &RunControl,
        progress: Option<&(dyn Fn(AnalysisProgress) + Sync)>,
    ) -> Result<DaeAnalysis, AnalysisError> {
        let n = system.dimension();
        if n == 0 {
            return Err(AnalysisError::EmptySystem);
        }
        if initial_state.len() != n {
            return Err(AnalysisError::DimensionMismatch {
                expected: n,
                actual: initial_state.len(),
            });
        }
        let report = Reporter { sink: progress };
        let (t0, y0) = (initial_time, initial_state);
        let zeros = vec![0.0; n];
        let h = self.settings.perturbation;
        info!("starting DAE analysis");

        control.checkpoint()?;
        report.emit(AnalysisStage::Dependencies, 0.0, "Building dependency graph");
        let state_pattern =
            sensitivity_pattern(system, t0, y0, &zeros, Perturbation::State, h, Some(control))?;
        let graph = DependencyGraph::from_pattern(&state_pattern);
        let cycles = graph.cycles();
        debug!(cycles = cycles.len(), "dependency graph built");

        control.checkpoint()?;
        report.emit(AnalysisStage::Classification, 20.0, "Classifying variables");
        let algebraic = classify_algebraic(system, t0, y0, &zeros, h)?;

        control.checkpoint()?;
        report.emit(AnalysisStage::Index, 30.0, "Determining structural index");
        let derivative_pattern = sensitivity_pattern(
            system,
            t0,
            y0,
            &zeros,
            Perturbation::Derivative,
            h,
            Some(control),
        )?;
        let index = structural_index(
            &rows_by_column(&state_pattern),
            &rows_by_column(&derivative_pattern),
            &algebraic,
            self.settings.max_index,
        );
        debug!(index, "structural index determined");

        control.checkpoint()?;
        report.emit(AnalysisStage::Jacobian, 40.0, "Computing Jacobian");
        let spectrum = self.spectrum(system, y0, t0, &algebraic, control, &report)?;
        let stiffness_ratio = stiffness_ratio(&spectrum.eigenvalues);
        let is_stiff = stiffness_ratio > self.settings.stiffness_threshold;

        control.checkpoint()?;
        report.emit(AnalysisStage::Structure, 95.0, "Decomposing system structure");
        let blocks = graph.strongly_connected_components();
        let system_structure = SystemStructure {
            sccs: blocks.iter().filter(|b| b.len() > 1).cloned().collect(),
            single_equations: blocks.iter().filter(|b| b.len() == 1).map(|b| b[0]).collect(),
            blocks,
        };

        let mut analysis = DaeAnalysis {
            index,
            algebraic_variables: algebraic,
            variable_dependencies: graph.to_map(),
            has_circular_dependency: !cycles.is_empty(),
            circular_dependency_paths: cycles.iter().map(|c| self.render_path(c)).collect(),
            is_stiff,
            condition_number: spectrum.condition_number,
            stiffness_ratio,
            eigenvalues: spectrum.eigenvalues,
            warnings: Vec::new(),
            system_structure,
        };
        analysis.warnings = self.warnings(&analysis);

        report.emit(AnalysisStage::Complete, 100.0, "Analysis complete");
        info!(
            index = analysis.index,
            algebraic = analysis.algebraic_count(),
            stiff = analysis.is_stiff,
            condition_number = analysis.condition_number,
            "DAE analysis finished"
        );
        Ok(analysis)
    }

    /// Runs [`DaeAnalyzer::analyze_with`] on a worker thread. Progress events arrive on the
    /// task's channel; the task's [`RunControl`] pauses or cancels the run.
    pub fn analyze_in_background(
        &self,
        system: Arc<dyn DaeSystem>,
        initial_state: Vec<f64>,
        initial_time: f64,
    ) -> AnalysisTask {
        let analyzer = self.clone();
        let control = RunControl::new();
        let worker_control = control.clone();
        let (sender, progress) = mpsc::channel();

        let handle = thread::spawn(move || {
            let sender = Mutex::new(sender);
            let report: &(dyn Fn(AnalysisProgress) + Sync) = &move |event: AnalysisProgress| {
                if let Ok(sender) = sender.lock() {
                    // receiver may already be gone
                    let _ = sender.send(event);
                }
            };
            analyzer.analyze_with(
                system.as_ref(),
                &initial_state,
                initial_time,
                &worker_control,
                Some(report),
            )
        });

        AnalysisTask {
            handle,
            control,
            progress,
        }
    }

    fn spectrum(
        &self,
        system: &dyn DaeSystem,
        y0: &[f64],
        t0: f64,
        algebraic: &[bool],
        control: &RunControl,
        report: &Reporter<'_>,
    ) -> Result<Spectrum, AnalysisError> {
        let zeros = vec![0.0; y0.len()];
        let eps = self.settings.jacobian_tolerance.sqrt() * l2_norm(y0).max(1.0);
        let probe = JacobianProbe::new(system, t0, y0, &zeros).with_control(control);

        let state_progress: &(dyn Fn(usize, usize) + Sync) =
            &|done: usize, total: usize| report.jacobian(done, 2 * total);
        let derivative_progress: &(dyn Fn(usize, usize) + Sync) =
            &|done: usize, total: usize| report.jacobian(total + done, 2 * total);
        let jacobians = probe
            .residual()
            .map_err(JacobianError::from)
            .and_then(|base| {
                let fy = probe.square(&base, Perturbation::State, eps, Some(state_progress))?;
                let fyp =
                    probe.square(&base, Perturbation::Derivative, eps, Some(derivative_progress))?;
                Ok((fy, fyp))
            });
        let (fy, fyp) = match jacobians {
            Ok(pair) => pair,
            Err(JacobianError::Cancelled) => return Err(AnalysisError::Cancelled),
            Err(JacobianError::Evaluation(err)) => {
                warn!(%err, "Jacobian evaluation failed; numerical diagnostics unavailable");
                return Ok(Spectrum::unavailable());
            }
        };

        let jacobian = &fy + &fyp;
        let condition_number = self.condition_number(&jacobian);

        control.checkpoint()?;
        report.emit(AnalysisStage::Spectrum, 85.0, "Computing eigenvalues");
        let eigenvalues = match reduced_jacobian(&fy, &fyp, algebraic) {
            Some(reduced) => eigenvalues(reduced),
            None => {
                debug!("using combined Jacobian for eigenvalues");
                eigenvalues(jacobian)
            }
        };
        Ok(Spectrum {
            condition_number,
            eigenvalues,
        })
    }

    fn condition_number(&self, jacobian: &DMatrix<f64>) -> f64 {
        if jacobian.iter().any(|v| !v.is_finite()) {
            warn!("Jacobian has non-finite entries");
            return f64::NAN;
        }
        let Some(svd) = jacobian.clone().try_svd(false, false, f64::EPSILON, 1000) else {
            warn!("singular value decomposition did not converge");
            return f64::NAN;
        };
        let max = svd.singular_values.max();
        let min = svd.singular_values.min();
        if min < self.settings.singular_threshold {
            warn!(min, "Jacobian is nearly singular");
            return f64::INFINITY;
        }
        max / min
    }

    fn warnings(&self, analysis: &DaeAnalysis) -> Vec<String> {
        let mut warnings = Vec::new();
        if analysis.index > 2 {
            warnings.push(format!(
                "High index ({}) DAE detected. Consider index reduction.",
                analysis.index
            ));
        }
        if analysis.is_stiff {
            warnings.push("Stiff system detected. Implicit solvers recommended.".to_string());
        }
        let algebraic = analysis.algebraic_count();
        if algebraic > 0 {
            warnings.push(format!(
                "System contains {algebraic} algebraic constraints."
            ));
        }
        for path in &analysis.circular_dependency_paths {
            warnings.push(format!("Circular dependency: {path}"));
        }
        for block in &analysis.system_structure.sccs {
            let names: Vec<String> = block.iter().map(|&i| self.name(i)).collect();
            warnings.push(format!("Coupled equation block: {}", names.join(", ")));
        }
        for warning in &warnings {
            warn!("{warning}");
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnResidual;
    use approx::assert_relative_eq;

    fn index_two() -> FnResidual<impl Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync> {
        // y0' = y1, 0 = y0 - 1
        FnResidual::new(2, |_t, y: &[f64], yp: &[f64], out: &mut [f64]| {
            out[0] = yp[0] - y[1];
            out[1] = y[0] - 1.0;
        })
    }

    fn stiff_pair() -> FnResidual<impl Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync> {
        FnResidual::new(2, |_t, y: &[f64], yp: &[f64], out: &mut [f64]| {
            out[0] = yp[0] + 10000.0 * y[0];
            out[1] = yp[1] + y[1];
        })
    }

    #[test]
    fn classifies_and_finds_index_two() {
        let analysis = DaeAnalyzer::new()
            .analyze(&index_two(), &[1.0, 0.0], 0.0)
            .unwrap();
        assert_eq!(analysis.algebraic_variables, vec![false, true]);
        assert_eq!(analysis.index, 2);
        assert!(analysis
            .warnings
            .contains(&"System contains 1 algebraic constraints.".to_string()));
    }

    #[test]
    fn pendulum_is_high_index() {
        let g = 9.81;
        let pendulum = FnResidual::new(5, move |_t, y: &[f64], yp: &[f64], out: &mut [f64]| {
            let (x, yy, vx, vy, lambda) = (y[0], y[1], y[2], y[3], y[4]);
            out[0] = yp[0] - vx;
            out[1] = yp[1] - vy;
            out[2] = yp[2] + lambda * x;
            out[3] = yp[3] + lambda * yy + g;
            out[4] = x * x + yy * yy - 1.0;
        });
        let analysis = DaeAnalyzer::new()
            .analyze(&pendulum, &[0.6, -0.8, 0.1, 0.2, 1.5], 0.0)
            .unwrap();
        assert_eq!(analysis.index, 3);
        assert_eq!(
            analysis.algebraic_variables,
            vec![false, false, false, false, true]
        );
        assert!(analysis.warnings[0].starts_with("High index (3)"));
    }

    #[test]
    fn detects_stiffness() {
        let analysis = DaeAnalyzer::new()
            .analyze(&stiff_pair(), &[1.0, 1.0], 0.0)
            .unwrap();
        assert!(analysis.is_stiff);
        assert_relative_eq!(analysis.stiffness_ratio, 10000.0, max_relative = 1e-3);
        assert_eq!(analysis.eigenvalues.len(), 2);
        assert_relative_eq!(analysis.condition_number, 10001.0 / 2.0, max_relative = 1e-3);
        assert!(analysis
            .warnings
            .contains(&"Stiff system detected. Implicit solvers recommended.".to_string()));
        assert_eq!(analysis.index, 1);
        assert!(!analysis.has_circular_dependency);
        assert_eq!(analysis.system_structure.single_equations.len(), 2);
    }

    #[test]
    fn oscillator_has_circular_dependency() {
        let oscillator = FnResidual::new(2, |_t, y: &[f64], yp: &[f64], out: &mut [f64]| {
            out[0] = yp[0] - y[1];
            out[1] = yp[1] + y[0];
        });
        let analysis = DaeAnalyzer::new()
            .with_variable_names(["x", "v"])
            .analyze(&oscillator, &[1.0, 0.0], 0.0)
            .unwrap();
        assert!(!analysis.is_stiff);
        assert_eq!(analysis.stiffness_ratio, 0.0);
        assert!(analysis.has_circular_dependency);
        assert_eq!(analysis.circular_dependency_paths, vec!["x → v → x"]);
        assert_eq!(analysis.system_structure.sccs, vec![vec![0, 1]]);
        assert!(analysis
            .warnings
            .contains(&"Coupled equation block: x, v".to_string()));
        for z in &analysis.eigenvalues {
            assert!(z.re.abs() < 1e-6);
            assert_relative_eq!(z.im.abs(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn singular_jacobian_reports_infinite_condition() {
        let degenerate = FnResidual::new(2, |_t, y: &[f64], _yp: &[f64], out: &mut [f64]| {
            out[0] = y[0] + y[1];
            out[1] = y[0] + y[1];
        });
        let analysis = DaeAnalyzer::new()
            .analyze(&degenerate, &[1.0, 1.0], 0.0)
            .unwrap();
        assert_eq!(analysis.condition_number, f64::INFINITY);
        assert_eq!(analysis.algebraic_variables, vec![true, true]);
    }

    #[test]
    fn rejects_bad_input() {
        let analyzer = DaeAnalyzer::new();
        assert_eq!(
            analyzer.analyze(&index_two(), &[1.0], 0.0).unwrap_err(),
            AnalysisError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
        let empty = FnResidual::new(0, |_t, _y: &[f64], _yp: &[f64], _out: &mut [f64]| {});
        assert_eq!(
            analyzer.analyze(&empty, &[], 0.0).unwrap_err(),
            AnalysisError::EmptySystem
        );
    }

    #[test]
    fn cancelled_analysis_stops() {
        let control = RunControl::new();
        control.cancel();
        let result = DaeAnalyzer::new().analyze_with(&index_two(), &[1.0, 0.0], 0.0, &control, None);
        assert_eq!(result.unwrap_err(), AnalysisError::Cancelled);
    }

    #[test]
    fn background_analysis_streams_progress() {
        let system: Arc<dyn DaeSystem> = Arc::new(stiff_pair());
        let task = DaeAnalyzer::new().analyze_in_background(system, vec![1.0, 1.0], 0.0);
        // the channel closes once the worker drops its sender
        let events: Vec<AnalysisProgress> = task.progress().iter().collect();
        let analysis = task.join().unwrap();
        assert!(analysis.is_stiff);

        assert_eq!(events.first().map(|e| e.stage), Some(AnalysisStage::Dependencies));
        let last = events.last().unwrap();
        assert_eq!(last.stage, AnalysisStage::Complete);
        assert_eq!(last.percentage, 100.0);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].percentage <= pair[1].percentage));
        assert!(events.iter().any(|e| e.stage == AnalysisStage::Jacobian));
    }
}
