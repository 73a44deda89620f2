//! Dense linear algebra and finite-difference helpers shared by the analyzer and the solvers.

use crate::control::RunControl;
use crate::error::{EvalError, JacobianError};
use crate::traits::DaeSystem;
use nalgebra::{DMatrix, DVector, Dyn, LU};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pivots smaller than this, relative to the largest matrix entry, mark the matrix singular.
pub const SINGULAR_PIVOT: f64 = 1e-12;

/// A residual whose sensitivity to a perturbed coordinate stays below this is treated as
/// independent of it.
pub const DETECTION_THRESHOLD: f64 = 1e-6;

/// Smallest number of columns handed to one worker.
pub const MIN_BATCH_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingularMatrix;

fn factor(matrix: DMatrix<f64>) -> Result<LU<f64, Dyn, Dyn>, SingularMatrix> {
    let scale = matrix.amax();
    if !scale.is_finite() || scale == 0.0 {
        return Err(SingularMatrix);
    }
    let lu = matrix.lu();
    let singular = lu
        .u()
        .diagonal()
        .iter()
        .any(|pivot| pivot.abs() <= SINGULAR_PIVOT * scale);
    if singular {
        Err(SingularMatrix)
    } else {
        Ok(lu)
    }
}

/// Solves `matrix * x = rhs` by LU decomposition with partial pivoting.
pub fn solve_linear_system(matrix: DMatrix<f64>, rhs: &[f64]) -> Result<Vec<f64>, SingularMatrix> {
    let rhs = DVector::from_column_slice(rhs);
    factor(matrix)?
        .solve(&rhs)
        .map(|v| v.iter().copied().collect())
        .ok_or(SingularMatrix)
}

/// Solves `matrix * X = rhs` for a matrix right-hand side.
pub fn solve_matrix(matrix: DMatrix<f64>, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, SingularMatrix> {
    factor(matrix)?.solve(rhs).ok_or(SingularMatrix)
}

pub fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Weighted root-mean-square norm `sqrt(mean((v_i / w_i)^2))`.
pub fn wrms_norm(values: &[f64], weights: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| (v / w).powi(2))
        .sum();
    (sum / values.len() as f64).sqrt()
}

/// Forward-difference increment for a coordinate with current `value`.
pub fn fd_increment(value: f64, scale: f64) -> f64 {
    f64::EPSILON.sqrt() * value.abs().max(scale)
}

/// Change between two residual values with rounding noise discounted.
pub fn residual_change(before: f64, after: f64) -> f64 {
    let diff = (after - before).abs();
    let noise = 16.0 * f64::EPSILON * before.abs().max(after.abs());
    if diff <= noise {
        0.0
    } else {
        diff
    }
}

/// Which arguments a finite-difference column perturbs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Perturbation {
    /// `∂F/∂y`
    State,
    /// `∂F/∂y'`
    Derivative,
    /// `∂F/∂y + w·∂F/∂y'` from a single evaluation per column.
    Combined { derivative_weight: f64 },
}

struct Scratch {
    state: Vec<f64>,
    derivatives: Vec<f64>,
    out: Vec<f64>,
}

/// Evaluation point for finite-difference Jacobians.
#[derive(Clone, Copy)]
pub struct JacobianProbe<'a> {
    pub system: &'a dyn DaeSystem,
    pub time: f64,
    pub state: &'a [f64],
    pub derivatives: &'a [f64],
    pub control: Option<&'a RunControl>,
}

impl<'a> JacobianProbe<'a> {
    pub fn new(
        system: &'a dyn DaeSystem,
        time: f64,
        state: &'a [f64],
        derivatives: &'a [f64],
    ) -> Self {
        Self {
            system,
            time,
            state,
            derivatives,
            control: None,
        }
    }

    pub fn with_control(mut self, control: &'a RunControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn residual(&self) -> Result<Vec<f64>, EvalError> {
        self.system.evaluate(self.time, self.state, self.derivatives)
    }

    /// Builds the `n × columns.len()` matrix of forward differences against `base`, the
    /// residual at the probe point. Column `k` perturbs coordinate `columns[k]` by
    /// `increments[columns[k]]`.
    ///
    /// Columns are evaluated in parallel; each worker owns its scratch buffers. `progress`
    /// receives `(completed, total)` after every column.
    pub fn columns(
        &self,
        base: &[f64],
        columns: &[usize],
        perturbation: Perturbation,
        increments: &[f64],
        progress: Option<&(dyn Fn(usize, usize) + Sync)>,
    ) -> Result<DMatrix<f64>, JacobianError> {
        let n = base.len();
        if n == 0 || columns.is_empty() {
            return Ok(DMatrix::zeros(n, columns.len()));
        }

        let mut data = vec![0.0; n * columns.len()];
        let completed = AtomicUsize::new(0);
        let total = columns.len();

        data.par_chunks_mut(n)
            .zip(columns.par_iter())
            .with_min_len(MIN_BATCH_SIZE)
            .try_for_each_init(
                || Scratch {
                    state: self.state.to_vec(),
                    derivatives: self.derivatives.to_vec(),
                    out: vec![0.0; n],
                },
                |scratch, (column, &j)| -> Result<(), JacobianError> {
                    if let Some(control) = self.control {
                        control.ensure_active()?;
                    }

                    let h = increments[j];
                    let (saved_y, saved_yp) = (scratch.state[j], scratch.derivatives[j]);
                    match perturbation {
                        Perturbation::State => scratch.state[j] += h,
                        Perturbation::Derivative => scratch.derivatives[j] += h,
                        Perturbation::Combined { derivative_weight } => {
                            scratch.state[j] += h;
                            scratch.derivatives[j] += derivative_weight * h;
                        }
                    }
                    let evaluated = self.system.residual(
                        self.time,
                        &scratch.state,
                        &scratch.derivatives,
                        &mut scratch.out,
                    );
                    scratch.state[j] = saved_y;
                    scratch.derivatives[j] = saved_yp;
                    evaluated?;

                    for ((entry, &f), &f0) in column.iter_mut().zip(&scratch.out).zip(base) {
                        *entry = (f - f0) / h;
                    }

                    if let Some(report) = progress {
                        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        report(done, total);
                    }
                    Ok(())
                },
            )?;

        Ok(DMatrix::from_vec(n, columns.len(), data))
    }

    /// Full square Jacobian with the same increment `h` for every column.
    pub fn square(
        &self,
        base: &[f64],
        perturbation: Perturbation,
        h: f64,
        progress: Option<&(dyn Fn(usize, usize) + Sync)>,
    ) -> Result<DMatrix<f64>, JacobianError> {
        let n = base.len();
        let columns: Vec<usize> = (0..n).collect();
        let increments = vec![h; n];
        self.columns(base, &columns, perturbation, &increments, progress)
    }
}

/// Flags variables whose derivative does not influence any residual component.
///
/// Each `y'[i]` is perturbed by `perturbation`; when the summed residual change divided by the
/// perturbation stays at or below [`DETECTION_THRESHOLD`] the variable is algebraic.
pub fn classify_algebraic(
    system: &dyn DaeSystem,
    t: f64,
    y: &[f64],
    y_prime: &[f64],
    perturbation: f64,
) -> Result<Vec<bool>, EvalError> {
    let n = system.dimension();
    let base = system.evaluate(t, y, y_prime)?;

    (0..n)
        .into_par_iter()
        .with_min_len(MIN_BATCH_SIZE)
        .map_init(
            || (y_prime.to_vec(), vec![0.0; n]),
            |(derivatives, out), i| -> Result<bool, EvalError> {
                let saved = derivatives[i];
                derivatives[i] += perturbation;
                let evaluated = system.residual(t, y, derivatives, out);
                derivatives[i] = saved;
                evaluated?;

                let change: f64 = base
                    .iter()
                    .zip(out.iter())
                    .map(|(&before, &after)| residual_change(before, after))
                    .sum();
                Ok(change <= DETECTION_THRESHOLD * perturbation)
            },
        )
        .collect()
}

/// Which residual rows react to each coordinate: `pattern[j][i]` is true when residual `i`
/// changes by more than [`DETECTION_THRESHOLD`] times `h` when coordinate `j` moves by `h`.
#[allow(clippy::too_many_arguments)]
pub fn sensitivity_pattern(
    system: &dyn DaeSystem,
    t: f64,
    y: &[f64],
    y_prime: &[f64],
    perturbation: Perturbation,
    h: f64,
    control: Option<&RunControl>,
) -> Result<Vec<Vec<bool>>, JacobianError> {
    let n = system.dimension();
    let base = system.evaluate(t, y, y_prime)?;

    (0..n)
        .into_par_iter()
        .with_min_len(MIN_BATCH_SIZE)
        .map_init(
            || Scratch {
                state: y.to_vec(),
                derivatives: y_prime.to_vec(),
                out: vec![0.0; n],
            },
            |scratch, j| -> Result<Vec<bool>, JacobianError> {
                if let Some(control) = control {
                    control.ensure_active()?;
                }
                let (saved_y, saved_yp) = (scratch.state[j], scratch.derivatives[j]);
                match perturbation {
                    Perturbation::State => scratch.state[j] += h,
                    Perturbation::Derivative => scratch.derivatives[j] += h,
                    Perturbation::Combined { derivative_weight } => {
                        scratch.state[j] += h;
                        scratch.derivatives[j] += derivative_weight * h;
                    }
                }
                let evaluated =
                    system.residual(t, &scratch.state, &scratch.derivatives, &mut scratch.out);
                scratch.state[j] = saved_y;
                scratch.derivatives[j] = saved_yp;
                evaluated?;

                Ok(base
                    .iter()
                    .zip(&scratch.out)
                    .map(|(&before, &after)| residual_change(before, after) > DETECTION_THRESHOLD * h)
                    .collect())
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnResidual;
    use approx::assert_relative_eq;

    #[test]
    fn solves_pivoted_system() {
        let matrix = DMatrix::from_row_slice(2, 2, &[0.0, 2.0, 3.0, 1.0]);
        let x = solve_linear_system(matrix, &[4.0, 5.0]).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn detects_singular_matrices() {
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert_eq!(solve_linear_system(matrix, &[1.0, 2.0]), Err(SingularMatrix));
        assert_eq!(
            solve_linear_system(DMatrix::zeros(2, 2), &[1.0, 2.0]),
            Err(SingularMatrix)
        );
    }

    #[test]
    fn norms() {
        assert_relative_eq!(l2_norm(&[3.0, 4.0]), 5.0);
        assert_relative_eq!(wrms_norm(&[2.0, 2.0], &[1.0, 2.0]), (2.5f64).sqrt());
        assert_eq!(wrms_norm(&[], &[]), 0.0);
        assert_eq!(residual_change(1.0, 1.0 + f64::EPSILON), 0.0);
        assert_relative_eq!(residual_change(1.0, 1.5), 0.5);
    }

    fn coupled() -> FnResidual<impl Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync> {
        FnResidual::new(3, |_t, y: &[f64], yp: &[f64], out: &mut [f64]| {
            out[0] = yp[0] - y[1] * y[1];
            out[1] = 2.0 * yp[1] + y[0];
            out[2] = y[0] + 3.0 * y[2];
        })
    }

    #[test]
    fn finite_difference_columns_match_analytic_jacobian() {
        let system = coupled();
        let y = [1.0, 2.0, 3.0];
        let yp = [0.0; 3];
        let probe = JacobianProbe::new(&system, 0.0, &y, &yp);
        let base = probe.residual().unwrap();

        let dy = probe.square(&base, Perturbation::State, 1e-7, None).unwrap();
        assert_relative_eq!(dy[(0, 1)], -4.0, epsilon = 1e-5);
        assert_relative_eq!(dy[(1, 0)], 1.0, epsilon = 1e-6);
        assert_relative_eq!(dy[(2, 2)], 3.0, epsilon = 1e-6);

        let dyp = probe
            .square(&base, Perturbation::Derivative, 1e-7, None)
            .unwrap();
        assert_relative_eq!(dyp[(0, 0)], 1.0, epsilon = 1e-6);
        assert_relative_eq!(dyp[(1, 1)], 2.0, epsilon = 1e-6);
        assert_relative_eq!(dyp[(2, 2)], 0.0, epsilon = 1e-6);

        let combined = probe
            .columns(
                &base,
                &[1, 2],
                Perturbation::Combined {
                    derivative_weight: 10.0,
                },
                &[1e-7; 3],
                None,
            )
            .unwrap();
        assert_eq!(combined.shape(), (3, 2));
        assert_relative_eq!(combined[(1, 0)], 20.0, epsilon = 1e-5);
        assert_relative_eq!(combined[(2, 1)], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn reports_progress_per_column() {
        let system = coupled();
        let y = [1.0, 2.0, 3.0];
        let yp = [0.0; 3];
        let probe = JacobianProbe::new(&system, 0.0, &y, &yp);
        let base = probe.residual().unwrap();
        let calls = AtomicUsize::new(0);
        let report = |_done: usize, total: usize| {
            assert_eq!(total, 3);
            calls.fetch_add(1, Ordering::Relaxed);
        };
        probe
            .square(&base, Perturbation::State, 1e-7, Some(&report))
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn cancelled_probe_stops() {
        let system = coupled();
        let y = [1.0, 2.0, 3.0];
        let yp = [0.0; 3];
        let control = RunControl::new();
        control.cancel();
        let probe = JacobianProbe::new(&system, 0.0, &y, &yp).with_control(&control);
        let base = probe.residual().unwrap();
        assert_eq!(
            probe.square(&base, Perturbation::State, 1e-7, None),
            Err(JacobianError::Cancelled)
        );
    }

    #[test]
    fn solves_matrix_right_hand_sides() {
        let matrix = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]);
        let rhs = DMatrix::from_row_slice(2, 2, &[2.0, 4.0, 4.0, 8.0]);
        let x = solve_matrix(matrix, &rhs).unwrap();
        assert_eq!(x, DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 1.0, 2.0]));
    }

    #[test]
    fn sensitivity_pattern_marks_dependencies() {
        let system = coupled();
        let y = [1.0, 2.0, 3.0];
        let pattern =
            sensitivity_pattern(&system, 0.0, &y, &[0.0; 3], Perturbation::State, 1e-6, None)
                .unwrap();
        // column j lists the rows that depend on y[j]
        assert_eq!(pattern[0], vec![false, true, true]);
        assert_eq!(pattern[1], vec![true, false, false]);
        assert_eq!(pattern[2], vec![false, false, true]);

        let pattern =
            sensitivity_pattern(&system, 0.0, &y, &[0.0; 3], Perturbation::Derivative, 1e-6, None)
                .unwrap();
        assert_eq!(pattern[0], vec![true, false, false]);
        assert_eq!(pattern[2], vec![false, false, false]);
    }

    #[test]
    fn classifies_algebraic_variables() {
        let system = coupled();
        let flags = classify_algebraic(&system, 0.0, &[1.0, 2.0, 3.0], &[0.0; 3], 1e-6).unwrap();
        assert_eq!(flags, vec![false, false, true]);
    }
}
