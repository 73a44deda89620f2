use crate::error::CompareError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Termination {
    #[default]
    Completed,
    /// Stopped on request; the recorded points are valid up to the last accepted step.
    Cancelled,
}

/// Time history produced by a solver. Entries are appended in strictly increasing time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub time_points: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub derivatives: Vec<Vec<f64>>,
    pub termination: Termination,
}

impl Solution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(points: usize) -> Self {
        Self {
            time_points: Vec::with_capacity(points),
            states: Vec::with_capacity(points),
            derivatives: Vec::with_capacity(points),
            termination: Termination::Completed,
        }
    }

    /// Records one point, copying the vectors.
    pub fn log_step(&mut self, t: f64, state: &[f64], derivatives: &[f64]) {
        debug_assert!(
            self.time_points.last().map_or(true, |&last| t > last),
            "solution time must increase"
        );
        self.time_points.push(t);
        self.states.push(state.to_vec());
        self.derivatives.push(derivatives.to_vec());
    }

    pub fn len(&self) -> usize {
        self.time_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_points.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.termination == Termination::Cancelled
    }

    pub fn final_time(&self) -> Option<f64> {
        self.time_points.last().copied()
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.states.last().map(Vec::as_slice)
    }

    /// Trajectory of one variable.
    pub fn variable(&self, idx: usize) -> Vec<f64> {
        self.states
            .iter()
            .filter_map(|state| state.get(idx).copied())
            .collect()
    }

    /// Differences between consecutive time points. These carry the rounding of the time
    /// accumulation, so they may differ from the solver's step by a few ulps of `t`.
    pub fn step_sizes(&self) -> Vec<f64> {
        self.time_points.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// Pointwise comparison of a solution against a reference sampled at the same time points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub max_absolute_error: f64,
    pub mean_absolute_error: f64,
    pub root_mean_square_error: f64,
    /// ‖solution − reference‖₂ / ‖reference‖₂ over all points.
    pub relative_error: f64,
    /// RMS error divided by the range of the reference values.
    pub normalized_error: f64,
    /// Mean absolute error across variables at each time point.
    pub local_errors: Vec<f64>,
    /// Mean absolute error over time for each variable.
    pub variable_errors: Vec<f64>,
}

impl ErrorAnalysis {
    pub fn compare(solution: &Solution, reference: &Solution) -> Result<Self, CompareError> {
        if solution.len() != reference.len() {
            return Err(CompareError::LengthMismatch {
                solution: solution.len(),
                reference: reference.len(),
            });
        }
        let (Some(first), Some(first_ref)) = (solution.states.first(), reference.states.first())
        else {
            return Err(CompareError::Empty);
        };
        let dim = first.len();
        if dim == 0 || first_ref.len() != dim {
            return Err(CompareError::DimensionMismatch {
                solution: dim,
                reference: first_ref.len(),
            });
        }

        let points = solution.len();
        let mut analysis = ErrorAnalysis {
            variable_errors: vec![0.0; dim],
            local_errors: Vec::with_capacity(points),
            ..Default::default()
        };
        let mut sum_abs = 0.0;
        let mut sum_sq = 0.0;
        let mut ref_sq = 0.0;
        let mut ref_min = f64::INFINITY;
        let mut ref_max = f64::NEG_INFINITY;

        for (state, ref_state) in solution.states.iter().zip(&reference.states) {
            if state.len() != dim || ref_state.len() != dim {
                return Err(CompareError::DimensionMismatch {
                    solution: state.len(),
                    reference: ref_state.len(),
                });
            }
            let mut local = 0.0;
            for (j, (&value, &expected)) in state.iter().zip(ref_state).enumerate() {
                let error = (value - expected).abs();
                local += error;
                sum_abs += error;
                sum_sq += error * error;
                ref_sq += expected * expected;
                ref_min = ref_min.min(expected);
                ref_max = ref_max.max(expected);
                analysis.variable_errors[j] += error;
                analysis.max_absolute_error = analysis.max_absolute_error.max(error);
            }
            analysis.local_errors.push(local / dim as f64);
        }

        let count = (points * dim) as f64;
        analysis.mean_absolute_error = sum_abs / count;
        analysis.root_mean_square_error = (sum_sq / count).sqrt();
        analysis.relative_error = if ref_sq > 0.0 {
            (sum_sq / ref_sq).sqrt()
        } else {
            f64::NAN
        };
        let range = ref_max - ref_min;
        analysis.normalized_error = if range > 0.0 {
            analysis.root_mean_square_error / range
        } else {
            f64::NAN
        };
        for error in &mut analysis.variable_errors {
            *error /= points as f64;
        }

        Ok(analysis)
    }
}

impl fmt::Display for ErrorAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error analysis")?;
        writeln!(f, "  max absolute error:  {:.6e}", self.max_absolute_error)?;
        writeln!(f, "  mean absolute error: {:.6e}", self.mean_absolute_error)?;
        writeln!(f, "  RMS error:           {:.6e}", self.root_mean_square_error)?;
        writeln!(f, "  relative error:      {:.6e}", self.relative_error)?;
        writeln!(f, "  normalized error:    {:.6e}", self.normalized_error)?;
        for (idx, error) in self.variable_errors.iter().enumerate() {
            writeln!(f, "  variable {idx}: {error:.6e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn solution(values: &[[f64; 2]]) -> Solution {
        let mut solution = Solution::new();
        for (i, state) in values.iter().enumerate() {
            solution.log_step(i as f64, state, &[0.0, 0.0]);
        }
        solution
    }

    #[test]
    fn log_step_copies_vectors() {
        let mut solution = Solution::with_capacity(2);
        let mut state = vec![1.0, 2.0];
        solution.log_step(0.0, &state, &[0.0, 0.0]);
        state[0] = 5.0;
        solution.log_step(0.5, &state, &[0.0, 0.0]);
        assert_eq!(solution.len(), 2);
        assert_eq!(solution.states[0], vec![1.0, 2.0]);
        assert_eq!(solution.variable(0), vec![1.0, 5.0]);
        assert_eq!(solution.final_time(), Some(0.5));
        assert_eq!(solution.final_state(), Some(&[5.0, 2.0][..]));
        assert_eq!(solution.step_sizes(), vec![0.5]);
        assert!(!solution.is_cancelled());
    }

    #[test]
    fn compares_against_reference() {
        let computed = solution(&[[1.0, 2.0], [2.0, 4.0]]);
        let reference = solution(&[[1.0, 1.0], [2.0, 3.0]]);
        let analysis = ErrorAnalysis::compare(&computed, &reference).unwrap();
        assert_relative_eq!(analysis.max_absolute_error, 1.0);
        assert_relative_eq!(analysis.mean_absolute_error, 0.5);
        assert_relative_eq!(analysis.root_mean_square_error, 0.5f64.sqrt());
        assert_relative_eq!(analysis.relative_error, (2.0f64 / 15.0).sqrt());
        assert_relative_eq!(analysis.normalized_error, 0.5f64.sqrt() / 2.0);
        assert_eq!(analysis.local_errors, vec![0.5, 0.5]);
        assert_eq!(analysis.variable_errors, vec![0.0, 1.0]);
        assert!(analysis.to_string().contains("variable 1"));
    }

    #[test]
    fn rejects_mismatched_solutions() {
        let a = solution(&[[1.0, 2.0]]);
        let b = solution(&[[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(
            ErrorAnalysis::compare(&a, &b).unwrap_err(),
            CompareError::LengthMismatch {
                solution: 1,
                reference: 2
            }
        );
        assert_eq!(
            ErrorAnalysis::compare(&Solution::new(), &Solution::new()).unwrap_err(),
            CompareError::Empty
        );
    }
}
