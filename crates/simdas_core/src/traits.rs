use crate::error::EvalError;
use std::sync::Arc;

/// A differential-algebraic system in residual form `F(t, y, y') = 0`.
///
/// Implementations must be safe to call from several threads at once with distinct output
/// buffers: finite-difference Jacobians evaluate columns in parallel.
pub trait DaeSystem: Send + Sync {
    /// Number of state variables (and residual components).
    fn dimension(&self) -> usize;

    /// Writes `F(t, y, y')` into `out`.
    /// y: current state
    /// y_prime: current derivative estimate
    /// out: buffer of length `dimension()`
    fn residual(&self, t: f64, y: &[f64], y_prime: &[f64], out: &mut [f64])
        -> Result<(), EvalError>;

    /// Allocating convenience wrapper around [`DaeSystem::residual`].
    fn evaluate(&self, t: f64, y: &[f64], y_prime: &[f64]) -> Result<Vec<f64>, EvalError> {
        let mut out = vec![0.0; self.dimension()];
        self.residual(t, y, y_prime, &mut out)?;
        Ok(out)
    }
}

impl<S: DaeSystem + ?Sized> DaeSystem for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn residual(
        &self,
        t: f64,
        y: &[f64],
        y_prime: &[f64],
        out: &mut [f64],
    ) -> Result<(), EvalError> {
        (**self).residual(t, y, y_prime, out)
    }
}

impl<S: DaeSystem + ?Sized> DaeSystem for Arc<S> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn residual(
        &self,
        t: f64,
        y: &[f64],
        y_prime: &[f64],
        out: &mut [f64],
    ) -> Result<(), EvalError> {
        (**self).residual(t, y, y_prime, out)
    }
}

/// Adapts a plain closure into a [`DaeSystem`].
pub struct FnResidual<F> {
    dimension: usize,
    residual: F,
}

impl<F> FnResidual<F>
where
    F: Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync,
{
    pub fn new(dimension: usize, residual: F) -> Self {
        Self {
            dimension,
            residual,
        }
    }
}

impl<F> DaeSystem for FnResidual<F>
where
    F: Fn(f64, &[f64], &[f64], &mut [f64]) + Send + Sync,
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn residual(
        &self,
        t: f64,
        y: &[f64],
        y_prime: &[f64],
        out: &mut [f64],
    ) -> Result<(), EvalError> {
        check_len(self.dimension, y.len())?;
        check_len(self.dimension, y_prime.len())?;
        check_len(self.dimension, out.len())?;
        (self.residual)(t, y, y_prime, out);
        Ok(())
    }
}

pub(crate) fn check_len(expected: usize, actual: usize) -> Result<(), EvalError> {
    if expected == actual {
        Ok(())
    } else {
        Err(EvalError::DimensionMismatch { expected, actual })
    }
}
