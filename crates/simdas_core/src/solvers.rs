//! Time integrators for residual-form DAE systems.

pub mod base;
pub mod dassl;
pub mod fixed_step;

pub use base::{
    newton_subset, NewtonOutcome, NewtonSettings, ProgressCallback, ProgressEvent, Solver,
    SolverConfig, SolverCore, Unknowns,
};
pub use dassl::{DasslSettings, DasslSolver};
pub use fixed_step::{
    ExplicitEuler, ExplicitEulerMethod, FixedStepMethod, FixedStepSolver, ImplicitEuler,
    ImplicitEulerMethod, RungeKutta4, RK4,
};

use crate::traits::DaeSystem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverKind {
    ExplicitEuler,
    ImplicitEuler,
    RungeKutta4,
    Dassl,
}

impl SolverKind {
    pub const ALL: [SolverKind; 4] = [
        SolverKind::ExplicitEuler,
        SolverKind::ImplicitEuler,
        SolverKind::RungeKutta4,
        SolverKind::Dassl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SolverKind::ExplicitEuler => "Explicit Euler",
            SolverKind::ImplicitEuler => "Implicit Euler",
            SolverKind::RungeKutta4 => "Runge-Kutta 4",
            SolverKind::Dassl => "DASSL",
        }
    }

    pub fn is_fixed_step(self) -> bool {
        !matches!(self, SolverKind::Dassl)
    }

    /// Creates an uninitialized solver of this kind.
    pub fn build(self, system: Arc<dyn DaeSystem>, config: SolverConfig) -> Box<dyn Solver> {
        match self {
            SolverKind::ExplicitEuler => Box::new(ExplicitEuler::new(system, config)),
            SolverKind::ImplicitEuler => Box::new(ImplicitEuler::new(system, config)),
            SolverKind::RungeKutta4 => Box::new(RungeKutta4::new(system, config)),
            SolverKind::Dassl => Box::new(DasslSolver::new(system, config)),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SolverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "explicit-euler" | "explicit_euler" | "euler" => Ok(SolverKind::ExplicitEuler),
            "implicit-euler" | "implicit_euler" | "backward-euler" => Ok(SolverKind::ImplicitEuler),
            "rk4" | "runge-kutta-4" | "runge_kutta_4" => Ok(SolverKind::RungeKutta4),
            "dassl" | "bdf" => Ok(SolverKind::Dassl),
            other => Err(format!(
                "unknown solver '{other}' (expected explicit-euler, implicit-euler, rk4 or dassl)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnResidual;

    #[test]
    fn parses_solver_names() {
        assert_eq!("RK4".parse::<SolverKind>(), Ok(SolverKind::RungeKutta4));
        assert_eq!("euler".parse::<SolverKind>(), Ok(SolverKind::ExplicitEuler));
        assert_eq!(" bdf ".parse::<SolverKind>(), Ok(SolverKind::Dassl));
        assert!("adams".parse::<SolverKind>().is_err());
    }

    #[test]
    fn factory_builds_every_kind() {
        let system: Arc<dyn DaeSystem> = Arc::new(FnResidual::new(
            1,
            |_t, y: &[f64], yp: &[f64], out: &mut [f64]| out[0] = yp[0] + y[0],
        ));
        for kind in SolverKind::ALL {
            let solver = kind.build(system.clone(), SolverConfig::default());
            assert_eq!(solver.kind(), kind);
            assert_eq!(solver.name(), kind.to_string());
            assert_eq!(solver.is_fixed_step(), kind != SolverKind::Dassl);
        }
    }
}
