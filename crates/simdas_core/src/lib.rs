//! The `simdas_core` crate is the numerical engine behind SimDAS.
//! It compiles textual equation systems into residual form `F(t, y, y') = 0`,
//! inspects their structure and integrates them in time.
//!
//! Key components:
//! - **Equation Engine**: tokenizer, postfix bytecode VM and the equation/model compilers.
//! - **Analysis**: variable classification, structural index, stiffness and dependency structure.
//! - **Solvers**: Explicit Euler, Implicit Euler, RK4 and a variable-order BDF (DASSL) integrator.
//! - **Control**: cooperative pause/resume/cancel shared by long-running operations.
pub mod analysis;
pub mod control;
pub mod equation_engine;
pub mod error;
pub mod numerics;
pub mod solution;
pub mod solvers;
pub mod traits;

pub use analysis::{AnalysisProgress, AnalysisStage, AnalyzerSettings, DaeAnalysis, DaeAnalyzer};
pub use control::RunControl;
pub use error::{AnalysisError, EvalError, JacobianError, ParseError, SolverError};
pub use solution::{ErrorAnalysis, Solution, Termination};
pub use solvers::{Solver, SolverConfig, SolverKind};
pub use traits::{DaeSystem, FnResidual};
