//! Command-line bridge for SimDAS.
//!
//! Usage: `simdas (--model FILE | --equations FILE --initial "x=1; y=0") [--solver dassl]`

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use simdas_core::equation_engine::{parse_assignments, CompiledSystem, EquationCompiler, ModelParser};
use simdas_core::solvers::ProgressEvent;
use simdas_core::{
    DaeAnalysis, DaeAnalyzer, DaeSystem, RunControl, Solution, SolverConfig, SolverKind,
};

#[derive(Parser, Debug)]
#[command(name = "simdas")]
#[command(about = "Analyze and integrate differential-algebraic equation systems")]
struct Args {
    /// Model file with declarations, initial equations and equations
    #[arg(long, conflicts_with = "equations", required_unless_present = "equations")]
    model: Option<PathBuf>,

    /// Plain equation file, one equation per line
    #[arg(long)]
    equations: Option<PathBuf>,

    /// Parameter assignments for an equation file, e.g. "k=2; c=0.5"
    #[arg(long, requires = "equations")]
    params: Option<String>,

    /// Initial conditions for an equation file, e.g. "x=1; v=0"
    #[arg(long, requires = "equations")]
    initial: Option<String>,

    /// explicit-euler, implicit-euler, rk4 or dassl
    #[arg(long, default_value = "dassl")]
    solver: SolverKind,

    #[arg(long, default_value_t = 0.0)]
    start: f64,

    #[arg(long, default_value_t = 10.0)]
    end: f64,

    /// Number of steps for fixed-step solvers
    #[arg(long, default_value_t = 100)]
    intervals: usize,

    /// Solver settings, e.g. "relative_tolerance=1e-8; max_step=0.01"
    #[arg(long)]
    settings: Option<String>,

    /// Run the structural/numerical analysis before solving
    #[arg(long)]
    analyze: bool,

    /// Skip the time integration
    #[arg(long, requires = "analyze")]
    analyze_only: bool,

    /// Print results as JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    variables: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<&'a DaeAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    solution: Option<&'a Solution>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_system(args: &Args) -> Result<(CompiledSystem, Vec<f64>)> {
    if let Some(path) = &args.model {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading model file {}", path.display()))?;
        let model = ModelParser::parse(&text)
            .with_context(|| format!("parsing model file {}", path.display()))?;
        info!(
            name = model.name.as_deref().unwrap_or("<unnamed>"),
            variables = model.variables.len(),
            "loaded model"
        );
        return Ok(model.compile()?);
    }

    let Some(path) = &args.equations else {
        bail!("either --model or --equations is required");
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading equation file {}", path.display()))?;
    let mut compiler = EquationCompiler::new();
    if let Some(params) = &args.params {
        compiler
            .set_parameters_from_str(params)
            .context("parsing parameters")?;
    }
    let system = compiler
        .compile_source(&text)
        .with_context(|| format!("compiling {}", path.display()))?;
    let state = match &args.initial {
        Some(initial) => system
            .parse_initial_conditions(initial)
            .context("parsing initial conditions")?,
        None => bail!("--initial is required with --equations"),
    };
    Ok((system, state))
}

fn print_analysis(analysis: &DaeAnalysis, names: &[String]) {
    println!("Index:             {}", analysis.index);
    let algebraic: Vec<&str> = names
        .iter()
        .zip(&analysis.algebraic_variables)
        .filter(|(_, &a)| a)
        .map(|(name, _)| name.as_str())
        .collect();
    println!("Algebraic:         {}", algebraic.join(", "));
    println!("Stiff:             {}", analysis.is_stiff);
    println!("Stiffness ratio:   {:.3e}", analysis.stiffness_ratio);
    println!("Condition number:  {:.3e}", analysis.condition_number);
    for z in &analysis.eigenvalues {
        println!("  λ = {:.6} {:+.6}i", z.re, z.im);
    }
    for warning in &analysis.warnings {
        println!("warning: {warning}");
    }
}

fn print_solution(solution: &Solution, names: &[String]) {
    print!("{:>12}", "t");
    for name in names {
        print!(" {name:>14}");
    }
    println!();
    for (t, state) in solution.time_points.iter().zip(&solution.states) {
        print!("{t:>12.6}");
        for value in state {
            print!(" {value:>14.6e}");
        }
        println!();
    }
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let (system, initial_state) = load_system(&args)?;
    let names = system.variable_names();
    let system: Arc<dyn DaeSystem> = Arc::new(system);

    let analysis = if args.analyze {
        let analyzer = DaeAnalyzer::new().with_variable_names(names.iter().cloned());
        Some(analyzer.analyze(system.as_ref(), &initial_state, args.start)?)
    } else {
        None
    };

    let solution = if args.analyze_only {
        None
    } else {
        let settings: HashMap<String, f64> = match &args.settings {
            Some(text) => parse_assignments(text)
                .context("parsing solver settings")?
                .into_iter()
                .collect(),
            None => HashMap::new(),
        };
        let config = SolverConfig::new(args.start, args.end, args.intervals, initial_state);
        let mut solver = args.solver.build(system, config);
        solver.initialize(&settings)?;
        solver.set_progress_callback(Box::new(|event: &ProgressEvent| {
            debug!(percentage = event.percentage(), "{}", event.status);
        }));

        info!(solver = solver.name(), "integrating");
        let solution = solver.solve(&RunControl::new())?;
        solver.cleanup();
        if solution.is_cancelled() {
            warn!("integration stopped early");
        }
        info!(points = solution.len(), "integration finished");
        Some(solution)
    };

    if args.json {
        let report = Report {
            variables: &names,
            analysis: analysis.as_ref(),
            solution: solution.as_ref(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(analysis) = &analysis {
        print_analysis(analysis, &names);
    }
    if let Some(solution) = &solution {
        print_solution(solution, &names);
    }
    Ok(())
}
