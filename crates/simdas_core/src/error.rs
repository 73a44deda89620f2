use thiserror::Error;

fn join(names: &[String]) -> String {
    names.join(", ")
}

/// Errors raised while turning text (equations, parameters, models) into a compiled system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unexpected character '{ch}' at position {position} in \"{input}\"")]
    UnexpectedCharacter {
        ch: char,
        position: usize,
        input: String,
    },

    #[error("invalid equation format: {0}")]
    InvalidEquationFormat(String),

    #[error("invalid variable name: {0}")]
    InvalidVariableName(String),

    #[error("variable {0} appears in multiple equations")]
    DuplicateVariable(String),

    #[error("cannot use parameter {0} as variable")]
    ParameterAsVariable(String),

    #[error("no equations defined")]
    EmptySystem,

    #[error("missing equations for variables: {}", join(.0))]
    MissingEquations(Vec<String>),

    #[error("equations define undeclared variables: {}", join(.0))]
    UndeclaredVariables(Vec<String>),

    #[error("undefined symbols referenced: {}", join(.0))]
    UndefinedSymbols(Vec<String>),

    #[error("invalid expression in \"{equation}\": {source}")]
    Expression {
        equation: String,
        #[source]
        source: EvalError,
    },

    #[error("invalid assignment format: {0}")]
    InvalidAssignment(String),

    #[error("invalid number format for {name}: {text}")]
    InvalidNumber { name: String, text: String },

    #[error("duplicate assignment for {0}")]
    DuplicateAssignment(String),

    #[error("unknown variable in initial conditions: {0}")]
    UnknownVariable(String),

    #[error("missing initial conditions for variables: {}", join(.0))]
    MissingInitialConditions(Vec<String>),

    #[error("invalid model declaration on line {line}: {text}")]
    InvalidDeclaration { line: usize, text: String },

    #[error("statement outside of a section on line {line}: {text}")]
    StatementOutsideSection { line: usize, text: String },
}

/// Errors raised while evaluating an expression or a residual.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unknown variable or parameter: {0}")]
    UnknownSymbol(String),

    #[error("mismatched parentheses")]
    MismatchedParentheses,

    #[error("invalid expression: not enough operands for '{0}'")]
    MissingOperand(String),

    #[error("invalid expression: incorrect number of operands ({0} left on stack)")]
    OperandCount(usize),

    #[error("function {0} must be followed by '('")]
    FunctionWithoutArguments(String),

    #[error("der() expects a single variable name, got {0}")]
    InvalidDerivative(String),

    #[error("invalid number literal: {0}")]
    InvalidNumber(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("square root of negative number ({0})")]
    NegativeSqrt(f64),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors raised while building a finite-difference Jacobian.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JacobianError {
    #[error(transparent)]
    Evaluation(#[from] EvalError),

    #[error("jacobian evaluation cancelled")]
    Cancelled,
}

/// Errors raised by the structural/numerical analyzer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("initial state dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("system has zero dimension")]
    EmptySystem,

    #[error(transparent)]
    Evaluation(#[from] EvalError),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("analysis worker terminated unexpectedly")]
    WorkerPanicked,
}

/// Errors raised by the time integrators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("solver has not been initialized")]
    NotInitialized,

    #[error(transparent)]
    Evaluation(#[from] EvalError),

    #[error("step size too small ({step:e}) at t = {time}")]
    StepSizeTooSmall { time: f64, step: f64 },

    #[error("too many consecutive step failures ({failures}) at t = {time}")]
    TooManyFailures { time: f64, failures: usize },

    #[error("integration cancelled")]
    Cancelled,
}

/// Errors raised when two solutions cannot be compared.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompareError {
    #[error("solutions have different lengths ({solution} vs {reference})")]
    LengthMismatch { solution: usize, reference: usize },

    #[error("solutions have different state dimensions ({solution} vs {reference})")]
    DimensionMismatch { solution: usize, reference: usize },

    #[error("cannot compare empty solutions")]
    Empty,
}

impl From<JacobianError> for SolverError {
    fn from(err: JacobianError) -> Self {
        match err {
            JacobianError::Evaluation(e) => SolverError::Evaluation(e),
            JacobianError::Cancelled => SolverError::Cancelled,
        }
    }
}

impl From<JacobianError> for AnalysisError {
    fn from(err: JacobianError) -> Self {
        match err {
            JacobianError::Evaluation(e) => AnalysisError::Evaluation(e),
            JacobianError::Cancelled => AnalysisError::Cancelled,
        }
    }
}
