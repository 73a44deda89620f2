use super::assignments;
use super::evaluator::{Bindings, Bytecode, SymbolTable, VM};
use super::tokenizer::{tokenize, Token, TokenKind, Tokenizer};
use super::{is_identifier, is_reserved};
use crate::error::{EvalError, ParseError};
use crate::traits::{check_len, DaeSystem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquationKind {
    /// `der(x) = rhs`, residual `x' - rhs`.
    Differential,
    /// `x = rhs`, residual `rhs` (the constraint `rhs = 0`).
    Algebraic,
}

/// One compiled `lhs = rhs` statement.
#[derive(Debug, Clone)]
pub struct Equation {
    pub variable: String,
    pub index: usize,
    pub kind: EquationKind,
    /// The statement as written, comments removed.
    pub source: String,
    pub expression: String,
    bytecode: Bytecode,
}

impl Equation {
    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }
}

/// Parses equation text into a [`CompiledSystem`].
#[derive(Debug, Clone, Default)]
pub struct EquationCompiler {
    parameters: BTreeMap<String, f64>,
}

struct Statement {
    source: String,
    variable: String,
    kind: EquationKind,
    expression: String,
    tokens: Vec<Token>,
}

impl EquationCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.set_parameters(parameters);
        self
    }

    pub fn set_parameters<I, S>(&mut self, parameters: I)
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.parameters = parameters
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();
    }

    /// Parses `name=value` pairs (see [`assignments::parse_parameters`]) and uses them.
    pub fn set_parameters_from_str(&mut self, text: &str) -> Result<(), ParseError> {
        let parsed = assignments::parse_parameters(text)?;
        self.set_parameters(parsed);
        Ok(())
    }

    /// Compiles a multi-line equation listing.
    pub fn compile_source(&self, source: &str) -> Result<CompiledSystem, ParseError> {
        let lines: Vec<&str> = source.lines().collect();
        self.compile(&lines)
    }

    /// Compiles one equation per line. Variables are indexed in the order their defining
    /// equations appear.
    pub fn compile<S: AsRef<str>>(&self, lines: &[S]) -> Result<CompiledSystem, ParseError> {
        let statements = self.parse_statements(lines)?;
        let mut variables = SymbolTable::new();
        for statement in &statements {
            variables.insert(&statement.variable);
        }
        self.build(statements, variables)
    }

    /// Compiles equations against an explicit declaration list. Every declared variable must
    /// have exactly one defining equation and every equation must define a declared variable.
    /// Variables are indexed in declaration order.
    pub fn compile_declared<S: AsRef<str>>(
        &self,
        lines: &[S],
        declared: &[String],
    ) -> Result<CompiledSystem, ParseError> {
        let mut statements = self.parse_statements(lines)?;
        let defined: BTreeSet<&str> = statements.iter().map(|s| s.variable.as_str()).collect();
        let declared_set: BTreeSet<&str> = declared.iter().map(String::as_str).collect();

        let missing: Vec<String> = declared
            .iter()
            .filter(|name| !defined.contains(name.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::MissingEquations(missing));
        }
        let extra: Vec<String> = statements
            .iter()
            .filter(|s| !declared_set.contains(s.variable.as_str()))
            .map(|s| s.variable.clone())
            .collect();
        if !extra.is_empty() {
            return Err(ParseError::UndeclaredVariables(extra));
        }

        let variables: SymbolTable = declared.iter().collect();
        statements.sort_by_key(|s| variables.index_of(&s.variable).unwrap_or(usize::MAX));
        self.build(statements, variables)
    }

    fn parse_statements<S: AsRef<str>>(&self, lines: &[S]) -> Result<Vec<Statement>, ParseError> {
        let mut tokenizer = Tokenizer::new();
        let mut seen = BTreeSet::new();
        let mut statements = Vec::new();

        for line in lines {
            let stripped = tokenizer.strip_comments(line.as_ref());
            let text = stripped.trim_end_matches(';').trim();
            if text.is_empty() {
                continue;
            }

            let statement = self.parse_statement(text)?;
            if !seen.insert(statement.variable.clone()) {
                return Err(ParseError::DuplicateVariable(statement.variable));
            }
            statements.push(statement);
        }

        if statements.is_empty() {
            return Err(ParseError::EmptySystem);
        }
        Ok(statements)
    }

    fn parse_statement(&self, text: &str) -> Result<Statement, ParseError> {
        let parts: Vec<&str> = text.split('=').collect();
        if parts.len() != 2 {
            return Err(ParseError::InvalidEquationFormat(text.to_string()));
        }
        let (lhs, rhs) = (parts[0].trim(), parts[1].trim());
        if lhs.is_empty() || rhs.is_empty() {
            return Err(ParseError::InvalidEquationFormat(text.to_string()));
        }

        let (variable, kind) = parse_lhs(lhs)?;
        if self.parameters.contains_key(variable) {
            return Err(ParseError::ParameterAsVariable(variable.to_string()));
        }

        Ok(Statement {
            source: text.to_string(),
            variable: variable.to_string(),
            kind,
            expression: rhs.to_string(),
            tokens: tokenize(rhs)?,
        })
    }

    fn build(
        &self,
        statements: Vec<Statement>,
        variables: SymbolTable,
    ) -> Result<CompiledSystem, ParseError> {
        let parameters: SymbolTable = self.parameters.keys().collect();
        let parameter_values: Vec<f64> = self.parameters.values().copied().collect();

        let undefined = undefined_symbols(&statements, &variables, &parameters);
        if !undefined.is_empty() {
            return Err(ParseError::UndefinedSymbols(undefined));
        }

        let mut equations = Vec::with_capacity(statements.len());
        for (index, statement) in statements.into_iter().enumerate() {
            let bytecode = Bytecode::compile(&statement.tokens, &variables, &parameters)
                .map_err(|source| ParseError::Expression {
                    equation: statement.source.clone(),
                    source,
                })?;
            debug!(
                variable = %statement.variable,
                kind = ?statement.kind,
                ops = bytecode.ops.len(),
                "compiled equation"
            );
            equations.push(Equation {
                variable: statement.variable,
                index,
                kind: statement.kind,
                source: statement.source,
                expression: statement.expression,
                bytecode,
            });
        }

        let stack_depth = equations
            .iter()
            .map(|eq| eq.bytecode.max_depth())
            .max()
            .unwrap_or(0);
        let differential = equations
            .iter()
            .filter(|eq| eq.kind == EquationKind::Differential)
            .count();
        info!(
            equations = equations.len(),
            differential,
            algebraic = equations.len() - differential,
            parameters = parameters.len(),
            "compiled equation system"
        );

        Ok(CompiledSystem {
            variables,
            parameters,
            parameter_values,
            equations,
            stack_depth,
        })
    }
}

fn parse_lhs(lhs: &str) -> Result<(&str, EquationKind), ParseError> {
    let invalid = || ParseError::InvalidVariableName(lhs.to_string());

    let (name, kind) = match lhs.strip_prefix("der") {
        Some(rest) if rest.trim_start().starts_with('(') => {
            let inner = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(invalid)?;
            (inner.trim(), EquationKind::Differential)
        }
        _ => (lhs, EquationKind::Algebraic),
    };

    if !is_identifier(name) || is_reserved(name) {
        return Err(invalid());
    }
    Ok((name, kind))
}

fn undefined_symbols(
    statements: &[Statement],
    variables: &SymbolTable,
    parameters: &SymbolTable,
) -> Vec<String> {
    let mut undefined = BTreeSet::new();
    for statement in statements {
        let tokens = &statement.tokens;
        for (i, token) in tokens.iter().enumerate() {
            if token.kind != TokenKind::Identifier || token.text == "t" {
                continue;
            }
            let is_der_target = i >= 2 && tokens[i - 2].text == "der";
            let known = if is_der_target {
                variables.contains(&token.text)
            } else {
                variables.contains(&token.text) || parameters.contains(&token.text)
            };
            if !known {
                undefined.insert(token.text.clone());
            }
        }
    }
    undefined.into_iter().collect()
}

/// A compiled equation system, evaluable as a residual `F(t, y, y') = 0`.
///
/// Equation `i` defines variable `i`. Evaluation allocates its own scratch stack so the system
/// can be shared across threads.
#[derive(Debug, Clone)]
pub struct CompiledSystem {
    variables: SymbolTable,
    parameters: SymbolTable,
    parameter_values: Vec<f64>,
    equations: Vec<Equation>,
    stack_depth: usize,
}

impl CompiledSystem {
    pub fn variables(&self) -> &SymbolTable {
        &self.variables
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.names().to_vec()
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters
            .index_of(name)
            .map(|idx| self.parameter_values[idx])
    }

    /// Rebinds a parameter value without recompiling. Returns `false` for unknown names.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> bool {
        match self.parameters.index_of(name) {
            Some(idx) => {
                self.parameter_values[idx] = value;
                true
            }
            None => false,
        }
    }

    /// `true` for variables whose equation is written with `der(...)`.
    pub fn differential_mask(&self) -> Vec<bool> {
        self.equations
            .iter()
            .map(|eq| eq.kind == EquationKind::Differential)
            .collect()
    }

    /// Parses `name=value` initial conditions into a state vector ordered like the variables.
    pub fn parse_initial_conditions(&self, text: &str) -> Result<Vec<f64>, ParseError> {
        assignments::parse_initial_conditions(text, &self.variables)
    }
}

impl DaeSystem for CompiledSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn residual(
        &self,
        t: f64,
        y: &[f64],
        y_prime: &[f64],
        out: &mut [f64],
    ) -> Result<(), EvalError> {
        let n = self.dimension();
        check_len(n, y.len())?;
        check_len(n, y_prime.len())?;
        check_len(n, out.len())?;

        let bindings = Bindings {
            time: t,
            state: y,
            derivatives: y_prime,
            parameters: &self.parameter_values,
        };
        let mut stack = Vec::with_capacity(self.stack_depth);

        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            let value = VM::execute(&eq.bytecode, &bindings, &mut stack)?;
            *slot = match eq.kind {
                EquationKind::Differential => y_prime[eq.index] - value,
                EquationKind::Algebraic => value,
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, ParseError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn oscillator() -> CompiledSystem {
        EquationCompiler::new()
            .with_parameters([("k", 2.0), ("c", 0.5)])
            .compile(&["der(x) = v", "der(v) = -k*x - c*v"])
            .expect("compile")
    }

    #[test]
    fn compiles_differential_equations() {
        let system = oscillator();
        assert_eq!(system.dimension(), 2);
        assert_eq!(system.variable_names(), ["x", "v"]);
        assert_eq!(system.differential_mask(), [true, true]);

        let residual = system.evaluate(0.0, &[1.0, 2.0], &[0.5, 0.25]).unwrap();
        assert_relative_eq!(residual[0], 0.5 - 2.0);
        assert_relative_eq!(residual[1], 0.25 - (-2.0 - 1.0));
    }

    #[test]
    fn algebraic_residual_is_the_right_hand_side() {
        let system = EquationCompiler::new()
            .compile(&["der(x) = y", "der(y) = z*x", "z = x^2 + y^2 - 1"])
            .unwrap();
        assert_eq!(system.differential_mask(), [true, true, false]);
        let residual = system.evaluate(0.0, &[0.6, 0.8, 3.0], &[9.0, 9.0, 9.0]).unwrap();
        assert_relative_eq!(residual[2], 0.0, epsilon = 1e-12);
        assert_relative_eq!(residual[1], 9.0 - 1.8);
    }

    #[test]
    fn residual_may_reference_time_and_derivatives() {
        let system = EquationCompiler::new()
            .compile(&["der(x) = sin(t)", "y = der(x) - y"])
            .unwrap();
        let residual = system.evaluate(0.0, &[0.0, 1.0], &[3.0, 0.0]).unwrap();
        assert_relative_eq!(residual[0], 3.0);
        assert_relative_eq!(residual[1], 2.0);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let source = "
            // harmonic oscillator
            der(x) = v;   # position
            /* velocity equation
               spans two lines */
            der(v) = -x
        ";
        let system = EquationCompiler::new().compile_source(source).unwrap();
        assert_eq!(system.variable_names(), ["x", "v"]);
        assert_eq!(system.equations()[1].source, "der(v) = -x");
    }

    #[test]
    fn rejects_duplicate_equations() {
        let result = EquationCompiler::new().compile(&["der(x) = 1", "x = 2"]);
        assert_eq!(
            result.unwrap_err(),
            ParseError::DuplicateVariable("x".to_string())
        );
        assert_err_contains(
            EquationCompiler::new().compile(&["der(x) = 1", "der(x) = 2"]),
            "appears in multiple equations",
        );
    }

    #[test]
    fn rejects_malformed_statements() {
        assert_err_contains(
            EquationCompiler::new().compile(&["der(x) = y = 1"]),
            "invalid equation format",
        );
        assert_err_contains(
            EquationCompiler::new().compile(&["der(x) 1"]),
            "invalid equation format",
        );
        assert_err_contains(
            EquationCompiler::new().compile(&["2x = 1"]),
            "invalid variable name",
        );
        assert_err_contains(
            EquationCompiler::new().compile(&["der(x + y) = 1"]),
            "invalid variable name",
        );
        assert_err_contains(
            EquationCompiler::new().compile(&["t = 1"]),
            "invalid variable name",
        );
        assert_err_contains(
            EquationCompiler::new().compile(&["x = 1 +"]),
            "not enough operands",
        );
        assert_eq!(
            EquationCompiler::new().compile(&["// nothing"]).unwrap_err(),
            ParseError::EmptySystem
        );
    }

    #[test]
    fn rejects_parameters_used_as_variables() {
        let result = EquationCompiler::new()
            .with_parameters([("k", 1.0)])
            .compile(&["der(k) = 1"]);
        assert_eq!(
            result.unwrap_err(),
            ParseError::ParameterAsVariable("k".to_string())
        );
    }

    #[test]
    fn reports_undefined_symbols() {
        let result = EquationCompiler::new().compile(&["der(x) = a*x + b", "der(y) = der(q)"]);
        assert_eq!(
            result.unwrap_err(),
            ParseError::UndefinedSymbols(vec!["a".into(), "b".into(), "q".into()])
        );
    }

    #[test]
    fn declared_compilation_checks_coverage() {
        let declared = vec!["y".to_string(), "x".to_string()];
        let system = EquationCompiler::new()
            .compile_declared(&["der(x) = y", "der(y) = -x"], &declared)
            .unwrap();
        assert_eq!(system.variable_names(), ["y", "x"]);
        assert_eq!(system.equations()[0].variable, "y");
        let residual = system.evaluate(0.0, &[1.0, 2.0], &[0.0, 0.0]).unwrap();
        assert_relative_eq!(residual[0], 2.0);
        assert_relative_eq!(residual[1], -1.0);

        let declared = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        assert_err_contains(
            EquationCompiler::new().compile_declared(&["der(x) = y", "der(y) = -x"], &declared),
            "missing equations for variables: z",
        );

        let declared = vec!["x".to_string()];
        assert_err_contains(
            EquationCompiler::new().compile_declared(&["der(x) = 1", "der(w) = 1"], &declared),
            "undeclared variables: w",
        );
    }

    #[test]
    fn evaluation_errors_surface_from_residual() {
        let system = EquationCompiler::new()
            .compile(&["der(x) = 1 / (x - 1)"])
            .unwrap();
        assert_eq!(
            system.evaluate(0.0, &[1.0], &[0.0]).unwrap_err(),
            EvalError::DivisionByZero
        );
        assert!(matches!(
            system.evaluate(0.0, &[1.0, 2.0], &[0.0]),
            Err(EvalError::DimensionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn recompiling_gives_bit_identical_residuals() {
        let source = "
            der(x) = v
            der(v) = -k*x - c*v + sin(t)
            e = der(x)^2 / 2 + k*x^2 / 2 - e
        ";
        let compile = || {
            EquationCompiler::new()
                .with_parameters([("k", 2.0), ("c", 0.3)])
                .compile_source(source)
                .unwrap()
        };
        let (first, second) = (compile(), compile());

        let points = [
            (0.0, [1.0, 0.0, 0.5], [0.0, -2.0, 0.0]),
            (0.7, [-0.3, 1.25, 3.0], [1.1, 0.4, -0.2]),
            (12.5, [1e-8, -7.0, 1e3], [2.5, 1e-3, 0.0]),
        ];
        for (t, y, yp) in points {
            let a = first.evaluate(t, &y, &yp).unwrap();
            let b = second.evaluate(t, &y, &yp).unwrap();
            let bits = |r: &[f64]| r.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&a), bits(&b));
            assert_eq!(bits(&a), bits(&first.evaluate(t, &y, &yp).unwrap()));
        }
        assert_eq!(first.differential_mask(), [true, true, false]);
    }

    #[test]
    fn parameters_can_be_rebound() {
        let mut system = oscillator();
        assert_eq!(system.parameter("k"), Some(2.0));
        assert!(system.set_parameter("k", 10.0));
        assert!(!system.set_parameter("m", 1.0));
        let residual = system.evaluate(0.0, &[1.0, 0.0], &[0.0, 0.0]).unwrap();
        assert_relative_eq!(residual[1], 10.0);
    }

    #[test]
    fn compiled_system_is_shareable_across_threads() {
        let system = std::sync::Arc::new(oscillator());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let system = system.clone();
                std::thread::spawn(move || {
                    system
                        .evaluate(0.0, &[i as f64, 0.0], &[0.0, 0.0])
                        .map(|r| r[1])
                })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.join().unwrap().unwrap();
            assert_relative_eq!(value, 2.0 * i as f64);
        }
    }

    #[test]
    fn parses_initial_conditions_for_variables() {
        let system = oscillator();
        assert_eq!(
            system.parse_initial_conditions("v = 0.5; x = 1").unwrap(),
            vec![1.0, 0.5]
        );
        assert_err_contains(
            system.parse_initial_conditions("x = 1"),
            "missing initial conditions for variables: v",
        );
    }
}
