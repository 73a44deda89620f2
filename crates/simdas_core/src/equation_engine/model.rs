//! Modelica-flavoured model files:
//!
//! ```text
//! model Oscillator
//!   Real x, v;
//!   parameter Real k = 2.0;
//! initial equation
//!   x = 1.0;
//! equation
//!   der(x) = v;
//!   der(v) = -k*x;
//! end Oscillator;
//! ```

use super::assignments::parse_assignments;
use super::compiler::{CompiledSystem, EquationCompiler};
use super::tokenizer::Tokenizer;
use super::{is_identifier, is_reserved};
use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Keywords of the model format. They cannot name variables or parameters.
pub const MODEL_KEYWORDS: [&str; 6] = ["Real", "parameter", "initial", "equation", "model", "end"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: Option<String>,
    /// Declared variables in declaration order.
    pub variables: Vec<String>,
    pub parameters: Vec<(String, f64)>,
    pub initial_values: Vec<(String, f64)>,
    /// Equation statements, one per entry.
    pub equations: Vec<String>,
}

impl Model {
    /// Compiles the equations against the declarations and builds the initial state.
    /// Variables without an initial value start at zero.
    pub fn compile(&self) -> Result<(CompiledSystem, Vec<f64>), ParseError> {
        let system = EquationCompiler::new()
            .with_parameters(self.parameters.iter().cloned())
            .compile_declared(&self.equations, &self.variables)?;

        let mut state = vec![0.0; self.variables.len()];
        for (name, value) in &self.initial_values {
            let idx = system
                .variables()
                .index_of(name)
                .ok_or_else(|| ParseError::UnknownVariable(name.clone()))?;
            state[idx] = *value;
        }
        Ok((system, state))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Declarations,
    Initial,
    Equations,
}

pub struct ModelParser;

impl ModelParser {
    pub fn parse(text: &str) -> Result<Model, ParseError> {
        let mut tokenizer = Tokenizer::new();
        let mut model = Model::default();
        let mut section = Section::Declarations;
        let mut variables = BTreeSet::new();
        let mut parameters = BTreeSet::new();
        let mut initial = BTreeSet::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line_no = line_no + 1;
            let stripped = tokenizer.strip_comments(raw);
            let line = stripped.trim_end_matches(';').trim();
            if line.is_empty() {
                continue;
            }
            let invalid = || ParseError::InvalidDeclaration {
                line: line_no,
                text: line.to_string(),
            };

            let (keyword, rest) = split_keyword(line);
            match keyword {
                "model" => {
                    model.name = Some(rest.to_string());
                }
                "end" => {}
                "initial" if rest == "equation" => section = Section::Initial,
                "equation" if rest.is_empty() => section = Section::Equations,
                "Real" => {
                    for name in rest.split(',').map(str::trim) {
                        check_name(name)?;
                        if parameters.contains(name) {
                            return Err(ParseError::ParameterAsVariable(name.to_string()));
                        }
                        if !variables.insert(name.to_string()) {
                            return Err(ParseError::DuplicateVariable(name.to_string()));
                        }
                        model.variables.push(name.to_string());
                    }
                }
                "parameter" => {
                    let declaration = rest.strip_prefix("Real").map(str::trim).unwrap_or(rest);
                    let mut parsed = parse_assignments(declaration)?;
                    if parsed.len() != 1 {
                        return Err(invalid());
                    }
                    let (name, value) = parsed.remove(0);
                    check_name(&name)?;
                    if variables.contains(&name) {
                        return Err(ParseError::ParameterAsVariable(name));
                    }
                    if !parameters.insert(name.clone()) {
                        return Err(ParseError::DuplicateAssignment(name));
                    }
                    debug!(%name, value, "model parameter");
                    model.parameters.push((name, value));
                }
                _ => match section {
                    Section::Declarations => {
                        return Err(ParseError::StatementOutsideSection {
                            line: line_no,
                            text: line.to_string(),
                        })
                    }
                    Section::Initial => {
                        for (name, value) in parse_assignments(line)? {
                            if !initial.insert(name.clone()) {
                                return Err(ParseError::DuplicateAssignment(name));
                            }
                            model.initial_values.push((name, value));
                        }
                    }
                    Section::Equations => model.equations.push(line.to_string()),
                },
            }
        }

        if let Some((name, _)) = model
            .initial_values
            .iter()
            .find(|(name, _)| !variables.contains(name))
        {
            return Err(ParseError::UnknownVariable(name.clone()));
        }

        debug!(
            variables = model.variables.len(),
            parameters = model.parameters.len(),
            equations = model.equations.len(),
            "parsed model"
        );
        Ok(model)
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (line, ""),
    }
}

fn check_name(name: &str) -> Result<(), ParseError> {
    if !is_identifier(name) || is_reserved(name) || MODEL_KEYWORDS.contains(&name) {
        return Err(ParseError::InvalidVariableName(name.to_string()));
    }
    Ok(())
}
