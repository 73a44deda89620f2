//! `name=value` lists used for parameters and initial conditions, e.g. `k=2; c=0.5; m=1`.
//! Entries are separated by `;` or newlines.

use super::evaluator::SymbolTable;
use super::{is_identifier, is_reserved};
use crate::error::ParseError;
use std::collections::{BTreeSet, HashMap};

/// Parses assignments in the order written. Names must be identifiers and appear once.
pub fn parse_assignments(text: &str) -> Result<Vec<(String, f64)>, ParseError> {
    let mut seen = BTreeSet::new();
    let mut parsed = Vec::new();

    for entry in text.split(&[';', '\n'][..]) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| ParseError::InvalidAssignment(entry.to_string()))?;
        let (name, value) = (name.trim(), value.trim());
        if !is_identifier(name) || value.contains('=') {
            return Err(ParseError::InvalidAssignment(entry.to_string()));
        }

        let number: f64 = value
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| ParseError::InvalidNumber {
                name: name.to_string(),
                text: value.to_string(),
            })?;

        if !seen.insert(name.to_string()) {
            return Err(ParseError::DuplicateAssignment(name.to_string()));
        }
        parsed.push((name.to_string(), number));
    }

    Ok(parsed)
}

/// Parses a parameter list. Reserved words (`t`, `der`, function names) are rejected.
pub fn parse_parameters(text: &str) -> Result<HashMap<String, f64>, ParseError> {
    let parsed = parse_assignments(text)?;
    if let Some((name, _)) = parsed.iter().find(|(name, _)| is_reserved(name)) {
        return Err(ParseError::InvalidVariableName(name.clone()));
    }
    Ok(parsed.into_iter().collect())
}

/// Parses initial conditions into a state vector ordered like `variables`. Every variable
/// must be assigned exactly once.
pub fn parse_initial_conditions(
    text: &str,
    variables: &SymbolTable,
) -> Result<Vec<f64>, ParseError> {
    let mut state = vec![None; variables.len()];

    for (name, value) in parse_assignments(text)? {
        let idx = variables
            .index_of(&name)
            .ok_or(ParseError::UnknownVariable(name))?;
        state[idx] = Some(value);
    }

    let missing: Vec<String> = variables
        .names()
        .iter()
        .zip(&state)
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ParseError::MissingInitialConditions(missing));
    }

    Ok(state.into_iter().flatten().collect())
}
