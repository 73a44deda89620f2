//! Text front end: equations are lexed, converted to postfix bytecode by an
//! operator-precedence pass, and evaluated on a small stack machine.

pub mod assignments;
pub mod compiler;
pub mod evaluator;
pub mod model;
pub mod tokenizer;

pub use assignments::{parse_assignments, parse_initial_conditions, parse_parameters};
pub use compiler::{CompiledSystem, Equation, EquationCompiler, EquationKind};
pub use evaluator::{evaluate, Bindings, Bytecode, EvaluationContext, OpCode, SymbolTable, VM};
pub use model::{Model, ModelParser};
pub use tokenizer::{tokenize, Token, TokenKind, Tokenizer};

/// Names with a fixed meaning inside expressions.
pub const RESERVED_WORDS: [&str; 2] = ["t", "der"];

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name) || tokenizer::is_function(name)
}
