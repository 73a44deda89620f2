use super::tokenizer::{Token, TokenKind};
use crate::error::EvalError;
use std::collections::HashMap;

/// Divisors smaller than this in magnitude are treated as division by zero.
pub const DIVISION_EPSILON: f64 = 1e-10;

/// Ordered name → index map. Indices follow insertion order and never change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name` and returns its index, or `None` if it was already present.
    pub fn insert(&mut self, name: &str) -> Option<usize> {
        if self.index.contains_key(name) {
            return None;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        Some(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut table = SymbolTable::new();
        for name in iter {
            table.insert(name.as_ref());
        }
        table
    }
}

/// Bindings for a single standalone evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub time: f64,
    pub state: &'a [f64],
    pub derivatives: &'a [f64],
    pub parameters: &'a HashMap<String, f64>,
}

/// OpCodes for the stack machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes the current time `t`.
    LoadTime,
    /// Pushes `state[idx]`.
    LoadVar(usize),
    /// Pushes `derivatives[idx]`, the value of `der(name)`.
    LoadDer(usize),
    /// Pushes `parameters[idx]`.
    LoadParam(usize),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Sin,
    Cos,
    Exp,
    Sqrt,
    Tan,
}

impl OpCode {
    fn arity(self) -> usize {
        match self {
            OpCode::LoadConst(_)
            | OpCode::LoadTime
            | OpCode::LoadVar(_)
            | OpCode::LoadDer(_)
            | OpCode::LoadParam(_) => 0,
            OpCode::Sin | OpCode::Cos | OpCode::Exp | OpCode::Sqrt | OpCode::Tan => 1,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => 2,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            OpCode::Add => "+",
            OpCode::Sub => "-",
            OpCode::Mul => "*",
            OpCode::Div => "/",
            OpCode::Pow => "^",
            OpCode::Sin => "sin",
            OpCode::Cos => "cos",
            OpCode::Exp => "exp",
            OpCode::Sqrt => "sqrt",
            OpCode::Tan => "tan",
            _ => "load",
        }
    }

    fn binary(op: &str) -> Option<Self> {
        match op {
            "+" => Some(OpCode::Add),
            "-" => Some(OpCode::Sub),
            "*" => Some(OpCode::Mul),
            "/" => Some(OpCode::Div),
            "^" => Some(OpCode::Pow),
            _ => None,
        }
    }

    fn function(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(OpCode::Sin),
            "cos" => Some(OpCode::Cos),
            "exp" => Some(OpCode::Exp),
            "sqrt" => Some(OpCode::Sqrt),
            "tan" => Some(OpCode::Tan),
            _ => None,
        }
    }
}

/// Postfix program produced by the operator-precedence pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    max_depth: usize,
}

impl Bytecode {
    /// Deepest stack the program needs.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Runs the shunting-yard pass over `tokens`, resolving names against the given tables.
    /// Identifiers resolve as `t`, then state variables, then parameters.
    pub fn compile(
        tokens: &[Token],
        variables: &SymbolTable,
        parameters: &SymbolTable,
    ) -> Result<Self, EvalError> {
        let mut emitter = Emitter::default();
        let mut pending: Vec<Pending> = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];
            match token.kind {
                TokenKind::Number => {
                    let value: f64 = token
                        .text
                        .parse()
                        .map_err(|_| EvalError::InvalidNumber(token.text.clone()))?;
                    emitter.emit(OpCode::LoadConst(value))?;
                }
                TokenKind::Identifier => {
                    let op = if token.text == "t" {
                        OpCode::LoadTime
                    } else if let Some(idx) = variables.index_of(&token.text) {
                        OpCode::LoadVar(idx)
                    } else if let Some(idx) = parameters.index_of(&token.text) {
                        OpCode::LoadParam(idx)
                    } else {
                        return Err(EvalError::UnknownSymbol(token.text.clone()));
                    };
                    emitter.emit(op)?;
                }
                TokenKind::Function if token.text == "der" => {
                    let name = derivative_target(&tokens[i + 1..])?;
                    let idx = variables
                        .index_of(name)
                        .ok_or_else(|| EvalError::UnknownSymbol(format!("der({name})")))?;
                    emitter.emit(OpCode::LoadDer(idx))?;
                    i += 4;
                    continue;
                }
                TokenKind::Function => {
                    let op = OpCode::function(&token.text)
                        .ok_or_else(|| EvalError::UnknownSymbol(token.text.clone()))?;
                    if tokens.get(i + 1).map(|t| t.kind) != Some(TokenKind::LeftParen) {
                        return Err(EvalError::FunctionWithoutArguments(token.text.clone()));
                    }
                    pending.push(Pending::Function(op));
                }
                TokenKind::Operator => {
                    let op = OpCode::binary(&token.text)
                        .ok_or_else(|| EvalError::UnknownSymbol(token.text.clone()))?;
                    if !token.unary {
                        while let Some(&Pending::Operator { op: top, precedence }) = pending.last()
                        {
                            if precedence < token.precedence {
                                break;
                            }
                            pending.pop();
                            emitter.emit(top)?;
                        }
                    }
                    pending.push(Pending::Operator {
                        op,
                        precedence: token.precedence,
                    });
                }
                TokenKind::LeftParen => pending.push(Pending::LeftParen),
                TokenKind::RightParen => {
                    loop {
                        match pending.pop() {
                            Some(Pending::LeftParen) => break,
                            Some(Pending::Operator { op, .. }) | Some(Pending::Function(op)) => {
                                emitter.emit(op)?
                            }
                            None => return Err(EvalError::MismatchedParentheses),
                        }
                    }
                    if let Some(&Pending::Function(op)) = pending.last() {
                        pending.pop();
                        emitter.emit(op)?;
                    }
                }
                TokenKind::Comma => loop {
                    match pending.last() {
                        Some(Pending::LeftParen) => break,
                        Some(&Pending::Operator { op, .. }) | Some(&Pending::Function(op)) => {
                            pending.pop();
                            emitter.emit(op)?;
                        }
                        None => return Err(EvalError::MismatchedParentheses),
                    }
                },
            }
            i += 1;
        }

        while let Some(item) = pending.pop() {
            match item {
                Pending::LeftParen => return Err(EvalError::MismatchedParentheses),
                Pending::Operator { op, .. } | Pending::Function(op) => emitter.emit(op)?,
            }
        }

        if emitter.depth != 1 {
            return Err(EvalError::OperandCount(emitter.depth));
        }

        Ok(Bytecode {
            ops: emitter.ops,
            max_depth: emitter.max_depth,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Operator { op: OpCode, precedence: u8 },
    Function(OpCode),
    LeftParen,
}

#[derive(Default)]
struct Emitter {
    ops: Vec<OpCode>,
    depth: usize,
    max_depth: usize,
}

impl Emitter {
    fn emit(&mut self, op: OpCode) -> Result<(), EvalError> {
        let arity = op.arity();
        if self.depth < arity {
            return Err(EvalError::MissingOperand(op.symbol().to_string()));
        }
        self.depth = self.depth - arity + 1;
        self.max_depth = self.max_depth.max(self.depth);
        self.ops.push(op);
        Ok(())
    }
}

/// Matches `( name )` right after a `der` token.
fn derivative_target(rest: &[Token]) -> Result<&str, EvalError> {
    match rest {
        [open, name, close, ..]
            if open.kind == TokenKind::LeftParen
                && name.kind == TokenKind::Identifier
                && close.kind == TokenKind::RightParen =>
        {
            Ok(&name.text)
        }
        _ => {
            let shown: Vec<&str> = rest.iter().take(3).map(|t| t.text.as_str()).collect();
            Err(EvalError::InvalidDerivative(shown.concat()))
        }
    }
}

/// Values the VM reads while executing bytecode.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub time: f64,
    pub state: &'a [f64],
    pub derivatives: &'a [f64],
    pub parameters: &'a [f64],
}

/// Stateless stack machine; the caller owns the scratch stack.
pub struct VM;

impl VM {
    pub fn execute(
        bytecode: &Bytecode,
        bindings: &Bindings<'_>,
        stack: &mut Vec<f64>,
    ) -> Result<f64, EvalError> {
        stack.clear();

        for &op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadTime => stack.push(bindings.time),
                OpCode::LoadVar(idx) => stack.push(load(bindings.state, idx)?),
                OpCode::LoadDer(idx) => stack.push(load(bindings.derivatives, idx)?),
                OpCode::LoadParam(idx) => stack.push(load(bindings.parameters, idx)?),
                OpCode::Add => binary(stack, op, |a, b| Ok(a + b))?,
                OpCode::Sub => binary(stack, op, |a, b| Ok(a - b))?,
                OpCode::Mul => binary(stack, op, |a, b| Ok(a * b))?,
                OpCode::Div => binary(stack, op, |a, b| {
                    if b.abs() < DIVISION_EPSILON {
                        Err(EvalError::DivisionByZero)
                    } else {
                        Ok(a / b)
                    }
                })?,
                OpCode::Pow => binary(stack, op, |a, b| Ok(a.powf(b)))?,
                OpCode::Sin => unary(stack, op, |a| Ok(a.sin()))?,
                OpCode::Cos => unary(stack, op, |a| Ok(a.cos()))?,
                OpCode::Exp => unary(stack, op, |a| Ok(a.exp()))?,
                OpCode::Tan => unary(stack, op, |a| Ok(a.tan()))?,
                OpCode::Sqrt => unary(stack, op, |a| {
                    if a < 0.0 {
                        Err(EvalError::NegativeSqrt(a))
                    } else {
                        Ok(a.sqrt())
                    }
                })?,
            }
        }

        if stack.len() != 1 {
            return Err(EvalError::OperandCount(stack.len()));
        }
        stack.pop().ok_or(EvalError::OperandCount(0))
    }
}

fn load(values: &[f64], idx: usize) -> Result<f64, EvalError> {
    values
        .get(idx)
        .copied()
        .ok_or(EvalError::DimensionMismatch {
            expected: idx + 1,
            actual: values.len(),
        })
}

fn pop(stack: &mut Vec<f64>, op: OpCode) -> Result<f64, EvalError> {
    stack
        .pop()
        .ok_or_else(|| EvalError::MissingOperand(op.symbol().to_string()))
}

fn binary(
    stack: &mut Vec<f64>,
    op: OpCode,
    f: impl Fn(f64, f64) -> Result<f64, EvalError>,
) -> Result<(), EvalError> {
    let b = pop(stack, op)?;
    let a = pop(stack, op)?;
    stack.push(f(a, b)?);
    Ok(())
}

fn unary(
    stack: &mut Vec<f64>,
    op: OpCode,
    f: impl Fn(f64) -> Result<f64, EvalError>,
) -> Result<(), EvalError> {
    let a = pop(stack, op)?;
    stack.push(f(a)?);
    Ok(())
}

/// Evaluates a token sequence against `context`.
///
/// `t` binds to the context time, names in `variables` to `state`, `der(name)` to
/// `derivatives`, and anything else to `context.parameters`.
pub fn evaluate(
    tokens: &[Token],
    variables: &SymbolTable,
    context: &EvaluationContext<'_>,
) -> Result<f64, EvalError> {
    let mut names: Vec<&String> = context.parameters.keys().collect();
    names.sort();
    let parameters: SymbolTable = names.iter().collect();
    let values: Vec<f64> = names.iter().map(|n| context.parameters[*n]).collect();

    let bytecode = Bytecode::compile(tokens, variables, &parameters)?;
    let bindings = Bindings {
        time: context.time,
        state: context.state,
        derivatives: context.derivatives,
        parameters: &values,
    };
    let mut stack = Vec::with_capacity(bytecode.max_depth());
    VM::execute(&bytecode, &bindings, &mut stack)
}
