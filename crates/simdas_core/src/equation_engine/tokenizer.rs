use crate::error::ParseError;
use serde::{Deserialize, Serialize};

/// Identifiers that are tagged as functions rather than variables.
pub const KNOWN_FUNCTIONS: [&str; 6] = ["der", "sin", "cos", "exp", "sqrt", "tan"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    Number,
    Identifier,
    Operator,
    Function,
    LeftParen,
    RightParen,
    Comma,
}

/// A lexical unit of an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Binding strength for operators, zero for everything else.
    pub precedence: u8,
    /// Set on the multiplication synthesised for a unary minus. It binds to the operand that
    /// follows and never reduces operators already on the stack.
    pub unary: bool,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            precedence: 0,
            unary: false,
        }
    }

    fn operator(op: char) -> Self {
        Self {
            kind: TokenKind::Operator,
            text: op.to_string(),
            precedence: precedence(op),
            unary: false,
        }
    }

    fn negation() -> [Token; 2] {
        [
            Token::new(TokenKind::Number, "-1"),
            Token {
                unary: true,
                ..Token::operator('*')
            },
        ]
    }
}

pub fn precedence(op: char) -> u8 {
    match op {
        '^' => 4,
        '*' | '/' => 3,
        '+' | '-' => 2,
        _ => 0,
    }
}

pub fn is_function(name: &str) -> bool {
    KNOWN_FUNCTIONS.contains(&name)
}

/// Line-oriented lexer. Remembers whether the previous line ended inside a `/* */` block so
/// that block comments may span lines.
#[derive(Debug, Default, Clone)]
pub struct Tokenizer {
    in_block_comment: bool,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_block_comment(&self) -> bool {
        self.in_block_comment
    }

    pub fn reset(&mut self) {
        self.in_block_comment = false;
    }

    /// Removes `//`, `#` and `/* */` comments from one line and trims the remainder.
    pub fn strip_comments(&mut self, line: &str) -> String {
        let mut kept = String::with_capacity(line.len());
        let mut rest = line;

        loop {
            if self.in_block_comment {
                match rest.find("*/") {
                    Some(end) => {
                        self.in_block_comment = false;
                        rest = &rest[end + 2..];
                    }
                    None => break,
                }
            }

            let line_comment = [rest.find("//"), rest.find('#')]
                .into_iter()
                .flatten()
                .min();
            let block = rest.find("/*");

            match (line_comment, block) {
                (Some(lc), Some(bc)) if bc < lc => {
                    kept.push_str(&rest[..bc]);
                    kept.push(' ');
                    self.in_block_comment = true;
                    rest = &rest[bc + 2..];
                }
                (Some(lc), _) => {
                    kept.push_str(&rest[..lc]);
                    break;
                }
                (None, Some(bc)) => {
                    kept.push_str(&rest[..bc]);
                    kept.push(' ');
                    self.in_block_comment = true;
                    rest = &rest[bc + 2..];
                }
                (None, None) => {
                    kept.push_str(rest);
                    break;
                }
            }
        }

        kept.trim().to_string()
    }

    /// Strips comments from `line` (honouring block state) and lexes what remains.
    pub fn tokenize_line(&mut self, line: &str) -> Result<Vec<Token>, ParseError> {
        let stripped = self.strip_comments(line);
        tokenize(&stripped)
    }
}

/// Lexes a comment-free expression.
pub fn tokenize(expression: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut expect_operand = true;
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = pos;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos + 1 < chars.len() && chars[pos] == '.' && chars[pos + 1].is_ascii_digit() {
                pos += 1;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            let text: String = chars[start..pos].iter().collect();
            tokens.push(Token::new(TokenKind::Number, text));
            expect_operand = false;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            if is_function(&text) {
                tokens.push(Token::new(TokenKind::Function, text));
                expect_operand = true;
            } else {
                tokens.push(Token::new(TokenKind::Identifier, text));
                expect_operand = false;
            }
            continue;
        }

        match c {
            '-' if expect_operand => {
                tokens.extend(Token::negation());
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::operator(c));
                expect_operand = true;
            }
            '(' => {
                tokens.push(Token::new(TokenKind::LeftParen, "("));
                expect_operand = true;
            }
            ')' => {
                tokens.push(Token::new(TokenKind::RightParen, ")"));
                expect_operand = false;
            }
            ',' => {
                tokens.push(Token::new(TokenKind::Comma, ","));
                expect_operand = true;
            }
            _ => {
                return Err(ParseError::UnexpectedCharacter {
                    ch: c,
                    position: pos,
                    input: expression.to_string(),
                })
            }
        }
        pos += 1;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn lexes_numbers_identifiers_and_operators() {
        let tokens = tokenize("2.5*x + .5 - y_1^2").unwrap();
        assert_eq!(texts(&tokens), ["2.5", "*", "x", "+", ".5", "-", "y_1", "^", "2"]);
        assert_eq!(tokens[1].precedence, 3);
        assert_eq!(tokens[3].precedence, 2);
        assert_eq!(tokens[7].precedence, 4);
        assert_eq!(tokens[2].kind, TokenKind::Identifier);
    }

    #[test]
    fn whitespace_does_not_change_tokens() {
        let compact = tokenize("-k*x/(1+y^2)+sin(t)").unwrap();
        let spaced = tokenize("  - k *  x / ( 1 + y ^ 2 ) + sin ( t ) ").unwrap();
        assert_eq!(compact, spaced);
    }

    #[test]
    fn unary_minus_becomes_negative_one_times() {
        let tokens = tokenize("-x").unwrap();
        assert_eq!(texts(&tokens), ["-1", "*", "x"]);
        assert!(tokens[1].unary);
        assert_eq!(tokens[1].precedence, 3);

        let tokens = tokenize("a/(-b)").unwrap();
        assert_eq!(texts(&tokens), ["a", "/", "(", "-1", "*", "b", ")"]);

        let tokens = tokenize("a - b").unwrap();
        assert_eq!(texts(&tokens), ["a", "-", "b"]);
        assert!(!tokens[1].unary);
    }

    #[test]
    fn functions_are_tagged() {
        let tokens = tokenize("sqrt(x) + der(y) + sine").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Function);
        assert_eq!(tokens[5].kind, TokenKind::Function);
        assert_eq!(tokens[10].kind, TokenKind::Identifier);
    }

    #[test]
    fn rejects_unknown_characters() {
        let err = tokenize("x $ y").unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedCharacter { ch: '$', position: 2, .. }
        ));
    }

    #[test]
    fn strips_line_and_block_comments() {
        let mut tokenizer = Tokenizer::new();
        assert_eq!(tokenizer.strip_comments("der(x) = y // velocity"), "der(x) = y");
        assert_eq!(tokenizer.strip_comments("der(y) = -x # spring"), "der(y) = -x");
        assert_eq!(tokenizer.strip_comments("a /* inline */ + b"), "a   + b");
        assert!(!tokenizer.in_block_comment());
    }

    #[test]
    fn block_comments_span_lines() {
        let mut tokenizer = Tokenizer::new();
        assert_eq!(tokenizer.strip_comments("x = 1 /* start"), "x = 1");
        assert!(tokenizer.in_block_comment());
        assert_eq!(tokenizer.strip_comments("still a comment // here"), "");
        assert!(tokenizer.in_block_comment());
        assert_eq!(tokenizer.strip_comments("end */ y = 2"), "y = 2");
        assert!(!tokenizer.in_block_comment());

        tokenizer.strip_comments("/* dangling");
        tokenizer.reset();
        assert!(!tokenizer.in_block_comment());
    }

    #[test]
    fn tokenize_line_uses_comment_state() {
        let mut tokenizer = Tokenizer::new();
        let tokens = tokenizer.tokenize_line("x + 1 // trailing").unwrap();
        assert_eq!(texts(&tokens), ["x", "+", "1"]);
    }
}
