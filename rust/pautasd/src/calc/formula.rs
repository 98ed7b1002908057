//! Sandboxed arithmetic for calculated components.
//!
//! Grammar (recursive descent, no dynamic evaluation):
//!
//! ```text
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/") unary)*
//! unary   := ("-" | "+") unary | primary
//! primary := NUMBER | IDENT | "(" expr ")"
//! ```
//!
//! Identifiers are component codes and are bound from a caller-supplied map.

use std::collections::HashMap;
use thiserror::Error;

/// Nesting deeper than this is rejected instead of recursing further.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },
    #[error("unknown identifier: {0}")]
    UnknownVariable(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("formula result is not a finite number")]
    NonFinite,
}

impl FormulaError {
    fn syntax(pos: usize, message: impl Into<String>) -> Self {
        FormulaError::Syntax {
            pos,
            message: message.into(),
        }
    }
}

/// Pluggable evaluator used by the component resolver.
pub trait FormulaEvaluator {
    fn evaluate(&self, expression: &str, vars: &HashMap<String, f64>) -> Result<f64, FormulaError>;
}

/// Default four-function evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticEvaluator;

impl FormulaEvaluator for ArithmeticEvaluator {
    fn evaluate(&self, expression: &str, vars: &HashMap<String, f64>) -> Result<f64, FormulaError> {
        parse(expression)?.eval(vars)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, vars: &HashMap<String, f64>) -> Result<f64, FormulaError> {
        let v = match self {
            Expr::Num(n) => *n,
            Expr::Var(name) => *vars
                .get(name)
                .ok_or_else(|| FormulaError::UnknownVariable(name.clone()))?,
            Expr::Neg(inner) => -inner.eval(vars)?,
            Expr::Bin(op, lhs, rhs) => {
                let a = lhs.eval(vars)?;
                let b = rhs.eval(vars)?;
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Err(FormulaError::DivisionByZero);
                        }
                        a / b
                    }
                }
            }
        };
        if !v.is_finite() {
            return Err(FormulaError::NonFinite);
        }
        Ok(v)
    }

    /// Identifiers in order of first appearance, without duplicates.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                if !out.iter().any(|n| n == name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_identifiers(out),
            Expr::Bin(_, lhs, rhs) => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '+' => {
                out.push((pos, Token::Plus));
                i += 1;
            }
            '-' => {
                out.push((pos, Token::Minus));
                i += 1;
            }
            '*' => {
                out.push((pos, Token::Star));
                i += 1;
            }
            '/' => {
                out.push((pos, Token::Slash));
                i += 1;
            }
            '(' => {
                out.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                out.push((pos, Token::RParen));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut seen_dot = false;
                while i < chars.len() {
                    let ch = chars[i].1;
                    if ch.is_ascii_digit() {
                        i += 1;
                    } else if ch == '.' && !seen_dot {
                        seen_dot = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| FormulaError::syntax(pos, format!("bad number '{}'", text)))?;
                out.push((pos, Token::Num(n)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_')
                {
                    i += 1;
                }
                let name: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
                out.push((pos, Token::Ident(name)));
            }
            other => {
                return Err(FormulaError::syntax(
                    pos,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaError::syntax(self.offset(), "formula nested too deeply"));
        }
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) | Some(Token::Plus) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(FormulaError::syntax(self.offset(), "formula nested too deeply"));
                }
                let negate = matches!(self.bump(), Some(Token::Minus));
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(if negate {
                    Expr::Neg(Box::new(inner))
                } else {
                    inner
                })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let at = self.offset();
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FormulaError::syntax(at, "unclosed parenthesis")),
                }
            }
            Some(other) => Err(FormulaError::syntax(
                at,
                format!("unexpected token {:?}", other),
            )),
            None => Err(FormulaError::syntax(at, "unexpected end of formula")),
        }
    }
}

pub fn parse(expression: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(FormulaError::syntax(0, "empty formula"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: expression.len(),
        depth: 0,
    };
    let expr = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(FormulaError::syntax(parser.offset(), "trailing input"));
    }
    Ok(expr)
}

/// Component codes must tokenize as a single identifier to be usable in formulas.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
