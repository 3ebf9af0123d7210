//! Condition expression language
//!
//! A tiny, total expression language shared by decision-table input
//! entries and edge conditions. There is deliberately no host `eval`:
//! expressions are parsed into an explicit AST and evaluated against a
//! name-resolution [`Scope`].
//!
//! # Grammar
//!
//! ```text
//! expr       := clause ("and" clause)*
//! clause     := comparison | range | membership | wildcard | truthy
//! comparison := [operand] op operand        -- operand omitted: the column input
//! op         := "=" | "!=" | "<" | "<=" | ">" | ">="
//! range      := [operand] ("[" | "(") scalar ".." scalar ("]" | ")")
//! membership := [operand] ["not"] "in" "(" scalar ("," scalar)* ")"
//! wildcard   := "-"                         -- always true
//! truthy     := operand                     -- non-null, non-false, non-empty
//! operand    := scalar | path
//! scalar     := number | quoted string | "true" | "false" | "null"
//! path       := ident ("." ident)*
//! ```
//!
//! Two parsing modes exist. **Entry mode** ([`Expr::parse_entry`]) is for
//! decision-table input entries: clauses are unary, evaluated against the
//! column's resolved input (`< 30`, `[10..20)`, `in (gold, silver)`,
//! `high`); a bare word is a string literal. **Condition mode**
//! ([`Expr::parse_condition`]) is for edge conditions and names its
//! operands explicitly (`risk_score < 30`, `status in ("rejected")`,
//! `approved`); a bare word is a lookup path.
//!
//! Evaluation is total: an unresolved path reads as `null`, and ordered
//! comparisons against `null` or mismatched types are simply `false`.
//! Only parsing can fail.
//!
//! # Examples
//!
//! ```rust
//! use awe_core::expr::{Expr, MapScope};
//! use serde_json::json;
//!
//! let scope = MapScope::new(json!({"risk_score": 15, "tier": "gold"}));
//!
//! let cond = Expr::parse_condition("risk_score < 30 and tier in (\"gold\", \"silver\")").unwrap();
//! assert!(cond.eval(None, &scope));
//!
//! let entry = Expr::parse_entry("[10..20)").unwrap();
//! assert!(entry.eval(Some(&json!(15)), &scope));
//! assert!(!entry.eval(Some(&json!(20)), &scope));
//! ```

use serde_json::Value;
use thiserror::Error;

/// Expression parse failure. Evaluation itself is total.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("malformed expression '{input}': {reason}")]
pub struct ExprError {
    pub input: String,
    pub reason: String,
}

impl ExprError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Scalar literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Scalar {
    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A value source inside an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// The implicit column input (entry mode only)
    Subject,
    Literal(Scalar),
    /// Dotted lookup path resolved through the [`Scope`]
    Path(String),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `-` — always true
    Wildcard,
    /// Bare operand: non-null, non-false, non-empty, non-zero
    Truthy(Operand),
    Cmp {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    Range {
        lhs: Operand,
        low: Scalar,
        low_incl: bool,
        high: Scalar,
        high_incl: bool,
    },
    In {
        lhs: Operand,
        items: Vec<Scalar>,
        negated: bool,
    },
    And(Vec<Expr>),
}

/// Name resolution for paths inside expressions.
pub trait Scope {
    fn lookup(&self, path: &str) -> Option<Value>;
}

/// Traverse a dotted path through nested JSON objects.
pub fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// [`Scope`] over a single JSON object.
#[derive(Debug, Clone)]
pub struct MapScope {
    root: Value,
}

impl MapScope {
    pub fn new(root: Value) -> Self {
        Self { root }
    }
}

impl Scope for MapScope {
    fn lookup(&self, path: &str) -> Option<Value> {
        lookup_path(&self.root, path)
    }
}

/// Layered scope: earlier layers shadow later ones. The engine resolves
/// names in token data first, then bound contexts.
pub struct LayeredScope<'a> {
    layers: Vec<&'a Value>,
}

impl<'a> LayeredScope<'a> {
    pub fn new(layers: Vec<&'a Value>) -> Self {
        Self { layers }
    }
}

impl Scope for LayeredScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        self.layers.iter().find_map(|layer| lookup_path(layer, path))
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CmpOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    DotDot,
    Comma,
    Dash,
    And,
    In,
    Not,
    True,
    False,
    Null,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err(ExprError::new(input, "expected '=' after '!'"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '.' => {
                if chars.get(i + 1) == Some(&'.') {
                    tokens.push(Token::DotDot);
                    i += 2;
                } else {
                    return Err(ExprError::new(input, "unexpected '.'"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(ExprError::new(input, "unterminated string"));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '-' => {
                // Wildcard unless it introduces a negative number
                if chars.get(i + 1).map(|d| d.is_ascii_digit()) == Some(true) {
                    let (n, next) = scan_number(&chars, i, input)?;
                    tokens.push(Token::Number(n));
                    i = next;
                } else {
                    tokens.push(Token::Dash);
                    i += 1;
                }
            }
            d if d.is_ascii_digit() => {
                let (n, next) = scan_number(&chars, i, input)?;
                tokens.push(Token::Number(n));
                i = next;
            }
            a if a.is_alphabetic() || a == '_' => {
                let start = i;
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_alphanumeric() || chars[j] == '_' || dotted_path_segment(&chars, j))
                {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "in" => Token::In,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
                i = j;
            }
            other => return Err(ExprError::new(input, format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

// A '.' continues an identifier only when followed by another identifier
// character (so `a.b` is one path while `a ..` never occurs mid-word).
fn dotted_path_segment(chars: &[char], j: usize) -> bool {
    chars[j] == '.'
        && chars
            .get(j + 1)
            .map(|c| c.is_alphabetic() || *c == '_')
            .unwrap_or(false)
}

fn scan_number(chars: &[char], start: usize, input: &str) -> Result<(f64, usize), ExprError> {
    let mut j = start;
    if chars[j] == '-' {
        j += 1;
    }
    while j < chars.len() && chars[j].is_ascii_digit() {
        j += 1;
    }
    // A '.' is part of the number only when followed by a digit; '..' is
    // the range separator.
    if j < chars.len() && chars[j] == '.' && chars.get(j + 1).map(|c| c.is_ascii_digit()) == Some(true)
    {
        j += 1;
        while j < chars.len() && chars[j].is_ascii_digit() {
            j += 1;
        }
    }
    let text: String = chars[start..j].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, j))
        .map_err(|_| ExprError::new(input, format!("invalid number '{text}'")))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Unary clauses against the implicit subject; bare words are string
    /// literals.
    Entry,
    /// Operands named explicitly; bare words are lookup paths.
    Condition,
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    mode: Mode,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, mode: Mode) -> Result<Self, ExprError> {
        Ok(Self {
            input,
            tokens: tokenize(input)?,
            pos: 0,
            mode,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            _ => Err(ExprError::new(self.input, format!("expected {what}"))),
        }
    }

    fn err(&self, reason: impl Into<String>) -> ExprError {
        ExprError::new(self.input, reason)
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut clauses = vec![self.parse_clause()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            clauses.push(self.parse_clause()?);
        }
        if self.pos < self.tokens.len() {
            return Err(self.err("trailing input"));
        }
        Ok(if clauses.len() == 1 {
            clauses.pop().expect("one clause")
        } else {
            Expr::And(clauses)
        })
    }

    fn parse_clause(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            None => Err(self.err("empty clause")),
            Some(Token::Dash) => {
                self.next();
                Ok(Expr::Wildcard)
            }
            // A leading operator, range bracket or membership keyword means
            // the clause applies to the implicit subject.
            Some(Token::Op(_)) | Some(Token::LBracket) | Some(Token::In) | Some(Token::Not) => {
                self.parse_clause_tail(Operand::Subject)
            }
            Some(Token::LParen) if self.mode == Mode::Entry => {
                self.parse_clause_tail(Operand::Subject)
            }
            _ => {
                let lhs = self.parse_operand()?;
                match self.peek() {
                    Some(Token::Op(_))
                    | Some(Token::LBracket)
                    | Some(Token::LParen)
                    | Some(Token::In)
                    | Some(Token::Not) => self.parse_clause_tail(lhs),
                    _ => {
                        // Bare operand. In entry mode a bare scalar means
                        // equality with the subject; elsewhere it is a
                        // truthiness test.
                        if self.mode == Mode::Entry {
                            match lhs {
                                Operand::Literal(lit) => Ok(Expr::Cmp {
                                    lhs: Operand::Subject,
                                    op: CmpOp::Eq,
                                    rhs: Operand::Literal(lit),
                                }),
                                other => Ok(Expr::Truthy(other)),
                            }
                        } else {
                            Ok(Expr::Truthy(lhs))
                        }
                    }
                }
            }
        }
    }

    fn parse_clause_tail(&mut self, lhs: Operand) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.next();
                let rhs = self.parse_operand()?;
                Ok(Expr::Cmp { lhs, op, rhs })
            }
            Some(Token::LBracket) | Some(Token::LParen) => self.parse_range(lhs),
            Some(Token::In) => {
                self.next();
                self.parse_membership(lhs, false)
            }
            Some(Token::Not) => {
                self.next();
                self.expect(Token::In, "'in' after 'not'")?;
                self.parse_membership(lhs, true)
            }
            _ => Err(self.err("expected operator")),
        }
    }

    fn parse_range(&mut self, lhs: Operand) -> Result<Expr, ExprError> {
        let low_incl = match self.next() {
            Some(Token::LBracket) => true,
            Some(Token::LParen) => false,
            _ => return Err(self.err("expected range open bracket")),
        };
        let low = self.parse_scalar()?;
        self.expect(Token::DotDot, "'..' in range")?;
        let high = self.parse_scalar()?;
        let high_incl = match self.next() {
            Some(Token::RBracket) => true,
            Some(Token::RParen) => false,
            _ => return Err(self.err("expected range close bracket")),
        };
        Ok(Expr::Range {
            lhs,
            low,
            low_incl,
            high,
            high_incl,
        })
    }

    fn parse_membership(&mut self, lhs: Operand, negated: bool) -> Result<Expr, ExprError> {
        self.expect(Token::LParen, "'(' after 'in'")?;
        let mut items = vec![self.parse_scalar()?];
        loop {
            match self.next() {
                Some(Token::Comma) => items.push(self.parse_scalar()?),
                Some(Token::RParen) => break,
                _ => return Err(self.err("expected ',' or ')' in membership list")),
            }
        }
        Ok(Expr::In {
            lhs,
            items,
            negated,
        })
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Operand::Literal(Scalar::Number(n))),
            Some(Token::Str(s)) => Ok(Operand::Literal(Scalar::Str(s))),
            Some(Token::True) => Ok(Operand::Literal(Scalar::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(Scalar::Bool(false))),
            Some(Token::Null) => Ok(Operand::Literal(Scalar::Null)),
            Some(Token::Ident(name)) => {
                if self.mode == Mode::Entry {
                    Ok(Operand::Literal(Scalar::Str(name)))
                } else {
                    Ok(Operand::Path(name))
                }
            }
            _ => Err(self.err("expected value")),
        }
    }

    fn parse_scalar(&mut self) -> Result<Scalar, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Scalar::Number(n)),
            Some(Token::Str(s)) => Ok(Scalar::Str(s)),
            Some(Token::True) => Ok(Scalar::Bool(true)),
            Some(Token::False) => Ok(Scalar::Bool(false)),
            Some(Token::Null) => Ok(Scalar::Null),
            // Bare words inside lists and ranges are string literals in
            // both modes: `in (gold, silver)`
            Some(Token::Ident(name)) => Ok(Scalar::Str(name)),
            _ => Err(self.err("expected literal")),
        }
    }
}

impl Expr {
    /// Parse a decision-table input entry (unary; implicit subject).
    pub fn parse_entry(input: &str) -> Result<Expr, ExprError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "-" {
            return Ok(Expr::Wildcard);
        }
        Parser::new(trimmed, Mode::Entry)?.parse_expr()
    }

    /// Parse an edge condition (operands named explicitly).
    pub fn parse_condition(input: &str) -> Result<Expr, ExprError> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "-" {
            return Ok(Expr::Wildcard);
        }
        Parser::new(trimmed, Mode::Condition)?.parse_expr()
    }

    /// Evaluate against an optional subject (the resolved column input)
    /// and a resolution scope. Total: never fails.
    pub fn eval(&self, subject: Option<&Value>, scope: &dyn Scope) -> bool {
        match self {
            Expr::Wildcard => true,
            Expr::Truthy(operand) => truthy(resolve(operand, subject, scope).as_ref()),
            Expr::Cmp { lhs, op, rhs } => {
                let l = resolve(lhs, subject, scope);
                let r = resolve(rhs, subject, scope);
                compare(l.as_ref(), *op, r.as_ref())
            }
            Expr::Range {
                lhs,
                low,
                low_incl,
                high,
                high_incl,
            } => {
                let v = resolve(lhs, subject, scope);
                let lower = if *low_incl { CmpOp::Ge } else { CmpOp::Gt };
                let upper = if *high_incl { CmpOp::Le } else { CmpOp::Lt };
                compare(v.as_ref(), lower, Some(&low.to_value()))
                    && compare(v.as_ref(), upper, Some(&high.to_value()))
            }
            Expr::In {
                lhs,
                items,
                negated,
            } => {
                let v = resolve(lhs, subject, scope);
                let found = items
                    .iter()
                    .any(|item| compare(v.as_ref(), CmpOp::Eq, Some(&item.to_value())));
                found != *negated
            }
            Expr::And(clauses) => clauses.iter().all(|c| c.eval(subject, scope)),
        }
    }
}

/// A value-producing expression: a literal constant or a lookup path.
/// Used for decision output entries written as strings.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Literal(Scalar),
    Path(String),
}

impl ValueExpr {
    pub fn parse(input: &str) -> Result<ValueExpr, ExprError> {
        let mut parser = Parser::new(input.trim(), Mode::Condition)?;
        let operand = parser.parse_operand()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.err("trailing input"));
        }
        match operand {
            Operand::Literal(s) => Ok(ValueExpr::Literal(s)),
            Operand::Path(p) => Ok(ValueExpr::Path(p)),
            Operand::Subject => Err(ExprError::new(input, "expected value")),
        }
    }

    pub fn eval(&self, scope: &dyn Scope) -> Value {
        match self {
            ValueExpr::Literal(s) => s.to_value(),
            ValueExpr::Path(p) => scope.lookup(p).unwrap_or(Value::Null),
        }
    }
}

fn resolve(operand: &Operand, subject: Option<&Value>, scope: &dyn Scope) -> Option<Value> {
    match operand {
        Operand::Subject => subject.cloned(),
        Operand::Literal(s) => Some(s.to_value()),
        Operand::Path(p) => scope.lookup(p),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

fn compare(lhs: Option<&Value>, op: CmpOp, rhs: Option<&Value>) -> bool {
    use std::cmp::Ordering;

    // Equality is defined for every pair, including null and missing
    // (missing reads as null).
    let l = lhs.unwrap_or(&Value::Null);
    let r = rhs.unwrap_or(&Value::Null);

    match op {
        CmpOp::Eq => json_eq(l, r),
        CmpOp::Ne => !json_eq(l, r),
        ordered => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ordering {
                None => false,
                Some(ord) => match ordered {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                    CmpOp::Eq | CmpOp::Ne => unreachable!(),
                },
            }
        }
    }
}

// Numeric equality ignores representation (1 == 1.0); everything else is
// structural.
fn json_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => l == r,
    }
}
