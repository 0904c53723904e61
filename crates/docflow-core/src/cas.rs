//! # CAS Collaborator
//!
//! The engine forwards math expressions and comparison modes to a [`Cas`]
//! implementation and never interprets math itself. [`ArithmeticCas`] is a
//! small reference implementation for tests and the CLI: numeric evaluation
//! with tuples, comparisons and boolean logic, plus text-normalizing symbolic
//! comparison. It makes no claim about full symbolic equivalence.

use crate::primitives::NUMERIC_TOLERANCE;
use crate::types::{CasError, Value};
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// COLLABORATOR CONTRACT
// =============================================================================

/// How two expressions are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonMode {
    Numeric,
    Symbolic,
    SymbolicSimplify,
    SymbolicSimplifyExpand,
}

impl ComparisonMode {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Symbolic => "symbolic",
            Self::SymbolicSimplify => "symbolicSimplify",
            Self::SymbolicSimplifyExpand => "symbolicSimplifyExpand",
        }
    }

    /// Parse a mode name; `symbolic+simplify` style spellings are accepted.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "numeric" | "numerical" => Some(Self::Numeric),
            "symbolic" => Some(Self::Symbolic),
            "symbolicsimplify" => Some(Self::SymbolicSimplify),
            "symbolicsimplifyexpand" => Some(Self::SymbolicSimplifyExpand),
            _ => None,
        }
    }
}

/// Symbolic math collaborator.
pub trait Cas: Send {
    /// Evaluate `expression` with the named values of `context` bound.
    fn evaluate(&self, expression: &str, context: &BTreeMap<String, Value>)
    -> Result<Value, CasError>;

    /// Decide whether two expressions are equivalent under `mode`.
    fn compare(&self, left: &str, right: &str, mode: ComparisonMode) -> Result<bool, CasError>;
}

// =============================================================================
// LEXER
// =============================================================================

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    /// Digits with at most one decimal point; `1.2.3` lexes but fails to parse.
    #[regex(r"[0-9.]*[0-9][0-9.]*", |lex| lex.slice().parse::<f64>().ok())]
    Num(f64),
    #[regex(r"[\p{L}_][\p{L}\p{N}_]*", |lex| lex.slice().to_string())]
    Ident(String),
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("^")]
    Caret,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token("==")]
    #[token("=")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("and")]
    #[token("&&")]
    And,
    #[token("or")]
    #[token("||")]
    Or,
    #[token("not")]
    #[token("!")]
    Not,
}

/// Tokens with their byte offsets.
fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, CasError> {
    Token::lexer(input)
        .spanned()
        .map(|(token, span)| match token {
            Ok(token) => Ok((span.start, token)),
            Err(()) => Err(CasError::Parse {
                position: span.start,
                message: format!("unexpected '{}'", &input[span]),
            }),
        })
        .collect()
}

// =============================================================================
// PARSER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Func {
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Log,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sqrt" => Some(Self::Sqrt),
            "abs" => Some(Self::Abs),
            "sin" => Some(Self::Sin),
            "cos" => Some(Self::Cos),
            "tan" => Some(Self::Tan),
            "exp" => Some(Self::Exp),
            "ln" => Some(Self::Ln),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sqrt => "sqrt",
            Self::Abs => "abs",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Exp => "exp",
            Self::Ln => "ln",
            Self::Log => "log",
        }
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Sqrt => x.sqrt(),
            Self::Abs => x.abs(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Exp => x.exp(),
            Self::Ln | Self::Log => x.ln(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Binding power; higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Self::Or => 10,
            Self::And => 20,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => 30,
            Self::Add | Self::Sub => 40,
            Self::Mul | Self::Div => 50,
            Self::Pow => 60,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Pow => "^",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => " and ",
            Self::Or => " or ",
        }
    }

    fn from_token(token: &Token) -> Option<Self> {
        match token {
            Token::Plus => Some(Self::Add),
            Token::Minus => Some(Self::Sub),
            Token::Star => Some(Self::Mul),
            Token::Slash => Some(Self::Div),
            Token::Caret => Some(Self::Pow),
            Token::EqEq => Some(Self::Eq),
            Token::NotEq => Some(Self::Ne),
            Token::Lt => Some(Self::Lt),
            Token::Le => Some(Self::Le),
            Token::Gt => Some(Self::Gt),
            Token::Ge => Some(Self::Ge),
            Token::And => Some(Self::And),
            Token::Or => Some(Self::Or),
            _ => None,
        }
    }
}

const UNARY_MINUS_PRECEDENCE: u8 = 55;
const NOT_PRECEDENCE: u8 = 25;

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Bool(bool),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
    Tuple(Vec<Expr>),
    /// n-ary sum, only produced by simplification.
    Sum(Vec<Expr>),
    /// n-ary product, only produced by simplification.
    Product(Vec<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, CasError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
            end: input.len(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> CasError {
        CasError::Parse {
            position: self.position(),
            message: message.into(),
        }
    }

    fn parse_all(mut self) -> Result<Expr, CasError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_expr(0)?;
        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Pratt loop over binary operators, with implicit multiplication.
    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, CasError> {
        let mut left = self.parse_prefix()?;
        loop {
            let op = match self.peek() {
                Some(token) => match BinOp::from_token(token) {
                    Some(op) => op,
                    None if starts_atom(token) => BinOp::Mul,
                    None => break,
                },
                None => break,
            };
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            let explicit = self.peek().is_some_and(|t| BinOp::from_token(t).is_some());
            if explicit {
                self.advance();
            }
            // ^ is right-associative
            let next = if op == BinOp::Pow { prec } else { prec + 1 };
            let right = self.parse_expr(next)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, CasError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_expr(UNARY_MINUS_PRECEDENCE)?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_expr(UNARY_MINUS_PRECEDENCE)
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_expr(NOT_PRECEDENCE)?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, CasError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => {
                if name == "true" || name == "false" {
                    return Ok(Expr::Bool(name == "true"));
                }
                match Func::from_name(&name) {
                    Some(func) if self.peek() == Some(&Token::LParen) => {
                        self.advance();
                        let argument = self.parse_expr(0)?;
                        self.expect_close()?;
                        Ok(Expr::Call(func, Box::new(argument)))
                    }
                    _ => Ok(Expr::Var(name)),
                }
            }
            Some(Token::LParen) => {
                let mut items = vec![self.parse_expr(0)?];
                while self.peek() == Some(&Token::Comma) {
                    self.advance();
                    items.push(self.parse_expr(0)?);
                }
                self.expect_close()?;
                if items.len() == 1 {
                    Ok(items.remove(0))
                } else {
                    Ok(Expr::Tuple(items))
                }
            }
            Some(other) => Err(CasError::Parse {
                position,
                message: format!("unexpected token {other:?}"),
            }),
            None => Err(CasError::Parse {
                position,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }

    fn expect_close(&mut self) -> Result<(), CasError> {
        match self.advance() {
            Some(Token::RParen) => Ok(()),
            _ => Err(self.error("expected ')'")),
        }
    }
}

fn starts_atom(token: &Token) -> bool {
    matches!(token, Token::Num(_) | Token::Ident(_) | Token::LParen)
}

fn parse(input: &str) -> Result<Expr, CasError> {
    Parser::new(input)?.parse_all()
}

// =============================================================================
// EVALUATION
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Eval {
    Num(f64),
    Bool(bool),
    Tuple(Vec<Eval>),
}

impl Eval {
    fn into_value(self) -> Value {
        match self {
            Self::Num(n) => Value::Number(n),
            Self::Bool(b) => Value::Bool(b),
            Self::Tuple(items) => Value::Array(items.into_iter().map(Self::into_value).collect()),
        }
    }

    fn num(&self) -> Result<f64, CasError> {
        match self {
            Self::Num(n) => Ok(*n),
            other => Err(CasError::Evaluation(format!("expected a number, got {other:?}"))),
        }
    }

    fn truth(&self) -> Result<bool, CasError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(CasError::Evaluation(format!("expected a boolean, got {other:?}"))),
        }
    }

    fn approx_eq(&self, other: &Eval, tolerance: f64) -> bool {
        self.clone()
            .into_value()
            .approx_eq(&other.clone().into_value(), tolerance)
    }
}

/// Evaluation outcome: a concrete value, or "symbolic" when free variables remain.
enum Outcome {
    Value(Eval),
    Symbolic,
}

type Env<'a> = &'a BTreeMap<String, Binding>;

#[derive(Debug, Clone)]
enum Binding {
    Known(Eval),
    /// Bound to an expression that does not evaluate to a number.
    Symbolic(String),
}

fn value_to_binding(name: &str, value: &Value) -> Result<Binding, CasError> {
    match value {
        Value::Number(n) => Ok(Binding::Known(Eval::Num(*n))),
        Value::Bool(b) => Ok(Binding::Known(Eval::Bool(*b))),
        Value::Array(items) => {
            let mut evaluated = Vec::with_capacity(items.len());
            for item in items {
                match value_to_binding(name, item)? {
                    Binding::Known(e) => evaluated.push(e),
                    Binding::Symbolic(_) => return Ok(Binding::Symbolic(value.to_expression_text())),
                }
            }
            Ok(Binding::Known(Eval::Tuple(evaluated)))
        }
        Value::Math(text) => {
            if text.trim().is_empty() {
                return Ok(Binding::Symbolic(name.to_string()));
            }
            match parse(text).and_then(|e| evaluate_expr(&e, &BTreeMap::new())) {
                Ok(Outcome::Value(e)) => Ok(Binding::Known(e)),
                _ => Ok(Binding::Symbolic(format!("({text})"))),
            }
        }
        Value::Text(text) => text
            .trim()
            .parse::<f64>()
            .map(|n| Binding::Known(Eval::Num(n)))
            .map_err(|_| CasError::UnsupportedValue(format!("{name} is text '{text}'"))),
        Value::Null | Value::Missing => Ok(Binding::Symbolic(name.to_string())),
        Value::Component(id) => Err(CasError::UnsupportedValue(format!(
            "{name} is component {id}"
        ))),
    }
}

fn evaluate_expr(expr: &Expr, env: Env<'_>) -> Result<Outcome, CasError> {
    macro_rules! eval_or_symbolic {
        ($e:expr) => {
            match evaluate_expr($e, env)? {
                Outcome::Value(v) => v,
                Outcome::Symbolic => return Ok(Outcome::Symbolic),
            }
        };
    }
    let value = match expr {
        Expr::Num(n) => Eval::Num(*n),
        Expr::Bool(b) => Eval::Bool(*b),
        Expr::Var(name) => match env.get(name) {
            Some(Binding::Known(e)) => e.clone(),
            Some(Binding::Symbolic(_)) | None => {
                if name == "pi" {
                    Eval::Num(std::f64::consts::PI)
                } else if name == "e" {
                    Eval::Num(std::f64::consts::E)
                } else {
                    return Ok(Outcome::Symbolic);
                }
            }
        },
        Expr::Neg(inner) => match eval_or_symbolic!(inner) {
            Eval::Tuple(items) => Eval::Tuple(
                items
                    .iter()
                    .map(|i| i.num().map(|n| Eval::Num(-n)))
                    .collect::<Result<_, _>>()?,
            ),
            other => Eval::Num(-other.num()?),
        },
        Expr::Not(inner) => Eval::Bool(!eval_or_symbolic!(inner).truth()?),
        Expr::Call(func, argument) => Eval::Num(func.apply(eval_or_symbolic!(argument).num()?)),
        Expr::Tuple(items) | Expr::Sum(items) | Expr::Product(items) => {
            let mut evaluated = Vec::with_capacity(items.len());
            for item in items {
                evaluated.push(eval_or_symbolic!(item));
            }
            match expr {
                Expr::Sum(_) => Eval::Num(
                    evaluated
                        .iter()
                        .map(Eval::num)
                        .sum::<Result<f64, _>>()?,
                ),
                Expr::Product(_) => Eval::Num(
                    evaluated
                        .iter()
                        .map(Eval::num)
                        .product::<Result<f64, _>>()?,
                ),
                _ => Eval::Tuple(evaluated),
            }
        }
        Expr::Binary(op, left, right) => {
            let l = eval_or_symbolic!(left);
            let r = eval_or_symbolic!(right);
            apply_binary(*op, &l, &r)?
        }
    };
    Ok(Outcome::Value(value))
}

fn apply_binary(op: BinOp, l: &Eval, r: &Eval) -> Result<Eval, CasError> {
    // element-wise tuple arithmetic
    if let (Eval::Tuple(a), Eval::Tuple(b)) = (l, r) {
        if matches!(op, BinOp::Add | BinOp::Sub) {
            if a.len() != b.len() {
                return Err(CasError::Evaluation("tuple sizes differ".to_string()));
            }
            let items = a
                .iter()
                .zip(b)
                .map(|(x, y)| apply_binary(op, x, y))
                .collect::<Result<_, _>>()?;
            return Ok(Eval::Tuple(items));
        }
    }
    if let (Eval::Tuple(a), Eval::Num(_)) = (l, r) {
        if matches!(op, BinOp::Mul | BinOp::Div) {
            let items = a
                .iter()
                .map(|x| apply_binary(op, x, r))
                .collect::<Result<_, _>>()?;
            return Ok(Eval::Tuple(items));
        }
    }
    if let (Eval::Num(_), Eval::Tuple(b)) = (l, r) {
        if op == BinOp::Mul {
            let items = b
                .iter()
                .map(|y| apply_binary(op, l, y))
                .collect::<Result<_, _>>()?;
            return Ok(Eval::Tuple(items));
        }
    }
    let result = match op {
        BinOp::Add => Eval::Num(l.num()? + r.num()?),
        BinOp::Sub => Eval::Num(l.num()? - r.num()?),
        BinOp::Mul => Eval::Num(l.num()? * r.num()?),
        BinOp::Div => Eval::Num(l.num()? / r.num()?),
        BinOp::Pow => Eval::Num(l.num()?.powf(r.num()?)),
        BinOp::Eq => Eval::Bool(l.approx_eq(r, NUMERIC_TOLERANCE)),
        BinOp::Ne => Eval::Bool(!l.approx_eq(r, NUMERIC_TOLERANCE)),
        BinOp::Lt => Eval::Bool(l.num()? < r.num()?),
        BinOp::Le => Eval::Bool(l.num()? <= r.num()?),
        BinOp::Gt => Eval::Bool(l.num()? > r.num()?),
        BinOp::Ge => Eval::Bool(l.num()? >= r.num()?),
        BinOp::And => Eval::Bool(l.truth()? && r.truth()?),
        BinOp::Or => Eval::Bool(l.truth()? || r.truth()?),
    };
    Ok(result)
}

// =============================================================================
// RENDERING AND NORMALIZATION
// =============================================================================

fn precedence_of(expr: &Expr) -> u8 {
    match expr {
        Expr::Binary(op, ..) => op.precedence(),
        Expr::Sum(_) => BinOp::Add.precedence(),
        Expr::Product(_) => BinOp::Mul.precedence(),
        Expr::Neg(_) => UNARY_MINUS_PRECEDENCE,
        Expr::Not(_) => NOT_PRECEDENCE,
        Expr::Num(n) if *n < 0.0 => UNARY_MINUS_PRECEDENCE,
        _ => u8::MAX,
    }
}

fn render_child(expr: &Expr, env: Env<'_>, min: u8) -> String {
    let text = render(expr, env);
    if precedence_of(expr) < min {
        format!("({text})")
    } else {
        text
    }
}

/// Canonical text of an expression, substituting symbolic bindings.
fn render(expr: &Expr, env: Env<'_>) -> String {
    match expr {
        Expr::Num(n) => n.to_string(),
        Expr::Bool(b) => b.to_string(),
        Expr::Var(name) => match env.get(name) {
            Some(Binding::Symbolic(text)) => text.clone(),
            Some(Binding::Known(e)) => e.clone().into_value().to_expression_text(),
            None => name.clone(),
        },
        Expr::Neg(inner) => format!("-{}", render_child(inner, env, UNARY_MINUS_PRECEDENCE + 1)),
        Expr::Not(inner) => format!("not {}", render_child(inner, env, NOT_PRECEDENCE + 1)),
        Expr::Call(func, argument) => format!("{}({})", func.name(), render(argument, env)),
        Expr::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(|i| render(i, env)).collect();
            format!("({})", parts.join(", "))
        }
        Expr::Sum(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|i| render_child(i, env, BinOp::Add.precedence()))
                .collect();
            parts.join("+")
        }
        Expr::Product(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|i| render_child(i, env, BinOp::Mul.precedence() + 1))
                .collect();
            parts.join("*")
        }
        Expr::Binary(op, left, right) => {
            let prec = op.precedence();
            let (left_min, right_min) = if *op == BinOp::Pow {
                (prec + 1, prec)
            } else {
                (prec, prec + 1)
            };
            format!(
                "{}{}{}",
                render_child(left, env, left_min),
                op.symbol(),
                render_child(right, env, right_min)
            )
        }
    }
}

fn fold(expr: &Expr) -> Option<f64> {
    match evaluate_expr(expr, &BTreeMap::new()) {
        Ok(Outcome::Value(Eval::Num(n))) if expr_has_no_constants_names(expr) => Some(n),
        _ => None,
    }
}

/// Constants like `pi` fold numerically but stay symbolic in normal forms.
fn expr_has_no_constants_names(expr: &Expr) -> bool {
    let mut names = BTreeSet::new();
    free_variables(expr, &mut names);
    names.is_empty()
}

/// Flatten, fold constants and sort commutative operands.
fn simplify(expr: Expr, expand: bool) -> Expr {
    let expr = match expr {
        Expr::Binary(BinOp::Sub, l, r) => {
            Expr::Sum(vec![simplify(*l, expand), simplify(Expr::Neg(r), expand)])
        }
        Expr::Binary(BinOp::Add, l, r) => {
            Expr::Sum(vec![simplify(*l, expand), simplify(*r, expand)])
        }
        Expr::Binary(BinOp::Mul, l, r) => {
            Expr::Product(vec![simplify(*l, expand), simplify(*r, expand)])
        }
        Expr::Binary(op, l, r) => {
            Expr::Binary(op, Box::new(simplify(*l, expand)), Box::new(simplify(*r, expand)))
        }
        Expr::Neg(inner) => match simplify(*inner, expand) {
            Expr::Num(n) => Expr::Num(-n),
            Expr::Neg(x) => *x,
            other => Expr::Product(vec![Expr::Num(-1.0), other]),
        },
        Expr::Not(inner) => Expr::Not(Box::new(simplify(*inner, expand))),
        Expr::Call(func, argument) => Expr::Call(func, Box::new(simplify(*argument, expand))),
        Expr::Tuple(items) => Expr::Tuple(items.into_iter().map(|i| simplify(i, expand)).collect()),
        Expr::Sum(items) => Expr::Sum(items.into_iter().map(|i| simplify(i, expand)).collect()),
        Expr::Product(items) => {
            Expr::Product(items.into_iter().map(|i| simplify(i, expand)).collect())
        }
        leaf @ (Expr::Num(_) | Expr::Bool(_) | Expr::Var(_)) => leaf,
    };
    let expr = match expr {
        Expr::Product(factors) if expand => distribute(factors),
        other => other,
    };
    normalize(expr)
}

fn distribute(factors: Vec<Expr>) -> Expr {
    let mut terms: Vec<Vec<Expr>> = vec![Vec::new()];
    for factor in factors {
        let alternatives = match factor {
            Expr::Sum(items) => items,
            other => vec![other],
        };
        let mut next = Vec::with_capacity(terms.len() * alternatives.len());
        for term in &terms {
            for alternative in &alternatives {
                let mut product = term.clone();
                product.push(alternative.clone());
                next.push(product);
            }
        }
        terms = next;
    }
    Expr::Sum(
        terms
            .into_iter()
            .map(|factors| normalize(Expr::Product(factors)))
            .collect(),
    )
}

fn normalize(expr: Expr) -> Expr {
    match expr {
        Expr::Sum(items) => {
            let mut flat = Vec::new();
            let mut constant = 0.0;
            for item in items {
                match normalize(item) {
                    Expr::Sum(inner) => flat.extend(inner),
                    other => match fold(&other) {
                        Some(n) => constant += n,
                        None => flat.push(other),
                    },
                }
            }
            if constant != 0.0 || flat.is_empty() {
                flat.push(Expr::Num(constant));
            }
            flat.sort_by_key(|e| render(e, &BTreeMap::new()));
            if flat.len() == 1 {
                flat.remove(0)
            } else {
                Expr::Sum(flat)
            }
        }
        Expr::Product(items) => {
            let mut flat = Vec::new();
            let mut constant = 1.0;
            for item in items {
                match normalize(item) {
                    Expr::Product(inner) => flat.extend(inner),
                    other => match fold(&other) {
                        Some(n) => constant *= n,
                        None => flat.push(other),
                    },
                }
            }
            if constant == 0.0 {
                return Expr::Num(0.0);
            }
            if constant != 1.0 || flat.is_empty() {
                flat.insert(0, Expr::Num(constant));
            }
            let (numbers, mut rest): (Vec<Expr>, Vec<Expr>) =
                flat.into_iter().partition(|e| matches!(e, Expr::Num(_)));
            rest.sort_by_key(|e| render(e, &BTreeMap::new()));
            let mut ordered = numbers;
            ordered.extend(rest);
            if ordered.len() == 1 {
                ordered.remove(0)
            } else {
                Expr::Product(ordered)
            }
        }
        other => match fold(&other) {
            Some(n) => Expr::Num(n),
            None => other,
        },
    }
}

fn free_variables(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Var(name) => {
            out.insert(name.clone());
        }
        Expr::Num(_) | Expr::Bool(_) => {}
        Expr::Neg(inner) | Expr::Not(inner) | Expr::Call(_, inner) => free_variables(inner, out),
        Expr::Binary(_, l, r) => {
            free_variables(l, out);
            free_variables(r, out);
        }
        Expr::Tuple(items) | Expr::Sum(items) | Expr::Product(items) => {
            for item in items {
                free_variables(item, out);
            }
        }
    }
}

// =============================================================================
// REFERENCE IMPLEMENTATION
// =============================================================================

/// Sample points used to compare expressions with free variables numerically.
const SAMPLE_POINTS: [f64; 4] = [0.317, 1.729, -2.413, 3.141];

/// Arithmetic reference CAS.
#[derive(Debug, Clone)]
pub struct ArithmeticCas {
    tolerance: f64,
}

impl Default for ArithmeticCas {
    fn default() -> Self {
        Self::new()
    }
}

impl ArithmeticCas {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tolerance: NUMERIC_TOLERANCE,
        }
    }

    /// Use a different relative tolerance for numeric comparison.
    #[must_use]
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self { tolerance }
    }

    fn numeric_equal(&self, left: &Expr, right: &Expr) -> Result<bool, CasError> {
        let mut names = BTreeSet::new();
        free_variables(left, &mut names);
        free_variables(right, &mut names);
        names.remove("pi");
        names.remove("e");
        if names.is_empty() {
            return Ok(
                match (
                    evaluate_expr(left, &BTreeMap::new())?,
                    evaluate_expr(right, &BTreeMap::new())?,
                ) {
                    (Outcome::Value(l), Outcome::Value(r)) => l.approx_eq(&r, self.tolerance),
                    _ => false,
                },
            );
        }
        // evaluate at shifted sample points; each variable gets its own offset
        for (round, base) in SAMPLE_POINTS.iter().enumerate() {
            let env: BTreeMap<String, Binding> = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let x = base + (i as f64) * 0.577 + (round as f64) * 0.001;
                    (name.clone(), Binding::Known(Eval::Num(x)))
                })
                .collect();
            let (Outcome::Value(l), Outcome::Value(r)) =
                (evaluate_expr(left, &env)?, evaluate_expr(right, &env)?)
            else {
                return Ok(false);
            };
            let both_undefined = matches!((&l, &r), (Eval::Num(a), Eval::Num(b)) if !a.is_finite() && !b.is_finite());
            if !both_undefined && !l.approx_eq(&r, self.tolerance.max(1e-9)) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Cas for ArithmeticCas {
    fn evaluate(
        &self,
        expression: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<Value, CasError> {
        let expr = parse(expression)?;
        let env = context
            .iter()
            .map(|(name, value)| Ok((name.clone(), value_to_binding(name, value)?)))
            .collect::<Result<BTreeMap<_, _>, CasError>>()?;
        match evaluate_expr(&expr, &env)? {
            Outcome::Value(result) => Ok(result.into_value()),
            Outcome::Symbolic => Ok(Value::Math(render(&expr, &env))),
        }
    }

    fn compare(&self, left: &str, right: &str, mode: ComparisonMode) -> Result<bool, CasError> {
        let left = parse(left)?;
        let right = parse(right)?;
        let empty = BTreeMap::new();
        Ok(match mode {
            ComparisonMode::Numeric => self.numeric_equal(&left, &right)?,
            ComparisonMode::Symbolic => render(&left, &empty) == render(&right, &empty),
            ComparisonMode::SymbolicSimplify => {
                render(&simplify(left, false), &empty) == render(&simplify(right, false), &empty)
            }
            ComparisonMode::SymbolicSimplifyExpand => {
                render(&simplify(left, true), &empty) == render(&simplify(right, true), &empty)
            }
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str) -> Value {
        ArithmeticCas::new()
            .evaluate(expression, &BTreeMap::new())
            .expect("evaluate")
    }

    fn eval_with(expression: &str, bindings: &[(&str, Value)]) -> Value {
        let context = bindings
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        ArithmeticCas::new()
            .evaluate(expression, &context)
            .expect("evaluate")
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3"), Value::Number(7.0));
        assert_eq!(eval("2 ^ 3 ^ 2"), Value::Number(512.0));
        assert_eq!(eval("-2 ^ 2"), Value::Number(-4.0));
        assert_eq!(eval("(1 + 2) * 3"), Value::Number(9.0));
        assert_eq!(eval("10 - 4 - 3"), Value::Number(3.0));
    }

    #[test]
    fn implicit_multiplication() {
        assert_eq!(eval_with("2x + 1", &[("x", 3.0.into())]), Value::Number(7.0));
        assert_eq!(eval("2(3 + 1)"), Value::Number(8.0));
    }

    #[test]
    fn tuples_and_functions() {
        assert_eq!(eval("(1, 2) + (3, 4)"), Value::point(4.0, 6.0));
        assert_eq!(eval("2 * (1, -1)"), Value::point(2.0, -2.0));
        assert_eq!(eval("sqrt(16) + abs(-1)"), Value::Number(5.0));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval("1 < 2 and not 3 == 4"), Value::Bool(true));
        assert_eq!(eval_with("n >= 2 or false", &[("n", 1.0.into())]), Value::Bool(false));
    }

    #[test]
    fn free_variables_stay_symbolic() {
        let result = eval_with("x + a", &[("a", 2.0.into())]);
        assert_eq!(result, Value::Math("x+2".to_string()));
    }

    #[test]
    fn lexer_spells_operators_both_ways() {
        let tokens: Vec<Token> = tokenize("x<=2.5 && not y || θ")
            .expect("lex")
            .into_iter()
            .map(|(_, t)| t)
            .collect();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("x".to_string()),
                Token::Le,
                Token::Num(2.5),
                Token::And,
                Token::Not,
                Token::Ident("y".to_string()),
                Token::Or,
                Token::Ident("θ".to_string()),
            ]
        );
        assert_eq!(tokenize("android").expect("lex"), vec![(0, Token::Ident("android".to_string()))]);
        assert!(matches!(tokenize("2 + 1.2.3"), Err(CasError::Parse { position: 4, .. })));
        assert!(matches!(tokenize("a # b"), Err(CasError::Parse { position: 2, .. })));
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = ArithmeticCas::new()
            .evaluate("1 + * 2", &BTreeMap::new())
            .expect_err("should fail");
        assert!(matches!(err, CasError::Parse { position: 4, .. }));
        assert!(ArithmeticCas::new().evaluate("", &BTreeMap::new()).is_err());
        assert!(ArithmeticCas::new().evaluate("(1", &BTreeMap::new()).is_err());
    }

    #[test]
    fn numeric_compare_samples_free_variables() {
        let cas = ArithmeticCas::new();
        assert!(cas.compare("2(x+1)", "2x+2", ComparisonMode::Numeric).expect("compare"));
        assert!(!cas.compare("x^2", "2x", ComparisonMode::Numeric).expect("compare"));
        assert!(cas.compare("0.1 + 0.2", "0.3", ComparisonMode::Numeric).expect("compare"));
    }

    #[test]
    fn symbolic_modes_differ_in_strength() {
        let cas = ArithmeticCas::new();
        assert!(cas.compare("x + y", "x+y", ComparisonMode::Symbolic).expect("compare"));
        assert!(!cas.compare("x + y", "y + x", ComparisonMode::Symbolic).expect("compare"));
        assert!(cas.compare("x + y", "y + x", ComparisonMode::SymbolicSimplify).expect("compare"));
        assert!(!cas.compare("2(x+1)", "2x+2", ComparisonMode::SymbolicSimplify).expect("compare"));
        assert!(cas
            .compare("2(x+1)", "2x+2", ComparisonMode::SymbolicSimplifyExpand)
            .expect("compare"));
    }

    #[test]
    fn mode_names_parse() {
        assert_eq!(
            ComparisonMode::from_name("symbolic+simplify"),
            Some(ComparisonMode::SymbolicSimplify)
        );
        assert_eq!(ComparisonMode::from_name("bogus"), None);
        for mode in [
            ComparisonMode::Numeric,
            ComparisonMode::Symbolic,
            ComparisonMode::SymbolicSimplify,
            ComparisonMode::SymbolicSimplifyExpand,
        ] {
            assert_eq!(ComparisonMode::from_name(mode.name()), Some(mode));
        }
    }

    #[test]
    fn math_context_values_are_parsed() {
        assert_eq!(
            eval_with("a * 2", &[("a", Value::Math("1 + 2".into()))]),
            Value::Number(6.0)
        );
    }
}
