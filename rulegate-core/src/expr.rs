//! Expression evaluation.
//!
//! Rules and guards carry small boolean/value expressions evaluated against a
//! scope object. The engine only depends on the [`ExpressionEvaluator`] trait;
//! [`ExprEngine`] is the default implementation for a restricted subset:
//!
//! - `data.amount`, `user.roles`, `payload.reason` - path access into the scope
//! - `amount` - a root name missing from the scope resolves against `data`
//! - `'text'`, `"text"`, `42`, `1.5`, `true`, `false`, `null`, `['a', 'b']` - literals
//! - `== != > >= < <=` - comparisons (numbers and strings)
//! - `a includes b`, `b in a` - membership for arrays and substrings
//! - `+ - * / %` - arithmetic, `+` concatenates when either side is a string
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)` - logic and grouping
//! - `len(x)`, `lower(s)`, `upper(s)`, `trim(s)`, `coalesce(a, b, ...)` - functions
//!
//! Examples:
//! - `user.roles includes 'admin'`
//! - `data.total > 100 && data.approved`
//! - `data.price * data.quantity`

use crate::error::EvalError;
use dashmap::DashMap;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// Evaluates expression text against a scope object.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates `expr` and returns its value.
    fn evaluate(&self, expr: &str, scope: &Value) -> Result<Value, EvalError>;

    /// Evaluates `expr` and returns the truthiness of its value.
    fn evaluate_boolean(&self, expr: &str, scope: &Value) -> Result<bool, EvalError> {
        self.evaluate(expr, scope).map(|v| is_truthy(&v))
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Includes,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, EvalError> {
        if s.trim().is_empty() {
            return Err(EvalError::parse(0, "empty expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(EvalError::parse(
                parser.pos,
                format!("unexpected input '{}'", &s[parser.pos..]),
            ));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a scope.
    pub fn eval(&self, scope: &Value) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(parts) => Ok(resolve_scope_path(scope, parts)),
            Expr::Array(items) => items
                .iter()
                .map(|e| e.eval(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(scope)?))),
            Expr::Neg(inner) => {
                let v = inner.eval(scope)?;
                let n = as_f64(&v).ok_or_else(|| EvalError::mismatch("cannot negate non-number"))?;
                number(-n)
            }
            Expr::And(left, right) => {
                if !is_truthy(&left.eval(scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.eval(scope)?)))
            }
            Expr::Or(left, right) => {
                if is_truthy(&left.eval(scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.eval(scope)?)))
            }
            Expr::Binary(op, left, right) => {
                let l = left.eval(scope)?;
                let r = right.eval(scope)?;
                apply_binary(*op, &l, &r)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|e| e.eval(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                call_function(name, &args)
            }
        }
    }
}

fn apply_binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinOp::Gt => Ok(Value::Bool(compare(l, r) == Some(Ordering::Greater))),
        BinOp::Ge => Ok(Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinOp::Lt => Ok(Value::Bool(compare(l, r) == Some(Ordering::Less))),
        BinOp::Le => Ok(Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinOp::Includes => includes(l, r).map(Value::Bool),
        BinOp::In => includes(r, l).map(Value::Bool),
        BinOp::Add => match (l, r) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", display(l), display(r))))
            }
            _ => arithmetic(l, r, "+", |a, b| Ok(a + b)),
        },
        BinOp::Sub => arithmetic(l, r, "-", |a, b| Ok(a - b)),
        BinOp::Mul => arithmetic(l, r, "*", |a, b| Ok(a * b)),
        BinOp::Div => arithmetic(l, r, "/", |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        }),
        BinOp::Rem => arithmetic(l, r, "%", |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(a % b)
            }
        }),
    }
}

fn arithmetic(
    l: &Value,
    r: &Value,
    op: &str,
    f: impl Fn(f64, f64) -> Result<f64, EvalError>,
) -> Result<Value, EvalError> {
    match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => number(f(a, b)?),
        _ => Err(EvalError::mismatch(format!(
            "operator '{}' requires numbers, got {} and {}",
            op,
            kind(l),
            kind(r)
        ))),
    }
}

fn includes(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match (container, item) {
        (Value::Array(items), _) => Ok(items.iter().any(|v| values_equal(v, item))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Null, _) => Ok(false),
        _ => Err(EvalError::mismatch(format!(
            "cannot test membership of {} in {}",
            kind(item),
            kind(container)
        ))),
    }
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let single = |args: &[Value]| -> Result<Value, EvalError> {
        match args {
            [v] => Ok(v.clone()),
            _ => Err(EvalError::mismatch(format!(
                "{}() takes exactly one argument",
                name
            ))),
        }
    };

    match name {
        "len" => match single(args)? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(EvalError::mismatch(format!("len() of {}", kind(&other)))),
        },
        "lower" | "upper" | "trim" => match single(args)? {
            Value::String(s) => Ok(Value::String(match name {
                "lower" => s.to_lowercase(),
                "upper" => s.to_uppercase(),
                _ => s.trim().to_string(),
            })),
            Value::Null => Ok(Value::Null),
            other => Err(EvalError::mismatch(format!(
                "{}() of {}",
                name,
                kind(&other)
            ))),
        },
        "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        _ => Err(EvalError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn resolve_scope_path(scope: &Value, parts: &[String]) -> Value {
    let root_present = scope
        .as_object()
        .map(|m| m.contains_key(&parts[0]))
        .unwrap_or(false);

    let found = if root_present {
        lookup_segments(scope, parts.iter().map(String::as_str))
    } else {
        scope
            .get("data")
            .and_then(|data| lookup_segments(data, parts.iter().map(String::as_str)))
    };

    found.cloned().unwrap_or(Value::Null)
}

fn lookup_segments<'v, 'p>(
    value: &'v Value,
    segments: impl IntoIterator<Item = &'p str>,
) -> Option<&'v Value> {
    let mut current = value;
    for part in segments {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves a dot-separated path. Missing segments yield `None`, never a panic.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    lookup_segments(value, path.split('.'))
}

/// Truthiness used by boolean evaluation.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Equality with numeric comparison across integer/float representations.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}

/// Orders two numbers or two strings; other combinations are unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => as_f64(a)?.partial_cmp(&as_f64(b)?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn number(n: f64) -> Result<Value, EvalError> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| EvalError::mismatch("result is not a finite number"))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursive descent parser for expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, EvalError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_not()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            self.pos += 2;
            BinOp::Eq
        } else if self.peek_str("!=") {
            self.pos += 2;
            BinOp::Ne
        } else if self.peek_str(">=") {
            self.pos += 2;
            BinOp::Ge
        } else if self.peek_str("<=") {
            self.pos += 2;
            BinOp::Le
        } else if self.peek_char() == Some('>') {
            self.pos += 1;
            BinOp::Gt
        } else if self.peek_char() == Some('<') {
            self.pos += 1;
            BinOp::Lt
        } else if self.peek_keyword("includes") {
            self.pos += "includes".len();
            BinOp::Includes
        } else if self.peek_keyword("in") {
            self.pos += 2;
            BinOp::In
        } else {
            return Ok(left);
        };

        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinOp::Add,
                Some('-') => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinOp::Mul,
                Some('/') => BinOp::Div,
                Some('%') => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();

        if self.peek_char() == Some('-') {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(match inner {
                Expr::Literal(Value::Number(n)) => Expr::Literal(
                    n.as_f64()
                        .map(|f| number(-f))
                        .transpose()?
                        .unwrap_or(Value::Null),
                ),
                other => Expr::Neg(Box::new(other)),
            });
        }

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect(')')?;
                Ok(expr)
            }
            Some('[') => {
                self.pos += 1;
                let items = self.parse_list(']')?;
                Ok(Expr::Array(items))
            }
            Some('\'') | Some('"') => self.parse_string().map(|s| Expr::Literal(Value::String(s))),
            Some(c) if c.is_ascii_digit() => self.parse_number().map(Expr::Literal),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_path_or_call(),
            Some(c) => Err(EvalError::parse(
                self.pos,
                format!("unexpected character '{}'", c),
            )),
            None => Err(EvalError::parse(self.pos, "unexpected end of expression")),
        }
    }

    fn parse_list(&mut self, close: char) -> Result<Vec<Expr>, EvalError> {
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(close) {
            self.pos += 1;
            return Ok(items);
        }

        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(EvalError::parse(self.pos, format!("expected '{}'", close))),
            }
        }
    }

    fn parse_path_or_call(&mut self) -> Result<Expr, EvalError> {
        let mut parts = vec![self.parse_ident()?];

        while self.peek_char() == Some('.') {
            self.pos += 1;
            let part = self.parse_ident()?;
            parts.push(part);
        }

        if parts.len() == 1 {
            match parts[0].as_str() {
                "true" => return Ok(Expr::Literal(Value::Bool(true))),
                "false" => return Ok(Expr::Literal(Value::Bool(false))),
                "null" => return Ok(Expr::Literal(Value::Null)),
                _ => {}
            }

            self.skip_whitespace();
            if self.peek_char() == Some('(') {
                self.pos += 1;
                let args = self.parse_list(')')?;
                return Ok(Expr::Call(parts.remove(0), args));
            }
        }

        Ok(Expr::Path(parts))
    }

    fn parse_ident(&mut self) -> Result<String, EvalError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        if start == self.pos {
            return Err(EvalError::parse(self.pos, "expected identifier"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, EvalError> {
        let quote = match self.peek_char() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(EvalError::parse(self.pos, "expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                let escaped = self
                    .peek_char()
                    .ok_or_else(|| EvalError::parse(self.pos, "unterminated string"))?;
                self.pos += escaped.len_utf8();
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }

        Err(EvalError::parse(self.pos, "unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, EvalError> {
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        let n = num_str
            .parse::<f64>()
            .map_err(|_| EvalError::parse(start, format!("invalid number: '{}'", num_str)))?;
        number(n)
    }

    fn expect(&mut self, c: char) -> Result<(), EvalError> {
        self.skip_whitespace();
        if self.peek_char() != Some(c) {
            return Err(EvalError::parse(self.pos, format!("expected '{}'", c)));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        let rest = &self.input[self.pos..];
        rest.starts_with(kw)
            && !rest[kw.len()..]
                .chars()
                .next()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false)
    }
}

/// Default expression evaluator with a parse cache.
#[derive(Default)]
pub struct ExprEngine {
    /// Bounded by the number of distinct expressions in registered definitions.
    cache: DashMap<String, Arc<Expr>>,
}

impl ExprEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an expression, reusing a cached parse when available.
    pub fn compile(&self, expr: &str) -> Result<Arc<Expr>, EvalError> {
        if let Some(parsed) = self.cache.get(expr) {
            return Ok(parsed.clone());
        }
        let parsed = Arc::new(Expr::parse(expr)?);
        self.cache.insert(expr.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Number of cached parses.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl ExpressionEvaluator for ExprEngine {
    fn evaluate(&self, expr: &str, scope: &Value) -> Result<Value, EvalError> {
        self.compile(expr)?.eval(scope)
    }
}

/// Builds the scope object handed to the evaluator.
#[derive(Debug, Default, Clone)]
pub struct Scope(Map<String, Value>);

impl Scope {
    pub fn new(data: &Value) -> Self {
        let mut map = Map::new();
        map.insert("data".into(), data.clone());
        map.insert("vars".into(), Value::Object(Map::new()));
        Self(map)
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn with_opt(self, key: &str, value: Option<&Value>) -> Self {
        match value {
            Some(v) => self.with(key, v.clone()),
            None => self,
        }
    }

    /// Binds a variable both under `vars` and at the root.
    pub fn var(mut self, name: &str, value: Value) -> Self {
        if let Some(Value::Object(vars)) = self.0.get_mut("vars") {
            vars.insert(name.to_string(), value.clone());
        }
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn user(self, id: Option<&str>, roles: &[String]) -> Self {
        let user = serde_json::json!({ "id": id, "roles": roles });
        self.with("user", user)
    }

    pub fn build(self) -> Value {
        Value::Object(self.0)
    }
}
