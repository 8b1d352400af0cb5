//! Flow predicate expressions
//!
//! A small boolean language over case data, parsed at specification load
//! time and evaluated against `serde_json` case data at runtime.
//!
//! Supported forms: `true`, `false`, `default`, bare variable references
//! (truthiness), comparisons (`==`, `!=`, `<`, `<=`, `>`, `>=`) between a
//! variable and a literal or another variable, `!`, `&&`, `||` and
//! parentheses. Evaluation is total: a missing variable or a type mismatch
//! evaluates to false, never an error.

use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};

/// A parsed predicate expression
///
/// Serialized as its source text, so specifications stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expr {
    source: String,
    node: Node,
}

#[derive(Debug, Clone, PartialEq, Default)]
enum Node {
    #[default]
    Default,
    Bool(bool),
    Var(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Cmp(Operand, CmpOp, Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Var(String),
    Number(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    /// Parse an expression from source text
    pub fn parse(source: &str) -> WorkflowResult<Self> {
        let mut parser = Parser::new(source);
        let node = parser.parse_or()?;
        parser.expect_end()?;
        Ok(Self {
            source: source.to_string(),
            node,
        })
    }

    /// The original source text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether this is the `default` arc marker
    pub fn is_default(&self) -> bool {
        self.node == Node::Default
    }

    /// Evaluate against case data; total, never errors
    pub fn evaluate(&self, data: &serde_json::Value) -> bool {
        eval(&self.node, data)
    }
}

impl TryFrom<String> for Expr {
    type Error = WorkflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Expr::parse(&value)
    }
}

impl From<Expr> for String {
    fn from(expr: Expr) -> String {
        expr.source
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn eval(node: &Node, data: &serde_json::Value) -> bool {
    match node {
        // Default arcs are selected by split evaluation, not by truth value.
        Node::Default => false,
        Node::Bool(b) => *b,
        Node::Var(name) => truthy(lookup(data, name)),
        Node::Not(inner) => !eval(inner, data),
        Node::And(a, b) => eval(a, data) && eval(b, data),
        Node::Or(a, b) => eval(a, data) || eval(b, data),
        Node::Cmp(lhs, op, rhs) => compare(lhs, *op, rhs, data),
    }
}

fn lookup<'a>(data: &'a serde_json::Value, name: &str) -> Option<&'a serde_json::Value> {
    // Dotted paths descend into nested objects.
    let mut current = data;
    for segment in name.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Array(a)) => !a.is_empty(),
        Some(serde_json::Value::Object(o)) => !o.is_empty(),
    }
}

fn compare(lhs: &Operand, op: CmpOp, rhs: &Operand, data: &serde_json::Value) -> bool {
    let left = resolve(lhs, data);
    let right = resolve(rhs, data);
    let (left, right) = match (left, right) {
        (Some(l), Some(r)) => (l, r),
        _ => return false,
    };

    // Numbers compare numerically, strings lexicographically, bools by
    // equality only. Mixed types never compare equal.
    match (&left, &right) {
        (Resolved::Number(l), Resolved::Number(r)) => match op {
            CmpOp::Eq => (l - r).abs() < f64::EPSILON,
            CmpOp::Ne => (l - r).abs() >= f64::EPSILON,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        },
        (Resolved::Str(l), Resolved::Str(r)) => match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        },
        (Resolved::Bool(l), Resolved::Bool(r)) => match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            _ => false,
        },
        _ => matches!(op, CmpOp::Ne),
    }
}

enum Resolved {
    Number(f64),
    Str(String),
    Bool(bool),
}

fn resolve(operand: &Operand, data: &serde_json::Value) -> Option<Resolved> {
    match operand {
        Operand::Number(n) => Some(Resolved::Number(*n)),
        Operand::Str(s) => Some(Resolved::Str(s.clone())),
        Operand::Bool(b) => Some(Resolved::Bool(*b)),
        Operand::Var(name) => match lookup(data, name)? {
            serde_json::Value::Number(n) => n.as_f64().map(Resolved::Number),
            serde_json::Value::String(s) => Some(Resolved::Str(s.clone())),
            serde_json::Value::Bool(b) => Some(Resolved::Bool(*b)),
            _ => None,
        },
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> WorkflowResult<Node> {
        let mut node = self.parse_and()?;
        while self.eat("||") {
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> WorkflowResult<Node> {
        let mut node = self.parse_unary()?;
        while self.eat("&&") {
            let rhs = self.parse_unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> WorkflowResult<Node> {
        if self.eat("!") {
            let inner = self.parse_unary()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> WorkflowResult<Node> {
        if self.eat("(") {
            let node = self.parse_or()?;
            if !self.eat(")") {
                return Err(self.error("expected ')'"));
            }
            return Ok(node);
        }

        let lhs = self.parse_operand()?;
        self.skip_ws();
        let op = if self.eat("==") {
            Some(CmpOp::Eq)
        } else if self.eat("!=") {
            Some(CmpOp::Ne)
        } else if self.eat("<=") {
            Some(CmpOp::Le)
        } else if self.eat(">=") {
            Some(CmpOp::Ge)
        } else if self.eat("<") {
            Some(CmpOp::Lt)
        } else if self.eat(">") {
            Some(CmpOp::Gt)
        } else {
            None
        };

        match op {
            Some(op) => {
                let rhs = self.parse_operand()?;
                Ok(Node::Cmp(lhs, op, rhs))
            }
            None => match lhs {
                Operand::Var(name) if name == "default" => Ok(Node::Default),
                Operand::Var(name) => Ok(Node::Var(name)),
                Operand::Bool(b) => Ok(Node::Bool(b)),
                _ => Err(self.error("bare literal is not a predicate")),
            },
        }
    }

    fn parse_operand(&mut self) -> WorkflowResult<Operand> {
        self.skip_ws();
        let rest = self.rest();
        let mut chars = rest.chars();
        match chars.next() {
            Some('"') => {
                let closing = rest[1..]
                    .find('"')
                    .ok_or_else(|| self.error("unterminated string literal"))?;
                let value = rest[1..1 + closing].to_string();
                self.pos += closing + 2;
                Ok(Operand::Str(value))
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let len = rest
                    .char_indices()
                    .take_while(|(i, ch)| {
                        ch.is_ascii_digit() || *ch == '.' || (*i == 0 && *ch == '-')
                    })
                    .count();
                let text = &rest[..len];
                let value: f64 = text
                    .parse()
                    .map_err(|_| self.error("invalid number literal"))?;
                self.pos += len;
                Ok(Operand::Number(value))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let len = rest
                    .chars()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '.')
                    .count();
                let name = &rest[..len];
                self.pos += len;
                match name {
                    "true" => Ok(Operand::Bool(true)),
                    "false" => Ok(Operand::Bool(false)),
                    _ => Ok(Operand::Var(name.to_string())),
                }
            }
            _ => Err(self.error("expected operand")),
        }
    }

    fn expect_end(&mut self) -> WorkflowResult<()> {
        self.skip_ws();
        if self.rest().is_empty() {
            Ok(())
        } else {
            Err(self.error("trailing input"))
        }
    }

    fn error(&self, message: &str) -> WorkflowError {
        WorkflowError::Parse(format!(
            "predicate error at offset {}: {} in {:?}",
            self.pos, message, self.input
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn comparison_against_literal() {
        let expr = Expr::parse("x > 0").unwrap();
        assert!(expr.evaluate(&json!({"x": 5})));
        assert!(!expr.evaluate(&json!({"x": -1})));
        assert!(!expr.evaluate(&json!({})));
    }

    #[test]
    fn comparison_between_variables() {
        let expr = Expr::parse("balance >= withdrawal").unwrap();
        assert!(expr.evaluate(&json!({"balance": 100, "withdrawal": 40})));
        assert!(!expr.evaluate(&json!({"balance": 10, "withdrawal": 40})));
    }

    #[test]
    fn string_and_bool_equality() {
        let expr = Expr::parse("status == \"approved\"").unwrap();
        assert!(expr.evaluate(&json!({"status": "approved"})));
        assert!(!expr.evaluate(&json!({"status": "rejected"})));

        let expr = Expr::parse("flag == true").unwrap();
        assert!(expr.evaluate(&json!({"flag": true})));
        assert!(!expr.evaluate(&json!({"flag": 1})));
    }

    #[test]
    fn boolean_connectives() {
        let expr = Expr::parse("x > 0 && !(y == 2 || z)").unwrap();
        assert!(expr.evaluate(&json!({"x": 1, "y": 3})));
        assert!(!expr.evaluate(&json!({"x": 1, "y": 2})));
        assert!(!expr.evaluate(&json!({"x": 1, "y": 3, "z": true})));
    }

    #[test]
    fn dotted_paths() {
        let expr = Expr::parse("order.total >= 100").unwrap();
        assert!(expr.evaluate(&json!({"order": {"total": 250}})));
        assert!(!expr.evaluate(&json!({"order": {}})));
    }

    #[test]
    fn default_marker() {
        let expr = Expr::parse("default").unwrap();
        assert!(expr.is_default());
        assert!(!expr.evaluate(&json!({"default": true})));
    }

    #[test]
    fn serde_round_trip() {
        let expr = Expr::parse("x > 0 && status == \"ok\"").unwrap();
        let text = serde_json::to_string(&expr).unwrap();
        let back: Expr = serde_json::from_str(&text).unwrap();
        assert_eq!(expr, back);
    }

    #[test]
    fn parse_errors() {
        assert!(Expr::parse("x >").is_err());
        assert!(Expr::parse("(x > 1").is_err());
        assert!(Expr::parse("\"dangling").is_err());
        assert!(Expr::parse("42").is_err());
    }
}
