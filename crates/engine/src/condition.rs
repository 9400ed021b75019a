//! Conditional branching — `when` predicates and `then` / `else` selection.
//!
//! Predicates are small boolean expressions over prior step outputs:
//!
//! ```text
//! {{score}} > 0.8 && {{review.status}} == 'approved'
//! !({{count}} <= 10) || {{force}}
//! ```
//!
//! Literals are numbers, quoted strings, `true`, `false` and `null`.
//! `and` / `or` / `not` are accepted as spellings of `&&` / `||` / `!`.
//! A bare operand is tested for truthiness. Evaluation is pure: the same
//! outputs always select the same branch.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::graph::Step;
use crate::template::Reference;
use crate::TemplateError;

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ref(Reference),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            c if c.is_whitespace() => i += 1,
            '{' if next == Some('{') => {
                let start = i + 2;
                let mut end = start;
                while end + 1 < chars.len() && !(chars[end] == '}' && chars[end + 1] == '}') {
                    end += 1;
                }
                if end + 1 >= chars.len() {
                    return Err("unterminated '{{' placeholder".into());
                }
                let raw: String = chars[start..end].iter().collect();
                let reference = Reference::parse(&raw);
                if reference.step.is_empty() {
                    return Err("empty '{{}}' placeholder".into());
                }
                tokens.push(Token::Ref(reference));
                i = end + 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(format!("unterminated string starting at {i}")),
                        Some('\\') if chars.get(j + 1).is_some() => {
                            value.push(chars[j + 1]);
                            j += 2;
                        }
                        Some(&ch) if ch == quote => break,
                        Some(&ch) => {
                            value.push(ch);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(value)));
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].is_ascii_digit()
                        || chars[j] == '.'
                        || ((chars[j] == 'e' || chars[j] == 'E') && j > i))
                {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                let number: f64 = text
                    .parse()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                let value = serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .ok_or_else(|| format!("invalid number '{text}'"))?;
                tokens.push(Token::Literal(value));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    other => {
                        return Err(format!(
                            "unexpected identifier '{other}' (use '{{{{{other}}}}}' to reference a step)"
                        ))
                    }
                });
                i = j;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ref(Reference),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.bump();
            let rhs = self.operand()?;
            return Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Ref(r)) => Ok(Expr::Ref(r)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".into()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// A parsed `when` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Parse a predicate; the error is a human-readable message.
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".into());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if let Some(extra) = parser.peek() {
            return Err(format!("unexpected trailing token {extra:?}"));
        }
        Ok(Self {
            source: source.to_owned(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Step references the predicate reads.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        collect_refs(&self.expr, &mut out);
        out
    }

    /// Evaluate against recorded step outputs.
    pub fn evaluate(&self, outputs: &HashMap<String, Value>) -> Result<bool, TemplateError> {
        Ok(truthy(&eval(&self.expr, outputs)?))
    }
}

fn collect_refs(expr: &Expr, out: &mut Vec<Reference>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Ref(r) => out.push(r.clone()),
        Expr::Not(e) => collect_refs(e, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}

fn eval(expr: &Expr, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    Ok(match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Ref(r) => r.lookup(outputs)?,
        Expr::Not(e) => Value::Bool(!truthy(&eval(e, outputs)?)),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, outputs)?) && truthy(&eval(b, outputs)?)),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, outputs)?) || truthy(&eval(b, outputs)?)),
        Expr::Compare(a, op, b) => Value::Bool(compare(&eval(a, outputs)?, *op, &eval(b, outputs)?)),
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    let ordering = match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };

    match op {
        CmpOp::Eq => ordering.map_or_else(|| lhs == rhs, |o| o == Ordering::Equal),
        CmpOp::Ne => ordering.map_or_else(|| lhs != rhs, |o| o != Ordering::Equal),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

// ---------------------------------------------------------------------------
// Condition + evaluator
// ---------------------------------------------------------------------------

/// A validated `when` / `then` / `else` block.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub predicate: Predicate,
    pub then: Vec<String>,
    pub otherwise: Vec<String>,
}

/// Outcome of evaluating one step's condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// Value the predicate evaluated to.
    pub taken: bool,
    /// Steps on the selected branch.
    pub activate: Vec<String>,
    /// Steps on the branch that was not selected.
    pub prune: Vec<String>,
}

/// Selects `then` / `else` branches from accumulated step outputs.
pub struct ConditionalEvaluator;

impl ConditionalEvaluator {
    /// Evaluate `step`'s condition. A step without one activates nothing.
    pub fn resolve(step: &Step, outputs: &HashMap<String, Value>) -> Result<Activation, TemplateError> {
        let Some(condition) = &step.condition else {
            return Ok(Activation::default());
        };

        let taken = condition.predicate.evaluate(outputs)?;
        let (activate, prune) = if taken {
            (condition.then.clone(), condition.otherwise.clone())
        } else {
            (condition.otherwise.clone(), condition.then.clone())
        };

        Ok(Activation {
            taken,
            activate,
            prune,
        })
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(source: &str, outputs: &HashMap<String, Value>) -> bool {
        Predicate::parse(source)
            .unwrap_or_else(|e| panic!("'{source}' should parse: {e}"))
            .evaluate(outputs)
            .expect("should evaluate")
    }

    fn outputs() -> HashMap<String, Value> {
        HashMap::from([
            ("score".to_string(), json!(0.93)),
            ("count".to_string(), json!("12")),
            ("review".to_string(), json!({ "status": "approved", "tags": [] })),
        ])
    }

    #[test]
    fn literal_comparisons() {
        let none = HashMap::new();
        assert!(eval_with("1 == 1", &none));
        assert!(!eval_with("1 != 1", &none));
        assert!(eval_with("-2.5 < 3", &none));
        assert!(eval_with("'abc' < 'abd'", &none));
        assert!(eval_with("null == null", &none));
        assert!(!eval_with("'a' > 1", &none));
    }

    #[test]
    fn references_and_boolean_operators() {
        let out = outputs();
        assert!(eval_with("{{score}} > 0.8 && {{review.status}} == 'approved'", &out));
        assert!(eval_with("{{count}} >= 12", &out));
        assert!(!eval_with("!({{count}} <= 100) or false", &out));
        assert!(eval_with("not {{review.tags}}", &out));
        assert!(!eval_with("{{review.missing}}", &out));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let none = HashMap::new();
        assert!(eval_with("true || false && false", &none));
        assert!(!eval_with("(true || false) && false", &none));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("1 ==").is_err());
        assert!(Predicate::parse("(1 == 1").is_err());
        assert!(Predicate::parse("score > 1").is_err());
        assert!(Predicate::parse("{{score > 1").is_err());
        assert!(Predicate::parse("1 == 1 1").is_err());
    }

    #[test]
    fn references_are_listed() {
        let p = Predicate::parse("{{a}} > 1 || !{{b.c}}").expect("should parse");
        let names: Vec<String> = p.references().iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["a", "b.c"]);
    }

    #[test]
    fn missing_step_is_unresolved() {
        let p = Predicate::parse("{{ghost}} == 1").expect("should parse");
        assert!(matches!(
            p.evaluate(&HashMap::new()),
            Err(TemplateError::UnresolvedReference { .. })
        ));
    }
}
