//! Path query language over schemaless workload documents
//!
//! ```text
//! status.conditions.#(type=="Complete")#|#(status=="True")#
//! ```
//!
//! - `a.b.0` walks object keys and array indexes (`\.` escapes a dot)
//! - `#` is the length of an array; segments after it are mapped over every element
//! - `#(path op literal)` selects the first matching element, `#(...)#` all of them
//! - `|` feeds the whole result of the left query into the right one
//!
//! Operators: `==` `!=` `<` `<=` `>` `>=`. Literals: `"string"`, numbers,
//! `true`, `false`, `null`. A bare `#(path)` matches elements where the path exists.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExpressionError {
    #[error("unbalanced parentheses in expression: {0}")]
    UnbalancedParentheses(String),

    #[error("unterminated string literal in expression: {0}")]
    UnterminatedString(String),

    #[error("invalid literal '{literal}' in expression: {expression}")]
    InvalidLiteral { literal: String, expression: String },

    #[error("invalid segment '{segment}' in expression: {expression}")]
    InvalidSegment { segment: String, expression: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    path: Vec<String>,
    comparison: Option<(Op, Literal)>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Count,
    First(Predicate),
    All(Predicate),
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pipeline: Vec<Vec<Segment>>,
}

impl Query {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let mut pipeline = Vec::new();
        for stage in split_top_level(expression, '|')? {
            let stage = stage.trim();
            if stage.is_empty() {
                return Err(ExpressionError::InvalidSegment {
                    segment: String::new(),
                    expression: expression.to_string(),
                });
            }
            let segments = split_top_level(stage, '.')?
                .into_iter()
                .map(|raw| parse_segment(&raw, expression))
                .collect::<Result<Vec<_>, _>>()?;
            pipeline.push(segments);
        }
        Ok(Query { pipeline })
    }

    /// Run the query; `None` when the path does not resolve
    pub fn run(&self, document: &Value) -> Option<Value> {
        let mut current = document.clone();
        for stage in &self.pipeline {
            current = apply(stage, &current)?;
        }
        Some(current)
    }
}

fn apply(segments: &[Segment], value: &Value) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    match first {
        Segment::Key(key) => {
            let next = match value {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
            apply(rest, next)
        }
        Segment::Count => {
            let items = value.as_array()?;
            if rest.is_empty() {
                Some(Value::from(items.len()))
            } else {
                Some(Value::Array(
                    items.iter().filter_map(|item| apply(rest, item)).collect(),
                ))
            }
        }
        Segment::First(predicate) => {
            let hit = value.as_array()?.iter().find(|item| predicate.matches(item))?;
            apply(rest, hit)
        }
        Segment::All(predicate) => Some(Value::Array(
            value
                .as_array()?
                .iter()
                .filter(|item| predicate.matches(item))
                .filter_map(|item| apply(rest, item))
                .collect(),
        )),
    }
}

impl Predicate {
    fn matches(&self, item: &Value) -> bool {
        let mut field = item;
        for key in &self.path {
            let next = match field {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(v) => field = v,
                None => return false,
            }
        }

        let Some((op, literal)) = &self.comparison else {
            return true;
        };

        match (field, literal) {
            (Value::String(actual), Literal::Str(expected)) => {
                compare(op, actual.as_str().cmp(expected.as_str()))
            }
            (Value::Number(actual), Literal::Num(expected)) => match actual.as_f64() {
                Some(actual) => match actual.partial_cmp(expected) {
                    Some(ordering) => compare(op, ordering),
                    None => false,
                },
                None => false,
            },
            (Value::Bool(actual), Literal::Bool(expected)) => match op {
                Op::Eq => actual == expected,
                Op::Ne => actual != expected,
                _ => false,
            },
            (Value::Null, Literal::Null) => matches!(op, Op::Eq | Op::Le | Op::Ge),
            // Type mismatch: only "not equal" holds
            _ => *op == Op::Ne,
        }
    }
}

fn compare(op: &Op, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        Op::Eq => ordering == Equal,
        Op::Ne => ordering != Equal,
        Op::Lt => ordering == Less,
        Op::Le => ordering != Greater,
        Op::Gt => ordering == Greater,
        Op::Ge => ordering != Less,
    }
}

/// Split on `sep` outside of parentheses and string literals.
/// A backslash keeps the next character from acting as a separator.
fn split_top_level(input: &str, sep: char) -> Result<Vec<String>, ExpressionError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                // Escapes are resolved by the segment parser
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ExpressionError::UnbalancedParentheses(input.to_string()))?;
                current.push(c);
            }
            c if c == sep && !in_string && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }

    if in_string {
        return Err(ExpressionError::UnterminatedString(input.to_string()));
    }
    if depth != 0 {
        return Err(ExpressionError::UnbalancedParentheses(input.to_string()));
    }
    parts.push(current);
    Ok(parts)
}

fn parse_segment(raw: &str, expression: &str) -> Result<Segment, ExpressionError> {
    let invalid = || ExpressionError::InvalidSegment {
        segment: raw.to_string(),
        expression: expression.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid());
    }
    if raw == "#" {
        return Ok(Segment::Count);
    }
    if let Some(inner) = raw.strip_prefix("#(") {
        let (body, all) = if let Some(body) = inner.strip_suffix(")#") {
            (body, true)
        } else if let Some(body) = inner.strip_suffix(')') {
            (body, false)
        } else {
            return Err(invalid());
        };
        let predicate = parse_predicate(body, expression)?;
        return Ok(if all {
            Segment::All(predicate)
        } else {
            Segment::First(predicate)
        });
    }
    // Escaped separators survive splitting as "\." and "\|"
    Ok(Segment::Key(unescape_key(raw)))
}

fn unescape_key(raw: &str) -> String {
    raw.replace("\\.", ".").replace("\\|", "|")
}

fn parse_predicate(body: &str, expression: &str) -> Result<Predicate, ExpressionError> {
    let (lhs, comparison) = match find_operator(body) {
        Some((index, op, width)) => {
            let literal = parse_literal(body[index + width..].trim(), expression)?;
            (&body[..index], Some((op, literal)))
        }
        None => (body, None),
    };

    let lhs = lhs.trim();
    if lhs.is_empty() {
        return Err(ExpressionError::InvalidSegment {
            segment: body.to_string(),
            expression: expression.to_string(),
        });
    }
    let path = split_top_level(lhs, '.')?
        .into_iter()
        .map(|k| unescape_key(&k))
        .collect();
    Ok(Predicate { path, comparison })
}

/// Locate the first comparison operator outside a string literal
fn find_operator(body: &str) -> Option<(usize, Op, usize)> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'"' => in_string = !in_string,
            b'=' | b'!' | b'<' | b'>' if !in_string => {
                let two = bytes.get(i + 1) == Some(&b'=');
                let op = match (bytes[i], two) {
                    (b'=', true) => Some((Op::Eq, 2)),
                    (b'!', true) => Some((Op::Ne, 2)),
                    (b'<', true) => Some((Op::Le, 2)),
                    (b'>', true) => Some((Op::Ge, 2)),
                    (b'<', false) => Some((Op::Lt, 1)),
                    (b'>', false) => Some((Op::Gt, 1)),
                    _ => None,
                };
                if let Some((op, width)) = op {
                    return Some((i, op, width));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_literal(raw: &str, expression: &str) -> Result<Literal, ExpressionError> {
    let invalid = || ExpressionError::InvalidLiteral {
        literal: raw.to_string(),
        expression: expression.to_string(),
    };

    if let Some(rest) = raw.strip_prefix('"') {
        let body = rest.strip_suffix('"').ok_or_else(invalid)?;
        let mut out = String::with_capacity(body.len());
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                out.push(chars.next().ok_or_else(invalid)?);
            } else if c == '"' {
                return Err(invalid());
            } else {
                out.push(c);
            }
        }
        return Ok(Literal::Str(out));
    }

    match raw {
        "true" => Ok(Literal::Bool(true)),
        "false" => Ok(Literal::Bool(false)),
        "null" => Ok(Literal::Null),
        _ => raw.parse::<f64>().map(Literal::Num).map_err(|_| invalid()),
    }
}
