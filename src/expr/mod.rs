//! Expression templates evaluated against a request environment.
//!
//! A template is plain text with zero or more `${{ expr }}` blocks. Text
//! without blocks passes through unchanged as a string. A template that is
//! exactly one block yields the block's typed value. Anything else is
//! interpolated into a string.
//!
//! Evaluation is pure: expressions see only the environment they are given
//! and have no side effects. Call sites check the type of the result.

mod eval;
mod parser;

use serde_json::Value;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("unterminated expression in template {0:?}")]
    Unterminated(String),

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("{function}: {message}")]
    Call { function: String, message: String },

    #[error("{0}")]
    Type(String),
}

/// Evaluates templates against an environment.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, template: &str, env: &Value) -> Result<Value, ExprError>;
}

/// The built-in `${{ ... }}` evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateEvaluator;

impl Evaluator for TemplateEvaluator {
    fn evaluate(&self, template: &str, env: &Value) -> Result<Value, ExprError> {
        let segments = split_template(template)?;
        match segments.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Segment::Text(text)] => Ok(Value::String((*text).to_string())),
            [Segment::Expr(source)] => eval::evaluate(&parser::parse(source)?, env),
            _ => {
                let mut out = String::new();
                for segment in &segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Expr(source) => {
                            match eval::evaluate(&parser::parse(source)?, env)? {
                                Value::String(s) => out.push_str(&s),
                                Value::Null => {}
                                other => out.push_str(&other.to_string()),
                            }
                        }
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

/// Evaluates `template` and requires a string result.
pub fn evaluate_string(
    evaluator: &dyn Evaluator,
    template: &str,
    env: &Value,
) -> Result<String, ExprError> {
    match evaluator.evaluate(template, env)? {
        Value::String(s) => Ok(s),
        other => Err(ExprError::Type(format!(
            "expression {template:?} evaluated to {}, expected a string",
            type_name(&other)
        ))),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

fn split_template(template: &str) -> Result<Vec<Segment<'_>>, ExprError> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let body = &rest[start + OPEN.len()..];
        let end = find_close(body).ok_or_else(|| ExprError::Unterminated(template.to_string()))?;
        segments.push(Segment::Expr(body[..end].trim()));
        rest = &body[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

/// Finds the closing `}}` outside of quoted strings.
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => {
                i += 2;
                continue;
            }
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if bytes[i..].starts_with(CLOSE.as_bytes()) => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}
