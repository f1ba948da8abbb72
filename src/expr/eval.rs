use serde_json::Value;

use super::parser::{BinaryOp, Expr};
use super::{type_name, ExprError};
use crate::urls;

pub(crate) fn evaluate(expr: &Expr, env: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        // Missing data is null rather than an error; payloads are sparse.
        Expr::Ident(name) => Ok(env.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Member(target, field) => Ok(evaluate(target, env)?
            .get(field.as_str())
            .cloned()
            .unwrap_or(Value::Null)),
        Expr::Index(target, index) => {
            let target = evaluate(target, env)?;
            let index = evaluate(index, env)?;
            Ok(match (&target, &index) {
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| items.get(i).cloned()),
                _ => None,
            }
            .unwrap_or(Value::Null))
        }
        Expr::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| evaluate(item, env))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(&evaluate(inner, env)?, "!")?)),
        Expr::Binary(op, left, right) => binary(*op, left, right, env),
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &args, env)
        }
    }
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, env: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::And => {
            if !as_bool(&evaluate(left, env)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&evaluate(right, env)?, "&&")?))
        }
        BinaryOp::Or => {
            if as_bool(&evaluate(left, env)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&evaluate(right, env)?, "||")?))
        }
        BinaryOp::Eq => Ok(Value::Bool(equal(&evaluate(left, env)?, &evaluate(right, env)?))),
        BinaryOp::Ne => Ok(Value::Bool(!equal(&evaluate(left, env)?, &evaluate(right, env)?))),
        BinaryOp::In => {
            let needle = evaluate(left, env)?;
            let haystack = evaluate(right, env)?;
            Ok(Value::Bool(contains(&haystack, &needle, "in")?))
        }
    }
}

fn equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value, context: &str) -> Result<bool, ExprError> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|item| equal(item, needle))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::Null, _) => Ok(false),
        _ => Err(ExprError::Type(format!(
            "{context}: cannot search {} for {}",
            type_name(haystack),
            type_name(needle)
        ))),
    }
}

fn as_bool(value: &Value, context: &str) -> Result<bool, ExprError> {
    value.as_bool().ok_or_else(|| {
        ExprError::Type(format!(
            "{context}: expected a boolean operand, got {}",
            type_name(value)
        ))
    })
}

fn call(name: &str, args: &[Value], env: &Value) -> Result<Value, ExprError> {
    match name {
        "header" => header(args, env),
        "lower" => string_fn(name, args, |s| s.to_lowercase()),
        "upper" => string_fn(name, args, |s| s.to_uppercase()),
        "normalizeGit" => string_fn(name, args, urls::normalize_git),
        "normalizeImage" => string_fn(name, args, urls::normalize_image),
        "normalizeChart" => string_fn(name, args, urls::normalize_chart),
        "contains" => {
            let [haystack, needle] = expect_args::<2>(name, args)?;
            Ok(Value::Bool(contains(haystack, needle, name)?))
        }
        "startsWith" => {
            let [s, prefix] = string_args::<2>(name, args)?;
            Ok(Value::Bool(s.starts_with(prefix)))
        }
        "endsWith" => {
            let [s, suffix] = string_args::<2>(name, args)?;
            Ok(Value::Bool(s.ends_with(suffix)))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// `header(name)` reads from `request.headers`; `req.header(name)` reads
/// from the given request object. Lookup is case-insensitive.
fn header(args: &[Value], env: &Value) -> Result<Value, ExprError> {
    static NULL: Value = Value::Null;
    let (request, name) = match args {
        [name] => (env.get("request").unwrap_or(&NULL), name),
        [request, name] => (request, name),
        _ => {
            return Err(ExprError::Call {
                function: "header".into(),
                message: format!("expected 1 or 2 arguments, got {}", args.len()),
            })
        }
    };
    let name = name.as_str().ok_or_else(|| ExprError::Call {
        function: "header".into(),
        message: "header name must be a string".into(),
    })?;
    Ok(request
        .get("headers")
        .and_then(|headers| headers.get(name.to_ascii_lowercase()))
        .cloned()
        .unwrap_or(Value::Null))
}

fn expect_args<'a, const N: usize>(
    name: &str,
    args: &'a [Value],
) -> Result<&'a [Value; N], ExprError> {
    args.try_into().map_err(|_| ExprError::Call {
        function: name.to_string(),
        message: format!("expected {N} argument(s), got {}", args.len()),
    })
}

fn string_args<'a, const N: usize>(name: &str, args: &'a [Value]) -> Result<[&'a str; N], ExprError> {
    let args = expect_args::<N>(name, args)?;
    let mut out = [""; N];
    for (slot, arg) in out.iter_mut().zip(args.iter()) {
        *slot = arg.as_str().ok_or_else(|| ExprError::Call {
            function: name.to_string(),
            message: format!("expected string arguments, got {}", type_name(arg)),
        })?;
    }
    Ok(out)
}

fn string_fn(name: &str, args: &[Value], f: impl Fn(&str) -> String) -> Result<Value, ExprError> {
    let [s] = string_args::<1>(name, args)?;
    Ok(Value::String(f(s)))
}
