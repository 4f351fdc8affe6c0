//! Expression evaluator over the workflow scope
//!
//! Values are `serde_json::Value`. Missing references degrade to an
//! empty-string leaf rather than erroring; only type-level misuse of a
//! built-in surfaces as an `ExprError`.

use serde_json::Value;

use super::ExprError;
use super::parser::{BinaryOp, Expr, UnaryOp};

/// Evaluate a parsed expression against the scope object
pub fn eval(expr: &Expr, scope: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Num(n) => Ok(number(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),

        Expr::Ident(name) => Ok(resolve_root(name, scope)),

        Expr::Field(base, name) => {
            let base = eval(base, scope)?;
            Ok(base.get(name).cloned().unwrap_or_else(empty_leaf))
        }

        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            let value = match (&base, &index) {
                (Value::Array(items), idx) => {
                    let i = to_number(idx) as i64;
                    if i >= 0 {
                        items.get(i as usize).cloned()
                    } else {
                        None
                    }
                }
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                _ => None,
            };
            Ok(value.unwrap_or_else(empty_leaf))
        }

        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, scope)?);
            }
            call_builtin(name, &values)
        }

        Expr::Unary(op, operand) => {
            let value = eval(operand, scope)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!truthy(&value)),
                UnaryOp::Neg => number(-to_number(&value)),
            })
        }

        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, scope),

        Expr::Ternary(cond, then_branch, else_branch) => {
            if truthy(&eval(cond, scope)?) {
                eval(then_branch, scope)
            } else {
                eval(else_branch, scope)
            }
        }
    }
}

/// Resolve a root identifier: scope key first, then `variables.<name>`,
/// then the empty-string leaf
fn resolve_root(name: &str, scope: &Value) -> Value {
    if let Some(value) = scope.get(name) {
        return value.clone();
    }
    if let Some(value) = scope.get("variables").and_then(|v| v.get(name)) {
        return value.clone();
    }
    empty_leaf()
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, scope: &Value) -> Result<Value, ExprError> {
    // Short-circuit the logical operators
    match op {
        BinaryOp::And => {
            let left = eval(lhs, scope)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthy(&eval(rhs, scope)?)));
        }
        BinaryOp::Or => {
            let left = eval(lhs, scope)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthy(&eval(rhs, scope)?)));
        }
        _ => {}
    }

    let left = eval(lhs, scope)?;
    let right = eval(rhs, scope)?;

    Ok(match op {
        BinaryOp::Add => {
            if left.is_string() || right.is_string() {
                Value::String(format!("{}{}", to_display(&left), to_display(&right)))
            } else {
                number(to_number(&left) + to_number(&right))
            }
        }
        BinaryOp::Sub => number(to_number(&left) - to_number(&right)),
        BinaryOp::Mul => number(to_number(&left) * to_number(&right)),
        BinaryOp::Div => {
            let divisor = to_number(&right);
            if divisor == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            number(to_number(&left) / divisor)
        }
        BinaryOp::Mod => {
            let divisor = to_number(&right);
            if divisor == 0.0 {
                return Err(ExprError::Eval("modulo by zero".to_string()));
            }
            number(to_number(&left) % divisor)
        }
        BinaryOp::Eq => Value::Bool(loose_eq(&left, &right)),
        BinaryOp::Ne => Value::Bool(!loose_eq(&left, &right)),
        BinaryOp::Lt => Value::Bool(compare(&left, &right) == std::cmp::Ordering::Less),
        BinaryOp::Le => Value::Bool(compare(&left, &right) != std::cmp::Ordering::Greater),
        BinaryOp::Gt => Value::Bool(compare(&left, &right) == std::cmp::Ordering::Greater),
        BinaryOp::Ge => Value::Bool(compare(&left, &right) != std::cmp::Ordering::Less),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    })
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let arity = |expected: usize| -> Result<(), ExprError> {
        if args.len() != expected {
            return Err(ExprError::Arity {
                name: name.to_string(),
                expected,
                got: args.len(),
            });
        }
        Ok(())
    };

    match name {
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => 0,
            };
            Ok(number(n as f64))
        }
        "has" => {
            arity(2)?;
            let key = to_display(&args[1]);
            let found = match &args[0] {
                Value::Object(map) => map.contains_key(&key),
                Value::Array(items) => items.iter().any(|v| loose_eq(v, &args[1])),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "get" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(ExprError::Arity {
                    name: name.to_string(),
                    expected: 2,
                    got: args.len(),
                });
            }
            let fallback = args.get(2).cloned().unwrap_or_else(empty_leaf);
            let value = match &args[0] {
                Value::Object(map) => map.get(&to_display(&args[1])).cloned(),
                Value::Array(items) => {
                    let i = to_number(&args[1]) as i64;
                    if i >= 0 { items.get(i as usize).cloned() } else { None }
                }
                _ => None,
            };
            Ok(value.unwrap_or(fallback))
        }
        "str" => {
            arity(1)?;
            Ok(Value::String(to_display(&args[0])))
        }
        "num" => {
            arity(1)?;
            Ok(number(to_number(&args[0])))
        }
        "bool" => {
            arity(1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "now" => {
            arity(0)?;
            Ok(number(chrono::Utc::now().timestamp_millis() as f64))
        }
        "floor" => {
            arity(1)?;
            Ok(number(to_number(&args[0]).floor()))
        }
        "ceil" => {
            arity(1)?;
            Ok(number(to_number(&args[0]).ceil()))
        }
        "round" => {
            arity(1)?;
            Ok(number(to_number(&args[0]).round()))
        }
        "abs" => {
            arity(1)?;
            Ok(number(to_number(&args[0]).abs()))
        }
        "min" => fold_numeric(name, args, f64::min),
        "max" => fold_numeric(name, args, f64::max),
        "includes" => {
            arity(2)?;
            let found = match &args[0] {
                Value::String(s) => s.contains(&to_display(&args[1])),
                Value::Array(items) => items.iter().any(|v| loose_eq(v, &args[1])),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "startsWith" => {
            arity(2)?;
            Ok(Value::Bool(
                to_display(&args[0]).starts_with(&to_display(&args[1])),
            ))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::String(to_display(&args[0]).to_lowercase()))
        }
        "upper" => {
            arity(1)?;
            Ok(Value::String(to_display(&args[0]).to_uppercase()))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn fold_numeric(name: &str, args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    if args.is_empty() {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: 1,
            got: 0,
        });
    }
    let mut acc = to_number(&args[0]);
    for arg in &args[1..] {
        acc = f(acc, to_number(arg));
    }
    Ok(number(acc))
}

/// The degraded leaf for anything missing
fn empty_leaf() -> Value {
    Value::String(String::new())
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Truthiness: null, false, 0, and "" are false; collections are true
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Loose equality with numeric cross-coercion for number/string pairs
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            to_number(left) == to_number(right)
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> std::cmp::Ordering {
    match (left, right) {
        (Value::String(a), Value::String(b)) => {
            // Compare numerically when both sides look numeric
            match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                _ => a.cmp(b),
            }
        }
        _ => to_number(left)
            .partial_cmp(&to_number(right))
            .unwrap_or(std::cmp::Ordering::Equal),
    }
}
