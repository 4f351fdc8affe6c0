//! Safe expression language for edge conditions and script nodes
//!
//! Side-effect-free arithmetic, comparison, logic, and conditionals over
//! the workflow scope. Planner-authored conditions often arrive in
//! JS-flavored syntax; [`preprocess`] normalizes the sugar before lexing.

pub mod eval;
pub mod lexer;
pub mod parser;

use serde_json::Value;
use thiserror::Error;

pub use eval::truthy;
pub use parser::Expr;

/// Errors from the expression pipeline
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("lex error at {pos}: {message}")]
    Lex { pos: usize, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("eval error: {0}")]
    Eval(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Normalize JS-like sugar into the native syntax
///
/// `&&`/`||`/`!` become `and`/`or`/`not`, `obj['some key']` becomes a
/// dotted access with a sanitized key, method-style `includes`/`startsWith`
/// become builtin calls, and `Date.now()` becomes `now()`.
pub fn preprocess(input: &str) -> String {
    let mut out = replace_operators_outside_strings(input);

    out = out.replace("Date.now()", "now()");

    // obj['some key'] / obj["some key"] -> obj.some_key
    let bracket = regex::Regex::new(r#"\[\s*['"]([^'"\]]+)['"]\s*\]"#).expect("static regex");
    out = bracket
        .replace_all(&out, |caps: &regex::Captures| {
            let key: String = caps[1]
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '_' })
                .collect();
            format!(".{}", key)
        })
        .to_string();

    // receiver.includes(x) -> includes(receiver, x); same for startsWith
    let method = regex::Regex::new(r"([A-Za-z_][A-Za-z0-9_.]*)\.(includes|startsWith)\(").expect("static regex");
    out = method.replace_all(&out, "$2($1, ").to_string();

    out
}

/// Replace `&&`, `||`, `===`, `!==`, and prefix `!` outside string literals
fn replace_operators_outside_strings(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];

        if let Some(quote) = in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' => {
                in_string = Some(c);
                out.push(c);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                out.push_str(" and ");
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                out.push_str(" or ");
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') => {
                out.push_str("==");
                i += 3;
            }
            '!' if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') => {
                out.push_str("!=");
                i += 3;
            }
            '!' if chars.get(i + 1) != Some(&'=') => {
                out.push_str(" not ");
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Parse and evaluate an expression against a scope
pub fn evaluate(input: &str, scope: &Value) -> Result<Value, ExprError> {
    let normalized = preprocess(input);
    let tokens = lexer::tokenize(&normalized)?;
    let ast = parser::parse(&tokens)?;
    eval::eval(&ast, scope)
}

/// Evaluate a condition; empty or blank expressions are `true`
pub fn evaluate_condition(input: &str, scope: &Value) -> Result<bool, ExprError> {
    if input.trim().is_empty() {
        return Ok(true);
    }
    Ok(truthy(&evaluate(input, scope)?))
}

/// Check that an expression parses without evaluating it
pub fn parse_check(input: &str) -> Result<(), ExprError> {
    if input.trim().is_empty() {
        return Ok(());
    }
    let normalized = preprocess(input);
    let tokens = lexer::tokenize(&normalized)?;
    parser::parse(&tokens)?;
    Ok(())
}
