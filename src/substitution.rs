//! Runtime argument substitution.
//!
//! Command arguments of the form `{{inspect['Key'][0].field}}` are rewritten
//! from the inspection record of a container or image before dispatch.  The
//! expression language is a restricted attribute/index path over the
//! inspection JSON, not a general evaluator; the only call-like form allowed
//! is a terminal `.keys()`.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::errors::{Error, Result};
use crate::models::ContainerName;
use crate::services::ContainerRuntime;

/// One step of a substitution expression.
#[derive(Clone, Debug, PartialEq)]
pub enum PathOp {
    /// `.name` — key lookup on an object.
    Field(String),
    /// `['name']` or `[0]` — key or position lookup.
    Index(Index),
    /// `.keys()` — the keys of an object, as a list.  Terminal.
    Keys,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Index {
    Key(String),
    Position(usize),
}

/// What the expression is evaluated against.
#[derive(Clone, Debug, PartialEq)]
pub enum InspectTarget {
    /// The container the lifecycle operates on.
    SelfContainer,
    Container(String),
    Image(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgTemplate {
    pub path: Vec<PathOp>,
    pub target: InspectTarget,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\{\{(?P<expr>.*)\}\}(?:\((?P<target>[^)]*)\))?$").unwrap()
    })
}

/// Parses one argument token.  Returns `None` for tokens that do not match
/// the substitution grammar; those pass through unchanged.
pub fn parse_token(token: &str) -> Result<Option<ArgTemplate>> {
    let captures = match token_pattern().captures(token.trim()) {
        Some(captures) => captures,
        None => return Ok(None),
    };

    let target = match captures.name("target").map(|m| m.as_str()) {
        None | Some("") => InspectTarget::SelfContainer,
        Some(reference) => match reference.strip_prefix("image://") {
            Some(image) => InspectTarget::Image(image.to_string()),
            None => InspectTarget::Container(reference.to_string()),
        },
    };

    let path = parse_path(&captures["expr"])?;
    Ok(Some(ArgTemplate { path, target }))
}

fn invalid(expr: &str, reason: &str) -> Error {
    Error::InvalidConfiguration(format!(
        "invalid substitution expression {:?}: {}",
        expr, reason
    ))
}

fn parse_path(expr: &str) -> Result<Vec<PathOp>> {
    let mut rest = expr
        .trim()
        .strip_prefix("inspect")
        .ok_or_else(|| invalid(expr, "expressions must start with 'inspect'"))?;

    let mut ops = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after
                .find(']')
                .ok_or_else(|| invalid(expr, "unterminated index"))?;
            let inner = after[..end].trim();
            let op = if (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
                || (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
            {
                PathOp::Index(Index::Key(inner[1..inner.len() - 1].to_string()))
            } else {
                let position = inner
                    .parse::<usize>()
                    .map_err(|_| invalid(expr, "indices must be quoted keys or integers"))?;
                PathOp::Index(Index::Position(position))
            };
            ops.push(op);
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix('.') {
            let len = after
                .find(|c: char| !c.is_alphanumeric() && c != '_')
                .unwrap_or_else(|| after.len());
            if len == 0 {
                return Err(invalid(expr, "expected a field name after '.'"));
            }
            let name = &after[..len];
            let tail = &after[len..];
            if let Some(tail) = tail.strip_prefix("()") {
                if name != "keys" {
                    return Err(invalid(expr, "only the keys() accessor is supported"));
                }
                if !tail.is_empty() {
                    return Err(invalid(expr, "keys() must be the final step"));
                }
                ops.push(PathOp::Keys);
                rest = tail;
            } else {
                ops.push(PathOp::Field(name.to_string()));
                rest = tail;
            }
        } else {
            return Err(invalid(expr, "expected '.' or '[' in path"));
        }
    }

    Ok(ops)
}

/// Walks a parsed path over an inspection record.
pub fn eval_path(path: &[PathOp], root: &Value) -> Result<Value> {
    let mut current = root;
    for op in path {
        match op {
            PathOp::Field(name) | PathOp::Index(Index::Key(name)) => {
                current = current.get(name).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "inspection record has no entry {:?}",
                        name
                    ))
                })?;
            }
            PathOp::Index(Index::Position(position)) => {
                current = current.get(position).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "inspection record has no element {}",
                        position
                    ))
                })?;
            }
            PathOp::Keys => {
                let object = current.as_object().ok_or_else(|| {
                    Error::InvalidConfiguration("keys() applied to a non-object".to_string())
                })?;
                return Ok(Value::Array(
                    object.keys().cloned().map(Value::String).collect(),
                ));
            }
        }
    }
    Ok(current.clone())
}

fn scalar_string(value: Value) -> String {
    match value {
        Value::String(string) => string,
        other => other.to_string(),
    }
}

/// Rewrites argument tokens against live inspection results.
///
/// Sequence results are spliced into the output in place of their token, so
/// the output length is the sum of the expansion lengths of the inputs.
/// Tokens that do not match the grammar pass through unchanged.
pub fn substitute_runtime_args(
    runtime: &mut dyn ContainerRuntime,
    own_name: &ContainerName,
    args: &[String],
) -> Result<Vec<String>> {
    let mut substituted = Vec::with_capacity(args.len());

    for arg in args {
        let template = match parse_token(arg)? {
            Some(template) => template,
            None => {
                substituted.push(arg.clone());
                continue;
            }
        };

        let record = match &template.target {
            InspectTarget::SelfContainer => runtime.inspect_container(own_name.as_str())?,
            InspectTarget::Container(name) => runtime.inspect_container(name)?,
            InspectTarget::Image(name) => runtime.inspect_image(name)?,
        };

        match eval_path(&template.path, &record)? {
            Value::Array(items) => substituted.extend(items.into_iter().map(scalar_string)),
            value => substituted.push(scalar_string(value)),
        }
    }

    Ok(substituted)
}
