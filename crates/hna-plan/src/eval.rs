use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;

use hna_core::deployment::Deployment;
use hna_core::errors::Error;
use hna_core::instance::Instance;
use hna_core::service::{Service, Unit};

/// Flat telemetry document a statement condition evaluates over.
pub type EvalData = BTreeMap<String, Value>;

/// Assemble the telemetry document for one deployment.
pub fn build_eval_data(
    service: &Service,
    unit: &Unit,
    instance: &Instance,
    deployment: &Deployment,
) -> EvalData {
    let mut data = EvalData::new();

    data.insert("service.name".to_string(), Value::from(service.name.clone()));
    data.insert("unit.name".to_string(), Value::from(unit.name.clone()));

    data.insert(
        "instance.state".to_string(),
        Value::from(instance.state.to_string()),
    );
    data.insert(
        "instance.processors".to_string(),
        Value::from(instance.processors),
    );
    data.insert("instance.memory".to_string(), Value::from(instance.memory));
    data.insert(
        "instance.public_ip".to_string(),
        Value::from(instance.public_ip().unwrap_or("")),
    );
    data.insert(
        "instance.private_ip".to_string(),
        Value::from(instance.private_ip().unwrap_or("")),
    );

    data.insert(
        "deployment.state".to_string(),
        Value::from(
            serde_json::to_value(deployment.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        ),
    );

    data
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn parse_op(token: &str) -> Option<Op> {
    match token {
        "==" => Some(Op::Eq),
        "!=" => Some(Op::Ne),
        "<" => Some(Op::Lt),
        ">" => Some(Op::Gt),
        "<=" => Some(Op::Le),
        ">=" => Some(Op::Ge),
        _ => None,
    }
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}

fn compare(field: &str, op: Op, actual: &Value, expected: &str) -> Result<bool> {
    match op {
        Op::Eq | Op::Ne => {
            let actual_text = match actual {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let equal = actual_text == expected;
            Ok(if op == Op::Eq { equal } else { !equal })
        }
        _ => {
            let actual_num = actual.as_f64().ok_or_else(|| {
                Error::Parse(format!("eval: Field '{}' is not numeric", field))
            })?;
            let expected_num: f64 = expected.parse().map_err(|_| {
                Error::Parse(format!("eval: Value '{}' is not numeric", expected))
            })?;
            Ok(match op {
                Op::Lt => actual_num < expected_num,
                Op::Gt => actual_num > expected_num,
                Op::Le => actual_num <= expected_num,
                Op::Ge => actual_num >= expected_num,
                _ => unreachable!(),
            })
        }
    }
}

/// Evaluate a condition over the telemetry document.
///
/// Grammar: `<field> <op> <value>` clauses joined by `and`. A missing
/// field fails the clause rather than erroring, so statements written
/// against richer telemetry degrade to inert.
pub fn eval(data: &EvalData, condition: &str) -> Result<bool> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Err(Error::Parse("eval: Empty statement".to_string()).into());
    }

    for clause in condition.split(" and ") {
        let tokens: Vec<&str> = clause.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(
                Error::Parse(format!("eval: Invalid clause '{}'", clause.trim())).into(),
            );
        }

        let field = tokens[0];
        let op = parse_op(tokens[1]).ok_or_else(|| {
            Error::Parse(format!("eval: Unknown operator '{}'", tokens[1]))
        })?;
        let expected = unquote(tokens[2]);

        let Some(actual) = data.get(field) else {
            return Ok(false);
        };

        if !compare(field, op, actual, expected)? {
            return Ok(false);
        }
    }

    Ok(true)
}
