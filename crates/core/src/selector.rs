//! Label selector helpers: render a `LabelSelector` as a list query string and
//! evaluate it against a label map without a round-trip to the API server.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("unknown selector operator {op:?} for key {key}")]
    UnknownOperator { key: String, op: String },
    #[error("operator {op} on key {key} requires values")]
    MissingValues { key: String, op: String },
    #[error("operator {op} on key {key} must not carry values")]
    UnexpectedValues { key: String, op: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op { In, NotIn, Exists, DoesNotExist }

fn parse_req(req: &LabelSelectorRequirement) -> Result<(Op, &[String]), SelectorError> {
    let values = req.values.as_deref().unwrap_or(&[]);
    let op = match req.operator.as_str() {
        "In" => Op::In,
        "NotIn" => Op::NotIn,
        "Exists" => Op::Exists,
        "DoesNotExist" => Op::DoesNotExist,
        other => return Err(SelectorError::UnknownOperator { key: req.key.clone(), op: other.to_string() }),
    };
    match op {
        Op::In | Op::NotIn if values.is_empty() => {
            Err(SelectorError::MissingValues { key: req.key.clone(), op: req.operator.clone() })
        }
        Op::Exists | Op::DoesNotExist if !values.is_empty() => {
            Err(SelectorError::UnexpectedValues { key: req.key.clone(), op: req.operator.clone() })
        }
        _ => Ok((op, values)),
    }
}

/// Render as `labelSelector` query syntax. An empty selector renders as `""` (everything).
pub fn to_query(sel: &LabelSelector) -> Result<String, SelectorError> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(ml) = &sel.match_labels {
        for (k, v) in ml {
            parts.push(format!("{}={}", k, v));
        }
    }
    for req in sel.match_expressions.iter().flatten() {
        let (op, values) = parse_req(req)?;
        parts.push(match op {
            Op::In => format!("{} in ({})", req.key, values.join(",")),
            Op::NotIn => format!("{} notin ({})", req.key, values.join(",")),
            Op::Exists => req.key.clone(),
            Op::DoesNotExist => format!("!{}", req.key),
        });
    }
    Ok(parts.join(","))
}

/// True when `labels` satisfy every term of `sel`.
pub fn matches(sel: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool, SelectorError> {
    if let Some(ml) = &sel.match_labels {
        if ml.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }
    for req in sel.match_expressions.iter().flatten() {
        let (op, values) = parse_req(req)?;
        let got = labels.get(&req.key);
        let ok = match op {
            Op::In => got.map(|v| values.contains(v)).unwrap_or(false),
            Op::NotIn => got.map(|v| !values.contains(v)).unwrap_or(true),
            Op::Exists => got.is_some(),
            Op::DoesNotExist => got.is_none(),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}
