//! Condition evaluation for SWITCH nodes.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;

use crate::dag_flow::reference::Reference;
use crate::dag_flow::store::ArtifactStore;

#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &str, store: &ArtifactStore) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComparisonOperator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl ComparisonOperator {
    const ALL: [(&'static str, ComparisonOperator); 6] = [
        ("==", ComparisonOperator::Eq),
        ("!=", ComparisonOperator::Ne),
        (">=", ComparisonOperator::Ge),
        ("<=", ComparisonOperator::Le),
        (">", ComparisonOperator::Gt),
        ("<", ComparisonOperator::Lt),
    ];
}

/// Default evaluator.
///
/// Accepted forms:
/// - `true` / `false`
/// - `<reference>`: truthiness of the referenced artifact
/// - `!<reference>`: negated truthiness
/// - `<reference> <op> <json literal>` with `== != > < >= <=`
///
/// A reference that does not resolve is treated as `null`.
pub struct ExpressionEvaluator;

#[async_trait]
impl ConditionEvaluator for ExpressionEvaluator {
    async fn evaluate(&self, expression: &str, store: &ArtifactStore) -> anyhow::Result<bool> {
        evaluate_expression(expression, store)
    }
}

pub fn evaluate_expression(expression: &str, store: &ArtifactStore) -> anyhow::Result<bool> {
    let expression = expression.trim();
    match expression {
        "true" => return Ok(true),
        "false" => return Ok(false),
        "" => anyhow::bail!("Empty condition"),
        _ => {}
    }

    if let Some((index, symbol, operator)) = split_point(expression) {
        let left = expression[..index].trim();
        let right = expression[index + symbol.len()..].trim();
        let actual = lookup(left, store)?;
        let expected = parse_literal(right);
        return Ok(compare(&actual, operator, &expected));
    }

    if let Some(negated) = expression.strip_prefix('!') {
        return Ok(!is_truthy(&lookup(negated.trim(), store)?));
    }

    Ok(is_truthy(&lookup(expression, store)?))
}

/// Leftmost operator in `expression`; at equal offsets the two-character
/// operator wins. Operators inside the right-hand literal are never reached.
fn split_point(expression: &str) -> Option<(usize, &'static str, ComparisonOperator)> {
    ComparisonOperator::ALL
        .iter()
        .filter_map(|&(symbol, operator)| {
            expression.find(symbol).map(|index| (index, symbol, operator))
        })
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))
}

fn lookup(reference: &str, store: &ArtifactStore) -> anyhow::Result<Value> {
    let reference = Reference::parse(reference)?;
    Ok(reference.resolve(store).unwrap_or(Value::Null))
}

/// JSON literal if it parses, bare word as a string otherwise.
fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn compare(actual: &Value, operator: ComparisonOperator, expected: &Value) -> bool {
    match operator {
        ComparisonOperator::Eq => values_equal(actual, expected),
        ComparisonOperator::Ne => !values_equal(actual, expected),
        ComparisonOperator::Gt => matches!(order(actual, expected), Some(Ordering::Greater)),
        ComparisonOperator::Lt => matches!(order(actual, expected), Some(Ordering::Less)),
        ComparisonOperator::Ge => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ComparisonOperator::Le => {
            matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal))
        }
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn order(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => actual.as_f64()?.partial_cmp(&expected.as_f64()?),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
