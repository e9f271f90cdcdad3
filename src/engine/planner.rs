//! Qualifier planning.
//!
//! Splits the query's qualifiers into filters that can be pushed into the
//! API request and a residual predicate re-applied after fetch. A qualifier
//! on the table's scope column with an exact equality (or in-list) operator
//! narrows the fan-out scope set instead; the match must be exact equality,
//! since over-narrowing silently drops valid rows.

use serde_json::Value;
use std::cmp::Ordering;

use crate::gcp::error::ApiError;
use crate::gcp::scopes::Scope;

use super::schema::{PushedFilter, QualOperator, Qualifier, TableSchema};

/// How the fan-out scope set is restricted by the qualifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeSelection {
    All,
    Only(Vec<String>),
}

/// Output of qualifier planning.
#[derive(Debug, Clone)]
pub struct QualifierPlan {
    pub pushed: Vec<PushedFilter>,
    pub residual: Vec<Qualifier>,
    pub scopes: ScopeSelection,
}

impl QualifierPlan {
    /// Apply scope narrowing to the available scope set. Matching is exact
    /// equality on the project id.
    pub fn select_scopes(&self, available: &[Scope]) -> Vec<Scope> {
        match &self.scopes {
            ScopeSelection::All => available.to_vec(),
            ScopeSelection::Only(ids) => available
                .iter()
                .filter(|s| ids.iter().any(|id| id == &s.project_id))
                .cloned()
                .collect(),
        }
    }
}

/// Plan the given qualifiers against a table schema.
///
/// A qualifier naming an unknown column is a planner-level bug in the host
/// request and aborts the whole query as a malformed request.
pub fn plan(schema: &TableSchema, qualifiers: &[Qualifier]) -> Result<QualifierPlan, ApiError> {
    let mut pushed = Vec::new();
    let mut residual = Vec::new();
    let mut narrowed: Option<Vec<String>> = None;

    for qualifier in qualifiers {
        let Some(column) = schema.column(&qualifier.column) else {
            return Err(ApiError::MalformedRequest(format!(
                "qualifier references unknown column: {}",
                qualifier.column
            )));
        };

        // Scope-dimension qualifiers narrow the fan-out when they are exact.
        if schema.scope_column.as_deref() == Some(qualifier.column.as_str()) {
            match exact_scope_values(qualifier) {
                Some(values) => {
                    narrowed = Some(match narrowed {
                        None => values,
                        Some(previous) => intersect(previous, values),
                    });
                },
                // Non-equality operators on the scope column cannot narrow;
                // the scope column is populated per-row and filtered there.
                None => residual.push(qualifier.clone()),
            }
            continue;
        }

        match (&column.api_param, column.operators.contains(&qualifier.operator)) {
            (Some(param), true) => match stringify_values(qualifier) {
                Some(values) => pushed.push(PushedFilter {
                    param: param.clone(),
                    operator: qualifier.operator,
                    values,
                }),
                None => residual.push(qualifier.clone()),
            },
            _ => residual.push(qualifier.clone()),
        }
    }

    Ok(QualifierPlan {
        pushed,
        residual,
        scopes: narrowed.map_or(ScopeSelection::All, ScopeSelection::Only),
    })
}

/// Scope values for an exact-equality scope qualifier; `None` when the
/// operator or value shape cannot narrow safely.
fn exact_scope_values(qualifier: &Qualifier) -> Option<Vec<String>> {
    match qualifier.operator {
        QualOperator::Equals => qualifier.value.as_str().map(|s| vec![s.to_string()]),
        QualOperator::InList => qualifier.value.as_array().and_then(|values| {
            values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        }),
        _ => None,
    }
}

fn intersect(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    a.into_iter().filter(|v| b.contains(v)).collect()
}

/// Render qualifier values as API parameter strings; `None` for value shapes
/// (objects, nested arrays) that cannot become a request parameter.
fn stringify_values(qualifier: &Qualifier) -> Option<Vec<String>> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    match qualifier.operator {
        QualOperator::InList => qualifier
            .value
            .as_array()?
            .iter()
            .map(scalar)
            .collect::<Option<Vec<_>>>(),
        _ => scalar(&qualifier.value).map(|v| vec![v]),
    }
}

/// Evaluate the residual predicate against an assembled row's values.
pub fn residual_matches(values: &serde_json::Map<String, Value>, residual: &[Qualifier]) -> bool {
    residual.iter().all(|qualifier| {
        let actual = values.get(&qualifier.column).unwrap_or(&Value::Null);
        qualifier_matches(actual, qualifier)
    })
}

/// Evaluate one qualifier against a concrete value.
pub fn qualifier_matches(actual: &Value, qualifier: &Qualifier) -> bool {
    match qualifier.operator {
        QualOperator::Equals => json_eq(actual, &qualifier.value),
        QualOperator::InList => qualifier
            .value
            .as_array()
            .map(|candidates| candidates.iter().any(|v| json_eq(actual, v)))
            .unwrap_or(false),
        QualOperator::GreaterThan => {
            matches!(compare(actual, &qualifier.value), Some(Ordering::Greater))
        },
        QualOperator::GreaterOrEqual => matches!(
            compare(actual, &qualifier.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        QualOperator::LessThan => {
            matches!(compare(actual, &qualifier.value), Some(Ordering::Less))
        },
        QualOperator::LessOrEqual => matches!(
            compare(actual, &qualifier.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// Equality that treats 1 and 1.0 as equal; otherwise serde_json equality.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for numbers (as f64) and strings (lexicographic; RFC 3339
/// timestamps order correctly this way). Mixed or unordered types compare
/// as incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.cmp(y));
    }
    None
}
