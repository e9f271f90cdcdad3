//! Built-in table definitions.
//!
//! Each table binds column definitions to the REST calls that produce them:
//! a List call for the base items and hydrate functions for columns that
//! need a follow-up call. Schemas are registered once at connection setup.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::engine::schema::{PushedFilter, QualOperator, TableRegistry};
use crate::gcp::client::ApiClient;

pub mod compute;
pub mod container;
pub mod storage;

/// Register every built-in table.
pub fn register_all(client: &Arc<ApiClient>, registry: &mut TableRegistry) -> Result<()> {
    registry.register(compute::table(client.clone()))?;
    registry.register(storage::table(client.clone()))?;
    registry.register(container::table(client.clone()))?;
    Ok(())
}

/// Extract the standard continuation token from a list response.
pub(crate) fn next_page_token(response: &Value) -> Option<String> {
    response
        .get("nextPageToken")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Render pushed filters as a Compute Engine `filter` expression,
/// e.g. `(status = "RUNNING") AND ((name = "a") OR (name = "b"))`.
pub(crate) fn filter_expression(filters: &[PushedFilter]) -> Option<String> {
    fn clause(filter: &PushedFilter) -> Option<String> {
        let comparator = match filter.operator {
            QualOperator::Equals => "=",
            QualOperator::GreaterThan => ">",
            QualOperator::GreaterOrEqual => ">=",
            QualOperator::LessThan => "<",
            QualOperator::LessOrEqual => "<=",
            QualOperator::InList => {
                let alternatives: Vec<String> = filter
                    .values
                    .iter()
                    .map(|v| format!("({} = \"{}\")", filter.param, v))
                    .collect();
                return (!alternatives.is_empty()).then(|| {
                    if alternatives.len() == 1 {
                        alternatives[0].clone()
                    } else {
                        format!("({})", alternatives.join(" OR "))
                    }
                });
            },
        };
        filter
            .values
            .first()
            .map(|v| format!("({} {} \"{}\")", filter.param, comparator, v))
    }

    let clauses: Vec<String> = filters.iter().filter_map(clause).collect();
    (!clauses.is_empty()).then(|| clauses.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_expression_equality_and_in_list() {
        let filters = vec![
            PushedFilter {
                param: "status".into(),
                operator: QualOperator::Equals,
                values: vec!["RUNNING".into()],
            },
            PushedFilter {
                param: "name".into(),
                operator: QualOperator::InList,
                values: vec!["a".into(), "b".into()],
            },
        ];
        assert_eq!(
            filter_expression(&filters).unwrap(),
            r#"(status = "RUNNING") AND ((name = "a") OR (name = "b"))"#
        );
    }

    #[test]
    fn test_filter_expression_empty() {
        assert_eq!(filter_expression(&[]), None);
    }
}
