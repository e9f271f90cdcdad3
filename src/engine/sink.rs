//! The host-facing output boundary.
//!
//! Query results stream over a bounded mpsc channel as either completed rows
//! or scope-tagged errors. Partial results plus scope errors is the normal
//! outcome of a fan-out query where some projects are inaccessible; the host
//! decides whether to surface that as a warning or a failure.

use serde::Serialize;

use crate::gcp::error::{ApiError, ErrorKind};
use crate::gcp::scopes::Scope;

use super::schema::ResultRow;

/// An error that terminated one scope's orchestration, reported alongside
/// successful rows from sibling scopes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeError {
    pub scope: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ScopeError {
    pub fn new(scope: &Scope, error: &ApiError) -> Self {
        Self {
            scope: scope.project_id.clone(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One element of the outbound result stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOutput {
    Row(ResultRow),
    ScopeError(ScopeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_serialization_shape() {
        let output = QueryOutput::ScopeError(ScopeError {
            scope: "proj-b".into(),
            kind: ErrorKind::Permission,
            message: "permission denied: compute.instances.list".into(),
        });
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["scopeError"]["scope"], "proj-b");
        assert_eq!(json["scopeError"]["kind"], "permission");
    }
}
