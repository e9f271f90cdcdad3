//! Table schemas and the query data model.
//!
//! A [`TableSchema`] binds column definitions to a List function and zero or
//! more Hydrate functions. List/hydrate dispatch is by function values
//! registered on the schema and resolved when the table is registered, so a
//! mock table for tests is just a schema whose closures never touch the
//! network.

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::gcp::error::ApiError;
use crate::gcp::scopes::Scope;

/// Semantic column type; values are coerced on row assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Int,
    Bool,
    Timestamp,
    Json,
    StringArray,
}

impl ColumnType {
    /// Coerce a raw JSON value into this column type. Values that cannot be
    /// represented become null rather than failing the row.
    pub fn coerce(&self, value: Value) -> Value {
        match self {
            ColumnType::String => match value {
                Value::String(_) | Value::Null => value,
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                _ => Value::Null,
            },
            ColumnType::Int => match &value {
                Value::Number(n) if n.is_i64() || n.is_u64() => value,
                // GCP encodes many 64-bit counters as decimal strings
                Value::String(s) => s
                    .parse::<i64>()
                    .map(|n| Value::Number(n.into()))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            ColumnType::Bool => match &value {
                Value::Bool(_) => value,
                Value::String(s) => match s.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            ColumnType::Timestamp => match &value {
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|ts| Value::String(ts.to_rfc3339()))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            ColumnType::Json => value,
            ColumnType::StringArray => match value {
                Value::Array(_) | Value::Null => value,
                _ => Value::Null,
            },
        }
    }
}

/// Value transform applied after JSON-path extraction, before type coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    None,
    /// Reduce a GCP resource URL to its trailing path segment,
    /// e.g. ".../zones/us-central1-a" -> "us-central1-a"
    LastPathSegment,
    /// Replace an array with its element count.
    Count,
}

impl Transform {
    pub fn apply(&self, value: Value) -> Value {
        match self {
            Transform::None => value,
            Transform::LastPathSegment => match value {
                Value::String(s) => {
                    let short = s.rsplit('/').next().unwrap_or(&s).to_string();
                    Value::String(short)
                },
                other => other,
            },
            Transform::Count => match value {
                Value::Array(arr) => Value::Number(arr.len().into()),
                Value::Null => Value::Null,
                _ => Value::Null,
            },
        }
    }
}

/// Qualifier operators a column may declare as pushable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualOperator {
    Equals,
    InList,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

/// One predicate qualifier supplied by the host query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Qualifier {
    pub column: String,
    pub operator: QualOperator,
    pub value: Value,
}

/// Column definition within a table schema.
#[derive(Clone)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    /// Dot path into the listed item (or the hydrate result, when
    /// `hydrate` is set). Empty path means the whole value.
    pub json_path: String,
    /// Name of the hydrate function producing this column's source value.
    pub hydrate: Option<String>,
    pub transform: Transform,
    /// API parameter this column's qualifiers can be pushed into.
    pub api_param: Option<String>,
    /// Operators supported by the pushdown parameter.
    pub operators: Vec<QualOperator>,
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType, json_path: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            json_path: json_path.to_string(),
            hydrate: None,
            transform: Transform::None,
            api_param: None,
            operators: Vec::new(),
        }
    }

    /// Declare this column pushable into an API request parameter.
    pub fn pushdown(mut self, param: &str, operators: &[QualOperator]) -> Self {
        self.api_param = Some(param.to_string());
        self.operators = operators.to_vec();
        self
    }

    /// Source this column from a registered hydrate function.
    pub fn hydrated_by(mut self, func: &str) -> Self {
        self.hydrate = Some(func.to_string());
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

/// A qualifier filter pushed into the API request.
#[derive(Debug, Clone)]
pub struct PushedFilter {
    pub param: String,
    pub operator: QualOperator,
    pub values: Vec<String>,
}

/// One page request against a table's List endpoint.
#[derive(Clone)]
pub struct ListRequest {
    pub scope: Scope,
    pub filters: Vec<PushedFilter>,
    pub page_token: Option<String>,
    pub page_size: Option<u32>,
}

/// One page of listed items plus the continuation token, if any.
pub struct ListPage {
    pub items: Vec<Value>,
    pub next_token: Option<String>,
}

/// Input to a hydrate function: the listed item and the scope it came from.
pub struct HydrateRequest {
    pub scope: Scope,
    pub item: Value,
}

pub type ListFn =
    Arc<dyn Fn(ListRequest) -> BoxFuture<'static, Result<ListPage, ApiError>> + Send + Sync>;

pub type HydrateFn =
    Arc<dyn Fn(HydrateRequest) -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

/// Immutable table definition. Built by the table modules, validated and
/// frozen on registration.
#[derive(Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Column bound to the scope dimension; an exact equality qualifier on it
    /// narrows the fan-out instead of filtering rows.
    pub scope_column: Option<String>,
    /// Dot path identifying a listed item, used to key hydration dedup.
    pub key_path: String,
    pub list: ListFn,
    pub hydrators: HashMap<String, HydrateFn>,
    /// Whether a NotFound on List means "zero rows" (e.g. API not enabled in
    /// the project) rather than a scope error.
    pub not_found_as_empty: bool,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<ColumnDef>, list: ListFn) -> Self {
        Self {
            name: name.to_string(),
            columns,
            scope_column: None,
            key_path: "name".to_string(),
            list,
            hydrators: HashMap::new(),
            not_found_as_empty: false,
        }
    }

    pub fn scope_column(mut self, column: &str) -> Self {
        self.scope_column = Some(column.to_string());
        self
    }

    pub fn key_path(mut self, path: &str) -> Self {
        self.key_path = path.to_string();
        self
    }

    pub fn with_hydrator(mut self, name: &str, func: HydrateFn) -> Self {
        self.hydrators.insert(name.to_string(), func);
        self
    }

    pub fn not_found_as_empty(mut self, value: bool) -> Self {
        self.not_found_as_empty = value;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Key identifying one listed item within a scope. Falls back to the
    /// serialized item when the key path is absent, which still dedups
    /// correctly (identical items share hydration).
    pub fn item_key(&self, item: &Value) -> String {
        match json_path(item, &self.key_path) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => item.to_string(),
        }
    }
}

/// Registry mapping table names to schemas; populated at connection setup,
/// immutable afterwards.
#[derive(Default)]
pub struct TableRegistry {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table, validating that every column's hydrate reference
    /// resolves and the scope column exists.
    pub fn register(&mut self, schema: TableSchema) -> Result<()> {
        for column in &schema.columns {
            if let Some(func) = &column.hydrate {
                if !schema.hydrators.contains_key(func) {
                    bail!(
                        "table {}: column {} references unknown hydrate function {}",
                        schema.name,
                        column.name,
                        func
                    );
                }
            }
        }
        if let Some(scope_col) = &schema.scope_column {
            if schema.column(scope_col).is_none() {
                bail!(
                    "table {}: scope column {} is not defined",
                    schema.name,
                    scope_col
                );
            }
        }
        if self.tables.contains_key(&schema.name) {
            bail!("table {} registered twice", schema.name);
        }
        tracing::debug!("Registered table {}", schema.name);
        self.tables.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }
}

/// Incoming table query from the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub table: String,
    /// Requested columns; empty means all columns.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub qualifiers: Vec<Qualifier>,
    /// Explicit scope selection, bypassing the connection's scope catalog.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Row-limit hint; the engine stops fetching once satisfied.
    #[serde(default)]
    pub limit: Option<u64>,
}

/// One completed row. Ownership transfers to the sink on emission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub scope: String,
    pub values: serde_json::Map<String, Value>,
}

/// Extract a value from JSON using a dot-notation path. Numeric segments
/// index into arrays. An empty path yields the value itself.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for part in path.split('.') {
        current = if let Ok(idx) = part.parse::<usize>() {
            current.get(idx)?
        } else {
            current.get(part)?
        };
    }
    Some(current)
}
