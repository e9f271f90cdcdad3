//! Table hydration and query execution engine.
//!
//! Given a table schema, a set of requested columns and a set of predicate
//! qualifiers, this layer decides which API calls to issue, deduplicates
//! calls shared across columns, fans the work out over every accessible
//! scope and streams completed rows back incrementally.
//!
//! # Architecture
//!
//! - [`schema`] - Table/column definitions, the query data model and the
//!   list/hydrate function registry
//! - [`planner`] - Splits qualifiers into API pushdown filters and a
//!   residual predicate; narrows the fan-out on exact scope qualifiers
//! - [`cache`] - Query-scoped singleflight memoization of hydrate calls
//! - [`orchestrator`] - Per-scope pagination, hydration worker pool and
//!   retry policy
//! - [`fanout`] - Scope-level concurrency, row limits, cancellation and the
//!   [`Engine`] entry point
//! - [`sink`] - Row/error output stream consumed by the host

pub mod cache;
pub mod fanout;
pub mod orchestrator;
pub mod planner;
pub mod schema;
pub mod sink;

pub use fanout::{CancelSignal, Engine, QueryExecution, RowBudget};
pub use planner::{QualifierPlan, ScopeSelection};
pub use schema::{
    ColumnDef, ColumnType, HydrateFn, HydrateRequest, ListFn, ListPage, ListRequest, PushedFilter,
    QualOperator, Qualifier, QueryRequest, ResultRow, TableRegistry, TableSchema, Transform,
};
pub use sink::{QueryOutput, ScopeError};
