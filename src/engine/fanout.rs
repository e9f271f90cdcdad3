//! Scope fan-out control and the engine entry point.
//!
//! Multiplies one table query across the resolved scope set, running each
//! scope's orchestration concurrently under a scope-level ceiling while a
//! global in-flight call semaphore keeps the combined listing and hydration
//! traffic inside provider quota. A satisfied row limit or an explicit
//! cancel propagates to every scope; rows already emitted are unaffected.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::gcp::error::{ApiError, ErrorKind};
use crate::gcp::scopes::{Scope, ScopeCatalog};

use super::cache::HydrationCache;
use super::orchestrator::{run_scope, RetryPolicy, ScopeContext};
use super::planner;
use super::schema::{QueryRequest, TableRegistry};
use super::sink::QueryOutput;

/// Capacity of the outbound row channel; bounds how far fetching can run
/// ahead of a slow host.
const SINK_CAPACITY: usize = 64;

/// Broadcast cancellation flag shared by every task of one query.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Global row budget shared across scopes. Claims are atomic, so exactly
/// `limit` rows win emission even when hydrations complete concurrently.
pub struct RowBudget {
    remaining: AtomicI64,
    limited: bool,
}

impl RowBudget {
    pub fn new(limit: Option<u64>) -> Self {
        match limit {
            Some(n) => Self {
                remaining: AtomicI64::new(n.min(i64::MAX as u64) as i64),
                limited: true,
            },
            None => Self {
                remaining: AtomicI64::new(0),
                limited: false,
            },
        }
    }

    /// Claim one row slot. Always succeeds on an unlimited query.
    pub fn try_claim(&self) -> bool {
        if !self.limited {
            return true;
        }
        self.remaining.fetch_sub(1, Ordering::SeqCst) > 0
    }

    pub fn exhausted(&self) -> bool {
        self.limited && self.remaining.load(Ordering::SeqCst) <= 0
    }
}

/// Handle to one running query: the output stream plus a cancel hook.
#[derive(Debug)]
pub struct QueryExecution {
    pub query_id: Uuid,
    output: mpsc::Receiver<QueryOutput>,
    cancel: CancelSignal,
}

impl QueryExecution {
    /// Next row or scope error; `None` once every scope has finished.
    pub async fn next(&mut self) -> Option<QueryOutput> {
        self.output.recv().await
    }

    /// Cancel the query. In-flight API calls complete but their results are
    /// discarded; rows already emitted remain valid.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// The table hydration and query execution engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<TableRegistry>,
    scopes: Arc<ScopeCatalog>,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: Arc<TableRegistry>, scopes: Arc<ScopeCatalog>) -> Self {
        Self {
            config,
            registry,
            scopes,
        }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Plan and launch one table query. Returns immediately with a streaming
    /// handle; a malformed request (unknown table, unknown column) fails here
    /// and nothing is executed.
    pub async fn execute(&self, request: QueryRequest) -> Result<QueryExecution, ApiError> {
        let query_id = Uuid::new_v4();

        let schema = self.registry.get(&request.table).ok_or_else(|| {
            ApiError::MalformedRequest(format!("unknown table: {}", request.table))
        })?;

        let emit_columns: Vec<String> = if request.columns.is_empty() {
            schema.column_names()
        } else {
            for name in &request.columns {
                if schema.column(name).is_none() {
                    return Err(ApiError::MalformedRequest(format!(
                        "unknown column {} in table {}",
                        name, request.table
                    )));
                }
            }
            request.columns.clone()
        };

        let plan = planner::plan(&schema, &request.qualifiers)?;

        // Residual qualifiers may reference columns outside the requested
        // set; those must still be materialized to evaluate the predicate.
        let mut fetch_columns = emit_columns.clone();
        for qualifier in &plan.residual {
            if !fetch_columns.contains(&qualifier.column) {
                fetch_columns.push(qualifier.column.clone());
            }
        }

        let available = match &request.scopes {
            Some(explicit) => explicit.iter().map(|s| Scope::new(s)).collect(),
            None => self.scopes.get().await.ok_or_else(|| {
                ApiError::Unknown(
                    "scope catalog not initialized; resolve scopes at connection setup".into(),
                )
            })?,
        };
        let selected = plan.select_scopes(&available);

        tracing::info!(
            "query {}: table={} scopes={}/{} pushed={} residual={} limit={:?}",
            query_id,
            request.table,
            selected.len(),
            available.len(),
            plan.pushed.len(),
            plan.residual.len(),
            request.limit
        );

        let cancel = CancelSignal::new();
        let budget = Arc::new(RowBudget::new(request.limit));
        let cache = Arc::new(HydrationCache::new());
        let call_gate = Arc::new(Semaphore::new(self.config.max_concurrent_calls.max(1)));
        let scope_gate = Arc::new(Semaphore::new(self.config.max_concurrent_scopes.max(1)));
        let retry = RetryPolicy::from_config(&self.config);
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);

        let plan = Arc::new(plan);
        let fetch_columns = Arc::new(fetch_columns);
        let emit_columns = Arc::new(emit_columns);
        let hydration_concurrency = self.config.hydration_concurrency;
        let page_size = self.config.page_size;

        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut scope_tasks = JoinSet::new();
            for scope in selected {
                let ctx = ScopeContext {
                    schema: schema.clone(),
                    plan: plan.clone(),
                    fetch_columns: fetch_columns.clone(),
                    emit_columns: emit_columns.clone(),
                    scope,
                    cache: cache.clone(),
                    sink: tx.clone(),
                    budget: budget.clone(),
                    cancel: driver_cancel.clone(),
                    call_gate: call_gate.clone(),
                    hydration_concurrency,
                    page_size,
                    retry,
                };
                let gate = scope_gate.clone();
                let cancel = driver_cancel.clone();
                scope_tasks.spawn(async move {
                    let _permit = match gate.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    };
                    if cancel.is_cancelled() {
                        return None;
                    }
                    run_scope(ctx).await.err()
                });
            }

            while let Some(joined) = scope_tasks.join_next().await {
                match joined {
                    Ok(Some(scope_error)) => {
                        tracing::warn!(
                            "query {}: scope {} failed: {}",
                            query_id,
                            scope_error.scope,
                            scope_error.message
                        );
                        // A malformed request is a planner bug; no sibling
                        // scope can succeed either, so stop the query.
                        let fatal = scope_error.kind == ErrorKind::MalformedRequest;
                        if tx.send(QueryOutput::ScopeError(scope_error)).await.is_err() {
                            driver_cancel.cancel();
                        }
                        if fatal {
                            driver_cancel.cancel();
                        }
                    },
                    Ok(None) => {},
                    Err(join_error) => {
                        tracing::warn!("query {}: scope task failed: {}", query_id, join_error);
                    },
                }
            }
            tracing::info!("query {}: complete", query_id);
            // tx drops here; the closed channel signals completion upstream.
        });

        Ok(QueryExecution {
            query_id,
            output: rx,
            cancel,
        })
    }
}
