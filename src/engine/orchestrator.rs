//! Per-scope list/get orchestration.
//!
//! Drives one scope through `Idle -> Listing -> Hydrating -> Draining ->
//! Done` (or `Failed`): follows continuation tokens, spawns one bounded row
//! task per listed item, hydrates missing columns through the query's
//! singleflight cache and emits each row to the sink as soon as all of its
//! hydrations have completed. A row is emitted whole; a hydration that still
//! fails after retries becomes a null column, never a dropped row.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::EngineConfig;
use crate::gcp::error::ApiError;
use crate::gcp::scopes::Scope;

use super::cache::{CallKey, HydrationCache};
use super::fanout::{CancelSignal, RowBudget};
use super::planner::{residual_matches, QualifierPlan};
use super::schema::{json_path, HydrateRequest, ListRequest, ResultRow, TableSchema};
use super::sink::{QueryOutput, ScopeError};

/// Retry behavior for transient provider errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        }
    }

    /// Exponential backoff with jitter for the given zero-based attempt.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_backoff.saturating_mul(1u32 << attempt.min(8));
        exponential + jitter(self.base_backoff)
    }
}

/// Sub-millisecond-seeded jitter bounded by the base backoff. Enough to
/// de-synchronize retry storms across scopes without a rand dependency.
fn jitter(base: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::from(d.subsec_nanos()));
    let bound = (base.as_millis() as u64).max(1);
    Duration::from_millis(nanos % bound)
}

/// Run `attempt` until it succeeds, retrying transient errors up to the
/// policy cap. A server-provided Retry-After hint takes precedence over the
/// computed backoff. Cancellation interrupts the backoff wait.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    cancel: &mut watch::Receiver<bool>,
    attempt: F,
) -> Result<T, ApiError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut tries: u32 = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && tries < policy.max_retries => {
                let delay = err.retry_after().unwrap_or_else(|| policy.backoff_delay(tries));
                tracing::warn!(
                    "{}: transient error (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    tries + 1,
                    policy.max_retries,
                    delay,
                    err
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = cancel.changed() => return Err(err),
                }
                tries += 1;
            },
            Err(err) => return Err(err),
        }
    }
}

/// Lifecycle of one scope's orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopePhase {
    Idle,
    Listing,
    Hydrating,
    Draining,
    Done,
    Failed,
}

fn advance(phase: &mut ScopePhase, next: ScopePhase, scope: &Scope) {
    tracing::debug!("scope {}: {:?} -> {:?}", scope, *phase, next);
    *phase = next;
}

/// Everything one scope's orchestration needs, assembled by the fan-out
/// controller.
pub(crate) struct ScopeContext {
    pub schema: Arc<TableSchema>,
    pub plan: Arc<QualifierPlan>,
    /// Columns that must be materialized (requested plus residual-referenced).
    pub fetch_columns: Arc<Vec<String>>,
    /// Columns present in emitted rows.
    pub emit_columns: Arc<Vec<String>>,
    pub scope: Scope,
    pub cache: Arc<HydrationCache>,
    pub sink: mpsc::Sender<QueryOutput>,
    pub budget: Arc<RowBudget>,
    pub cancel: CancelSignal,
    pub call_gate: Arc<Semaphore>,
    pub hydration_concurrency: usize,
    pub page_size: u32,
    pub retry: RetryPolicy,
}

impl ScopeContext {
    fn row_context(&self) -> RowContext {
        RowContext {
            schema: self.schema.clone(),
            plan: self.plan.clone(),
            fetch_columns: self.fetch_columns.clone(),
            emit_columns: self.emit_columns.clone(),
            scope: self.scope.clone(),
            cache: self.cache.clone(),
            sink: self.sink.clone(),
            budget: self.budget.clone(),
            cancel: self.cancel.clone(),
            call_gate: self.call_gate.clone(),
            retry: self.retry,
        }
    }
}

#[derive(Clone)]
struct RowContext {
    schema: Arc<TableSchema>,
    plan: Arc<QualifierPlan>,
    fetch_columns: Arc<Vec<String>>,
    emit_columns: Arc<Vec<String>>,
    scope: Scope,
    cache: Arc<HydrationCache>,
    sink: mpsc::Sender<QueryOutput>,
    budget: Arc<RowBudget>,
    cancel: CancelSignal,
    call_gate: Arc<Semaphore>,
    retry: RetryPolicy,
}

/// Run one scope to completion. Returns the scope-fatal error, if any;
/// sibling scopes are unaffected either way.
pub(crate) async fn run_scope(ctx: ScopeContext) -> Result<(), ScopeError> {
    let mut phase = ScopePhase::Idle;
    let hydration_gate = Arc::new(Semaphore::new(ctx.hydration_concurrency.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut cancel = ctx.cancel.subscribe();
    let mut page_token: Option<String> = None;

    advance(&mut phase, ScopePhase::Listing, &ctx.scope);
    loop {
        if ctx.cancel.is_cancelled() || ctx.budget.exhausted() {
            break;
        }

        let request = ListRequest {
            scope: ctx.scope.clone(),
            filters: ctx.plan.pushed.clone(),
            page_token: page_token.take(),
            page_size: Some(ctx.page_size),
        };

        let list = ctx.schema.list.clone();
        let gate = ctx.call_gate.clone();
        let outcome = with_retries(&ctx.retry, "list", &mut cancel, || {
            let list = list.clone();
            let gate = gate.clone();
            let request = request.clone();
            async move {
                let _permit = gate
                    .acquire_owned()
                    .await
                    .map_err(|_| ApiError::Unknown("call gate closed".into()))?;
                list(request).await
            }
        })
        .await;

        let page = match outcome {
            Ok(page) => page,
            Err(ApiError::NotFound(message)) if ctx.schema.not_found_as_empty => {
                tracing::debug!(
                    "scope {}: list returned not-found, treating as zero rows: {}",
                    ctx.scope,
                    message
                );
                break;
            },
            Err(err) => {
                advance(&mut phase, ScopePhase::Failed, &ctx.scope);
                // Rows from pages fetched before the failure are still valid;
                // let their hydrations finish.
                while tasks.join_next().await.is_some() {}
                return Err(ScopeError::new(&ctx.scope, &err));
            },
        };

        tracing::debug!(
            "scope {}: fetched page with {} items",
            ctx.scope,
            page.items.len()
        );

        for item in page.items {
            if ctx.cancel.is_cancelled() || ctx.budget.exhausted() {
                break;
            }
            // The permit bounds how many rows hydrate concurrently within
            // this scope; it rides into the task and releases on completion.
            let permit = match hydration_gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let row_ctx = ctx.row_context();
            tasks.spawn(async move {
                let _permit = permit;
                process_item(row_ctx, item).await;
            });
        }

        match page.next_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    advance(&mut phase, ScopePhase::Hydrating, &ctx.scope);
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::warn!("scope {}: row task failed: {}", ctx.scope, err);
        }
    }
    advance(&mut phase, ScopePhase::Draining, &ctx.scope);
    advance(&mut phase, ScopePhase::Done, &ctx.scope);
    Ok(())
}

/// Hydrate one listed item into a full row and emit it. Dropped silently if
/// the residual predicate rejects it, the query was cancelled, or the row
/// budget was exhausted first.
async fn process_item(ctx: RowContext, item: Value) {
    if ctx.cancel.is_cancelled() || ctx.budget.exhausted() {
        return;
    }

    let values = hydrate_row(&ctx, &item).await;

    if !residual_matches(&values, &ctx.plan.residual) {
        return;
    }
    // Results arriving after cancellation are discarded, not emitted.
    if ctx.cancel.is_cancelled() {
        return;
    }
    if !ctx.budget.try_claim() {
        ctx.cancel.cancel();
        return;
    }

    let mut emitted = serde_json::Map::new();
    for name in ctx.emit_columns.iter() {
        if let Some(value) = values.get(name) {
            emitted.insert(name.clone(), value.clone());
        }
    }

    let row = ResultRow {
        scope: ctx.scope.project_id.clone(),
        values: emitted,
    };
    if ctx.sink.send(QueryOutput::Row(row)).await.is_err() {
        // Receiver gone: the host dropped the query.
        ctx.cancel.cancel();
    }
}

/// Materialize every fetch column for one item. Distinct hydrate functions
/// run concurrently; the row assembles only once all of them have settled,
/// so the emitted columns are mutually consistent.
async fn hydrate_row(ctx: &RowContext, item: &Value) -> serde_json::Map<String, Value> {
    let mut needed: Vec<&str> = Vec::new();
    for name in ctx.fetch_columns.iter() {
        if let Some(column) = ctx.schema.column(name) {
            if let Some(func) = column.hydrate.as_deref() {
                if !needed.contains(&func) {
                    needed.push(func);
                }
            }
        }
    }

    let hydrations = needed.iter().map(|func| {
        let func = func.to_string();
        async move {
            let value = run_hydration(ctx, &func, item).await;
            (func, value)
        }
    });
    let hydrated: HashMap<String, Option<Value>> = join_all(hydrations).await.into_iter().collect();

    let mut values = serde_json::Map::new();
    for name in ctx.fetch_columns.iter() {
        let Some(column) = ctx.schema.column(name) else {
            continue;
        };

        let raw = if ctx.schema.scope_column.as_deref() == Some(name.as_str()) {
            Value::String(ctx.scope.project_id.clone())
        } else {
            let source = match column.hydrate.as_deref() {
                Some(func) => hydrated.get(func).and_then(Option::as_ref),
                None => Some(item),
            };
            source
                .and_then(|v| json_path(v, &column.json_path))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let value = column.column_type.coerce(column.transform.apply(raw));
        values.insert(name.clone(), value);
    }
    values
}

/// Execute one hydrate function through the singleflight cache. Any failure
/// surviving the retry policy yields `None`, which the caller reports as a
/// null column.
async fn run_hydration(ctx: &RowContext, func: &str, item: &Value) -> Option<Value> {
    let hydrator = ctx.schema.hydrators.get(func)?.clone();
    let key = CallKey {
        table: ctx.schema.name.clone(),
        func: func.to_string(),
        scope: ctx.scope.project_id.clone(),
        item: ctx.schema.item_key(item),
    };

    let retry = ctx.retry;
    let gate = ctx.call_gate.clone();
    let scope = ctx.scope.clone();
    let item = item.clone();
    let mut cancel = ctx.cancel.subscribe();
    let what = format!("hydrate {}", func);

    let result = ctx
        .cache
        .get_or_compute(key, || async move {
            with_retries(&retry, &what, &mut cancel, || {
                let hydrator = hydrator.clone();
                let gate = gate.clone();
                let request = HydrateRequest {
                    scope: scope.clone(),
                    item: item.clone(),
                };
                async move {
                    let _permit = gate
                        .acquire_owned()
                        .await
                        .map_err(|_| ApiError::Unknown("call gate closed".into()))?;
                    hydrator(request).await
                }
            })
            .await
        })
        .await;

    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                "scope {}: hydration {} failed, emitting null: {}",
                ctx.scope,
                func,
                err
            );
            None
        },
    }
}
