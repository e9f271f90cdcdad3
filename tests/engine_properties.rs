//! End-to-end engine properties, exercised with mock tables whose list and
//! hydrate closures count invocations instead of touching the network.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qgcp::config::EngineConfig;
use qgcp::engine::{
    ColumnDef, ColumnType, Engine, HydrateFn, ListFn, ListPage, QualOperator, Qualifier,
    QueryExecution, QueryOutput, QueryRequest, ResultRow, ScopeError, TableRegistry, TableSchema,
};
use qgcp::gcp::error::{ApiError, ErrorKind};
use qgcp::gcp::scopes::{Scope, ScopeCatalog};

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_retries: 3,
        base_backoff_ms: 10,
        ..EngineConfig::default()
    }
}

async fn engine_for(table: TableSchema, scopes: &[&str], config: EngineConfig) -> Engine {
    let mut registry = TableRegistry::new();
    registry.register(table).expect("schema should register");
    let catalog = ScopeCatalog::new();
    catalog
        .prime(scopes.iter().map(|s| Scope::new(s)).collect())
        .await;
    Engine::new(config, Arc::new(registry), Arc::new(catalog))
}

async fn collect(mut execution: QueryExecution) -> (Vec<ResultRow>, Vec<ScopeError>) {
    let mut rows = Vec::new();
    let mut errors = Vec::new();
    while let Some(output) = execution.next().await {
        match output {
            QueryOutput::Row(row) => rows.push(row),
            QueryOutput::ScopeError(err) => errors.push(err),
        }
    }
    (rows, errors)
}

fn query(table: &str, columns: &[&str]) -> QueryRequest {
    QueryRequest {
        table: table.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        qualifiers: Vec::new(),
        scopes: None,
        limit: None,
    }
}

/// Single-page list closure producing per-scope items, counting invocations.
fn counting_list(
    calls: Arc<AtomicUsize>,
    items_for: impl Fn(&str) -> Result<Vec<Value>, ApiError> + Send + Sync + 'static,
) -> ListFn {
    Arc::new(move |request| {
        calls.fetch_add(1, Ordering::SeqCst);
        let result = items_for(&request.scope.project_id);
        Box::pin(async move {
            result.map(|items| ListPage {
                items,
                next_token: None,
            })
        })
    })
}

fn counting_hydrator(
    calls: Arc<AtomicUsize>,
    value_for: impl Fn(&Value) -> Result<Value, ApiError> + Send + Sync + 'static,
) -> HydrateFn {
    Arc::new(move |request| {
        calls.fetch_add(1, Ordering::SeqCst);
        let result = value_for(&request.item);
        Box::pin(async move { result })
    })
}

fn named_items(scope: &str, count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({"name": format!("{}-item-{}", scope, i)}))
        .collect()
}

#[tokio::test]
async fn test_shared_hydrate_call_executes_once_per_item() {
    let list_calls = Arc::new(AtomicUsize::new(0));
    let hydrate_calls = Arc::new(AtomicUsize::new(0));

    let table = TableSchema::new(
        "mock_table",
        vec![
            ColumnDef::new("name", ColumnType::String, "name"),
            ColumnDef::new("cpus", ColumnType::Int, "cpus").hydrated_by("detail"),
            ColumnDef::new("memory", ColumnType::Int, "memory").hydrated_by("detail"),
        ],
        counting_list(list_calls.clone(), |_| Ok(named_items("a", 3))),
    )
    .with_hydrator(
        "detail",
        counting_hydrator(hydrate_calls.clone(), |_| {
            Ok(json!({"cpus": 4, "memory": 16384}))
        }),
    );

    let engine = engine_for(table, &["proj-a"], fast_config()).await;
    let execution = engine
        .execute(query("mock_table", &["name", "cpus", "memory"]))
        .await
        .unwrap();
    let (rows, errors) = collect(execution).await;

    assert!(errors.is_empty());
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.values["cpus"], json!(4));
        assert_eq!(row.values["memory"], json!(16384));
    }
    // Two columns depend on "detail", yet it runs once per item.
    assert_eq!(hydrate_calls.load(Ordering::SeqCst), 3);
    assert_eq!(list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scope_equality_qualifier_narrows_fanout() {
    let listed_scopes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = listed_scopes.clone();

    let list: ListFn = Arc::new(move |request| {
        recorder
            .lock()
            .unwrap()
            .push(request.scope.project_id.clone());
        let items = named_items(&request.scope.project_id, 2);
        Box::pin(async move {
            Ok(ListPage {
                items,
                next_token: None,
            })
        })
    });

    let table = TableSchema::new(
        "mock_table",
        vec![
            ColumnDef::new("project", ColumnType::String, ""),
            ColumnDef::new("name", ColumnType::String, "name"),
        ],
        list,
    )
    .scope_column("project");

    let engine = engine_for(table, &["proj-a", "proj-b", "proj-c"], fast_config()).await;
    let mut request = query("mock_table", &["project", "name"]);
    request.qualifiers = vec![Qualifier {
        column: "project".into(),
        operator: QualOperator::Equals,
        value: json!("proj-b"),
    }];

    let (rows, errors) = collect(engine.execute(request).await.unwrap()).await;

    assert!(errors.is_empty());
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.scope == "proj-b"));
    assert_eq!(*listed_scopes.lock().unwrap(), vec!["proj-b".to_string()]);
}

#[tokio::test]
async fn test_row_limit_terminates_early_and_bounds_calls() {
    let list_calls = Arc::new(AtomicUsize::new(0));
    let counter = list_calls.clone();

    // Endless pagination: every page has 10 items and a continuation token.
    let list: ListFn = Arc::new(move |request| {
        counter.fetch_add(1, Ordering::SeqCst);
        let items = named_items(&request.scope.project_id, 10);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(ListPage {
                items,
                next_token: Some("more".into()),
            })
        })
    });

    let table = TableSchema::new(
        "mock_table",
        vec![ColumnDef::new("name", ColumnType::String, "name")],
        list,
    );

    let engine = engine_for(table, &["proj-a", "proj-b", "proj-c"], fast_config()).await;
    let mut request = query("mock_table", &["name"]);
    request.limit = Some(5);

    let (rows, errors) = collect(engine.execute(request).await.unwrap()).await;

    assert!(errors.is_empty());
    assert_eq!(rows.len(), 5);
    // Bounded, not exhaustive: at most the first pages of each scope plus
    // one page of overshoot each.
    assert!(list_calls.load(Ordering::SeqCst) <= 6);
}

#[tokio::test]
async fn test_partial_failure_isolates_the_failing_scope() {
    let table = TableSchema::new(
        "mock_table",
        vec![ColumnDef::new("name", ColumnType::String, "name")],
        counting_list(Arc::new(AtomicUsize::new(0)), |scope| {
            if scope == "proj-b" {
                Err(ApiError::Permission(
                    "compute.instances.list denied".into(),
                ))
            } else {
                Ok(named_items(scope, 2))
            }
        }),
    );

    let engine = engine_for(table, &["proj-a", "proj-b", "proj-c"], fast_config()).await;
    let (rows, errors) = collect(engine.execute(query("mock_table", &["name"])).await.unwrap()).await;

    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.scope != "proj-b"));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].scope, "proj-b");
    assert_eq!(errors[0].kind, ErrorKind::Permission);
}

#[tokio::test]
async fn test_transient_errors_retry_with_increasing_backoff() {
    let list_calls = Arc::new(AtomicUsize::new(0));
    let counter = list_calls.clone();

    let list: ListFn = Arc::new(move |request| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        let scope = request.scope.project_id.clone();
        Box::pin(async move {
            if attempt < 2 {
                Err(ApiError::Transient {
                    status: 429,
                    retry_after: None,
                    message: "rate limited".into(),
                })
            } else {
                Ok(ListPage {
                    items: named_items(&scope, 1),
                    next_token: None,
                })
            }
        })
    });

    let table = TableSchema::new(
        "mock_table",
        vec![ColumnDef::new("name", ColumnType::String, "name")],
        list,
    );

    let engine = engine_for(table, &["proj-a"], fast_config()).await;
    let started = std::time::Instant::now();
    let (rows, errors) = collect(engine.execute(query("mock_table", &["name"])).await.unwrap()).await;

    assert!(errors.is_empty());
    assert_eq!(rows.len(), 1);
    assert_eq!(list_calls.load(Ordering::SeqCst), 3);
    // Two waits: base * 1 then base * 2 (plus jitter).
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_failed_hydration_yields_null_column_not_dropped_row() {
    let table = TableSchema::new(
        "mock_table",
        vec![
            ColumnDef::new("name", ColumnType::String, "name"),
            ColumnDef::new("broken", ColumnType::Json, "").hydrated_by("broken_detail"),
            ColumnDef::new("healthy", ColumnType::Int, "cpus").hydrated_by("healthy_detail"),
        ],
        counting_list(Arc::new(AtomicUsize::new(0)), |scope| {
            Ok(named_items(scope, 1))
        }),
    )
    .with_hydrator(
        "broken_detail",
        counting_hydrator(Arc::new(AtomicUsize::new(0)), |_| {
            Err(ApiError::NotFound("detail endpoint missing".into()))
        }),
    )
    .with_hydrator(
        "healthy_detail",
        counting_hydrator(Arc::new(AtomicUsize::new(0)), |_| Ok(json!({"cpus": 8}))),
    );

    let engine = engine_for(table, &["proj-a"], fast_config()).await;
    let (rows, errors) = collect(
        engine
            .execute(query("mock_table", &["name", "broken", "healthy"]))
            .await
            .unwrap(),
    )
    .await;

    assert!(errors.is_empty());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values["broken"], Value::Null);
    assert_eq!(rows[0].values["healthy"], json!(8));
}

#[tokio::test]
async fn test_cancellation_stops_emission_promptly() {
    let list: ListFn = Arc::new(move |request| {
        let items = named_items(&request.scope.project_id, 5);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(ListPage {
                items,
                next_token: Some("more".into()),
            })
        })
    });

    let slow_hydrator: HydrateFn = Arc::new(|_request| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(json!({"cpus": 2}))
        })
    });

    let table = TableSchema::new(
        "mock_table",
        vec![
            ColumnDef::new("name", ColumnType::String, "name"),
            ColumnDef::new("cpus", ColumnType::Int, "cpus").hydrated_by("detail"),
        ],
        list,
    )
    .with_hydrator("detail", slow_hydrator);

    let engine = engine_for(table, &["proj-a", "proj-b"], fast_config()).await;
    let mut execution = engine
        .execute(query("mock_table", &["name", "cpus"]))
        .await
        .unwrap();

    // Read one output, then cancel mid-flight.
    let first = execution.next().await;
    assert!(first.is_some());
    execution.cancel();

    let mut remaining = 0usize;
    while execution.next().await.is_some() {
        remaining += 1;
    }
    // The stream terminates despite endless pagination, and only results
    // already in flight at the cancellation point can trickle out.
    assert!(remaining < 20, "drained {} outputs after cancel", remaining);
}

#[tokio::test]
async fn test_not_found_list_respects_table_policy() {
    let not_found_list = |_: &str| -> Result<Vec<Value>, ApiError> {
        Err(ApiError::NotFound("API not enabled".into()))
    };

    // Policy: treat as zero rows.
    let empty_table = TableSchema::new(
        "lenient_table",
        vec![ColumnDef::new("name", ColumnType::String, "name")],
        counting_list(Arc::new(AtomicUsize::new(0)), not_found_list),
    )
    .not_found_as_empty(true);

    let engine = engine_for(empty_table, &["proj-a"], fast_config()).await;
    let (rows, errors) = collect(engine.execute(query("lenient_table", &["name"])).await.unwrap()).await;
    assert!(rows.is_empty());
    assert!(errors.is_empty());

    // Policy: surface as a scope error.
    let strict_table = TableSchema::new(
        "strict_table",
        vec![ColumnDef::new("name", ColumnType::String, "name")],
        counting_list(Arc::new(AtomicUsize::new(0)), not_found_list),
    );

    let engine = engine_for(strict_table, &["proj-a"], fast_config()).await;
    let (rows, errors) = collect(engine.execute(query("strict_table", &["name"])).await.unwrap()).await;
    assert!(rows.is_empty());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_malformed_request_rejected_before_execution() {
    let table = TableSchema::new(
        "mock_table",
        vec![ColumnDef::new("name", ColumnType::String, "name")],
        counting_list(Arc::new(AtomicUsize::new(0)), |scope| {
            Ok(named_items(scope, 1))
        }),
    );
    let engine = engine_for(table, &["proj-a"], fast_config()).await;

    let err = engine
        .execute(query("no_such_table", &["name"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::MalformedRequest(_)));

    let mut request = query("mock_table", &["name"]);
    request.qualifiers = vec![Qualifier {
        column: "bogus".into(),
        operator: QualOperator::Equals,
        value: json!("x"),
    }];
    let err = engine.execute(request).await.unwrap_err();
    assert!(matches!(err, ApiError::MalformedRequest(_)));
}

#[tokio::test]
async fn test_residual_qualifier_on_unrequested_column() {
    let list: ListFn = Arc::new(move |_request| {
        Box::pin(async move {
            Ok(ListPage {
                items: vec![
                    json!({"name": "small", "sizeGb": 50}),
                    json!({"name": "large", "sizeGb": 500}),
                ],
                next_token: None,
            })
        })
    });

    let table = TableSchema::new(
        "mock_table",
        vec![
            ColumnDef::new("name", ColumnType::String, "name"),
            ColumnDef::new("size_gb", ColumnType::Int, "sizeGb"),
        ],
        list,
    );

    let engine = engine_for(table, &["proj-a"], fast_config()).await;
    let mut request = query("mock_table", &["name"]);
    request.qualifiers = vec![Qualifier {
        column: "size_gb".into(),
        operator: QualOperator::GreaterThan,
        value: json!(100),
    }];

    let (rows, errors) = collect(engine.execute(request).await.unwrap()).await;

    assert!(errors.is_empty());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values["name"], json!("large"));
    // The filter column was materialized for the predicate but not emitted.
    assert!(!rows[0].values.contains_key("size_gb"));
}
