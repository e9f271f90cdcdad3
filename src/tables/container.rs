//! GKE cluster table.

use serde_json::Value;
use std::sync::Arc;

use crate::engine::schema::{
    json_path, ColumnDef, ColumnType, HydrateFn, HydrateRequest, ListFn, ListPage, ListRequest,
    TableSchema, Transform,
};
use crate::gcp::client::ApiClient;
use crate::gcp::error::ApiError;

/// `gcp_container_cluster`: GKE clusters across all locations. The clusters
/// endpoint returns the full set in one response, so there is no
/// continuation token. `node_pools` and `node_pool_count` share one
/// node-pool listing per cluster.
pub fn table(client: Arc<ApiClient>) -> TableSchema {
    let list_client = client.clone();
    let list: ListFn = Arc::new(move |request: ListRequest| {
        let client = list_client.clone();
        Box::pin(async move {
            let url = client.container_location_url(&request.scope, "-", "clusters");
            let response = client.get_json(&url).await?;
            let items = response
                .get("clusters")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(ListPage {
                items,
                next_token: None,
            })
        })
    });

    let pools_client = client;
    let node_pools: HydrateFn = Arc::new(move |request: HydrateRequest| {
        let client = pools_client.clone();
        Box::pin(async move {
            let name = json_path(&request.item, "name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ApiError::MalformedRequest("cluster item has no name".into()))?;
            let location = json_path(&request.item, "location")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ApiError::MalformedRequest("cluster item has no location".into()))?;

            let url = client.container_location_url(
                &request.scope,
                &location,
                &format!("clusters/{}/nodePools", name),
            );
            let response = client.get_json(&url).await?;
            Ok(response
                .get("nodePools")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())))
        })
    });

    TableSchema::new(
        "gcp_container_cluster",
        vec![
            ColumnDef::new("project", ColumnType::String, ""),
            ColumnDef::new("name", ColumnType::String, "name"),
            ColumnDef::new("location", ColumnType::String, "location"),
            ColumnDef::new("status", ColumnType::String, "status"),
            ColumnDef::new("current_master_version", ColumnType::String, "currentMasterVersion"),
            ColumnDef::new("current_node_count", ColumnType::Int, "currentNodeCount"),
            ColumnDef::new("autopilot", ColumnType::Bool, "autopilot.enabled"),
            ColumnDef::new("endpoint", ColumnType::String, "endpoint"),
            ColumnDef::new("create_time", ColumnType::Timestamp, "createTime"),
            ColumnDef::new("network", ColumnType::String, "network")
                .transform(Transform::LastPathSegment),
            ColumnDef::new("node_pools", ColumnType::Json, "").hydrated_by("node_pools"),
            ColumnDef::new("node_pool_count", ColumnType::Int, "")
                .hydrated_by("node_pools")
                .transform(Transform::Count),
        ],
        list,
    )
    .scope_column("project")
    .key_path("selfLink")
    .with_hydrator("node_pools", node_pools)
    .not_found_as_empty(true)
}
