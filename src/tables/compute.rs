//! Compute Engine instance table.

use serde_json::Value;
use std::sync::Arc;

use crate::engine::schema::{
    json_path, ColumnDef, ColumnType, HydrateFn, HydrateRequest, ListFn, ListPage, ListRequest,
    QualOperator, TableSchema, Transform,
};
use crate::gcp::client::ApiClient;
use crate::gcp::error::ApiError;

use super::{filter_expression, next_page_token};

/// `gcp_compute_instance`: VM instances across all zones, via the
/// aggregated endpoint. `guest_cpus` and `memory_mb` hydrate from the
/// instance's machine type and share the same underlying call.
pub fn table(client: Arc<ApiClient>) -> TableSchema {
    let list_client = client.clone();
    let list: ListFn = Arc::new(move |request: ListRequest| {
        let client = list_client.clone();
        Box::pin(async move {
            let mut url = client.compute_url(&request.scope, "aggregated/instances");

            let mut params: Vec<String> = Vec::new();
            if let Some(expression) = filter_expression(&request.filters) {
                params.push(format!("filter={}", urlencoding::encode(&expression)));
            }
            if let Some(size) = request.page_size {
                params.push(format!("maxResults={}", size));
            }
            if let Some(token) = &request.page_token {
                params.push(format!("pageToken={}", urlencoding::encode(token)));
            }
            if !params.is_empty() {
                url = format!("{}?{}", url, params.join("&"));
            }

            let response = client.get_json(&url).await?;
            Ok(ListPage {
                items: flatten_aggregated(&response),
                next_token: next_page_token(&response),
            })
        })
    });

    let machine_type_client = client;
    let machine_type_detail: HydrateFn = Arc::new(move |request: HydrateRequest| {
        let client = machine_type_client.clone();
        Box::pin(async move {
            // machineType on the listed item is a full resource URL
            let url = json_path(&request.item, "machineType")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ApiError::MalformedRequest("instance item has no machineType".into())
                })?;
            client.get_json(&url).await
        })
    });

    TableSchema::new(
        "gcp_compute_instance",
        vec![
            ColumnDef::new("project", ColumnType::String, ""),
            ColumnDef::new("name", ColumnType::String, "name")
                .pushdown("name", &[QualOperator::Equals, QualOperator::InList]),
            ColumnDef::new("id", ColumnType::String, "id"),
            ColumnDef::new("status", ColumnType::String, "status")
                .pushdown("status", &[QualOperator::Equals, QualOperator::InList]),
            ColumnDef::new("zone", ColumnType::String, "zone")
                .transform(Transform::LastPathSegment),
            ColumnDef::new("machine_type", ColumnType::String, "machineType")
                .transform(Transform::LastPathSegment),
            ColumnDef::new("creation_timestamp", ColumnType::Timestamp, "creationTimestamp"),
            ColumnDef::new("labels", ColumnType::Json, "labels"),
            ColumnDef::new("network_interfaces", ColumnType::Json, "networkInterfaces"),
            ColumnDef::new("tags", ColumnType::StringArray, "tags.items"),
            ColumnDef::new("guest_cpus", ColumnType::Int, "guestCpus")
                .hydrated_by("machine_type_detail"),
            ColumnDef::new("memory_mb", ColumnType::Int, "memoryMb")
                .hydrated_by("machine_type_detail"),
        ],
        list,
    )
    .scope_column("project")
    .key_path("id")
    .with_hydrator("machine_type_detail", machine_type_detail)
}

/// Flatten an aggregated API response into a plain item list.
/// Aggregated responses have format:
/// `{ "items": { "zones/us-central1-a": { "instances": [...] }, ... } }`
fn flatten_aggregated(response: &Value) -> Vec<Value> {
    let Some(items) = response.get("items").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut all_items: Vec<Value> = Vec::new();
    for zone_data in items.values() {
        if let Some(obj) = zone_data.as_object() {
            for (key, value) in obj {
                // Zones without instances carry a "warning" entry instead
                if key == "warning" {
                    continue;
                }
                if let Some(arr) = value.as_array() {
                    all_items.extend(arr.iter().cloned());
                }
            }
        }
    }
    all_items
}
