//! Cloud Storage bucket table.

use serde_json::Value;
use std::sync::Arc;

use crate::engine::schema::{
    json_path, ColumnDef, ColumnType, HydrateFn, HydrateRequest, ListFn, ListPage, ListRequest,
    TableSchema,
};
use crate::gcp::client::ApiClient;
use crate::gcp::error::ApiError;

use super::next_page_token;

/// `gcp_storage_bucket`: buckets of a project. The bucket list API offers no
/// usable filter parameters, so every qualifier is applied post-fetch.
/// `iam_policy` and `iam_bindings` hydrate from the same policy call.
/// A 404 on List means the Storage API is not enabled in the project and is
/// treated as zero rows.
pub fn table(client: Arc<ApiClient>) -> TableSchema {
    let list_client = client.clone();
    let list: ListFn = Arc::new(move |request: ListRequest| {
        let client = list_client.clone();
        Box::pin(async move {
            let mut url = format!(
                "{}?project={}",
                client.storage_url("b"),
                urlencoding::encode(&request.scope.project_id)
            );
            if let Some(size) = request.page_size {
                url = format!("{}&maxResults={}", url, size);
            }
            if let Some(token) = &request.page_token {
                url = format!("{}&pageToken={}", url, urlencoding::encode(token));
            }

            let response = client.get_json(&url).await?;
            let items = response
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(ListPage {
                items,
                next_token: next_page_token(&response),
            })
        })
    });

    let iam_client = client;
    let iam_policy: HydrateFn = Arc::new(move |request: HydrateRequest| {
        let client = iam_client.clone();
        Box::pin(async move {
            let bucket = json_path(&request.item, "name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ApiError::MalformedRequest("bucket item has no name".into()))?;
            let url = client.storage_url(&format!("b/{}/iam", urlencoding::encode(&bucket)));
            client.get_json(&url).await
        })
    });

    TableSchema::new(
        "gcp_storage_bucket",
        vec![
            ColumnDef::new("project", ColumnType::String, ""),
            ColumnDef::new("name", ColumnType::String, "name"),
            ColumnDef::new("location", ColumnType::String, "location"),
            ColumnDef::new("storage_class", ColumnType::String, "storageClass"),
            ColumnDef::new("versioning_enabled", ColumnType::Bool, "versioning.enabled"),
            ColumnDef::new("time_created", ColumnType::Timestamp, "timeCreated"),
            ColumnDef::new("updated", ColumnType::Timestamp, "updated"),
            ColumnDef::new("labels", ColumnType::Json, "labels"),
            ColumnDef::new("iam_policy", ColumnType::Json, "").hydrated_by("iam_policy"),
            ColumnDef::new("iam_bindings", ColumnType::Json, "bindings").hydrated_by("iam_policy"),
        ],
        list,
    )
    .scope_column("project")
    .key_path("name")
    .with_hydrator("iam_policy", iam_policy)
    .not_found_as_empty(true)
}
