//! Scope discovery and caching.
//!
//! A scope is one project over which a table query fans out. The set of
//! accessible projects is resolved once per connection from Cloud Resource
//! Manager and held process-wide; `invalidate` drops the cached set so the
//! next query re-resolves it (required after a credential change).

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::RwLock;

use super::client::ApiClient;
use super::error::ApiError;

/// One credential/project unit of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Scope {
    pub project_id: String,
}

impl Scope {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.project_id)
    }
}

/// List all accessible, active projects.
pub async fn discover(client: &ApiClient) -> Result<Vec<Scope>, ApiError> {
    let mut scopes = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let mut url = client.resourcemanager_url("projects");
        if let Some(token) = &page_token {
            url = format!("{}?pageToken={}", url, urlencoding::encode(token));
        }

        let response = client.get_json(&url).await?;

        if let Some(projects) = response.get("projects").and_then(Value::as_array) {
            for project in projects {
                let active = project
                    .get("lifecycleState")
                    .and_then(Value::as_str)
                    .map(|s| s == "ACTIVE")
                    .unwrap_or(false);
                if !active {
                    continue;
                }
                if let Some(id) = project.get("projectId").and_then(Value::as_str) {
                    scopes.push(Scope::new(id));
                }
            }
        }

        match response.get("nextPageToken").and_then(Value::as_str) {
            Some(token) => page_token = Some(token.to_string()),
            None => break,
        }
    }

    tracing::info!("Discovered {} accessible projects", scopes.len());
    Ok(scopes)
}

/// Connection-lifetime cache of the resolved scope set.
///
/// Read-only during query execution; refreshed only between queries via
/// [`ScopeCatalog::invalidate`].
#[derive(Default)]
pub struct ScopeCatalog {
    inner: RwLock<Option<Vec<Scope>>>,
}

impl ScopeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a resolved scope set.
    pub async fn prime(&self, scopes: Vec<Scope>) {
        let mut inner = self.inner.write().await;
        *inner = Some(scopes);
    }

    /// The cached scope set, if resolved.
    pub async fn get(&self) -> Option<Vec<Scope>> {
        self.inner.read().await.clone()
    }

    /// Drop the cached set. Call after a credential change.
    pub async fn invalidate(&self) {
        let mut inner = self.inner.write().await;
        *inner = None;
        tracing::debug!("Scope catalog invalidated");
    }

    /// Return the cached set, discovering and caching it if absent.
    pub async fn resolve(&self, client: &ApiClient) -> Result<Vec<Scope>, ApiError> {
        if let Some(scopes) = self.get().await {
            return Ok(scopes);
        }
        let scopes = discover(client).await?;
        self.prime(scopes.clone()).await;
        Ok(scopes)
    }
}
