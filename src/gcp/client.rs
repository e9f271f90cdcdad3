//! GCP Client
//!
//! Main client for interacting with GCP APIs, combining authentication
//! and HTTP functionality. One client serves every scope of a fan-out;
//! scope-dependent URLs take the scope as a parameter.

use anyhow::{Context, Result};
use serde_json::Value;

use super::auth::Credentials;
use super::error::ApiError;
use super::http::HttpClient;
use super::scopes::Scope;

/// Main GCP client
#[derive(Clone)]
pub struct ApiClient {
    pub credentials: Credentials,
    pub http: HttpClient,
}

impl ApiClient {
    /// Create a new GCP client
    pub async fn new() -> Result<Self> {
        let credentials = Credentials::new()
            .await
            .context("Failed to initialize GCP credentials")?;

        let http = HttpClient::new()?;

        Ok(Self { credentials, http })
    }

    /// Make a GET request to a GCP API with the current credentials injected.
    pub async fn get_json(&self, url: &str) -> Result<Value, ApiError> {
        let token = self
            .credentials
            .token()
            .await
            .map_err(|e| ApiError::Permission(format!("failed to obtain access token: {e:#}")))?;
        self.http.get(url, &token).await
    }

    // =========================================================================
    // Compute Engine API helpers
    // =========================================================================

    /// Build Compute Engine API URL
    pub fn compute_url(&self, scope: &Scope, path: &str) -> String {
        format!(
            "https://compute.googleapis.com/compute/v1/projects/{}/{}",
            scope.project_id, path
        )
    }

    // =========================================================================
    // Cloud Storage API helpers
    // =========================================================================

    /// Build Cloud Storage API URL
    pub fn storage_url(&self, path: &str) -> String {
        format!("https://storage.googleapis.com/storage/v1/{}", path)
    }

    /// Build Cloud Storage bucket URL
    pub fn storage_bucket_url(&self, bucket: &str) -> String {
        self.storage_url(&format!("b/{}", bucket))
    }

    // =========================================================================
    // GKE API helpers
    // =========================================================================

    /// Build GKE API URL
    pub fn container_url(&self, scope: &Scope, path: &str) -> String {
        format!(
            "https://container.googleapis.com/v1/projects/{}/{}",
            scope.project_id, path
        )
    }

    /// Build GKE location URL (region or zone; "-" means all locations)
    pub fn container_location_url(&self, scope: &Scope, location: &str, resource: &str) -> String {
        self.container_url(scope, &format!("locations/{}/{}", location, resource))
    }

    // =========================================================================
    // Resource Manager API helpers
    // =========================================================================

    /// Build Resource Manager API URL
    pub fn resourcemanager_url(&self, path: &str) -> String {
        format!("https://cloudresourcemanager.googleapis.com/v1/{}", path)
    }
}
