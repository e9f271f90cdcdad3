//! GCP API interaction module
//!
//! This module provides the core functionality for interacting with Google Cloud Platform
//! APIs, including authentication, HTTP client, error classification, and scope discovery.
//!
//! # Module Structure
//!
//! - [`auth`] - GCP authentication using Application Default Credentials
//! - [`client`] - Main GCP client for making API requests
//! - [`error`] - Typed API error classification (transient/permission/not-found/...)
//! - [`http`] - HTTP utilities for REST API calls
//! - [`scopes`] - Project (scope) discovery and the connection-wide scope cache
//!
//! # Example
//!
//! ```ignore
//! use qgcp::gcp::client::ApiClient;
//! use qgcp::gcp::scopes::Scope;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let client = ApiClient::new().await?;
//!     let scope = Scope::new("my-project");
//!     let instances = client
//!         .get_json(&client.compute_url(&scope, "aggregated/instances"))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod http;
pub mod scopes;
