//! qgcp - resource-catalog query engine for Google Cloud Platform.
//!
//! Exposes GCP resources (compute instances, storage buckets, GKE clusters)
//! as queryable relational tables. A query names a table, a set of columns
//! and a set of qualifiers; the engine plans which qualifiers can be pushed
//! into the API request, fans the query out across every accessible project,
//! hydrates lazily-computed columns through a deduplicating cache and streams
//! completed rows back while sibling projects are still being fetched.

pub mod config;
pub mod engine;
pub mod gcp;
pub mod plugin;
pub mod tables;
