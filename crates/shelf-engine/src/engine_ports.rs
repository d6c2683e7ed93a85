//! Collaborator seams consumed by the engine.
//!
//! The concrete clients live in their own crates; the engine depends only
//! on these traits so tests (and alternative backends) can script every
//! collaborator.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shelf_requests::{RequestMetadata, RequestRecord, RequestStatus};
use shelf_tracker::RemoteStatusFetch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A platform known to the library server.
pub struct CatalogPlatform {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub custom_name: Option<String>,
}

impl CatalogPlatform {
    /// Custom names override the canonical platform name when present.
    pub fn display_name(&self) -> &str {
        self.custom_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An item already present in the library catalog.
pub struct CatalogItem {
    pub name: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub catalog_ref: Option<String>,
}

/// Read access to the library server's catalog.
#[async_trait]
pub trait LibraryCatalog: Send + Sync {
    async fn list_platforms(&self) -> Result<Vec<CatalogPlatform>>;
    async fn search_items(&self, platform_id: &str, term: &str) -> Result<Vec<CatalogItem>>;
}

/// Best-effort metadata enrichment.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn lookup(&self, platform: &str, title: &str) -> Result<Option<RequestMetadata>>;
}

/// Outbound pushes to and inbound status reads from the external tracker.
#[async_trait]
pub trait TrackerPort: Send + Sync {
    async fn push_create(&self, record: &RequestRecord) -> Result<String>;
    async fn push_status(
        &self,
        external_ref: &str,
        status: RequestStatus,
        note: Option<&str>,
    ) -> Result<()>;
    async fn fetch_status(&self, external_ref: &str) -> Result<RemoteStatusFetch>;
}
