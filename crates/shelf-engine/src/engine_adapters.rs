//! Adapters binding the concrete clients to the engine's collaborator
//! traits.

use anyhow::Result;
use async_trait::async_trait;

use shelf_metadata::MetadataClient;
use shelf_requests::{RequestMetadata, RequestRecord, RequestStatus};
use shelf_tracker::{RemoteStatusFetch, RemoteTrackerStatus, TrackerClient, TrackerCreateRequest};

use crate::engine_ports::{MetadataProvider, TrackerPort};

#[async_trait]
impl MetadataProvider for MetadataClient {
    async fn lookup(&self, platform: &str, title: &str) -> Result<Option<RequestMetadata>> {
        let chosen = MetadataClient::lookup(self, platform, title).await?;
        Ok(chosen.map(|chosen| RequestMetadata {
            provider_id: chosen.provider_id,
            canonical_title: chosen.canonical_title,
            cover_url: chosen.cover_url,
        }))
    }
}

#[async_trait]
impl TrackerPort for TrackerClient {
    async fn push_create(&self, record: &RequestRecord) -> Result<String> {
        let primary = record.primary_requester();
        let create = TrackerCreateRequest {
            title: record.title.clone(),
            platform: record.platform.clone(),
            requester_id: primary.user_id.clone(),
            requester_name: primary.display_name.clone(),
            local_request_id: record.id,
            provider_id: record.metadata.as_ref().map(|metadata| metadata.provider_id),
            details: record.details.clone(),
        };
        TrackerClient::push_create(self, &create).await
    }

    async fn push_status(
        &self,
        external_ref: &str,
        status: RequestStatus,
        note: Option<&str>,
    ) -> Result<()> {
        TrackerClient::push_status(self, external_ref, remote_status_for(status), note).await
    }

    async fn fetch_status(&self, external_ref: &str) -> Result<RemoteStatusFetch> {
        TrackerClient::fetch_status(self, external_ref).await
    }
}

/// Local terminal statuses map one-to-one onto the tracker's vocabulary;
/// a pending push (never queued in practice) maps to the tracker's open
/// state.
fn remote_status_for(status: RequestStatus) -> RemoteTrackerStatus {
    match status {
        RequestStatus::Pending => RemoteTrackerStatus::Pending,
        RequestStatus::Fulfilled => RemoteTrackerStatus::Fulfilled,
        RequestStatus::Rejected => RemoteTrackerStatus::Rejected,
        RequestStatus::Cancelled => RemoteTrackerStatus::Cancelled,
    }
}
