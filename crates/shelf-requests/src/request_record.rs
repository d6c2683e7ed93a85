//! The central request entity and its closed status vocabulary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `RequestStatus` values.
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "fulfilled" => Some(Self::Fulfilled),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Records which authority drove a transition into a terminal state.
pub enum FulfillmentSource {
    Admin,
    Scan,
    Remote,
}

impl FulfillmentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Scan => "scan",
            Self::Remote => "remote",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "scan" => Some(Self::Scan),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A user attached to a request. The first requester on a record is the
/// primary requester; additional requesters arrive via dedup-join.
pub struct Requester {
    pub user_id: String,
    pub display_name: String,
}

impl Requester {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Structured metadata captured from a confident provider match.
pub struct RequestMetadata {
    pub provider_id: u64,
    pub canonical_title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An append-only annotation on a request.
pub struct AdminNote {
    pub author: String,
    pub body: String,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Public struct `RequestRecord` used across Shelfkeeper components.
pub struct RequestRecord {
    pub id: i64,
    pub platform: String,
    pub title: String,
    pub normalized_title: String,
    #[serde(default)]
    pub details: Option<String>,
    pub status: RequestStatus,
    pub created_unix_ms: u64,
    #[serde(default)]
    pub resolved_unix_ms: Option<u64>,
    #[serde(default)]
    pub fulfillment_source: Option<FulfillmentSource>,
    #[serde(default)]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub external_ref_stale: bool,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
    pub requesters: Vec<Requester>,
    #[serde(default)]
    pub admin_notes: Vec<AdminNote>,
}

impl RequestRecord {
    /// The primary requester is always the first attached requester.
    pub fn primary_requester(&self) -> &Requester {
        &self.requesters[0]
    }

    pub fn has_requester(&self, user_id: &str) -> bool {
        self.requesters
            .iter()
            .any(|requester| requester.user_id == user_id)
    }
}

#[derive(Debug, Clone)]
/// Input for creating a new pending request.
pub struct NewRequest {
    pub requester: Requester,
    pub platform: String,
    pub title: String,
    pub details: Option<String>,
    pub metadata: Option<RequestMetadata>,
}
