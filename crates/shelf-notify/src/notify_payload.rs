//! Wire-agnostic notification payload types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A private message for one recipient.
pub struct DirectMessagePayload {
    pub recipient: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub request_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// An update for the admin-facing surface. `request_id` is absent for
/// batch summaries that cover several requests.
pub struct AdminSurfaceUpdate {
    #[serde(default)]
    pub request_id: Option<i64>,
    pub status: String,
    pub summary: String,
}
