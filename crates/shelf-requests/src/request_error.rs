//! Typed error taxonomy for request operations.
//!
//! Only `Validation` and `CapExceeded` are ever surfaced to requesters;
//! `Conflict` is a benign race signal for scan and sync callers, and
//! `Dependency` failures degrade the operation instead of failing it.

use thiserror::Error;

use crate::request_record::RequestStatus;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("user {user_id} already has {cap} pending requests")]
    CapExceeded { user_id: String, cap: usize },

    #[error("request {id} is already {status}")]
    Conflict { id: i64, status: RequestStatus },

    #[error("request {0} not found")]
    NotFound(i64),

    #[error("dependency '{dependency}' unavailable: {detail}")]
    Dependency { dependency: String, detail: String },

    #[error("request store failure: {0}")]
    Storage(String),
}

impl RequestError {
    pub fn dependency(dependency: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            detail: detail.to_string(),
        }
    }

    /// Benign for callers that race against another fulfillment authority.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<rusqlite::Error> for RequestError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(error: serde_json::Error) -> Self {
        Self::Storage(format!("column codec failure: {error}"))
    }
}

pub type RequestResult<T> = Result<T, RequestError>;
