//! HTTP client for the remote request tracker.
//!
//! Authentication is a form login that yields a session cookie; every call
//! retries exactly once after re-authenticating when the session has
//! expired (401 or a redirect envelope in the body). A 404 for a linked
//! record is not an error: it reports `Missing` so the caller can mark the
//! correlation stale.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{header, redirect::Policy, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::tracker_transport::{truncate_for_error, TrackerRejection, TrackerStatusError};

const ERROR_BODY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone)]
/// Public struct `TrackerClientConfig` used across Shelfkeeper components.
pub struct TrackerClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_timeout_ms: u64,
}

impl Default for TrackerClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Status vocabulary of the remote tracker.
pub enum RemoteTrackerStatus {
    Pending,
    Approved,
    Fulfilled,
    Rejected,
    Cancelled,
}

impl RemoteTrackerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "fulfilled" | "completed" => Some(Self::Fulfilled),
            "rejected" | "denied" => Some(Self::Rejected),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal remote statuses drive local transitions; the rest are
    /// observation-only.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Rejected | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of an inbound status fetch.
pub enum RemoteStatusFetch {
    /// The linked remote record no longer exists.
    Missing,
    Status(RemoteTrackerStatus),
}

#[derive(Debug, Clone)]
/// Outbound creation payload assembled from a local request.
pub struct TrackerCreateRequest {
    pub title: String,
    pub platform: String,
    pub requester_id: String,
    pub requester_name: String,
    pub local_request_id: i64,
    pub provider_id: Option<u64>,
    pub details: Option<String>,
}

/// Session-cookie authenticated client for the tracker API.
#[derive(Debug)]
pub struct TrackerClient {
    http: reqwest::Client,
    config: TrackerClientConfig,
    session_cookie: Mutex<Option<String>>,
}

impl TrackerClient {
    pub fn new(config: TrackerClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty()
            || config.username.trim().is_empty()
            || config.password.trim().is_empty()
        {
            bail!("tracker integration requires base url and credentials");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .redirect(Policy::none())
            .build()
            .context("failed to create tracker http client")?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            config: TrackerClientConfig { base_url, ..config },
            session_cookie: Mutex::new(None),
        })
    }

    /// Pushes a new request; returns the remote identifier used as
    /// `external_ref`.
    pub async fn push_create(&self, create: &TrackerCreateRequest) -> Result<String> {
        let mut description = vec![
            "Requested via library companion bot".to_string(),
            format!(
                "Requester: {} (id {})",
                create.requester_name, create.requester_id
            ),
            format!("Platform: {}", create.platform),
            format!("Local request id: #{}", create.local_request_id),
        ];
        if let Some(details) = create.details.as_deref().filter(|text| !text.trim().is_empty()) {
            description.push(format!("Notes: {details}"));
        }

        let body = json!({
            "request_type": "game",
            "title": create.title,
            "igdb_id": create.provider_id,
            "platforms": [create.platform],
            "priority": "medium",
            "description": description.join("\n"),
            "reason": format!("Requested by {}", create.requester_name),
        });

        let response = self.authed_post("/request", &body).await?;
        if !value_is_success(&response) {
            return Err(TrackerRejection {
                operation: "request creation",
                detail: response_error_text(&response),
            }
            .into());
        }
        let remote_id = response
            .pointer("/request/id")
            .map(value_to_id_string)
            .ok_or_else(|| anyhow!("tracker create response carried no request id"))?;
        debug!(remote_id = remote_id.as_str(), "tracker request created");
        Ok(remote_id)
    }

    /// Pushes a status update for an already-linked request.
    pub async fn push_status(
        &self,
        external_ref: &str,
        status: RemoteTrackerStatus,
        note: Option<&str>,
    ) -> Result<()> {
        let body = json!({
            "request_id": external_ref,
            "status": status.as_str(),
            "admin_notes": note.unwrap_or("Updated by library companion bot"),
        });
        let response = self.authed_post("/admin/api/requests/update", &body).await?;
        if !value_is_success(&response) {
            return Err(TrackerRejection {
                operation: "status update",
                detail: response_error_text(&response),
            }
            .into());
        }
        Ok(())
    }

    /// Fetches the remote status for a linked request.
    pub async fn fetch_status(&self, external_ref: &str) -> Result<RemoteStatusFetch> {
        let path = format!("/admin/api/requests/{external_ref}");
        let response = match self.authed_get(&path).await? {
            Some(value) => value,
            None => return Ok(RemoteStatusFetch::Missing),
        };
        if !value_is_success(&response) {
            return Err(TrackerRejection {
                operation: "status fetch",
                detail: response_error_text(&response),
            }
            .into());
        }
        let raw_status = response
            .pointer("/request/status")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("tracker status response carried no status field"))?;
        match RemoteTrackerStatus::parse(raw_status) {
            Some(status) => Ok(RemoteStatusFetch::Status(status)),
            None => {
                warn!(
                    external_ref,
                    raw_status, "tracker reported an unrecognized status; treating as pending"
                );
                Ok(RemoteStatusFetch::Status(RemoteTrackerStatus::Pending))
            }
        }
    }

    async fn authed_post(&self, path: &str, body: &Value) -> Result<Value> {
        for attempt in 0..2 {
            let cookie = self.ensure_session().await?;
            let response = self
                .http
                .post(format!("{}{}", self.config.base_url, path))
                .header(header::COOKIE, cookie)
                .json(body)
                .send()
                .await
                .with_context(|| format!("tracker request to {path} failed"))?;

            match self.classify(response, path).await? {
                AuthedOutcome::Value(value) => return Ok(value),
                AuthedOutcome::SessionExpired if attempt == 0 => {
                    self.clear_session().await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                AuthedOutcome::SessionExpired => {
                    bail!("tracker session expired and re-authentication did not stick")
                }
                AuthedOutcome::NotFound => bail!("tracker endpoint {path} not found"),
            }
        }
        unreachable!("authed_post loops at most twice");
    }

    async fn authed_get(&self, path: &str) -> Result<Option<Value>> {
        for attempt in 0..2 {
            let cookie = self.ensure_session().await?;
            let response = self
                .http
                .get(format!("{}{}", self.config.base_url, path))
                .header(header::COOKIE, cookie)
                .send()
                .await
                .with_context(|| format!("tracker request to {path} failed"))?;

            match self.classify(response, path).await? {
                AuthedOutcome::Value(value) => return Ok(Some(value)),
                AuthedOutcome::NotFound => return Ok(None),
                AuthedOutcome::SessionExpired if attempt == 0 => {
                    self.clear_session().await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                AuthedOutcome::SessionExpired => {
                    bail!("tracker session expired and re-authentication did not stick")
                }
            }
        }
        unreachable!("authed_get loops at most twice");
    }

    async fn classify(&self, response: reqwest::Response, path: &str) -> Result<AuthedOutcome> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            debug!(path, "tracker returned 401; re-authenticating");
            return Ok(AuthedOutcome::SessionExpired);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(AuthedOutcome::NotFound);
        }
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read tracker response from {path}"))?;
        if !status.is_success() {
            return Err(TrackerStatusError {
                status: status.as_u16(),
                detail: format!(
                    "{path}: {}",
                    truncate_for_error(&body, ERROR_BODY_MAX_CHARS)
                ),
            }
            .into());
        }
        let value: Value = serde_json::from_str(&body).with_context(|| {
            format!(
                "tracker returned non-json body for {path}: {}",
                truncate_for_error(&body, ERROR_BODY_MAX_CHARS)
            )
        })?;
        // The tracker signals an expired session with a redirect envelope
        // instead of a 401.
        if value.get("type").and_then(Value::as_str) == Some("redirect") {
            debug!(path, "tracker returned redirect envelope; re-authenticating");
            return Ok(AuthedOutcome::SessionExpired);
        }
        Ok(AuthedOutcome::Value(value))
    }

    async fn ensure_session(&self) -> Result<String> {
        if let Some(cookie) = self.session_cookie.lock().await.as_ref() {
            return Ok(cookie.clone());
        }
        let cookie = self.authenticate().await?;
        *self.session_cookie.lock().await = Some(cookie.clone());
        Ok(cookie)
    }

    async fn clear_session(&self) {
        *self.session_cookie.lock().await = None;
    }

    async fn authenticate(&self) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/api/auth/basic/login", self.config.base_url))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .context("tracker login request failed")?;
        let status = response.status();
        if !(status.is_success() || status == StatusCode::FOUND) {
            bail!("tracker login returned {status}");
        }

        let mut cookie_pairs = Vec::new();
        for value in response.headers().get_all(header::SET_COOKIE) {
            let raw = value
                .to_str()
                .context("tracker set-cookie header was not valid ascii")?;
            if let Some(pair) = raw.split(';').next() {
                let pair = pair.trim();
                if !pair.is_empty() {
                    cookie_pairs.push(pair.to_string());
                }
            }
        }
        if cookie_pairs.is_empty() {
            bail!("tracker login succeeded but set no session cookie");
        }
        debug!("tracker session established");
        Ok(cookie_pairs.join("; "))
    }
}

enum AuthedOutcome {
    Value(Value),
    SessionExpired,
    NotFound,
}

fn value_is_success(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool).unwrap_or(false)
}

fn response_error_text(value: &Value) -> String {
    value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

fn value_to_id_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_parse_is_lenient() {
        assert_eq!(
            RemoteTrackerStatus::parse(" Fulfilled "),
            Some(RemoteTrackerStatus::Fulfilled)
        );
        assert_eq!(
            RemoteTrackerStatus::parse("canceled"),
            Some(RemoteTrackerStatus::Cancelled)
        );
        assert_eq!(
            RemoteTrackerStatus::parse("open"),
            Some(RemoteTrackerStatus::Pending)
        );
        assert_eq!(RemoteTrackerStatus::parse("archived"), None);
    }

    #[test]
    fn only_resolved_statuses_are_terminal() {
        assert!(RemoteTrackerStatus::Fulfilled.is_terminal());
        assert!(RemoteTrackerStatus::Rejected.is_terminal());
        assert!(RemoteTrackerStatus::Cancelled.is_terminal());
        assert!(!RemoteTrackerStatus::Pending.is_terminal());
        assert!(!RemoteTrackerStatus::Approved.is_terminal());
    }

    #[test]
    fn client_requires_configuration() {
        let error = TrackerClient::new(TrackerClientConfig::default()).expect_err("no config");
        assert!(error.to_string().contains("credentials"));
    }

    #[test]
    fn remote_id_values_normalize_to_strings() {
        assert_eq!(value_to_id_string(&serde_json::json!("ggr-5")), "ggr-5");
        assert_eq!(value_to_id_string(&serde_json::json!(42)), "42");
    }
}
