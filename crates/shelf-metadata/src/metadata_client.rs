//! HTTP client for the game metadata provider.
//!
//! Token handling follows the provider's client-credentials flow: the
//! access token is cached until shortly before expiry and refreshed on
//! demand. Lookup failures are reported to the caller, which treats them
//! as non-fatal and proceeds without metadata.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use shelf_core::{current_unix_timestamp, normalize_title};

use crate::metadata_match::{choose_confident_match, MetadataCandidate, MetadataMatch};

const TOKEN_EXPIRY_MARGIN_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
/// Public struct `MetadataClientConfig` used across Shelfkeeper components.
pub struct MetadataClientConfig {
    pub api_base: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub request_timeout_ms: u64,
    pub search_limit: usize,
}

impl Default for MetadataClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.igdb.com/v4".to_string(),
            auth_url: "https://id.twitch.tv/oauth2/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout_ms: 5_000,
            search_limit: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_unix: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct GameRow {
    id: u64,
    name: String,
    #[serde(default)]
    cover: Option<CoverRow>,
    #[serde(default)]
    alternative_names: Vec<AlternativeNameRow>,
}

#[derive(Debug, Deserialize)]
struct CoverRow {
    url: String,
}

#[derive(Debug, Deserialize)]
struct AlternativeNameRow {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlatformRow {
    id: u64,
    name: String,
    #[serde(default)]
    slug: Option<String>,
}

/// Metadata provider client with token and platform-id caching.
#[derive(Debug)]
pub struct MetadataClient {
    http: reqwest::Client,
    config: MetadataClientConfig,
    token: Mutex<Option<CachedToken>>,
    platform_ids: Mutex<HashMap<String, u64>>,
}

impl MetadataClient {
    pub fn new(config: MetadataClientConfig) -> Result<Self> {
        if config.client_id.trim().is_empty() || config.client_secret.trim().is_empty() {
            bail!("metadata provider credentials are not configured");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create metadata http client")?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
            platform_ids: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves `(platform, title)` to a confident provider match, or None.
    pub async fn lookup(&self, platform: &str, title: &str) -> Result<Option<MetadataMatch>> {
        let candidates = self.search_candidates(platform, title).await?;
        let chosen = choose_confident_match(title, &candidates);
        if chosen.is_none() {
            debug!(
                platform,
                title, "metadata lookup found no confident match"
            );
        }
        Ok(chosen)
    }

    async fn search_candidates(
        &self,
        platform: &str,
        title: &str,
    ) -> Result<Vec<MetadataCandidate>> {
        let token = self.ensure_access_token().await?;
        let platform_id = self.resolve_platform_id(&token, platform).await?;

        let escaped = title.replace('"', "\\\"");
        let mut query = format!(
            "search \"{escaped}\"; fields id,name,cover.url,alternative_names.name; limit {};",
            self.config.search_limit.max(1)
        );
        if let Some(platform_id) = platform_id {
            query.push_str(&format!(" where platforms = ({platform_id});"));
        }

        let rows: Vec<GameRow> = self
            .provider_post(&token, "games", query)
            .await
            .context("metadata search failed")?;
        Ok(rows
            .into_iter()
            .map(|row| MetadataCandidate {
                provider_id: row.id,
                name: row.name,
                alternative_names: row
                    .alternative_names
                    .into_iter()
                    .map(|alternative| alternative.name)
                    .collect(),
                cover_url: row.cover.map(|cover| upscale_cover_url(&cover.url)),
            })
            .collect())
    }

    async fn resolve_platform_id(&self, token: &str, platform: &str) -> Result<Option<u64>> {
        let key = normalize_title(platform);
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(id) = self.platform_ids.lock().await.get(&key) {
            return Ok(Some(*id));
        }

        let escaped = key.replace('"', "\\\"");
        let query = format!("search \"{escaped}\"; fields id,name,slug; limit 20;");
        let rows: Vec<PlatformRow> = self
            .provider_post(token, "platforms", query)
            .await
            .context("platform resolution failed")?;
        let matched = rows.into_iter().find(|row| {
            normalize_title(&row.name) == key
                || row
                    .slug
                    .as_deref()
                    .is_some_and(|slug| normalize_title(slug) == key)
        });

        match matched {
            Some(row) => {
                self.platform_ids.lock().await.insert(key, row.id);
                Ok(Some(row.id))
            }
            None => {
                debug!(platform, "no provider platform id; searching unconstrained");
                Ok(None)
            }
        }
    }

    async fn provider_post<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        endpoint: &str,
        query: String,
    ) -> Result<T> {
        let url = format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            endpoint
        );
        let response = self
            .http
            .post(&url)
            .header("Client-ID", self.config.client_id.as_str())
            .bearer_auth(token)
            .body(query)
            .send()
            .await
            .with_context(|| format!("metadata provider request to {endpoint} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "metadata provider returned {} for {endpoint}: {}",
                status,
                body.chars().take(200).collect::<String>()
            );
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode metadata {endpoint} response"))
    }

    async fn ensure_access_token(&self) -> Result<String> {
        let now = current_unix_timestamp();
        if let Some(cached) = self.token.lock().await.as_ref() {
            if cached.expires_unix > now {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.config.auth_url)
            .query(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("metadata token request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("metadata token endpoint returned {status}");
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("failed to decode metadata token response")?;

        let expires_unix = now
            .saturating_add(token.expires_in)
            .saturating_sub(TOKEN_EXPIRY_MARGIN_SECONDS);
        let access_token = token.access_token.clone();
        *self.token.lock().await = Some(CachedToken {
            access_token: token.access_token,
            expires_unix,
        });
        Ok(access_token)
    }
}

/// The provider's search results reference thumbnail renditions; requests
/// display full covers, so swap the size segment and force https.
fn upscale_cover_url(raw: &str) -> String {
    let sized = raw.replace("t_thumb", "t_cover_big");
    if let Some(stripped) = sized.strip_prefix("//") {
        format!("https://{stripped}")
    } else {
        sized
    }
}
