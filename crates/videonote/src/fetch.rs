use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use humansize::{format_size, DECIMAL};
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::NoteConfig;
use crate::error::FetchError;

/// Turns an opaque file handle into a URL that can be downloaded with a plain GET
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, handle: &str) -> Result<String, FetchError>;
}

/// Treats the handle itself as the download URL
#[derive(Debug, Clone, Default)]
pub struct DirectUrlResolver;

#[async_trait]
impl UrlResolver for DirectUrlResolver {
    async fn resolve(&self, handle: &str) -> Result<String, FetchError> {
        if handle.starts_with("http://") || handle.starts_with("https://") {
            Ok(handle.to_string())
        } else {
            Err(FetchError::Resolve {
                handle: handle.to_string(),
                reason: "not an http(s) url".to_string(),
            })
        }
    }
}

/// Resolves file ids through the bot API `getFile` method
#[derive(Clone)]
pub struct BotApiResolver {
    client: Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct GetFileResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct RemoteFile {
    #[serde(default)]
    file_path: Option<String>,
}

impl BotApiResolver {
    pub fn new(client: Client, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn resolve_error(handle: &str, reason: impl Into<String>) -> FetchError {
        FetchError::Resolve {
            handle: handle.to_string(),
            reason: reason.into(),
        }
    }
}

// The token is part of every URL built here, so errors drop the URL.
#[async_trait]
impl UrlResolver for BotApiResolver {
    async fn resolve(&self, handle: &str) -> Result<String, FetchError> {
        let endpoint = format!("{}/bot{}/getFile", self.api_base, self.token);
        let response = self
            .client
            .get(&endpoint)
            .query(&[("file_id", handle)])
            .send()
            .await
            .map_err(|e| Self::resolve_error(handle, e.without_url().to_string()))?;

        // Errors come back as JSON too (`ok: false` plus a description)
        let status = response.status();
        let body: GetFileResponse = response
            .json()
            .await
            .map_err(|e| Self::resolve_error(handle, format!("status {}: {}", status, e.without_url())))?;

        if !body.ok {
            let reason = body
                .description
                .unwrap_or_else(|| format!("getFile failed with status {}", status));
            return Err(Self::resolve_error(handle, reason));
        }

        let file_path = body
            .result
            .and_then(|f| f.file_path)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Self::resolve_error(handle, "response carries no file_path"))?;

        Ok(format!(
            "{}/file/bot{}/{}",
            self.api_base,
            self.token,
            file_path.trim_start_matches('/')
        ))
    }
}

/// Replace the token in a `/bot<token>/` path segment so the URL can be logged
pub fn redact_token(url: &str) -> String {
    // The host may itself start with "bot", so search the path only
    let path_start = url
        .find("://")
        .map(|i| i + "://".len())
        .map(|authority| url[authority..].find('/').map_or(url.len(), |i| authority + i))
        .unwrap_or(0);
    match url[path_start..].find("/bot").map(|i| path_start + i) {
        Some(start) => {
            let token_start = start + "/bot".len();
            let token_end = url[token_start..]
                .find('/')
                .map(|i| token_start + i)
                .unwrap_or(url.len());
            format!("{}***{}", &url[..token_start], &url[token_end..])
        }
        None => url.to_string(),
    }
}

/// Downloads the full body behind a file handle. No retries: the first
/// failure is final.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    resolver: Arc<dyn UrlResolver>,
}

impl Fetcher {
    pub fn new(client: Client, resolver: Arc<dyn UrlResolver>) -> Self {
        Self { client, resolver }
    }

    /// HTTP client carrying the configured user agent and request timeout
    pub fn build_client(cfg: &NoteConfig) -> Result<Client> {
        Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.fetch_timeout())
            .build()
            .context("Failed to build HTTP client")
    }

    pub async fn fetch(&self, handle: &str, cancel: &CancellationToken) -> Result<Bytes, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.download(handle) => result,
        }
    }

    async fn download(&self, handle: &str) -> Result<Bytes, FetchError> {
        let url = self.resolver.resolve(handle).await?;
        let shown = redact_token(&url);
        debug!("Downloading {}", shown);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: shown.clone(),
                source: e.without_url(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: shown, status });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Body {
            url: shown.clone(),
            source: e.without_url(),
        })?;

        debug!("Downloaded {} from {}", format_size(body.len(), DECIMAL), shown);
        Ok(body)
    }
}
