//! Upstream playlist and EPG fetching.
//!
//! Bodies are cached for a configurable TTL. When a refresh fails the last
//! good copy is served instead.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use tvrelay_core::Config;

/// Upstream fetch errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("No {0} URL configured")]
    NotConfigured(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

struct CachedBody {
    body: Bytes,
    fetched: Instant,
}

/// One upstream document with its cache slot.
struct CachedSource {
    kind: &'static str,
    url: Option<String>,
    ttl: Duration,
    cache: RwLock<Option<CachedBody>>,
}

impl CachedSource {
    fn new(kind: &'static str, url: Option<String>, ttl: Duration) -> Self {
        Self {
            kind,
            url: url.filter(|u| !u.trim().is_empty()),
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn fresh(&self) -> Option<Bytes> {
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.fetched.elapsed() < self.ttl)
            .map(|cached| cached.body.clone())
    }

    async fn get(&self, client: &UpstreamClient) -> Result<Bytes, UpstreamError> {
        let url = self.url.as_deref().ok_or(UpstreamError::NotConfigured(self.kind))?;

        if let Some(body) = self.fresh().await {
            debug!(kind = self.kind, "Serving cached upstream body");
            return Ok(body);
        }

        match client.fetch(url).await {
            Ok(body) => {
                info!(kind = self.kind, bytes = body.len(), "Fetched upstream body");
                *self.cache.write().await = Some(CachedBody {
                    body: body.clone(),
                    fetched: Instant::now(),
                });
                Ok(body)
            }
            Err(e) => {
                let stale = self.cache.read().await.as_ref().map(|c| c.body.clone());
                match stale {
                    Some(body) => {
                        warn!(kind = self.kind, error = %e, "Upstream fetch failed, serving stale copy");
                        Ok(body)
                    }
                    None => Err(e),
                }
            }
        }
    }
}

/// HTTP client for the playlist and EPG providers.
pub struct UpstreamClient {
    http: reqwest::Client,
    playlist: CachedSource,
    epg: CachedSource,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        if let Some(ua) = config.headers.user_agent.as_deref() {
            let value = HeaderValue::from_str(ua)
                .map_err(|_| UpstreamError::Config(format!("Invalid user agent: {ua}")))?;
            headers.insert(USER_AGENT, value);
        }

        // reqwest is built with rustls-no-provider; `Err` means a provider is
        // already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.cache.fetch_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            playlist: CachedSource::new(
                "playlist",
                config.sources.m3u_url.clone(),
                Duration::from_secs(config.cache.playlist_ttl_secs),
            ),
            epg: CachedSource::new(
                "EPG",
                config.sources.epg_url.clone(),
                Duration::from_secs(config.cache.epg_ttl_secs),
            ),
        })
    }

    /// Fetch a URL without caching.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, UpstreamError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.bytes().await?)
    }

    /// Raw upstream playlist text.
    pub async fn playlist(&self) -> Result<String, UpstreamError> {
        let body = self.playlist.get(self).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// EPG document, unmodified.
    pub async fn epg(&self) -> Result<Bytes, UpstreamError> {
        self.epg.get(self).await
    }
}
