//! Enrichment Gateway
//!
//! Optional external lookup that supplements the static rules with a
//! canonical title, a total chapter count and a translation hint. Every
//! failure is reported as [`EnrichmentError`] and is never fatal: callers
//! simply classify without enrichment.

use crate::config::FolioConfig;
use crate::document::DocumentMetadata;
use crate::rules::Label;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Why enrichment data is unavailable for a lookup
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by enrichment service")]
    RateLimited,

    #[error("cooling down after rate limit, {remaining_secs}s left")]
    CoolingDown { remaining_secs: u64 },

    #[error("credential rejected: {0}")]
    Credential(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

// =============================================================================
// Data
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentData {
    #[serde(default)]
    pub canonical_title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub total_chapters: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub translation_hint: Option<Label>,
}

/// Body sent to the lookup endpoint
#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    file_name: &'a str,
    title: Option<&'a str>,
    author: Option<&'a str>,
    chapter_count: u32,
}

// =============================================================================
// Gateway trait
// =============================================================================

#[async_trait]
pub trait EnrichmentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, metadata: &DocumentMetadata) -> Result<EnrichmentData, EnrichmentError>;
}

/// Run a lookup under a deadline; an elapsed deadline is `Timeout`.
pub async fn lookup_with_timeout(
    gateway: &dyn EnrichmentGateway,
    metadata: &DocumentMetadata,
    timeout: Duration,
) -> Result<EnrichmentData, EnrichmentError> {
    match tokio::time::timeout(timeout, gateway.lookup(metadata)).await {
        Ok(result) => result,
        Err(_) => Err(EnrichmentError::Timeout(timeout)),
    }
}

// =============================================================================
// HTTP gateway
// =============================================================================

/// JSON-over-HTTP lookup with call spacing and a rate-limit cooldown.
pub struct HttpEnrichmentGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    min_interval: Duration,
    cooldown: Duration,
    next_slot: tokio::sync::Mutex<Option<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl fmt::Debug for HttpEnrichmentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEnrichmentGateway")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("min_interval", &self.min_interval)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl HttpEnrichmentGateway {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        requests_per_minute: u32,
        cooldown: Duration,
    ) -> Self {
        let rpm = requests_per_minute.max(1) as u64;
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            min_interval: Duration::from_millis(60_000 / rpm),
            cooldown,
            next_slot: tokio::sync::Mutex::new(None),
            cooldown_until: Mutex::new(None),
        }
    }

    pub fn from_config(config: &FolioConfig) -> Self {
        if config.enrichment_api_key().is_none() {
            tracing::warn!(
                key = %config.enrichment.api_key_name,
                "No API key configured for enrichment; requests will be unauthenticated"
            );
        }
        Self::new(
            config.enrichment.endpoint.clone(),
            config.enrichment_api_key().map(str::to_string),
            config.enrichment.requests_per_minute,
            Duration::from_secs(config.enrichment.cooldown_minutes * 60),
        )
    }

    fn check_cooldown(&self) -> Result<(), EnrichmentError> {
        let mut until = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        match *until {
            Some(deadline) if deadline > Instant::now() => Err(EnrichmentError::CoolingDown {
                remaining_secs: deadline.saturating_duration_since(Instant::now()).as_secs(),
            }),
            Some(_) => {
                *until = None;
                tracing::info!("Enrichment cooldown finished");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn start_cooldown(&self) {
        let mut until = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        *until = Some(Instant::now() + self.cooldown);
        tracing::warn!(
            cooldown_secs = self.cooldown.as_secs(),
            "Enrichment service rate-limited us; pausing lookups"
        );
    }

    /// Wait for this caller's request slot.
    async fn throttle(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl EnrichmentGateway for HttpEnrichmentGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn lookup(&self, metadata: &DocumentMetadata) -> Result<EnrichmentData, EnrichmentError> {
        self.check_cooldown()?;
        self.throttle().await;

        let body = LookupRequest {
            file_name: &metadata.file_name,
            title: metadata.title.as_deref(),
            author: metadata.author.as_deref(),
            chapter_count: metadata.chapter_count,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EnrichmentError::Http(e.without_url().to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.start_cooldown();
            return Err(EnrichmentError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EnrichmentError::Credential(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(EnrichmentError::Http(format!("HTTP {}", status.as_u16())));
        }

        let data: EnrichmentData = response
            .json()
            .await
            .map_err(|e| EnrichmentError::InvalidResponse(e.without_url().to_string()))?;
        tracing::debug!(
            file = %metadata.file_name,
            total_chapters = ?data.total_chapters,
            hint = ?data.translation_hint,
            "Enrichment lookup succeeded"
        );
        Ok(data)
    }
}
