//! Model catalog — context windows, output limits, and pricing.
//!
//! The engine only consumes `context_length` and `max_output` for sizing and
//! the per-million prices for cost previews. The catalog is the sole
//! process-wide cache; it is cheap to rebuild, so a fetch failure after
//! expiry just surfaces as a provider error on the next start request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::LlmError;

/// One entry from the provider's model listing.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: usize,
    pub max_output: Option<usize>,
    /// USD per million input tokens.
    pub input_price_per_million: f64,
    /// USD per million output tokens.
    pub output_price_per_million: f64,
    pub is_free: bool,
}

/// Lookup of model metadata by id.
#[async_trait]
pub trait ModelDirectory: Send + Sync {
    async fn get(&self, model_id: &str) -> Result<Option<ModelInfo>, LlmError>;
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireCatalog {
    data: Vec<WireModel>,
}

#[derive(Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    context_length: usize,
    #[serde(default)]
    top_provider: Option<WireTopProvider>,
    #[serde(default)]
    pricing: Option<WirePricing>,
}

#[derive(Deserialize)]
struct WireTopProvider {
    #[serde(default)]
    max_completion_tokens: Option<usize>,
}

#[derive(Deserialize)]
struct WirePricing {
    /// USD per token, as a decimal string.
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    completion: Option<String>,
}

impl WireModel {
    fn into_info(self) -> ModelInfo {
        let per_token = |s: &Option<String>| {
            s.as_deref()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let (input, output) = match &self.pricing {
            Some(p) => (per_token(&p.prompt) * 1e6, per_token(&p.completion) * 1e6),
            None => (0.0, 0.0),
        };
        ModelInfo {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            context_length: self.context_length,
            max_output: self.top_provider.and_then(|t| t.max_completion_tokens),
            input_price_per_million: input,
            output_price_per_million: output,
            is_free: input == 0.0 && output == 0.0,
            id: self.id,
        }
    }
}

// ── HTTP catalog with TTL cache ─────────────────────────────────────

struct CachedCatalog {
    fetched_at: Instant,
    models: HashMap<String, ModelInfo>,
}

/// Fetches `{base}/models` and caches the result for `ttl`.
pub struct HttpCatalog {
    base_url: String,
    client: reqwest::Client,
    ttl: Duration,
    cache: RwLock<Option<CachedCatalog>>,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> Result<HashMap<String, ModelInfo>, LlmError> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(|e| LlmError::TransientNetwork(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(super::provider::classify_http_error(status, &message));
        }

        let wire: WireCatalog = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let models = wire
            .data
            .into_iter()
            .map(|m| {
                let info = m.into_info();
                (info.id.clone(), info)
            })
            .collect();
        Ok(models)
    }
}

#[async_trait]
impl ModelDirectory for HttpCatalog {
    async fn get(&self, model_id: &str) -> Result<Option<ModelInfo>, LlmError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.models.get(model_id).cloned());
                }
            }
        }

        let models = self.fetch().await?;
        tracing::debug!(count = models.len(), "Model catalog refreshed");

        let mut cache = self.cache.write().await;
        let info = models.get(model_id).cloned();
        *cache = Some(CachedCatalog {
            fetched_at: Instant::now(),
            models,
        });
        Ok(info)
    }
}

/// Fixed in-memory catalog, for tests and offline runs.
pub struct StaticCatalog {
    models: HashMap<String, ModelInfo>,
}

impl StaticCatalog {
    pub fn new(models: impl IntoIterator<Item = ModelInfo>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }
}

#[async_trait]
impl ModelDirectory for StaticCatalog {
    async fn get(&self, model_id: &str) -> Result<Option<ModelInfo>, LlmError> {
        Ok(self.models.get(model_id).cloned())
    }
}
