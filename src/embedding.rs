//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`HttpProvider`]** — calls a generic `POST /embed` endpoint.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API.
//!
//! Every failure surfaces as a typed [`EmbeddingError`]; there is no silent
//! fallback to a zero vector. The indexer decides what a failed embedding
//! means for a document (see `index::index_batch` and the
//! `embedding.on_failure` policy).
//!
//! Also provides vector utilities for BLOB storage:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! Remote providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Failure classes an embedding call can surface.
///
/// Callers must be able to distinguish "not configured" from "the model is
/// down" from "the model returned garbage"; the indexing policy treats them
/// all as failures but logs them differently.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("embedding API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed embedding response: {0}")]
    Malformed(String),
    #[error("embedding configuration error: {0}")]
    Config(String),
}

/// Trait for embedding providers.
///
/// Carries provider metadata; the actual computation is performed by
/// [`embed_texts`] (kept as a free function due to async trait limitations).
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
}

/// Embed a batch of texts using the configured provider.
///
/// Returns one vector per input text, in input order. Any vector whose
/// length differs from the configured `dims` is rejected as
/// [`EmbeddingError::Malformed`] — a wrong-sized vector must never be
/// presented as valid.
pub async fn embed_texts(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    match config.provider.as_str() {
        "http" => embed_http(config, texts).await,
        "openai" => embed_openai(config, texts).await,
        "disabled" => Err(EmbeddingError::Disabled),
        other => Err(EmbeddingError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Embed a single query text.
///
/// Convenience wrapper around [`embed_texts`] for embedding a search query
/// on the fly.
pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| EmbeddingError::Malformed("empty embedding response".to_string()))
}

// ============ Disabled Provider ============

/// A no-op embedding provider used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ HTTP Provider ============

/// Generic HTTP embedding provider.
///
/// Calls `POST {endpoint}` with `{"model": ..., "input": [...]}` and expects
/// `{"embeddings": [[...], ...]}` in response. Any OpenAI-incompatible
/// self-hosted embedding service fits behind this shape.
pub struct HttpProvider {
    model: String,
    dims: usize,
}

impl HttpProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EmbeddingError::Config("embedding.model required".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| EmbeddingError::Config("embedding.dims required".to_string()))?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for HttpProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EmbeddingError::Config("embedding.model required".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| EmbeddingError::Config("embedding.dims required".to_string()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(EmbeddingError::Config(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>, EmbeddingError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "http" => Ok(Box::new(HttpProvider::new(config)?)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        other => Err(EmbeddingError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Remote calls ============

async fn embed_http(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let endpoint = config
        .endpoint
        .as_ref()
        .ok_or_else(|| EmbeddingError::Config("embedding.endpoint required".to_string()))?;

    let body = serde_json::json!({
        "model": config.model,
        "input": texts,
    });

    let json = post_with_retry(config, endpoint, None, &body).await?;

    let rows = json
        .get("embeddings")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Malformed("missing embeddings array".to_string()))?;

    collect_vectors(rows.iter(), texts.len(), config.dims)
}

async fn embed_openai(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| EmbeddingError::Config("OPENAI_API_KEY not set".to_string()))?;

    let endpoint = config
        .endpoint
        .as_deref()
        .unwrap_or("https://api.openai.com/v1/embeddings");

    let body = serde_json::json!({
        "model": config.model,
        "input": texts,
    });

    let json = post_with_retry(config, endpoint, Some(&api_key), &body).await?;

    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Malformed("missing data array".to_string()))?;

    collect_vectors(
        data.iter().map(|item| item.get("embedding").unwrap_or(item)),
        texts.len(),
        config.dims,
    )
}

/// POST a JSON body with exponential backoff on 429/5xx/transport errors.
async fn post_with_retry(
    config: &EmbeddingConfig,
    endpoint: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value, EmbeddingError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| EmbeddingError::Unreachable(e.to_string()))?;

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(endpoint).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| EmbeddingError::Malformed(e.to_string()));
                }

                let message = response.text().await.unwrap_or_default();

                // Rate limited or server error — retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(EmbeddingError::Api {
                        status: status.as_u16(),
                        message,
                    });
                    continue;
                }

                // Client error (not 429) — don't retry
                return Err(EmbeddingError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
            Err(e) => {
                last_err = Some(EmbeddingError::Unreachable(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| EmbeddingError::Unreachable("embedding failed after retries".into())))
}

/// Parse an iterator of JSON arrays into vectors, enforcing count and dims.
fn collect_vectors<'a>(
    rows: impl Iterator<Item = &'a serde_json::Value>,
    expected_count: usize,
    expected_dims: Option<usize>,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut embeddings = Vec::with_capacity(expected_count);

    for row in rows {
        let values = row
            .as_array()
            .ok_or_else(|| EmbeddingError::Malformed("embedding is not an array".to_string()))?;

        let mut vec = Vec::with_capacity(values.len());
        for v in values {
            let f = v.as_f64().ok_or_else(|| {
                EmbeddingError::Malformed("non-numeric embedding component".to_string())
            })?;
            vec.push(f as f32);
        }

        if let Some(dims) = expected_dims {
            if vec.len() != dims {
                return Err(EmbeddingError::Malformed(format!(
                    "expected {} dims, got {}",
                    dims,
                    vec.len()
                )));
            }
        }

        embeddings.push(vec);
    }

    if embeddings.len() != expected_count {
        return Err(EmbeddingError::Malformed(format!(
            "expected {} embeddings, got {}",
            expected_count,
            embeddings.len()
        )));
    }

    Ok(embeddings)
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing a BLOB
/// of `vec.len() × 4` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
