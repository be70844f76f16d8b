//! Embedding backend abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete backends:
//! - **[`HashEmbedder`]**: deterministic feature hashing; offline, used in tests.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs models locally via fastembed (feature
//!   `local-embeddings-fastembed`); no network calls after model download.
//!
//! Every backend only implements [`Embedder::embed_batch`]. Splitting input
//! into batches, shape checks, and L2 normalization happen once in
//! [`embed_all`], so inner products between any two outputs are cosine
//! similarities and batch size never changes results.
//!
//! Failures surface as [`ContextError::Model`] and are not retried here; the
//! caller decides whether a failed build is fatal.

mod hashing;

pub use hashing::HashEmbedder;

use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{ContextError, Result};
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};

/// Approximate chars-per-token ratio used to bound remote inputs.
const CHARS_PER_TOKEN: usize = 4;

/// A text embedding backend producing fixed-dimension vectors.
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;

    /// Output dimensionality `d`.
    fn dimension(&self) -> usize;

    /// Preferred number of texts per backend call.
    fn batch_size(&self) -> usize;

    /// Embed one backend batch. Outputs need not be normalized.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed any number of texts into L2-normalized vectors, in input order.
    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_all(self, texts, &NoProgress)
    }

    /// Embed a single text.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_many(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| ContextError::Model("empty embedding response".to_string()))
    }
}

/// Batch, embed, validate and normalize `texts`, reporting progress per batch.
pub fn embed_all<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
    progress: &dyn IndexProgressReporter,
) -> Result<Vec<Vec<f32>>> {
    let total = texts.len() as u64;
    let dims = embedder.dimension();
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(embedder.batch_size().max(1)) {
        let vectors = embedder.embed_batch(batch)?;
        if vectors.len() != batch.len() {
            return Err(ContextError::Model(format!(
                "backend returned {} embeddings for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        for mut v in vectors {
            if v.len() != dims {
                return Err(ContextError::Model(format!(
                    "backend returned a {}-dimensional embedding, expected {}",
                    v.len(),
                    dims
                )));
            }
            normalize(&mut v);
            out.push(v);
        }
        progress.report(IndexProgressEvent::Embedding {
            n: out.len() as u64,
            total,
        });
    }

    Ok(out)
}

/// Scale `v` to unit L2 norm. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(ContextError::model)
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    config.dims.ok_or_else(|| {
        ContextError::Model(format!(
            "embedding.dims required for provider '{}'",
            config.provider
        ))
    })
}

// ============ OpenAI ============

/// Embedding backend using `POST https://api.openai.com/v1/embeddings`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_chars: usize,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ContextError::Model("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dims: required_dims(config)?,
            batch_size: config.batch_size,
            max_chars: config.max_length * CHARS_PER_TOKEN,
            api_key,
            client: http_client(config)?,
        })
    }
}

impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .map_err(ContextError::model)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().unwrap_or_default();
            return Err(ContextError::Model(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().map_err(ContextError::model)?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding` arrays, ordered by their `index` field.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ContextError::Model("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ContextError::Model("Invalid OpenAI response: missing embedding".into()))?;
        indexed.push((index, json_floats(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama ============

/// Embedding backend using a local Ollama instance's `/api/embed` endpoint.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_chars: usize,
    url: String,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            dims: required_dims(config)?,
            batch_size: config.batch_size,
            max_chars: config.max_length * CHARS_PER_TOKEN,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: http_client(config)?,
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<String> = texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .map_err(|e| {
                ContextError::Model(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().unwrap_or_default();
            return Err(ContextError::Model(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response.json().map_err(ContextError::model)?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ContextError::Model("Invalid Ollama response: missing embeddings array".into())
        })?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding.as_array().map(|a| json_floats(a)).ok_or_else(|| {
                ContextError::Model("Invalid Ollama response: embedding is not an array".into())
            })
        })
        .collect()
}

// ============ Local (fastembed) ============

/// Local inference through fastembed. The model is loaded once at
/// construction and guarded by a mutex because inference needs `&mut`.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config.model_name();
        let (fastembed_model, default_dims) = fastembed_model(&model_name)?;

        tracing::info!(model = %model_name, "loading local embedding model");
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model)
                .with_max_length(config.max_length)
                .with_show_download_progress(true),
        )
        .map_err(|e| {
            ContextError::Model(format!("Failed to initialize local embedding model: {}", e))
        })?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| ContextError::Model("embedding model lock poisoned".to_string()))?;
        model
            .embed(texts.to_vec(), Some(self.batch_size))
            .map_err(|e| ContextError::Model(format!("Local embedding failed: {}", e)))
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel;

    match name {
        "all-minilm-l6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
            Ok((EmbeddingModel::AllMiniLML6V2, 384))
        }
        "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((EmbeddingModel::BGELargeENV15, 1024)),
        "nomic-embed-text-v1.5" => Ok((EmbeddingModel::NomicEmbedTextV15, 768)),
        "multilingual-e5-small" => Ok((EmbeddingModel::MultilingualE5Small, 384)),
        other => Err(ContextError::Model(format!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ))),
    }
}

/// Create the [`Embedder`] selected by `embedding.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings-fastembed`) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::from_config(config))),
        "openai" => Ok(Box::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(ContextError::Model(
            "Local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        other => Err(ContextError::Model(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}
