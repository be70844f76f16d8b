//! TOML configuration parsing and validation.
//!
//! Every section and field has a default, so an empty file is a valid
//! (disabled) configuration. String values of the form `${NAME}` are
//! replaced with the environment variable `NAME` when it is set.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RagConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_length: default_max_length(),
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// `local` when the fastembed backend is compiled in, otherwise `hash`.
/// Always a backend this build can construct.
fn default_provider() -> String {
    if cfg!(feature = "local-embeddings-fastembed") {
        "local".to_string()
    } else {
        "hash".to_string()
    }
}
fn default_batch_size() -> usize {
    32
}
fn default_max_length() -> usize {
    512
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    #[serde(default)]
    pub restrict_to_diff_files: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            max_context_length: default_max_context_length(),
            max_query_length: default_max_query_length(),
            restrict_to_diff_files: false,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_max_context_length() -> usize {
    2000
}
fn default_max_query_length() -> usize {
    1000
}

/// How the chunker cuts text into units.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SplitMethod {
    #[default]
    Token,
    Sentence,
    Character,
}

impl SplitMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitMethod::Token => "token",
            SplitMethod::Sentence => "sentence",
            SplitMethod::Character => "character",
        }
    }
}

impl fmt::Display for SplitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub split_by: SplitMethod,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            split_by: SplitMethod::default(),
            tokenizer: default_tokenizer(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    100
}
/// cl100k_base as a `tokenizer.json`.
fn default_tokenizer() -> String {
    "Xenova/gpt-4".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_max_files")]
    pub max_files_to_index: usize,
    #[serde(default = "default_true")]
    pub include_file_structure: bool,
    #[serde(default = "default_true")]
    pub include_readme: bool,
    #[serde(default = "default_true")]
    pub include_documentation: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            max_files_to_index: default_max_files(),
            include_file_structure: true,
            include_readme: true,
            include_documentation: true,
        }
    }
}

fn default_exclude_patterns() -> Vec<String> {
    [
        "node_modules",
        "target",
        "dist",
        "build",
        "__pycache__",
        ".venv",
        "venv",
        "*.lock",
        "*.min.js",
        "*.min.css",
        "package-lock.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_files() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./.rag_cache")
}

impl EmbeddingConfig {
    /// Model name with the provider's default filled in.
    pub fn model_name(&self) -> String {
        self.model.clone().unwrap_or_else(|| match self.provider.as_str() {
            "hash" => "feature-hash".to_string(),
            _ => "all-minilm-l6-v2".to_string(),
        })
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }

        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }

        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }

        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0 when set");
        }

        match self.embedding.provider.as_str() {
            "hash" | "local" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() {
                    bail!(
                        "embedding.dims must be set when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, local, openai, or ollama.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut raw: toml::Value =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    substitute_env_vars(&mut raw);

    let config: Config = raw
        .try_into()
        .with_context(|| "Invalid configuration values")?;
    config.validate()?;

    Ok(config)
}

fn substitute_env_vars(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
                if let Ok(resolved) = std::env::var(name) {
                    *s = resolved;
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(substitute_env_vars),
        toml::Value::Table(table) => table
            .iter_mut()
            .for_each(|(_, v)| substitute_env_vars(v)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert!(!cfg.rag.enabled);
        assert_eq!(cfg.retrieval.top_k, 10);
        assert_eq!(cfg.retrieval.max_context_length, 2000);
        assert_eq!(cfg.chunking.chunk_size, 500);
        assert_eq!(cfg.chunking.chunk_overlap, 100);
        assert_eq!(cfg.chunking.split_by, SplitMethod::Token);
        assert_eq!(cfg.collector.max_files_to_index, 1000);
        assert_eq!(cfg.storage.cache_dir, PathBuf::from("./.rag_cache"));
        assert_eq!(cfg.chunking.tokenizer, "Xenova/gpt-4");
    }

    #[test]
    fn default_provider_matches_compiled_backends() {
        let cfg = parse_config("[rag]\nenabled = true\n").unwrap();
        if cfg!(feature = "local-embeddings-fastembed") {
            assert_eq!(cfg.embedding.provider, "local");
        } else {
            assert_eq!(cfg.embedding.provider, "hash");
            assert!(crate::embedding::create_embedder(&cfg.embedding).is_ok());
        }
    }

    #[test]
    fn parses_sections() {
        let cfg = parse_config(
            r#"
[rag]
enabled = true

[embedding]
provider = "hash"
dims = 64

[chunking]
split_by = "sentence"
chunk_size = 200

[retrieval]
top_k = 3
similarity_threshold = 0.2
"#,
        )
        .unwrap();
        assert!(cfg.rag.enabled);
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(cfg.embedding.dims, Some(64));
        assert_eq!(cfg.chunking.split_by, SplitMethod::Sentence);
        assert_eq!(cfg.retrieval.top_k, 3);
        assert!((cfg.retrieval.similarity_threshold - 0.2).abs() < 1e-6);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse_config("[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(parse_config("[chunking]\nchunk_size = 0\n").is_err());
    }

    #[test]
    fn remote_provider_requires_dims() {
        assert!(parse_config("[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse_config("[embedding]\nprovider = \"openai\"\ndims = 1536\n").is_ok());
    }

    #[test]
    fn rejects_unknown_split_method() {
        assert!(parse_config("[chunking]\nsplit_by = \"paragraph\"\n").is_err());
    }

    #[test]
    fn substitutes_environment_variables() {
        std::env::set_var("RCX_TEST_CACHE_DIR", "/tmp/rcx-cache");
        let cfg = parse_config("[storage]\ncache_dir = \"${RCX_TEST_CACHE_DIR}\"\n").unwrap();
        assert_eq!(cfg.storage.cache_dir, PathBuf::from("/tmp/rcx-cache"));

        let cfg = parse_config("[storage]\ncache_dir = \"${RCX_TEST_UNSET_VARIABLE}\"\n").unwrap();
        assert_eq!(
            cfg.storage.cache_dir,
            PathBuf::from("${RCX_TEST_UNSET_VARIABLE}")
        );
    }

    #[test]
    fn substitutes_inside_nested_tables_and_arrays() {
        std::env::set_var("RCX_TEST_EXCLUDE", "generated");
        let cfg = parse_config(
            "[collector]\nexclude_patterns = [\"${RCX_TEST_EXCLUDE}\", \"*.lock\"]\n",
        )
        .unwrap();
        assert_eq!(cfg.collector.exclude_patterns, vec!["generated", "*.lock"]);
    }
}
