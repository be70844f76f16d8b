//! Per-repository context orchestration.
//!
//! The [`ContextEngine`] owns the on-disk cache, one embedder and one
//! retriever. For a `(repo_url, branch)` pair it derives a cache key, keeps a
//! working copy under `repo_<key>/`, builds or loads the index artifacts
//! `<key>.vec` and `<key>.chunks.json`, and answers diff or free-text
//! queries with a length-bounded context string.
//!
//! Failures other than [`ContextError::Model`] are logged and absorbed:
//! preparation reports `false`, queries return an empty string.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::chunk::TextSplitter;
use crate::collector::RepositoryCollector;
use crate::config::Config;
use crate::diff_summary::extract_diff_summary;
use crate::embedding::{create_embedder, embed_all, Embedder};
use crate::error::{ContextError, Result};
use crate::git;
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};
use crate::retriever::{cached_keys, IndexArtifacts, Retriever};

/// Stable cache key for a repository and branch: 16 hex chars of SHA-256.
pub fn cache_key(repo_url: &str, branch: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", repo_url, branch).as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Delete one repository's artifacts and working copy under `cache_dir`, or
/// with no repository, empty the whole cache root and recreate it.
pub fn clear_cache_at(cache_dir: &Path, repo_url: Option<&str>, branch: &str) -> Result<()> {
    match repo_url {
        Some(url) => {
            let key = cache_key(url, branch);
            IndexArtifacts::for_key(cache_dir, &key).remove()?;
            let repo_dir = cache_dir.join(format!("repo_{}", key));
            if repo_dir.exists() {
                std::fs::remove_dir_all(&repo_dir)?;
            }
            tracing::info!(repo = %url, branch, "cleared cache");
        }
        None => {
            if cache_dir.exists() {
                std::fs::remove_dir_all(cache_dir)?;
            }
            std::fs::create_dir_all(cache_dir)?;
            tracing::info!(dir = %cache_dir.display(), "cleared all cached indexes");
        }
    }
    Ok(())
}

/// Log and swallow recoverable errors; pass model errors through.
fn absorb<T>(result: Result<T>, fallback: T, what: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "{}", what);
            Ok(fallback)
        }
    }
}

pub struct ContextEngine {
    config: Config,
    cache_dir: PathBuf,
    embedder: Box<dyn Embedder>,
    collector: RepositoryCollector,
    retriever: Retriever,
    /// Cache key of the index currently held by `retriever`.
    loaded_key: Option<String>,
    progress: Box<dyn IndexProgressReporter>,
}

impl ContextEngine {
    /// Create an engine with an explicit embedder. Creates the cache root.
    pub fn new(config: Config, embedder: Box<dyn Embedder>) -> Result<Self> {
        let cache_dir = config.storage.cache_dir.clone();
        std::fs::create_dir_all(&cache_dir)?;

        let splitter = TextSplitter::from_config(&config.chunking, &cache_dir);
        let collector = RepositoryCollector::new(&config.collector, splitter)?;
        let retriever = Retriever::new(&config.retrieval);

        Ok(Self {
            config,
            cache_dir,
            embedder,
            collector,
            retriever,
            loaded_key: None,
            progress: Box::new(NoProgress),
        })
    }

    /// Create an engine with the embedder selected by `embedding.provider`.
    pub fn from_config(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        Self::new(config, embedder)
    }

    pub fn set_progress(&mut self, progress: Box<dyn IndexProgressReporter>) {
        self.progress = progress;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.rag.enabled
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    fn artifacts(&self, key: &str) -> IndexArtifacts {
        IndexArtifacts::for_key(&self.cache_dir, key)
    }

    fn working_copy(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("repo_{}", key))
    }

    fn unload(&mut self) {
        self.retriever.clear();
        self.loaded_key = None;
    }

    /// Make the index for `(repo_url, branch)` available, building it if needed.
    ///
    /// Returns `Ok(false)` when disabled, when the fetch fails, or when the
    /// build produces nothing. Only model errors are returned as `Err`.
    pub fn prepare_context(&mut self, repo_url: &str, branch: &str) -> Result<bool> {
        if !self.is_enabled() {
            tracing::info!("{}", ContextError::Disabled);
            return Ok(false);
        }

        let key = cache_key(repo_url, branch);
        if self.artifacts(&key).exist() {
            match self.load(&key) {
                Ok(()) => return Ok(true),
                Err(e) => tracing::warn!(error = %e, "failed to load cached index, rebuilding"),
            }
        }

        let repo_dir = self.working_copy(&key);
        if let Err(e) = git::clone_or_update(repo_url, branch, &repo_dir) {
            tracing::warn!(repo = %repo_url, error = %e, "failed to fetch repository");
            return Ok(false);
        }
        if let Some(sha) = git::head_sha(&repo_dir) {
            tracing::info!(repo = %repo_url, branch, head = %sha, "working copy ready");
        }

        self.index_checkout(&repo_dir, repo_url, branch)
    }

    /// Build and persist the index for an already checked-out tree.
    pub fn index_checkout(&mut self, repo_root: &Path, repo_url: &str, branch: &str) -> Result<bool> {
        if !self.is_enabled() {
            tracing::info!("{}", ContextError::Disabled);
            return Ok(false);
        }

        let key = cache_key(repo_url, branch);
        let built = self.build(repo_root, &key);
        absorb(built, false, "failed to build index")
    }

    fn build(&mut self, repo_root: &Path, key: &str) -> Result<bool> {
        self.unload();

        let files = self.collector.readable_files(repo_root);
        self.progress.report(IndexProgressEvent::Scanning {
            files: files.len() as u64,
        });

        let chunks = self.collector.process_files(repo_root, &files);
        self.progress.report(IndexProgressEvent::Chunked {
            chunks: chunks.len() as u64,
        });
        if chunks.is_empty() {
            return Err(ContextError::Build("no chunks generated from repository".into()));
        }

        tracing::info!(chunks = chunks.len(), model = %self.embedder.model_name(), "embedding chunks");
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(self.embedder.as_ref(), &texts, self.progress.as_ref())?;

        self.retriever.build(chunks, vectors)?;
        if let Err(e) = self
            .retriever
            .save(&self.artifacts(key), self.embedder.model_name())
        {
            self.unload();
            return Err(e);
        }

        self.loaded_key = Some(key.to_string());
        tracing::info!(key, "index built and cached");
        Ok(true)
    }

    /// Load cached artifacts for `key`, rejecting a dimension the embedder can't query.
    fn load(&mut self, key: &str) -> Result<()> {
        self.retriever.load(&self.artifacts(key))?;

        let expected = self.embedder.dimension();
        match self.retriever.dimension() {
            Some(found) if found != expected => {
                self.unload();
                Err(ContextError::DimensionMismatch { expected, found })
            }
            _ => {
                self.loaded_key = Some(key.to_string());
                Ok(())
            }
        }
    }

    /// Ensure the retriever holds the index for `key`, loading it on demand.
    fn ensure_loaded(&mut self, repo_url: &str, branch: &str) -> bool {
        let key = cache_key(repo_url, branch);
        if self.loaded_key.as_deref() == Some(key.as_str()) {
            return true;
        }
        if !self.artifacts(&key).exist() {
            tracing::warn!(
                repo = %repo_url,
                branch,
                "{}; prepare the repository first",
                ContextError::IndexState
            );
            return false;
        }
        match self.load(&key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(repo = %repo_url, error = %e, "failed to load index");
                false
            }
        }
    }

    /// Context relevant to a diff, or an empty string.
    pub fn context_for_diff(&mut self, diff: &str, repo_url: &str, branch: &str) -> Result<String> {
        if !self.is_enabled() || !self.ensure_loaded(repo_url, branch) {
            return Ok(String::new());
        }

        let query = extract_diff_summary(diff, self.config.retrieval.max_query_length);
        if query.is_empty() {
            tracing::info!("empty diff summary, no context retrieved");
            return Ok(String::new());
        }

        let files = if self.config.retrieval.restrict_to_diff_files {
            self.collector.relevant_files_for_diff(diff)
        } else {
            Default::default()
        };

        let context = if files.is_empty() {
            self.retriever
                .get_relevant_context(&query, self.embedder.as_ref())
        } else {
            self.retriever
                .get_relevant_context_where(&query, self.embedder.as_ref(), |c| {
                    files.contains(&c.file_path)
                })
        };
        let context = absorb(context, String::new(), "context retrieval failed")?;

        if context.is_empty() {
            tracing::info!("no relevant context found for the diff");
        } else {
            tracing::info!(chars = context.chars().count(), "retrieved context for the diff");
        }
        Ok(context)
    }

    /// Context relevant to a free-text query, or an empty string.
    pub fn context_for_query(&mut self, query: &str, repo_url: &str, branch: &str) -> Result<String> {
        if !self.is_enabled() || !self.ensure_loaded(repo_url, branch) || query.trim().is_empty() {
            return Ok(String::new());
        }

        let context = self
            .retriever
            .get_relevant_context(query, self.embedder.as_ref());
        absorb(context, String::new(), "context retrieval failed")
    }

    /// [`clear_cache_at`] on this engine's cache root, dropping the in-memory
    /// index when it belongs to what was cleared.
    pub fn clear_cache(&mut self, repo_url: Option<&str>, branch: &str) -> Result<()> {
        clear_cache_at(&self.cache_dir, repo_url, branch)?;
        let cleared_loaded = match repo_url {
            Some(url) => self.loaded_key.as_deref() == Some(cache_key(url, branch).as_str()),
            None => true,
        };
        if cleared_loaded {
            self.unload();
        }
        Ok(())
    }

    /// Cache keys with both artifacts on disk, sorted.
    pub fn cached_indexes(&self) -> Result<Vec<String>> {
        cached_keys(&self.cache_dir)
    }
}
