//! Similarity index over embedded chunks.
//!
//! The [`Retriever`] holds at most one [`RepositoryIndex`]: a row-major
//! matrix of L2-normalized vectors aligned with the chunks they were
//! computed from. Search is exact brute-force inner product, which equals
//! cosine similarity for normalized rows.
//!
//! # States
//!
//! | State | Reached by | Search |
//! |-------|------------|--------|
//! | empty | construction, failed `build`, `clear` | [`ContextError::IndexState`] |
//! | built | [`Retriever::build`] | ranked hits |
//! | loaded | [`Retriever::load`] | ranked hits |
//!
//! `save` persists from built or loaded without changing state.
//!
//! # Artifacts
//!
//! Two files share one cache key:
//!
//! - `<key>.vec`: magic `RCXV`, format version (u32), dimension (u32),
//!   rows (u64), then `rows × dimension` little-endian f32 values.
//! - `<key>.chunks.json`: version, dimension, model, build time and the
//!   chunk list in row order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, dot, vec_to_blob, Embedder};
use crate::error::{ContextError, Result};
use crate::models::{SearchHit, TextChunk};

const VEC_MAGIC: &[u8; 4] = b"RCXV";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// In-memory retrieval state for one repository and branch.
#[derive(Debug, Clone)]
pub struct RepositoryIndex {
    chunks: Vec<TextChunk>,
    vectors: Vec<f32>,
    dimension: usize,
}

impl RepositoryIndex {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[TextChunk] {
        &self.chunks
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dimension..(i + 1) * self.dimension]
    }
}

/// Paths of the two companion artifacts for a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifacts {
    pub vectors: PathBuf,
    pub chunks: PathBuf,
}

impl IndexArtifacts {
    pub fn for_key(dir: &Path, key: &str) -> Self {
        Self {
            vectors: dir.join(format!("{}.vec", key)),
            chunks: dir.join(format!("{}.chunks.json", key)),
        }
    }

    /// Both artifacts are present.
    pub fn exist(&self) -> bool {
        self.vectors.is_file() && self.chunks.is_file()
    }

    /// Delete whichever artifacts exist.
    pub fn remove(&self) -> Result<()> {
        for path in [&self.vectors, &self.chunks] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Cache keys under `dir` with both artifacts present, sorted.
pub fn cached_keys(dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(key) = name.strip_suffix(".vec") {
            if IndexArtifacts::for_key(dir, key).exist() {
                keys.push(key.to_string());
            }
        }
    }
    keys.sort();
    Ok(keys)
}

#[derive(Serialize, Deserialize)]
struct ChunkArtifact<C> {
    version: u32,
    dimension: usize,
    model: String,
    built_at: DateTime<Utc>,
    chunks: C,
}

/// Top-k similarity search with a score threshold and an output budget.
pub struct Retriever {
    top_k: usize,
    threshold: f32,
    max_context_length: usize,
    index: Option<RepositoryIndex>,
}

impl Retriever {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            threshold: config.similarity_threshold,
            max_context_length: config.max_context_length,
            index: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_none()
    }

    pub fn index(&self) -> Option<&RepositoryIndex> {
        self.index.as_ref()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.index.as_ref().map(|i| i.dimension)
    }

    /// Drop the in-memory index.
    pub fn clear(&mut self) {
        self.index = None;
    }

    /// Replace the index with `chunks` and their `vectors`, row for row.
    ///
    /// On any error the retriever is left empty.
    pub fn build(&mut self, chunks: Vec<TextChunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        self.index = None;

        if chunks.len() != vectors.len() {
            return Err(ContextError::Build(format!(
                "{} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let dimension = match vectors.first() {
            Some(v) if !v.is_empty() => v.len(),
            Some(_) => return Err(ContextError::Build("zero-dimensional vectors".into())),
            None => return Err(ContextError::Build("no chunks to index".into())),
        };

        let mut flat = Vec::with_capacity(dimension * vectors.len());
        for v in &vectors {
            if v.len() != dimension {
                return Err(ContextError::DimensionMismatch {
                    expected: dimension,
                    found: v.len(),
                });
            }
            flat.extend_from_slice(v);
        }

        tracing::debug!(chunks = chunks.len(), dimension, "index built");
        self.index = Some(RepositoryIndex {
            chunks,
            vectors: flat,
            dimension,
        });
        Ok(())
    }

    /// Ranked hits with `score >= threshold`, at most `top_k`.
    pub fn search(&self, query: &[f32], top_k: usize, threshold: f32) -> Result<Vec<SearchHit>> {
        self.search_where(query, top_k, threshold, |_| true)
    }

    /// Like [`search`](Self::search), considering only chunks accepted by `filter`.
    pub fn search_where<F>(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
        filter: F,
    ) -> Result<Vec<SearchHit>>
    where
        F: Fn(&TextChunk) -> bool,
    {
        let index = self.index.as_ref().ok_or(ContextError::IndexState)?;
        if query.len() != index.dimension {
            return Err(ContextError::DimensionMismatch {
                expected: index.dimension,
                found: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = (0..index.len())
            .filter(|&i| filter(&index.chunks[i]))
            .map(|i| (i, dot(query, index.row(i))))
            .filter(|(_, score)| *score >= threshold)
            .collect();

        // sort_by is stable, so equal scores keep chunk order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| SearchHit {
                chunk: index.chunks[i].clone(),
                score,
            })
            .collect())
    }

    /// Embed `query` and search with the configured `top_k` and threshold.
    pub fn search_by_text(&self, query: &str, embedder: &dyn Embedder) -> Result<Vec<SearchHit>> {
        self.search_by_text_where(query, embedder, |_| true)
    }

    pub fn search_by_text_where<F>(
        &self,
        query: &str,
        embedder: &dyn Embedder,
        filter: F,
    ) -> Result<Vec<SearchHit>>
    where
        F: Fn(&TextChunk) -> bool,
    {
        if self.index.is_none() {
            return Err(ContextError::IndexState);
        }
        let vector = embedder.embed_one(query)?;
        self.search_where(&vector, self.top_k, self.threshold, filter)
    }

    /// Formatted context blocks for `query`, bounded by `max_context_length`.
    pub fn get_relevant_context(&self, query: &str, embedder: &dyn Embedder) -> Result<String> {
        let hits = self.search_by_text(query, embedder)?;
        Ok(self.assemble_context(&hits))
    }

    pub fn get_relevant_context_where<F>(
        &self,
        query: &str,
        embedder: &dyn Embedder,
        filter: F,
    ) -> Result<String>
    where
        F: Fn(&TextChunk) -> bool,
    {
        let hits = self.search_by_text_where(query, embedder, filter)?;
        Ok(self.assemble_context(&hits))
    }

    /// Join hit blocks with `"\n"` in rank order, stopping before the first
    /// block that would push the total past `max_context_length` characters.
    pub fn assemble_context(&self, hits: &[SearchHit]) -> String {
        let mut out = String::new();
        let mut used = 0usize;

        for hit in hits {
            let block = hit.chunk.to_context_block();
            let separator = usize::from(!out.is_empty());
            let cost = block.chars().count() + separator;
            if used + cost > self.max_context_length {
                break;
            }
            if separator == 1 {
                out.push('\n');
            }
            out.push_str(&block);
            used += cost;
        }

        out
    }

    /// Write both artifacts. Fails with [`ContextError::IndexState`] when empty.
    pub fn save(&self, artifacts: &IndexArtifacts, model: &str) -> Result<()> {
        let index = self.index.as_ref().ok_or(ContextError::IndexState)?;

        if let Some(parent) = artifacts.vectors.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + index.vectors.len() * 4);
        bytes.extend_from_slice(VEC_MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(index.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(index.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&index.vectors));
        fs::write(&artifacts.vectors, bytes)?;

        let meta = ChunkArtifact {
            version: FORMAT_VERSION,
            dimension: index.dimension,
            model: model.to_string(),
            built_at: Utc::now(),
            chunks: index.chunks.as_slice(),
        };
        fs::write(&artifacts.chunks, serde_json::to_vec(&meta)?)?;

        tracing::info!(
            path = %artifacts.vectors.display(),
            chunks = index.len(),
            "index saved"
        );
        Ok(())
    }

    /// Replace the in-memory index with the persisted one.
    ///
    /// On error the current state is kept.
    pub fn load(&mut self, artifacts: &IndexArtifacts) -> Result<()> {
        let (dimension, vectors) = read_vectors(&artifacts.vectors)?;

        let raw = fs::read(&artifacts.chunks)?;
        let meta: ChunkArtifact<Vec<TextChunk>> = serde_json::from_slice(&raw)?;
        let corrupt = |reason: String| ContextError::CorruptIndex {
            path: artifacts.chunks.display().to_string(),
            reason,
        };
        if meta.version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported version {}", meta.version)));
        }
        if meta.dimension != dimension {
            return Err(ContextError::DimensionMismatch {
                expected: dimension,
                found: meta.dimension,
            });
        }
        if meta.chunks.len() * dimension != vectors.len() {
            return Err(corrupt(format!(
                "{} chunks for {} vectors",
                meta.chunks.len(),
                vectors.len() / dimension
            )));
        }

        tracing::info!(
            path = %artifacts.vectors.display(),
            chunks = meta.chunks.len(),
            model = %meta.model,
            built_at = %meta.built_at,
            "index loaded"
        );
        self.index = Some(RepositoryIndex {
            chunks: meta.chunks,
            vectors,
            dimension,
        });
        Ok(())
    }
}

fn read_vectors(path: &Path) -> Result<(usize, Vec<f32>)> {
    let bytes = fs::read(path)?;
    let corrupt = |reason: &str| ContextError::CorruptIndex {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_LEN || &bytes[..4] != VEC_MAGIC {
        return Err(corrupt("bad header"));
    }
    let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    if u32_at(4) != FORMAT_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let dimension = u32_at(8) as usize;
    let mut rows = [0u8; 8];
    rows.copy_from_slice(&bytes[12..HEADER_LEN]);
    let rows = u64::from_le_bytes(rows) as usize;

    if dimension == 0 {
        return Err(corrupt("zero dimension"));
    }
    let expected = rows
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt("size overflow"))?;
    if bytes.len() - HEADER_LEN != expected {
        return Err(corrupt("payload length does not match header"));
    }

    Ok((dimension, blob_to_vec(&bytes[HEADER_LEN..])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use tempfile::TempDir;

    fn retriever(top_k: usize, threshold: f32, max_context_length: usize) -> Retriever {
        Retriever::new(&RetrievalConfig {
            top_k,
            similarity_threshold: threshold,
            max_context_length,
            ..RetrievalConfig::default()
        })
    }

    fn chunk(path: &str, text: &str, seq: usize) -> TextChunk {
        TextChunk::new(text.to_string(), path, 1, 1, seq, "character")
    }

    fn sample() -> (Vec<TextChunk>, Vec<Vec<f32>>) {
        let chunks = vec![
            chunk("a.rs", "alpha", 0),
            chunk("b.rs", "beta", 0),
            chunk("c.rs", "gamma", 0),
            chunk("d.rs", "delta", 0),
        ];
        let s = std::f32::consts::FRAC_1_SQRT_2;
        let vectors = vec![
            vec![1.0, 0.0],
            vec![s, s],
            vec![0.0, 1.0],
            vec![s, s],
        ];
        (chunks, vectors)
    }

    #[test]
    fn search_before_build_is_index_state_error() {
        let r = retriever(5, 0.0, 1000);
        assert!(matches!(
            r.search(&[1.0, 0.0], 5, 0.0),
            Err(ContextError::IndexState)
        ));
    }

    #[test]
    fn mismatched_build_leaves_retriever_empty() {
        let mut r = retriever(5, 0.0, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks.clone(), vectors.clone()).unwrap();
        assert!(!r.is_empty());

        let err = r.build(chunks, vectors[..3].to_vec()).unwrap_err();
        assert!(matches!(err, ContextError::Build(_)));
        assert!(r.is_empty());
    }

    #[test]
    fn ragged_vectors_are_rejected() {
        let mut r = retriever(5, 0.0, 1000);
        let chunks = vec![chunk("a", "a", 0), chunk("b", "b", 0)];
        let err = r
            .build(chunks, vec![vec![1.0, 0.0], vec![1.0]])
            .unwrap_err();
        assert!(matches!(err, ContextError::DimensionMismatch { .. }));
        assert!(r.is_empty());
    }

    #[test]
    fn results_sorted_and_thresholded() {
        let mut r = retriever(10, 0.5, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks, vectors).unwrap();

        let hits = r.search(&[1.0, 0.0], 10, 0.5).unwrap();
        let paths: Vec<&str> = hits.iter().map(|h| h.chunk.file_path.as_str()).collect();
        // b and d tie; chunk order breaks the tie. c scores 0.
        assert_eq!(paths, vec!["a.rs", "b.rs", "d.rs"]);
        assert!(hits.iter().all(|h| h.score >= 0.5));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn top_k_limits_results() {
        let mut r = retriever(10, -1.0, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks, vectors).unwrap();
        assert_eq!(r.search(&[0.0, 1.0], 2, -1.0).unwrap().len(), 2);
    }

    #[test]
    fn query_dimension_must_match() {
        let mut r = retriever(10, 0.0, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks, vectors).unwrap();
        assert!(matches!(
            r.search(&[1.0, 0.0, 0.0], 10, 0.0),
            Err(ContextError::DimensionMismatch { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn search_where_restricts_candidates() {
        let mut r = retriever(10, -1.0, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks, vectors).unwrap();
        let hits = r
            .search_where(&[1.0, 0.0], 10, -1.0, |c| c.file_path == "c.rs")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.file_path, "c.rs");
    }

    #[test]
    fn context_respects_budget_without_splitting_blocks() {
        let hits: Vec<SearchHit> = (0..5)
            .map(|i| SearchHit {
                chunk: chunk(&format!("f{}.rs", i), &"x".repeat(40), 0),
                score: 1.0,
            })
            .collect();
        let block_len = hits[0].chunk.to_context_block().chars().count();

        let r = retriever(10, 0.0, block_len * 2 + 1);
        let context = r.assemble_context(&hits);
        assert_eq!(context.chars().count(), block_len * 2 + 1);
        assert_eq!(context.matches("File: ").count(), 2);

        let tight = retriever(10, 0.0, block_len - 1);
        assert_eq!(tight.assemble_context(&hits), "");
    }

    #[test]
    fn relevant_context_is_empty_when_nothing_clears_threshold() {
        let embedder = HashEmbedder::new(64);
        let chunks = vec![chunk("a.rs", "parse configuration file", 0)];
        let vectors = embedder.embed_many(&[chunks[0].text.clone()]).unwrap();

        let mut r = retriever(5, 0.99, 1000);
        r.build(chunks, vectors).unwrap();
        assert_eq!(
            r.get_relevant_context("render triangle mesh", &embedder).unwrap(),
            ""
        );
        let context = r
            .get_relevant_context("parse configuration file", &embedder)
            .unwrap();
        assert!(context.starts_with("File: a.rs (lines 1-1)\n"));
    }

    #[test]
    fn save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let artifacts = IndexArtifacts::for_key(tmp.path(), "abc123");

        let mut built = retriever(10, -1.0, 1000);
        let (chunks, vectors) = sample();
        built.build(chunks, vectors).unwrap();
        built.save(&artifacts, "test-model").unwrap();
        assert!(artifacts.exist());

        let mut loaded = retriever(10, -1.0, 1000);
        loaded.load(&artifacts).unwrap();
        assert_eq!(loaded.dimension(), Some(2));
        assert_eq!(loaded.index().map(|i| i.len()), Some(4));

        let query = [0.6, 0.8];
        assert_eq!(
            built.search(&query, 10, -1.0).unwrap(),
            loaded.search(&query, 10, -1.0).unwrap()
        );
    }

    #[test]
    fn save_requires_index() {
        let tmp = TempDir::new().unwrap();
        let r = retriever(10, 0.0, 1000);
        assert!(matches!(
            r.save(&IndexArtifacts::for_key(tmp.path(), "k"), "m"),
            Err(ContextError::IndexState)
        ));
    }

    #[test]
    fn truncated_vector_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let artifacts = IndexArtifacts::for_key(tmp.path(), "k");
        let mut r = retriever(10, 0.0, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks, vectors).unwrap();
        r.save(&artifacts, "m").unwrap();

        let bytes = fs::read(&artifacts.vectors).unwrap();
        fs::write(&artifacts.vectors, &bytes[..bytes.len() - 4]).unwrap();

        let mut fresh = retriever(10, 0.0, 1000);
        assert!(matches!(
            fresh.load(&artifacts),
            Err(ContextError::CorruptIndex { .. })
        ));
        assert!(fresh.is_empty());
    }

    #[test]
    fn metadata_dimension_must_match_vectors() {
        let tmp = TempDir::new().unwrap();
        let artifacts = IndexArtifacts::for_key(tmp.path(), "k");
        let mut r = retriever(10, 0.0, 1000);
        let (chunks, vectors) = sample();
        r.build(chunks, vectors).unwrap();
        r.save(&artifacts, "m").unwrap();

        let mut meta: serde_json::Value =
            serde_json::from_slice(&fs::read(&artifacts.chunks).unwrap()).unwrap();
        meta["dimension"] = serde_json::json!(3);
        fs::write(&artifacts.chunks, serde_json::to_vec(&meta).unwrap()).unwrap();

        assert!(matches!(
            retriever(10, 0.0, 1000).load(&artifacts),
            Err(ContextError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn cached_keys_requires_both_artifacts() {
        let tmp = TempDir::new().unwrap();
        for key in ["b", "a"] {
            let artifacts = IndexArtifacts::for_key(tmp.path(), key);
            fs::write(&artifacts.vectors, b"x").unwrap();
            fs::write(&artifacts.chunks, b"{}").unwrap();
        }
        fs::write(tmp.path().join("c.vec"), b"x").unwrap();
        fs::create_dir(tmp.path().join("repo_a")).unwrap();
        assert_eq!(cached_keys(tmp.path()).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn remove_artifacts() {
        let tmp = TempDir::new().unwrap();
        let artifacts = IndexArtifacts::for_key(tmp.path(), "k");
        fs::write(&artifacts.vectors, b"x").unwrap();
        assert!(!artifacts.exist());
        artifacts.remove().unwrap();
        assert!(!artifacts.vectors.exists());
    }
}
