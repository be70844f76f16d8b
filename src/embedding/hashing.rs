//! Deterministic feature-hashing embedder.
//!
//! Lowercased word tokens and adjacent-token bigrams are hashed with SHA-256
//! into a fixed number of buckets, with one hash bit choosing the sign.
//! Texts sharing vocabulary land close together, which is enough for
//! offline indexing and for tests that must not touch the network.
//! Text without tokens maps to a fixed bucket so every output is unit length.

use sha2::{Digest, Sha256};

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::Result;

const DEFAULT_DIMS: usize = 256;
/// Feature for texts whose token features are empty or cancel out.
const EMPTY_FEATURE: &[u8] = b"\0empty";

pub struct HashEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    max_tokens: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: "feature-hash".to_string(),
            dims: dims.max(1),
            batch_size: 32,
            max_tokens: 512,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model_name(),
            dims: config.dims.unwrap_or(DEFAULT_DIMS).max(1),
            batch_size: config.batch_size.max(1),
            max_tokens: config.max_length.max(1),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty())
            .take(self.max_tokens)
            .collect();

        for token in &tokens {
            self.add_feature(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut v, bigram.as_bytes(), 0.5);
        }
        if v.iter().all(|x| *x == 0.0) {
            self.add_feature(&mut v, EMPTY_FEATURE, 1.0);
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[index] += sign * weight;
    }
}

impl Embedder for HashEmbedder {
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
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::dot;

    #[test]
    fn deterministic() {
        let e = HashEmbedder::new(64);
        assert_eq!(
            e.embed_one("parse the config file").unwrap(),
            e.embed_one("parse the config file").unwrap()
        );
    }

    #[test]
    fn case_insensitive() {
        let e = HashEmbedder::new(64);
        assert_eq!(
            e.embed_one("Retriever Search").unwrap(),
            e.embed_one("retriever search").unwrap()
        );
    }

    #[test]
    fn identical_text_has_unit_similarity() {
        let e = HashEmbedder::new(128);
        let a = e.embed_one("fn load_index(path: &Path)").unwrap();
        assert!((dot(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashEmbedder::new(256);
        let query = e.embed_one("database connection pool").unwrap();
        let related = e.embed_one("the database connection pool is exhausted").unwrap();
        let unrelated = e.embed_one("render the triangle mesh").unwrap();
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[test]
    fn tokenless_text_is_still_unit_length() {
        let e = HashEmbedder::new(16);
        let empty = e.embed_one("").unwrap();
        assert_eq!(empty.len(), 16);
        assert!((dot(&empty, &empty) - 1.0).abs() < 1e-5);
        assert_eq!(e.embed_one("  -- ;; ").unwrap(), empty);
    }
}
