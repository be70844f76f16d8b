//! Core data models that flow through the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Synthetic origin path used for the repository structure summary.
pub const STRUCTURE_PATH: &str = "repository_structure.txt";

/// A bounded, independently retrievable unit of text with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    /// Relative path of origin, or [`STRUCTURE_PATH`].
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// `{file_path}_{sequence}`, unique within one index build.
    pub chunk_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TextChunk {
    pub fn new(
        text: String,
        file_path: &str,
        start_line: usize,
        end_line: usize,
        sequence: usize,
        split_method: &str,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("split_method".to_string(), split_method.to_string());
        Self {
            text,
            file_path: file_path.to_string(),
            start_line,
            end_line: end_line.max(start_line),
            chunk_id: format!("{}_{}", file_path, sequence),
            metadata,
        }
    }

    pub fn split_method(&self) -> Option<&str> {
        self.metadata.get("split_method").map(String::as_str)
    }

    /// Render the chunk as a context block for the prompt.
    pub fn to_context_block(&self) -> String {
        format!(
            "File: {} (lines {}-{})\n{}\n",
            self.file_path, self.start_line, self.end_line, self.text
        )
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: TextChunk,
    /// Inner-product similarity; cosine for normalized vectors.
    pub score: f32,
}
