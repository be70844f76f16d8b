//! # Review Context
//!
//! Repository-aware context retrieval for automated code review.
//!
//! Review Context indexes a git repository into embedded chunks, caches the
//! index per repository and branch, and turns a unified diff into a short
//! query that retrieves the most relevant existing code and documentation
//! for a downstream review or description generator.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌──────────┐   ┌────────────┐
//! │ Collector  │──▶│ Chunker  │──▶│ Embedder │──▶│ Retriever  │
//! │ walk+glob  │   │ tok/sent │   │ hash/... │   │ .vec+.json │
//! └────────────┘   └──────────┘   └──────────┘   └─────┬──────┘
//!                                                      │
//!          diff ──▶ diff summary ──▶ query embedding ──┘──▶ bounded context
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rcx index https://github.com/org/repo.git --branch main
//! git diff | rcx diff https://github.com/org/repo.git
//! rcx query https://github.com/org/repo.git "how are retries configured"
//! rcx clear-cache --repo-url https://github.com/org/repo.git
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Token, sentence and character chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`retriever`] | Similarity index, persistence and context assembly |
//! | [`collector`] | Repository walking and file selection |
//! | [`diff_summary`] | Diff to retrieval query |
//! | [`git`] | Working-copy clone and update |
//! | [`engine`] | Per-repository cache and query orchestration |
//! | [`progress`] | Index-build progress reporting |

pub mod chunk;
pub mod collector;
pub mod config;
pub mod diff_summary;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod git;
pub mod models;
pub mod progress;
pub mod retriever;

pub use engine::{cache_key, clear_cache_at, ContextEngine};
pub use error::{ContextError, Result};
