//! Error taxonomy for the retrieval engine.
//!
//! The engine absorbs most of these into "no context" results; only
//! [`ContextError::Model`] is allowed to escape the build path, because a
//! broken embedding backend makes every later call useless.

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context retrieval is disabled in configuration")]
    Disabled,

    #[error("repository fetch failed: {0}")]
    Fetch(String),

    #[error("index build failed: {0}")]
    Build(String),

    #[error("no index has been built or loaded")]
    IndexState,

    #[error("embedding model error: {0}")]
    Model(String),

    #[error("vector dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("corrupt index artifact {path}: {reason}")]
    CorruptIndex { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid exclude pattern: {0}")]
    Glob(#[from] globset::Error),
}

impl ContextError {
    /// Shorthand for building a [`ContextError::Model`] from any displayable error.
    pub fn model(err: impl std::fmt::Display) -> Self {
        ContextError::Model(err.to_string())
    }

    /// Whether this error must propagate instead of degrading to "no context".
    pub fn is_fatal(&self) -> bool {
        matches!(self, ContextError::Model(_))
    }
}
