/// Errors shared across every Shadow crate's type layer. Component-specific
/// errors (inference, tool execution, compaction, persistence) live in their
/// owning crates and wrap this where they need to.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
