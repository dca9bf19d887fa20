/// Top-level error taxonomy for the daemon. Each named entry mirrors the
/// propagation policy: tool errors are recovered locally and never reach
/// here; provider and persistence errors are surfaced as `error` parts and
/// move the run to `FAILED`.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("inference error: {0}")]
    Inference(#[from] shadow_provider::InferenceError),
    #[error(transparent)]
    Tool(#[from] shadow_tools::ToolError),
    #[error(transparent)]
    Compaction(#[from] shadow_compaction::CompactionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run cancelled")]
    Cancelled,
    #[error("context manager could not fit the sliding window under target")]
    ContextOverflow,
    #[error("background job error: {0}")]
    BackgroundJob(String),
    #[error("repository lock error: {0}")]
    RepoLock(String),
}

/// Persistence-layer failures. Transient failures are retried with bounded
/// backoff by the caller; `DaemonError::Store` only ever carries the final,
/// exhausted failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Session Hub failures — narrow, since publish/subscribe are designed to
/// never fail under normal operation (a full bounded channel degrades to a
/// `lag` event, not an error).
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("no active run for variant {0}")]
    NoActiveRun(String),
}

/// Webhook-layer failures, mapped directly to the HTTP status codes named
/// in the external interfaces contract: signature failures are `401`,
/// payload schema failures are `400`.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
