/// Errors raised by the Message Compressor and Context Manager. Summarizer
/// failures are not fatal to the caller — `compressor::ensure_level` maps
/// them into a fallback result rather than returning `Err`, so this enum is
/// mostly surfaced at the Context Manager boundary where message loading can
/// genuinely fail.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("unknown model: {0}")]
    UnknownModel(#[from] shadow_pricing::UnknownModel),
    #[error("failed to load messages for task: {0}")]
    MessageSource(String),
}
