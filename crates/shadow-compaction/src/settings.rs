use shadow_pricing::UnknownModel;

/// Per-model compression policy: an absolute token limit, the fraction of
/// that limit the Context Manager must stay under, and how many of the most
/// recent messages are always kept verbatim regardless of pressure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionSettings {
    pub token_limit: u32,
    pub compression_threshold: f32,
    pub sliding_window_size: usize,
}

impl CompressionSettings {
    pub fn new(token_limit: u32, compression_threshold: f32, sliding_window_size: usize) -> Self {
        Self {
            token_limit,
            compression_threshold,
            sliding_window_size: sliding_window_size.max(1),
        }
    }

    /// `floor(tokenLimit * compressionThreshold)` — the ceiling `buildOptimalContext`
    /// must keep the prompt under.
    pub fn target_tokens(&self) -> u32 {
        (self.token_limit as f32 * self.compression_threshold).floor() as u32
    }
}

/// Default policy derived from the Model Registry's context window. Real
/// deployments should prefer model-specific tuning; some tests use
/// thresholds as low as 0.05 to force compression deterministically. This
/// default targets headroom for a typical multi-turn coding session.
const DEFAULT_COMPRESSION_THRESHOLD: f32 = 0.85;
const DEFAULT_SLIDING_WINDOW_SIZE: usize = 20;

pub fn resolve(model_id: &str) -> Result<CompressionSettings, UnknownModel> {
    let descriptor = shadow_pricing::resolve(model_id)?;
    Ok(CompressionSettings::new(
        descriptor.context_window,
        DEFAULT_COMPRESSION_THRESHOLD,
        DEFAULT_SLIDING_WINDOW_SIZE,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_tokens_floors() {
        let settings = CompressionSettings::new(128_000, 0.05, 8);
        assert_eq!(settings.target_tokens(), 6_400);
    }

    #[test]
    fn resolves_from_registry() {
        let settings = resolve("claude-sonnet-4-20250514").unwrap();
        assert_eq!(settings.token_limit, 200_000);
    }

    #[test]
    fn unknown_model_fails_closed() {
        assert!(resolve("not-a-model").is_err());
    }

    #[test]
    fn sliding_window_is_never_zero() {
        let settings = CompressionSettings::new(1000, 0.5, 0);
        assert_eq!(settings.sliding_window_size, 1);
    }
}
