use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use shadow_core::Usage;

use crate::error::InferenceError;
use crate::types::{InferenceRequest, RawEvent, RawFinishReason};

/// Raw, provider-specific streaming call. One implementation per upstream
/// API (`shadow-anthropic` provides the reference Anthropic Messages
/// implementation). The Stream Processor wraps this trait to produce
/// normalized, validated `Part`s.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn stream(
        &self,
        request: InferenceRequest,
    ) -> Result<BoxStream<'static, Result<RawEvent, InferenceError>>, InferenceError>;

    /// Convenience one-shot call for call sites that don't want streaming
    /// (compaction summaries, PR metadata generation). Default impl drains
    /// `stream` and assembles a single response.
    async fn complete(&self, request: InferenceRequest) -> Result<CompletedResponse, InferenceError> {
        let mut stream = self.stream(request).await?;
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut finish_reason = RawFinishReason::EndTurn;

        while let Some(event) = stream.next().await {
            match event? {
                RawEvent::TextDelta(delta) => text.push_str(&delta),
                RawEvent::Finish { reason, usage: u } => {
                    finish_reason = reason;
                    usage = u;
                }
                RawEvent::Error(message) => return Err(InferenceError::Request(message)),
                _ => {}
            }
        }

        Ok(CompletedResponse {
            text,
            usage,
            finish_reason,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: RawFinishReason,
}
