use chrono::Utc;
use shadow_core::model::CompressedVersion;
use shadow_core::{ChatMessage, CompressionLevel, Part};
use shadow_provider::{InferenceRequest, ProviderClient};
use tracing::warn;

const LIGHT_SYSTEM_PROMPT: &str = "\
You summarize a single message from a coding agent's conversation. Produce a \
10 to 14 sentence structured summary that preserves every tool call with its \
arguments, every file path and query mentioned, any counts, and the outcome \
of each action. Embed a code block only if it is 20 lines or fewer. Omit \
pleasantries. Be precise, not vague.";

const HEAVY_SYSTEM_PROMPT: &str = "\
You summarize a single message from a coding agent's conversation as \
compactly as possible. Produce 4 to 6 sentences covering only the decisive \
actions taken, the key files or commands involved, and the final status. \
Drop everything else.";

/// Renders a message's content the way the Context Manager linearizes it —
/// assistant `parts` joined textually, falling back to `content` for
/// messages with no parts (plain user/system/tool text).
fn render_for_summary(message: &ChatMessage) -> String {
    if message.parts.is_empty() {
        return message.content.clone();
    }
    message
        .parts
        .iter()
        .filter_map(Part::linearize)
        .collect::<Vec<_>>()
        .join("\n")
}

/// `ensureLevel(messageId, level, summarizerModel)`. If `message` already
/// carries a cached version at `level`, returns it unchanged — idempotent
/// per `(messageId, level)`. Otherwise invokes the summarizer model with the
/// level-specific prompt pair. On summarizer failure, falls back to the
/// original content rather than failing the caller; compaction is
/// best-effort and must never block the run.
pub async fn ensure_level(
    message: &ChatMessage,
    level: CompressionLevel,
    summarizer: &dyn ProviderClient,
    summarizer_model: &str,
) -> CompressedVersion {
    if let Some(cached) = message.compressed_versions.get(&level) {
        return cached.clone();
    }

    if level == CompressionLevel::None {
        let content = render_for_summary(message);
        let tokens = shadow_core::count(shadow_core::tokens::Content::Text(&content), summarizer_model);
        return CompressedVersion {
            content,
            tokens,
            compressed_at: Utc::now(),
        };
    }

    let system = match level {
        CompressionLevel::Light => LIGHT_SYSTEM_PROMPT,
        CompressionLevel::Heavy => HEAVY_SYSTEM_PROMPT,
        CompressionLevel::None => unreachable!(),
    };

    let source = render_for_summary(message);
    let request = InferenceRequest {
        model: summarizer_model.to_string(),
        max_tokens: 512,
        system: Some(system.to_string()),
        tools: vec![],
        messages: vec![serde_json::json!({
            "role": "user",
            "content": source,
        })],
        thinking: None,
    };

    match summarizer.complete(request).await {
        Ok(response) if !response.text.trim().is_empty() => {
            let tokens =
                shadow_core::count(shadow_core::tokens::Content::Text(&response.text), summarizer_model);
            CompressedVersion {
                content: response.text,
                tokens,
                compressed_at: Utc::now(),
            }
        }
        Ok(_) => fallback(message, summarizer_model, "summarizer returned empty text"),
        Err(e) => fallback(message, summarizer_model, &e.to_string()),
    }
}

fn fallback(message: &ChatMessage, model_id: &str, reason: &str) -> CompressedVersion {
    warn!(message_id = %message.id, reason, "summarizer failed, falling back to original content");
    let content = render_for_summary(message);
    let tokens = shadow_core::count(shadow_core::tokens::Content::Text(&content), model_id);
    CompressedVersion {
        content,
        tokens,
        compressed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use shadow_core::{ChatRole, MessageId, TaskId, VariantId};
    use shadow_provider::{InferenceError, RawEvent, RawFinishReason};
    use std::collections::HashMap;

    struct ScriptedSummarizer {
        text: Result<String, String>,
    }

    #[async_trait]
    impl ProviderClient for ScriptedSummarizer {
        async fn stream(
            &self,
            _request: InferenceRequest,
        ) -> Result<BoxStream<'static, Result<RawEvent, InferenceError>>, InferenceError> {
            match &self.text {
                Ok(text) => {
                    let events = vec![
                        RawEvent::TextDelta(text.clone()),
                        RawEvent::Finish {
                            reason: RawFinishReason::EndTurn,
                            usage: Default::default(),
                        },
                    ];
                    Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
                }
                Err(message) => Err(InferenceError::Request(message.clone())),
            }
        }
    }

    fn message(content: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            task_id: TaskId::new(),
            variant_id: VariantId::new(),
            role: ChatRole::Assistant,
            content: content.to_string(),
            parts: vec![],
            sequence: 1,
            created_at: Utc::now(),
            model_id: None,
            usage: Default::default(),
            finish_reason: None,
            active_compression_level: CompressionLevel::None,
            compressed_versions: HashMap::new(),
            pull_request_snapshot: None,
        }
    }

    #[tokio::test]
    async fn invokes_summarizer_for_uncached_level() {
        let summarizer = ScriptedSummarizer {
            text: Ok("a concise summary".into()),
        };
        let msg = message("a very long message about reading several files");
        let result = ensure_level(&msg, CompressionLevel::Light, &summarizer, "claude-haiku-4-20250514").await;
        assert_eq!(result.content, "a concise summary");
    }

    #[tokio::test]
    async fn returns_cached_version_without_calling_summarizer() {
        let summarizer = ScriptedSummarizer {
            text: Err("should never be called".into()),
        };
        let mut msg = message("original");
        msg.compressed_versions.insert(
            CompressionLevel::Heavy,
            CompressedVersion {
                content: "cached heavy summary".into(),
                tokens: 3,
                compressed_at: Utc::now(),
            },
        );
        let result = ensure_level(&msg, CompressionLevel::Heavy, &summarizer, "claude-haiku-4-20250514").await;
        assert_eq!(result.content, "cached heavy summary");
    }

    #[tokio::test]
    async fn falls_back_to_original_on_summarizer_failure() {
        let summarizer = ScriptedSummarizer {
            text: Err("network down".into()),
        };
        let msg = message("original content that failed to summarize");
        let result = ensure_level(&msg, CompressionLevel::Light, &summarizer, "claude-haiku-4-20250514").await;
        assert_eq!(result.content, "original content that failed to summarize");
    }

    #[tokio::test]
    async fn idempotent_repeated_calls_hit_cache_only() {
        let summarizer = ScriptedSummarizer {
            text: Ok("first summary".into()),
        };
        let mut msg = message("content");
        let first = ensure_level(&msg, CompressionLevel::Light, &summarizer, "claude-haiku-4-20250514").await;
        msg.compressed_versions.insert(CompressionLevel::Light, first.clone());

        let failing_summarizer = ScriptedSummarizer {
            text: Err("must not be invoked".into()),
        };
        let second = ensure_level(&msg, CompressionLevel::Light, &failing_summarizer, "claude-haiku-4-20250514").await;
        assert_eq!(first.content, second.content);
    }
}
