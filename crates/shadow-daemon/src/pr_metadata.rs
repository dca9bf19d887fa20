use serde::Deserialize;
use serde_json::Value;
use shadow_core::model::PullRequestSnapshot;
use shadow_provider::{InferenceRequest, ProviderClient};

use crate::error::DaemonError;

const SYSTEM_PROMPT: &str = "\
You write pull request metadata for a coding agent's completed run. Given \
the task title, the git diff, and the commit messages, respond with a JSON \
object {\"title\": string, \"description\": string, \"isDraft\": bool} and \
nothing else. The description should summarize what changed and why in a \
few sentences. Mark isDraft true if the task was not fully completed.";

/// Input to one PR-metadata call: `{taskTitle, gitDiff, commitMessages, wasTaskCompleted}`
/// exactly as spec §4.11 names it.
pub struct PrMetadataInput<'a> {
    pub task_title: &'a str,
    pub git_diff: &'a str,
    pub commit_messages: &'a [String],
    pub was_task_completed: bool,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    title: String,
    description: String,
    #[serde(rename = "isDraft")]
    is_draft: bool,
}

/// Invokes a dedicated model call producing PR title/description/draft
/// status, then folds in diff stats the orchestrator already knows (lines
/// added/removed, files changed, commit sha) to build the full
/// `PullRequestSnapshot` persisted on the run's final assistant message.
/// Same "single request/response, no tools, no streaming" shape as the
/// orchestrator's own auto-compaction call.
pub async fn generate(
    provider: &dyn ProviderClient,
    model: &str,
    input: PrMetadataInput<'_>,
    lines_added: u32,
    lines_removed: u32,
    files_changed: u32,
    commit_sha: &str,
) -> Result<PullRequestSnapshot, DaemonError> {
    let user_content = serde_json::json!({
        "taskTitle": input.task_title,
        "gitDiff": input.git_diff,
        "commitMessages": input.commit_messages,
        "wasTaskCompleted": input.was_task_completed,
    });

    let request = InferenceRequest {
        model: model.to_string(),
        max_tokens: 1024,
        system: Some(SYSTEM_PROMPT.to_string()),
        tools: vec![],
        messages: vec![serde_json::json!({
            "role": "user",
            "content": user_content.to_string(),
        })],
        thinking: None,
    };

    let response = provider
        .complete(request)
        .await
        .map_err(DaemonError::Inference)?;

    let parsed = parse_metadata(&response.text);
    let description = if parsed.is_draft {
        format!("[draft] {}", parsed.description)
    } else {
        parsed.description
    };

    Ok(PullRequestSnapshot {
        title: parsed.title,
        description,
        lines_added,
        lines_removed,
        files_changed,
        commit_sha: commit_sha.to_string(),
    })
}

/// The model is instructed to return bare JSON, but may wrap it in prose or
/// a code fence; find the first balanced `{...}` block and parse that.
fn parse_metadata(text: &str) -> RawMetadata {
    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
            if let Ok(metadata) = serde_json::from_value::<RawMetadata>(value) {
                return metadata;
            }
        }
    }
    RawMetadata {
        title: "Untitled change".to_string(),
        description: text.trim().to_string(),
        is_draft: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use shadow_core::Usage;
    use shadow_provider::{InferenceError, RawEvent, RawFinishReason};

    struct FixedProvider(&'static str);

    #[async_trait]
    impl ProviderClient for FixedProvider {
        async fn stream(
            &self,
            _request: InferenceRequest,
        ) -> Result<BoxStream<'static, Result<RawEvent, InferenceError>>, InferenceError> {
            let events = vec![
                RawEvent::TextDelta(self.0.to_string()),
                RawEvent::Finish {
                    reason: RawFinishReason::EndTurn,
                    usage: Usage::default(),
                },
            ];
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    #[tokio::test]
    async fn parses_well_formed_json_response() {
        let provider = FixedProvider(
            r#"{"title": "Fix retry logic", "description": "Adds backoff.", "isDraft": false}"#,
        );
        let snapshot = generate(
            &provider,
            "claude-haiku-4-20250514",
            PrMetadataInput {
                task_title: "Fix retries",
                git_diff: "diff --git a/x b/x",
                commit_messages: &["fix retries".to_string()],
                was_task_completed: true,
            },
            10,
            2,
            1,
            "abc123",
        )
        .await
        .unwrap();
        assert_eq!(snapshot.title, "Fix retry logic");
        assert_eq!(snapshot.commit_sha, "abc123");
    }

    #[tokio::test]
    async fn falls_back_on_unparseable_response() {
        let provider = FixedProvider("not json at all");
        let snapshot = generate(
            &provider,
            "claude-haiku-4-20250514",
            PrMetadataInput {
                task_title: "Fix retries",
                git_diff: "",
                commit_messages: &[],
                was_task_completed: false,
            },
            0,
            0,
            0,
            "abc123",
        )
        .await
        .unwrap();
        assert_eq!(snapshot.title, "Untitled change");
    }
}
