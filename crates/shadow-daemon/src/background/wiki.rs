use std::path::Path;

use chrono::{Duration, Utc};
use shadow_core::model::CodebaseUnderstanding;
use shadow_provider::{InferenceRequest, ProviderClient};
use walkdir::WalkDir;

use super::is_fresh;
use crate::error::DaemonError;
use crate::store::Store;

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "dist", "build"];
const MAX_SAMPLED_FILES: usize = 40;
const MAX_FILE_SAMPLE_CHARS: usize = 800;

const SYSTEM_PROMPT: &str = "\
You write a short onboarding summary of a code repository for another \
coding agent that is about to work in it. Given a directory listing and a \
sample of file contents, describe the project's purpose, its overall \
structure, and the conventions a contributor should follow. Respond with \
prose only, no headers, no code fences, 4-8 sentences.";

/// Regenerates the repository's `CodebaseUnderstanding` if the existing
/// record (if any) is older than `freshness`. A single prompt built from a
/// directory tree plus sampled file heads, not a true multi-pass
/// file-then-directory hierarchy, which keeps this within one model call
/// per task initialization rather than one per directory.
pub async fn generate_if_stale(
    store: &dyn Store,
    provider: &dyn ProviderClient,
    workspace_root: &Path,
    repo_full_name: &str,
    freshness: Duration,
) -> Result<(), DaemonError> {
    if let Some(existing) = store.get_codebase_understanding(repo_full_name).await? {
        if is_fresh(existing.generated_at, freshness) {
            return Ok(());
        }
    }

    let tree = build_tree_listing(workspace_root);
    let samples = sample_files(workspace_root);

    let user_content = format!(
        "Repository: {repo_full_name}\n\nDirectory listing:\n{tree}\n\nFile samples:\n{samples}"
    );

    let request = InferenceRequest {
        model: crate::orchestrator::SUMMARIZER_MODEL.to_string(),
        max_tokens: 1024,
        system: Some(SYSTEM_PROMPT.to_string()),
        tools: vec![],
        messages: vec![serde_json::json!({"role": "user", "content": user_content})],
        thinking: None,
    };

    let response = provider.complete(request).await?;

    let understanding = CodebaseUnderstanding {
        repo_full_name: repo_full_name.to_string(),
        summary: response.text,
        generated_at: Utc::now(),
    };
    store.put_codebase_understanding(understanding).await?;

    Ok(())
}

fn build_tree_listing(workspace_root: &Path) -> String {
    let mut lines = Vec::new();
    for entry in WalkDir::new(workspace_root)
        .max_depth(3)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .filter_map(Result::ok)
    {
        if entry.path() == workspace_root {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(workspace_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let marker = if entry.file_type().is_dir() { "/" } else { "" };
        lines.push(format!("{relative}{marker}"));
    }
    lines.join("\n")
}

fn sample_files(workspace_root: &Path) -> String {
    let mut sections = Vec::new();
    for entry in WalkDir::new(workspace_root)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .take(MAX_SAMPLED_FILES)
    {
        let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
        let relative = entry
            .path()
            .strip_prefix(workspace_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let truncated: String = content.chars().take(MAX_FILE_SAMPLE_CHARS).collect();
        sections.push(format!("--- {relative} ---\n{truncated}"));
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use shadow_core::Usage;
    use shadow_provider::{InferenceError, RawEvent, RawFinishReason};

    use crate::store::InMemoryStore;

    struct FixedProvider(&'static str);

    #[async_trait]
    impl ProviderClient for FixedProvider {
        async fn stream(
            &self,
            _request: InferenceRequest,
        ) -> Result<BoxStream<'static, Result<RawEvent, InferenceError>>, InferenceError> {
            let events = vec![
                RawEvent::TextDelta(self.0.to_string()),
                RawEvent::Finish { reason: RawFinishReason::EndTurn, usage: Usage::default() },
            ];
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    #[tokio::test]
    async fn generates_a_fresh_summary_when_none_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn main() {}\n").unwrap();

        let store = InMemoryStore::new();
        let provider = FixedProvider("a small rust crate");

        generate_if_stale(&store, &provider, dir.path(), "o/r", Duration::hours(24))
            .await
            .unwrap();

        let understanding = store.get_codebase_understanding("o/r").await.unwrap().unwrap();
        assert_eq!(understanding.summary, "a small rust crate");
    }

    #[tokio::test]
    async fn skips_regeneration_when_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        store
            .put_codebase_understanding(CodebaseUnderstanding {
                repo_full_name: "o/r".to_string(),
                summary: "existing summary".to_string(),
                generated_at: Utc::now(),
            })
            .await
            .unwrap();

        let provider = FixedProvider("should not be used");
        generate_if_stale(&store, &provider, dir.path(), "o/r", Duration::hours(24))
            .await
            .unwrap();

        let understanding = store.get_codebase_understanding("o/r").await.unwrap().unwrap();
        assert_eq!(understanding.summary, "existing summary");
    }
}
