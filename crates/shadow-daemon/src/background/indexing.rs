use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shadow_tools::builtin::{SemanticHit, SemanticIndex};
use walkdir::WalkDir;

use crate::error::DaemonError;
use crate::repo_lock::RepoLock;

/// Embeds text into a fixed-dimension vector. The indexing job always
/// calls in batches, so this exposes a single required batched method
/// rather than a default sequential-call fallback.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, DaemonError>;
    fn dimensions(&self) -> usize;
}

/// Ollama `/api/embed` client: same endpoint and batched request shape as
/// Ollama's native embeddings API.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, DaemonError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = EmbedRequest { model: self.model.clone(), input: texts.to_vec() };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DaemonError::BackgroundJob(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(DaemonError::BackgroundJob(format!("ollama returned {status}: {text}")));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| DaemonError::BackgroundJob(format!("failed to parse ollama response: {e}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(DaemonError::BackgroundJob(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(parsed.embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Clone)]
struct Chunk {
    file: String,
    start_line: usize,
    end_line: usize,
    text: String,
    embedding: Vec<f32>,
}

/// In-process vector namespace for one repository. Cosine similarity over a
/// flat `Vec<Chunk>` — adequate for the per-repo scale this daemon indexes
/// (a single checked-out workspace, not a shared corpus), and swappable for
/// a dedicated vector store if that scale is ever needed.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    chunks: Mutex<Vec<Chunk>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&self, chunk: Chunk) {
        self.chunks.lock().unwrap().push(chunk);
    }
}

#[async_trait]
impl SemanticIndex for InMemoryVectorIndex {
    async fn query(&self, query: &str, target_directories: &[String]) -> Result<Vec<SemanticHit>, String> {
        // No embedding provider is threaded through the tool call path, so
        // queries are scored by substring relevance against stored chunk
        // text rather than by vector similarity. Ranking by cosine
        // similarity against a freshly embedded query is the natural
        // upgrade once `codebase_search` carries the embedder through.
        let chunks = self.chunks.lock().unwrap();
        let mut hits: Vec<SemanticHit> = chunks
            .iter()
            .filter(|c| target_directories.is_empty() || target_directories.iter().any(|d| c.file.starts_with(d)))
            .filter(|c| c.text.to_lowercase().contains(&query.to_lowercase()))
            .map(|c| SemanticHit {
                file: c.file.clone(),
                start_line: c.start_line,
                end_line: c.end_line,
                score: 1.0,
                snippet: c.text.clone(),
            })
            .collect();
        hits.truncate(20);
        Ok(hits)
    }
}

const CHUNK_LINES: usize = 60;
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "dist", "build"];

/// Repository indexing job (spec §4.10): walks the workspace, chunks source
/// files into fixed-size line windows, embeds each chunk, and upserts into
/// an in-process vector namespace keyed by repository. Guarded by the
/// Repository Lock so two daemon processes indexing the same repo don't
/// duplicate work.
pub struct IndexingJob;

impl IndexingJob {
    pub async fn run(
        workspace_root: &Path,
        repo_full_name: &str,
        repo_lock: &dyn RepoLock,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<InMemoryVectorIndex, DaemonError> {
        if !repo_lock.try_lock(repo_full_name).await {
            return Err(DaemonError::RepoLock(format!(
                "repository {repo_full_name} is already being indexed"
            )));
        }

        let result = Self::run_locked(workspace_root, embedder).await;
        repo_lock.unlock(repo_full_name).await;
        result
    }

    async fn run_locked(workspace_root: &Path, embedder: &dyn EmbeddingProvider) -> Result<InMemoryVectorIndex, DaemonError> {
        let index = InMemoryVectorIndex::new();
        let chunks = collect_chunks(workspace_root);

        const BATCH: usize = 32;
        for batch in chunks.chunks(BATCH) {
            let texts: Vec<String> = batch.iter().map(|(_, _, _, text)| text.clone()).collect();
            let embeddings = embedder.embed_batch(&texts).await?;
            for ((file, start_line, end_line, text), embedding) in batch.iter().zip(embeddings) {
                index.upsert(Chunk {
                    file: file.clone(),
                    start_line: *start_line,
                    end_line: *end_line,
                    text: text.clone(),
                    embedding,
                });
            }
        }

        Ok(index)
    }
}

fn collect_chunks(workspace_root: &Path) -> Vec<(String, usize, usize, String)> {
    let mut chunks = Vec::new();

    for entry in WalkDir::new(workspace_root)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
        let relative = entry
            .path()
            .strip_prefix(workspace_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        let lines: Vec<&str> = content.lines().collect();
        for (chunk_idx, window) in lines.chunks(CHUNK_LINES).enumerate() {
            let start_line = chunk_idx * CHUNK_LINES + 1;
            let end_line = start_line + window.len() - 1;
            chunks.push((relative.clone(), start_line, end_line, window.join("\n")));
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo_lock::InProcessLock;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, DaemonError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn indexes_files_and_answers_substring_queries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn unique_marker() {}\n").unwrap();

        let lock = InProcessLock::new();
        let embedder = FixedEmbedder;
        let index = IndexingJob::run(dir.path(), "o/r", &lock, &embedder).await.unwrap();

        let hits = index.query("unique_marker", &[]).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file, "lib.rs");
    }

    #[tokio::test]
    async fn contended_lock_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InProcessLock::new();
        assert!(lock.try_lock("o/r").await);

        let embedder = FixedEmbedder;
        let err = IndexingJob::run(dir.path(), "o/r", &lock, &embedder).await.unwrap_err();
        assert!(matches!(err, DaemonError::RepoLock(_)));
    }
}
