use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use walkdir::WalkDir;

use crate::handler::ToolHandler;
use crate::sandbox::resolve_in_workspace;

const MAX_OUTPUT_BYTES: usize = 20_000;
const DEFAULT_SEARCH_CAP: usize = 50;
const DEFAULT_TERMINAL_TIMEOUT: Duration = Duration::from_secs(30);

fn truncate(mut output: String) -> String {
    if output.len() > MAX_OUTPUT_BYTES {
        output.truncate(MAX_OUTPUT_BYTES);
        output.push_str("\n... [output truncated]");
    }
    output
}

/// Reads a slice of a file with 1-indexed line numbers. If the caller asked
/// for a range rather than the whole file, the response records what was
/// omitted so the model knows to ask again if it needs more.
pub struct ReadFile {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for ReadFile {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let target = input["target_file"].as_str().ok_or("missing target_file")?;
        let whole = input["should_read_entire_file"].as_bool().unwrap_or(false);
        let path = resolve_in_workspace(&self.workspace_root, target).map_err(|e| e.to_string())?;

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("failed to read {target}: {e}"))?;
        let lines: Vec<&str> = contents.lines().collect();
        let total = lines.len();

        let (start, end) = if whole {
            (1, total)
        } else {
            let start = input["start_line"].as_u64().unwrap_or(1).max(1) as usize;
            let end = input["end_line"].as_u64().unwrap_or(total as u64) as usize;
            (start, end.min(total))
        };

        let mut rendered = String::new();
        if start > 1 {
            rendered.push_str(&format!("... [lines 1-{} omitted] ...\n", start - 1));
        }
        for (idx, line) in lines.iter().enumerate().take(end).skip(start.saturating_sub(1)) {
            rendered.push_str(&format!("{}\t{}\n", idx + 1, line));
        }
        if end < total {
            rendered.push_str(&format!("... [lines {}-{total} omitted] ...\n", end + 1));
        }

        Ok(truncate(rendered))
    }
}

/// Writes a whole file atomically, creating parent directories as needed.
/// The model supplies the full new contents of the file (`code_edit`), not a
/// diff — `search_replace` is the surgical alternative for small changes.
pub struct EditFile {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for EditFile {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let target = input["target_file"].as_str().ok_or("missing target_file")?;
        let code_edit = input["code_edit"].as_str().ok_or("missing code_edit")?;
        let path = resolve_in_workspace(&self.workspace_root, target).map_err(|e| e.to_string())?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create parent directories: {e}"))?;
        }

        let tmp_path = path.with_extension("shadow-tmp");
        tokio::fs::write(&tmp_path, code_edit)
            .await
            .map_err(|e| format!("failed to write {target}: {e}"))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| format!("failed to finalize write to {target}: {e}"))?;

        Ok(format!("wrote {target}"))
    }
}

/// Replaces the first (and only permitted) occurrence of `old_string` with
/// `new_string`. Fails closed if the match is missing or ambiguous — the
/// caller is expected to supply enough surrounding context to be unique.
pub struct SearchReplace {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for SearchReplace {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let file_path = input["file_path"].as_str().ok_or("missing file_path")?;
        let old_string = input["old_string"].as_str().ok_or("missing old_string")?;
        let new_string = input["new_string"].as_str().ok_or("missing new_string")?;
        let path = resolve_in_workspace(&self.workspace_root, file_path).map_err(|e| e.to_string())?;

        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("failed to read {file_path}: {e}"))?;

        let occurrences = contents.matches(old_string).count();
        if occurrences == 0 {
            return Err(format!("old_string not found in {file_path}"));
        }
        if occurrences > 1 {
            return Err(format!(
                "old_string is ambiguous in {file_path}: {occurrences} occurrences"
            ));
        }

        let replaced = contents.replacen(old_string, new_string, 1);
        tokio::fs::write(&path, replaced)
            .await
            .map_err(|e| format!("failed to write {file_path}: {e}"))?;

        Ok(format!("replaced 1 occurrence in {file_path}"))
    }
}

/// Lists immediate entries of a directory, tagging each as a file or a dir.
pub struct ListDir {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for ListDir {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let rel = input["relative_workspace_path"].as_str().unwrap_or(".");
        let path = resolve_in_workspace(&self.workspace_root, rel).map_err(|e| e.to_string())?;

        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("failed to list {rel}: {e}"))?;

        let mut lines = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
            let file_type = entry.file_type().await.map_err(|e| e.to_string())?;
            let tag = if file_type.is_dir() { "[dir]" } else { "[file]" };
            lines.push(format!("{tag} {}", entry.file_name().to_string_lossy()));
        }
        lines.sort();

        Ok(truncate(lines.join("\n")))
    }
}

/// Fuzzy filename search: every path under the workspace whose basename
/// contains the query as a case-insensitive substring, capped at 50 results.
pub struct FileSearch {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for FileSearch {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let query = input["query"].as_str().ok_or("missing query")?.to_lowercase();
        let root = self.workspace_root.clone();

        let matches = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if found.len() >= DEFAULT_SEARCH_CAP {
                    break;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if name.contains(&query) {
                    let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                    found.push(rel.to_string_lossy().to_string());
                }
            }
            found
        })
        .await
        .map_err(|e| e.to_string())?;

        if matches.is_empty() {
            return Ok("no matching files".to_string());
        }
        Ok(matches.join("\n"))
    }
}

/// Regex text search across the workspace, optionally constrained by
/// include/exclude glob-style substrings on the file path, capped at 50 hits.
pub struct GrepSearch {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for GrepSearch {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let query = input["query"].as_str().ok_or("missing query")?.to_string();
        let include = input["include_pattern"].as_str().map(String::from);
        let exclude = input["exclude_pattern"].as_str().map(String::from);
        let case_sensitive = input["case_sensitive"].as_bool().unwrap_or(false);
        let root = self.workspace_root.clone();

        let regex = RegexBuilder::new(&query)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| format!("invalid regex: {e}"))?;

        let hits = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if found.len() >= DEFAULT_SEARCH_CAP {
                    break;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let rel_str = rel.to_string_lossy();
                if let Some(pattern) = &include {
                    if !rel_str.contains(pattern.as_str()) {
                        continue;
                    }
                }
                if let Some(pattern) = &exclude {
                    if rel_str.contains(pattern.as_str()) {
                        continue;
                    }
                }
                let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                for (line_no, line) in contents.lines().enumerate() {
                    if found.len() >= DEFAULT_SEARCH_CAP {
                        break;
                    }
                    if regex.is_match(line) {
                        found.push(format!("{}:{}: {}", rel_str, line_no + 1, line.trim()));
                    }
                }
            }
            found
        })
        .await
        .map_err(|e| e.to_string())?;

        if hits.is_empty() {
            return Ok("no matches".to_string());
        }
        Ok(hits.join("\n"))
    }
}

/// Semantic search against the indexed repository namespace. Backed by the
/// Background Service Manager's index when one exists for the variant's
/// repository; falls back to a plain grep-style scan of the query terms
/// when the index is cold, so the tool degrades rather than failing outright.
pub struct CodebaseSearch {
    pub workspace_root: PathBuf,
    pub index: Option<Arc<dyn SemanticIndex>>,
}

/// Abstraction over the background indexer's query surface, so this tool
/// doesn't depend on the indexing implementation directly.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn query(&self, query: &str, target_directories: &[String]) -> Result<Vec<SemanticHit>, String>;
}

#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub file: String,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f32,
    pub snippet: String,
}

#[async_trait]
impl ToolHandler for CodebaseSearch {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let query = input["query"].as_str().ok_or("missing query")?;
        let target_directories: Vec<String> = input["target_directories"]
            .as_array()
            .map(|dirs| dirs.iter().filter_map(|d| d.as_str().map(String::from)).collect())
            .unwrap_or_default();

        if let Some(index) = &self.index {
            let hits = index.query(query, &target_directories).await?;
            if !hits.is_empty() {
                return Ok(render_hits(&hits));
            }
        }

        self.fallback_scan(query, &target_directories).await
    }
}

impl CodebaseSearch {
    async fn fallback_scan(&self, query: &str, target_directories: &[String]) -> Result<String, String> {
        let terms: Vec<String> = query.split_whitespace().map(|s| s.to_lowercase()).collect();
        let root = self.workspace_root.clone();
        let dirs = target_directories.to_vec();

        let hits = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                if found.len() >= 10 {
                    break;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let rel_str = rel.to_string_lossy().to_string();
                if !dirs.is_empty() && !dirs.iter().any(|d| rel_str.starts_with(d.as_str())) {
                    continue;
                }
                let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let lower = contents.to_lowercase();
                let score = terms.iter().filter(|t| lower.contains(t.as_str())).count();
                if score == 0 {
                    continue;
                }
                let snippet: String = contents.lines().take(5).collect::<Vec<_>>().join("\n");
                found.push(SemanticHit {
                    file: rel_str,
                    start_line: 1,
                    end_line: contents.lines().count().min(5),
                    score: score as f32 / terms.len().max(1) as f32,
                    snippet,
                });
            }
            found
        })
        .await
        .map_err(|e| e.to_string())?;

        if hits.is_empty() {
            return Ok("no matches (semantic index unavailable, used fallback scan)".to_string());
        }
        Ok(render_hits(&hits))
    }
}

fn render_hits(hits: &[SemanticHit]) -> String {
    hits.iter()
        .map(|h| {
            format!(
                "{}:{}-{} (score {:.2})\n{}",
                h.file, h.start_line, h.end_line, h.score, h.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Executes a command inside the workspace sandbox with a hard timeout.
/// `is_background` returns immediately after spawning rather than waiting
/// for completion; the Agent Orchestrator is responsible for killing
/// backgrounded processes on cancellation.
pub struct RunTerminalCmd {
    pub workspace_root: PathBuf,
    pub timeout: Duration,
}

impl RunTerminalCmd {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            timeout: DEFAULT_TERMINAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl ToolHandler for RunTerminalCmd {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let command = input["command"].as_str().ok_or("missing command")?;
        let is_background = input["is_background"].as_bool().unwrap_or(false);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn command: {e}"))?;

        if is_background {
            return Ok(format!("started in background: {command}"));
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }

        let status = timeout(self.timeout, child.wait()).await;
        match status {
            Ok(Ok(exit)) => {
                let mut rendered = format!("exit status: {}\n", exit.code().unwrap_or(-1));
                rendered.push_str(&stdout);
                if !stderr.is_empty() {
                    rendered.push_str("\n[stderr]\n");
                    rendered.push_str(&stderr);
                }
                Ok(truncate(rendered))
            }
            Ok(Err(e)) => Err(format!("command wait failed: {e}")),
            Err(_) => {
                let _ = child.start_kill();
                Err(format!("command timed out after {:?} and was killed", self.timeout))
            }
        }
    }
}

/// Deletes a file. Idempotent: a missing file is a success, not an error.
pub struct DeleteFile {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolHandler for DeleteFile {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let target = input["target_file"].as_str().ok_or("missing target_file")?;
        let path = resolve_in_workspace(&self.workspace_root, target).map_err(|e| e.to_string())?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(format!("deleted {target}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(format!("{target} already absent")),
            Err(e) => Err(format!("failed to delete {target}: {e}")),
        }
    }
}

/// Replaces or merges the variant's todo list. The store is an in-memory
/// snapshot keyed by the variant — persistence of the list as part of the
/// variant record is the daemon's concern, not this handler's.
pub struct TodoWrite {
    pub state: Arc<tokio::sync::Mutex<Vec<Value>>>,
}

#[async_trait]
impl ToolHandler for TodoWrite {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let merge = input["merge"].as_bool().unwrap_or(false);
        let todos = input["todos"].as_array().ok_or("missing todos")?.clone();

        let mut state = self.state.lock().await;
        if merge {
            for todo in todos {
                let id = todo.get("id").cloned();
                if let Some(id) = id {
                    if let Some(existing) = state.iter_mut().find(|t| t.get("id") == Some(&id)) {
                        *existing = todo;
                        continue;
                    }
                }
                state.push(todo);
            }
        } else {
            *state = todos;
        }

        Ok(json!({ "todos": *state }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn read_file_renders_the_whole_file_with_line_numbers() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").await.unwrap();
        let tool = ReadFile { workspace_root: dir.path().to_path_buf() };

        let out = tool
            .call(&json!({ "target_file": "a.txt", "should_read_entire_file": true }))
            .await
            .unwrap();

        assert_eq!(out, "1\tone\n2\ttwo\n3\tthree\n");
    }

    #[tokio::test]
    async fn read_file_omits_lines_outside_the_requested_range() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").await.unwrap();
        let tool = ReadFile { workspace_root: dir.path().to_path_buf() };

        let out = tool
            .call(&json!({ "target_file": "a.txt", "start_line": 2, "end_line": 3 }))
            .await
            .unwrap();

        assert!(out.contains("[lines 1-1 omitted]"));
        assert!(out.contains("2\ttwo"));
        assert!(out.contains("3\tthree"));
        assert!(out.contains("[lines 4-4 omitted]"));
    }

    #[tokio::test]
    async fn edit_file_creates_parent_directories_and_writes_contents() {
        let dir = tempdir().unwrap();
        let tool = EditFile { workspace_root: dir.path().to_path_buf() };

        tool.call(&json!({ "target_file": "nested/dir/b.txt", "code_edit": "hello" }))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("nested/dir/b.txt")).await.unwrap();
        assert_eq!(contents, "hello");
    }

    #[tokio::test]
    async fn search_replace_rejects_an_ambiguous_match() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("c.txt"), "foo\nfoo\n").await.unwrap();
        let tool = SearchReplace { workspace_root: dir.path().to_path_buf() };

        let err = tool
            .call(&json!({ "file_path": "c.txt", "old_string": "foo", "new_string": "bar" }))
            .await
            .unwrap_err();

        assert!(err.contains("ambiguous"));
    }

    #[tokio::test]
    async fn search_replace_replaces_a_unique_match() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("c.txt"), "foo\nbaz\n").await.unwrap();
        let tool = SearchReplace { workspace_root: dir.path().to_path_buf() };

        tool.call(&json!({ "file_path": "c.txt", "old_string": "foo", "new_string": "bar" }))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("c.txt")).await.unwrap();
        assert_eq!(contents, "bar\nbaz\n");
    }

    #[tokio::test]
    async fn delete_file_is_idempotent_for_a_missing_file() {
        let dir = tempdir().unwrap();
        let tool = DeleteFile { workspace_root: dir.path().to_path_buf() };

        let out = tool.call(&json!({ "target_file": "missing.txt" })).await.unwrap();

        assert!(out.contains("already absent"));
    }

    #[tokio::test]
    async fn delete_file_removes_an_existing_file() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("d.txt"), "x").await.unwrap();
        let tool = DeleteFile { workspace_root: dir.path().to_path_buf() };

        tool.call(&json!({ "target_file": "d.txt" })).await.unwrap();

        assert!(!dir.path().join("d.txt").exists());
    }

    #[tokio::test]
    async fn list_dir_tags_files_and_directories() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("f.txt"), "x").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        let tool = ListDir { workspace_root: dir.path().to_path_buf() };

        let out = tool.call(&json!({ "relative_workspace_path": "." })).await.unwrap();

        assert!(out.contains("[file] f.txt"));
        assert!(out.contains("[dir] sub"));
    }

    #[tokio::test]
    async fn grep_search_finds_matches_and_respects_include_pattern() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.rs"), "fn needle() {}\n").await.unwrap();
        tokio::fs::write(dir.path().join("b.md"), "needle\n").await.unwrap();
        let tool = GrepSearch { workspace_root: dir.path().to_path_buf() };

        let out = tool
            .call(&json!({ "query": "needle", "include_pattern": ".rs" }))
            .await
            .unwrap();

        assert!(out.contains("a.rs"));
        assert!(!out.contains("b.md"));
    }

    #[tokio::test]
    async fn todo_write_merges_by_id_instead_of_duplicating() {
        let tool = TodoWrite { state: Arc::new(tokio::sync::Mutex::new(vec![])) };

        tool.call(&json!({ "todos": [{"id": "1", "text": "first", "status": "pending"}] }))
            .await
            .unwrap();
        let out = tool
            .call(&json!({
                "merge": true,
                "todos": [{"id": "1", "text": "first", "status": "done"}]
            }))
            .await
            .unwrap();

        let parsed: Value = serde_json::from_str(&out).unwrap();
        let todos = parsed["todos"].as_array().unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0]["status"], "done");
    }

    #[tokio::test]
    async fn codebase_search_falls_back_to_a_scan_when_no_index_is_configured() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("e.txt"), "widgets are great\n").await.unwrap();
        let tool = CodebaseSearch { workspace_root: dir.path().to_path_buf(), index: None };

        let out = tool.call(&json!({ "query": "widgets" })).await.unwrap();

        assert!(out.contains("e.txt"));
    }
}
