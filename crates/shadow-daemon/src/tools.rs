use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use shadow_tools::builtin::{
    CodebaseSearch, DeleteFile, EditFile, FileSearch, GrepSearch, ListDir, ReadFile,
    RunTerminalCmd, SearchReplace, SemanticIndex, TodoWrite,
};
use shadow_tools::decorator::redaction::RedactionTransform;
use shadow_tools::decorator::source_tag::SourceTagTransform;
use shadow_tools::{ToolPipeline, ToolRegistry};
use tokio::sync::Mutex;

/// Schemas for the closed ten-tool set, in Anthropic tool-use shape
/// (`name`/`description`/`input_schema`), matching the argument contracts in
/// spec §4.6 exactly. Kept alongside the registry builder so schema and
/// handler never drift apart.
fn read_file_schema() -> serde_json::Value {
    json!({
        "name": "read_file",
        "description": "Read a slice of a file in the workspace, 1-indexed.",
        "input_schema": {
            "type": "object",
            "properties": {
                "target_file": {"type": "string"},
                "should_read_entire_file": {"type": "boolean"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"}
            },
            "required": ["target_file", "should_read_entire_file"]
        }
    })
}

fn edit_file_schema() -> serde_json::Value {
    json!({
        "name": "edit_file",
        "description": "Create or overwrite a file's full contents.",
        "input_schema": {
            "type": "object",
            "properties": {
                "target_file": {"type": "string"},
                "code_edit": {"type": "string"},
                "instructions": {"type": "string"}
            },
            "required": ["target_file", "code_edit", "instructions"]
        }
    })
}

fn search_replace_schema() -> serde_json::Value {
    json!({
        "name": "search_replace",
        "description": "Replace the single occurrence of old_string with new_string in a file.",
        "input_schema": {
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "old_string": {"type": "string"},
                "new_string": {"type": "string"}
            },
            "required": ["file_path", "old_string", "new_string"]
        }
    })
}

fn list_dir_schema() -> serde_json::Value {
    json!({
        "name": "list_dir",
        "description": "List entries of a workspace-relative directory.",
        "input_schema": {
            "type": "object",
            "properties": {"relative_workspace_path": {"type": "string"}},
            "required": ["relative_workspace_path"]
        }
    })
}

fn file_search_schema() -> serde_json::Value {
    json!({
        "name": "file_search",
        "description": "Fuzzy filename search, capped results.",
        "input_schema": {
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }
    })
}

fn grep_search_schema() -> serde_json::Value {
    json!({
        "name": "grep_search",
        "description": "Regex text search across the workspace, capped results.",
        "input_schema": {
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "include_pattern": {"type": "string"},
                "exclude_pattern": {"type": "string"},
                "case_sensitive": {"type": "boolean"}
            },
            "required": ["query"]
        }
    })
}

fn codebase_search_schema() -> serde_json::Value {
    json!({
        "name": "codebase_search",
        "description": "Semantic search against the indexed repository namespace.",
        "input_schema": {
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "target_directories": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["query"]
        }
    })
}

fn run_terminal_cmd_schema() -> serde_json::Value {
    json!({
        "name": "run_terminal_cmd",
        "description": "Run a shell command inside the workspace sandbox.",
        "input_schema": {
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "is_background": {"type": "boolean"}
            },
            "required": ["command", "is_background"]
        }
    })
}

fn delete_file_schema() -> serde_json::Value {
    json!({
        "name": "delete_file",
        "description": "Delete a file. Idempotent.",
        "input_schema": {
            "type": "object",
            "properties": {"target_file": {"type": "string"}},
            "required": ["target_file"]
        }
    })
}

fn todo_write_schema() -> serde_json::Value {
    json!({
        "name": "todo_write",
        "description": "Replace or merge the task's todo list.",
        "input_schema": {
            "type": "object",
            "properties": {
                "merge": {"type": "boolean"},
                "todos": {"type": "array", "items": {"type": "object"}}
            },
            "required": ["merge", "todos"]
        }
    })
}

/// Assembles the closed tool set for one variant's workspace: the ten
/// handlers from `shadow_tools::builtin` behind a `ToolPipeline` running the
/// redaction transform (phase 1, always) and the source-tag decorator
/// (phase 2, advisory). `semantic_index` is the Background Service
/// Manager's query surface for `codebase_search`; `None` until that
/// variant's indexing job completes, at which point `codebase_search` falls
/// back to a plain scan (spec §4.6 notes this as graceful degradation).
pub fn build_pipeline(
    workspace_root: PathBuf,
    tool_timeout: std::time::Duration,
    semantic_index: Option<Arc<dyn SemanticIndex>>,
) -> ToolPipeline {
    let todo_state = Arc::new(Mutex::new(Vec::new()));

    let registry = ToolRegistry::new()
        .add(
            "read_file",
            read_file_schema(),
            ReadFile {
                workspace_root: workspace_root.clone(),
            },
        )
        .add(
            "edit_file",
            edit_file_schema(),
            EditFile {
                workspace_root: workspace_root.clone(),
            },
        )
        .add(
            "search_replace",
            search_replace_schema(),
            SearchReplace {
                workspace_root: workspace_root.clone(),
            },
        )
        .add(
            "list_dir",
            list_dir_schema(),
            ListDir {
                workspace_root: workspace_root.clone(),
            },
        )
        .add(
            "file_search",
            file_search_schema(),
            FileSearch {
                workspace_root: workspace_root.clone(),
            },
        )
        .add(
            "grep_search",
            grep_search_schema(),
            GrepSearch {
                workspace_root: workspace_root.clone(),
            },
        )
        .add(
            "codebase_search",
            codebase_search_schema(),
            CodebaseSearch {
                workspace_root: workspace_root.clone(),
                index: semantic_index,
            },
        )
        .add(
            "run_terminal_cmd",
            run_terminal_cmd_schema(),
            RunTerminalCmd {
                workspace_root: workspace_root.clone(),
                timeout: tool_timeout,
            },
        )
        .add(
            "delete_file",
            delete_file_schema(),
            DeleteFile {
                workspace_root: workspace_root.clone(),
            },
        )
        .add("todo_write", todo_write_schema(), TodoWrite { state: todo_state });

    ToolPipeline::new(registry)
        .with_transform(RedactionTransform::new())
        .with_decorator(SourceTagTransform)
}
