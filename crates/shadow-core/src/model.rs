use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, TaskId, ToolCallId, VariantId};
use crate::parts::Part;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariantStatus {
    Initializing,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitStatus {
    Inactive,
    PrepareWorkspace,
    IndexRepository,
    GenerateWiki,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatRole {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompressionLevel {
    #[default]
    None,
    Light,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner: String,
    pub repo_full_name: String,
    pub repo_url: String,
    pub base_branch: String,
    pub base_commit: String,
    pub title: String,
    pub status: TaskStatus,
    pub total_tokens: u64,
    pub pull_request_number: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub task_id: TaskId,
    pub model_id: String,
    pub sequence: u32,
    pub shadow_branch: String,
    pub status: VariantStatus,
    pub init_status: InitStatus,
    pub init_error: Option<String>,
    pub workspace_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cached compressed rendering of a message's content at a given level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedVersion {
    pub content: String,
    pub tokens: u32,
    pub compressed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub task_id: TaskId,
    pub variant_id: VariantId,
    pub role: ChatRole,
    pub content: String,
    pub parts: Vec<Part>,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub model_id: Option<String>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    pub active_compression_level: CompressionLevel,
    pub compressed_versions: HashMap<CompressionLevel, CompressedVersion>,
    pub pull_request_snapshot: Option<PullRequestSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub message_id: MessageId,
    pub tool_name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub title: String,
    pub description: String,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub files_changed: u32,
    pub commit_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebaseUnderstanding {
    pub repo_full_name: String,
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}
