pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shadow_core::{
    ChatMessage, CodebaseUnderstanding, CompressionLevel, InitStatus, Part, PullRequestSnapshot,
    Task, TaskId, TaskStatus, ToolCall, ToolCallId, ToolCallStatus, Usage, Variant, VariantId,
    VariantStatus,
};

use crate::error::StoreError;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// New-task fields supplied by HTTP ingress. `Store::create_task` assigns
/// the identifier, initial status, and timestamps.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner: String,
    pub repo_full_name: String,
    pub repo_url: String,
    pub base_branch: String,
    pub base_commit: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct NewVariant {
    pub task_id: TaskId,
    pub model_id: String,
    pub sequence: u32,
    pub shadow_branch: String,
    pub workspace_path: String,
}

/// `(taskId, sequence)` is unique and strictly increasing — this adapter is
/// the only place that mints sequence numbers, inside a short critical
/// section against the task (spec §5's ordering rule (b)).
///
/// Thin data-access layer: tasks, variants, chat messages (parts, usage,
/// compression levels), tool-call records, PR snapshots, codebase
/// understanding. No business logic lives here — the Orchestrator, Context
/// Manager, and Background Service Manager are the callers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, new_task: NewTask) -> Result<Task, StoreError>;
    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError>;
    async fn set_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError>;
    async fn add_task_tokens(&self, task_id: TaskId, usage: &Usage) -> Result<(), StoreError>;
    async fn set_task_pull_request_number(&self, task_id: TaskId, pr_number: u64) -> Result<(), StoreError>;
    /// Archives every Variant with `pull_request_number == pr_number` on `repo_full_name`,
    /// used by the pull-request-closed webhook. Returns how many variants were touched.
    async fn archive_by_pull_request(
        &self,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<u32, StoreError>;

    async fn create_variant(&self, new_variant: NewVariant) -> Result<Variant, StoreError>;
    async fn get_variant(&self, variant_id: VariantId) -> Result<Variant, StoreError>;
    async fn list_variants(&self, task_id: TaskId) -> Result<Vec<Variant>, StoreError>;
    async fn set_variant_status(&self, variant_id: VariantId, status: VariantStatus) -> Result<(), StoreError>;
    async fn set_variant_init_status(
        &self,
        variant_id: VariantId,
        init_status: InitStatus,
        init_error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Allocates the next sequence number for a task and inserts the new
    /// message atomically — the short critical section named in spec §5.
    async fn append_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;
    async fn get_message(&self, message_id: shadow_core::MessageId) -> Result<ChatMessage, StoreError>;
    async fn list_messages(&self, task_id: TaskId) -> Result<Vec<ChatMessage>, StoreError>;
    async fn next_sequence(&self, task_id: TaskId) -> Result<u64, StoreError>;

    /// Replaces a message's `parts` wholesale. Parts are append-only from the
    /// Orchestrator's point of view — this is how the debounced writer
    /// flushes the in-memory accumulation; it never removes previously
    /// flushed parts.
    async fn set_message_parts(&self, message_id: shadow_core::MessageId, parts: Vec<Part>) -> Result<(), StoreError>;
    async fn set_message_finish(
        &self,
        message_id: shadow_core::MessageId,
        finish_reason: String,
        usage: Usage,
    ) -> Result<(), StoreError>;
    async fn set_compressed_version(
        &self,
        message_id: shadow_core::MessageId,
        level: CompressionLevel,
        content: String,
        tokens: u32,
        compressed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn set_pull_request_snapshot(
        &self,
        message_id: shadow_core::MessageId,
        snapshot: PullRequestSnapshot,
    ) -> Result<(), StoreError>;

    async fn create_tool_call(&self, tool_call: ToolCall) -> Result<ToolCall, StoreError>;
    async fn set_tool_call_status(
        &self,
        tool_call_id: ToolCallId,
        status: ToolCallStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn get_codebase_understanding(
        &self,
        repo_full_name: &str,
    ) -> Result<Option<CodebaseUnderstanding>, StoreError>;
    async fn put_codebase_understanding(
        &self,
        understanding: CodebaseUnderstanding,
    ) -> Result<(), StoreError>;
}
