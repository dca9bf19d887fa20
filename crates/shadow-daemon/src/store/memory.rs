use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shadow_core::{
    ChatMessage, CodebaseUnderstanding, CompressionLevel, InitStatus, MessageId, Part,
    PullRequestSnapshot, Task, TaskId, TaskStatus, ToolCall, ToolCallId, ToolCallStatus, Usage,
    Variant, VariantId, VariantStatus,
};

use crate::error::StoreError;
use crate::store::{NewTask, NewVariant, Store};

/// In-process `Store` backed by plain `HashMap`s behind a `Mutex`: a fully
/// functional implementation of the trait, used by unit/integration tests
/// so the Orchestrator, Context Manager, and HTTP layer never need a live
/// Postgres instance to be exercised.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    variants: HashMap<VariantId, Variant>,
    variants_by_task: HashMap<TaskId, Vec<VariantId>>,
    messages: HashMap<MessageId, ChatMessage>,
    messages_by_task: HashMap<TaskId, Vec<MessageId>>,
    next_sequence: HashMap<TaskId, u64>,
    tool_calls: HashMap<ToolCallId, ToolCall>,
    codebase_understanding: HashMap<String, CodebaseUnderstanding>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            owner: new_task.owner,
            repo_full_name: new_task.repo_full_name,
            repo_url: new_task.repo_url,
            base_branch: new_task.base_branch,
            base_commit: new_task.base_commit,
            title: new_task.title,
            status: TaskStatus::Initializing,
            total_tokens: 0,
            pull_request_number: None,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    async fn set_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn add_task_tokens(&self, task_id: TaskId, usage: &Usage) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.total_tokens += (usage.input_tokens + usage.output_tokens) as u64;
        Ok(())
    }

    async fn set_task_pull_request_number(&self, task_id: TaskId, pr_number: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.pull_request_number = Some(pr_number);
        Ok(())
    }

    async fn archive_by_pull_request(
        &self,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let matching_tasks: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.repo_full_name == repo_full_name && t.pull_request_number == Some(pr_number))
            .map(|t| t.id)
            .collect();

        let mut touched = 0u32;
        for task_id in matching_tasks {
            if let Some(variant_ids) = inner.variants_by_task.get(&task_id).cloned() {
                for variant_id in variant_ids {
                    if let Some(variant) = inner.variants.get_mut(&variant_id) {
                        variant.status = VariantStatus::Stopped;
                        touched += 1;
                    }
                }
            }
        }
        Ok(touched)
    }

    async fn create_variant(&self, new_variant: NewVariant) -> Result<Variant, StoreError> {
        let now = Utc::now();
        let variant = Variant {
            id: VariantId::new(),
            task_id: new_variant.task_id,
            model_id: new_variant.model_id,
            sequence: new_variant.sequence,
            shadow_branch: new_variant.shadow_branch,
            status: VariantStatus::Initializing,
            init_status: InitStatus::Inactive,
            init_error: None,
            workspace_path: new_variant.workspace_path,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.variants.insert(variant.id, variant.clone());
        inner
            .variants_by_task
            .entry(variant.task_id)
            .or_default()
            .push(variant.id);
        Ok(variant)
    }

    async fn get_variant(&self, variant_id: VariantId) -> Result<Variant, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .variants
            .get(&variant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(variant_id.to_string()))
    }

    async fn list_variants(&self, task_id: TaskId) -> Result<Vec<Variant>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .variants_by_task
            .get(&task_id)
            .map(|ids| ids.iter().filter_map(|id| inner.variants.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn set_variant_status(&self, variant_id: VariantId, status: VariantStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let variant = inner
            .variants
            .get_mut(&variant_id)
            .ok_or_else(|| StoreError::NotFound(variant_id.to_string()))?;
        variant.status = status;
        variant.updated_at = Utc::now();
        Ok(())
    }

    async fn set_variant_init_status(
        &self,
        variant_id: VariantId,
        init_status: InitStatus,
        init_error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let variant = inner
            .variants
            .get_mut(&variant_id)
            .ok_or_else(|| StoreError::NotFound(variant_id.to_string()))?;
        variant.init_status = init_status;
        variant.init_error = init_error;
        variant.updated_at = Utc::now();
        Ok(())
    }

    async fn next_sequence(&self, task_id: TaskId) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.next_sequence.entry(task_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn append_message(&self, mut message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.next_sequence.entry(message.task_id).or_insert(0);
        *counter += 1;
        message.sequence = *counter;

        inner.messages.insert(message.id, message.clone());
        inner.messages_by_task.entry(message.task_id).or_default().push(message.id);
        Ok(message)
    }

    async fn get_message(&self, message_id: MessageId) -> Result<ChatMessage, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))
    }

    async fn list_messages(&self, task_id: TaskId) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<ChatMessage> = inner
            .messages_by_task
            .get(&task_id)
            .map(|ids| ids.iter().filter_map(|id| inner.messages.get(id).cloned()).collect())
            .unwrap_or_default();
        messages.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.created_at.cmp(&b.created_at)));
        Ok(messages)
    }

    async fn set_message_parts(&self, message_id: MessageId, parts: Vec<Part>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        message.parts = parts;
        Ok(())
    }

    async fn set_message_finish(
        &self,
        message_id: MessageId,
        finish_reason: String,
        usage: Usage,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        message.finish_reason = Some(finish_reason);
        message.usage = usage;
        Ok(())
    }

    async fn set_compressed_version(
        &self,
        message_id: MessageId,
        level: CompressionLevel,
        content: String,
        tokens: u32,
        compressed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        message.compressed_versions.insert(
            level,
            shadow_core::model::CompressedVersion {
                content,
                tokens,
                compressed_at,
            },
        );
        Ok(())
    }

    async fn set_pull_request_snapshot(
        &self,
        message_id: MessageId,
        snapshot: PullRequestSnapshot,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        message.pull_request_snapshot = Some(snapshot);
        Ok(())
    }

    async fn create_tool_call(&self, tool_call: ToolCall) -> Result<ToolCall, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tool_calls.insert(tool_call.id, tool_call.clone());
        Ok(tool_call)
    }

    async fn set_tool_call_status(
        &self,
        tool_call_id: ToolCallId,
        status: ToolCallStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let tool_call = inner
            .tool_calls
            .get_mut(&tool_call_id)
            .ok_or_else(|| StoreError::NotFound(tool_call_id.to_string()))?;
        tool_call.status = status;
        tool_call.result = result;
        tool_call.error = error;
        if matches!(status, ToolCallStatus::Success | ToolCallStatus::Error) {
            tool_call.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_codebase_understanding(
        &self,
        repo_full_name: &str,
    ) -> Result<Option<CodebaseUnderstanding>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .codebase_understanding
            .get(repo_full_name)
            .cloned())
    }

    async fn put_codebase_understanding(&self, understanding: CodebaseUnderstanding) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .codebase_understanding
            .insert(understanding.repo_full_name.clone(), understanding);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_core::ChatRole;
    use std::collections::HashMap as StdHashMap;

    fn new_task() -> NewTask {
        NewTask {
            owner: "alice".into(),
            repo_full_name: "o/r".into(),
            repo_url: "https://github.com/o/r".into(),
            base_branch: "main".into(),
            base_commit: "abc123".into(),
            title: "fix the bug".into(),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_strictly_increasing() {
        let store = InMemoryStore::new();
        let task = store.create_task(new_task()).await.unwrap();

        let make_message = |task_id: TaskId| ChatMessage {
            id: MessageId::new(),
            task_id,
            variant_id: VariantId::new(),
            role: ChatRole::User,
            content: "hi".into(),
            parts: vec![],
            sequence: 0,
            created_at: Utc::now(),
            model_id: None,
            usage: Usage::default(),
            finish_reason: None,
            active_compression_level: CompressionLevel::None,
            compressed_versions: StdHashMap::new(),
            pull_request_snapshot: None,
        };

        let first = store.append_message(make_message(task.id)).await.unwrap();
        let second = store.append_message(make_message(task.id)).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn archive_by_pull_request_stops_matching_variants_only() {
        let store = InMemoryStore::new();
        let task = store.create_task(new_task()).await.unwrap();
        store.set_task_pull_request_number(task.id, 42).await.unwrap();
        let variant = store
            .create_variant(NewVariant {
                task_id: task.id,
                model_id: "claude-sonnet-4-20250514".into(),
                sequence: 1,
                shadow_branch: "shadow/task-1/variant-1".into(),
                workspace_path: "/tmp/ws".into(),
            })
            .await
            .unwrap();

        let other_task = store.create_task(new_task()).await.unwrap();
        store
            .create_variant(NewVariant {
                task_id: other_task.id,
                model_id: "claude-sonnet-4-20250514".into(),
                sequence: 1,
                shadow_branch: "shadow/task-2/variant-1".into(),
                workspace_path: "/tmp/ws2".into(),
            })
            .await
            .unwrap();

        let touched = store.archive_by_pull_request("o/r", 42).await.unwrap();
        assert_eq!(touched, 1);
        let reloaded = store.get_variant(variant.id).await.unwrap();
        assert_eq!(reloaded.status, VariantStatus::Stopped);
    }
}
