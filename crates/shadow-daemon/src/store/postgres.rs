use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shadow_core::{
    ChatMessage, ChatRole, CodebaseUnderstanding, CompressionLevel, InitStatus, MessageId, Part,
    PullRequestSnapshot, Task, TaskId, TaskStatus, ToolCall, ToolCallId, ToolCallStatus, Usage,
    Variant, VariantId, VariantStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::store::{NewTask, NewVariant, Store};

/// sqlx/Postgres implementation of the Persistence Adapter. Runs against the
/// schema in `migrations/0001_init.sql`; `PostgresStore::connect` applies
/// pending migrations before returning so the daemon binary never needs a
/// separate migrate step in dev.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            StoreError::Database(sqlx::Error::Migrate(Box::new(e)))
        })?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn enum_to_text<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => unreachable!("status enums always serialize to a string"),
    }
}

fn text_to_enum<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(text.to_string())).map_err(StoreError::from)
}

fn row_to_task(row: &PgRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: TaskId::from_uuid(row.try_get("id")?),
        owner: row.try_get("owner")?,
        repo_full_name: row.try_get("repo_full_name")?,
        repo_url: row.try_get("repo_url")?,
        base_branch: row.try_get("base_branch")?,
        base_commit: row.try_get("base_commit")?,
        title: row.try_get("title")?,
        status: text_to_enum(row.try_get::<String, _>("status")?.as_str())?,
        total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
        pull_request_number: row.try_get::<Option<i64>, _>("pull_request_number")?.map(|n| n as u64),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_variant(row: &PgRow) -> Result<Variant, StoreError> {
    Ok(Variant {
        id: VariantId::from_uuid(row.try_get("id")?),
        task_id: TaskId::from_uuid(row.try_get("task_id")?),
        model_id: row.try_get("model_id")?,
        sequence: row.try_get::<i32, _>("sequence")? as u32,
        shadow_branch: row.try_get("shadow_branch")?,
        status: text_to_enum(row.try_get::<String, _>("status")?.as_str())?,
        init_status: text_to_enum(row.try_get::<String, _>("init_status")?.as_str())?,
        init_error: row.try_get("init_error")?,
        workspace_path: row.try_get("workspace_path")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &PgRow) -> Result<ChatMessage, StoreError> {
    let parts_json: Value = row.try_get("parts")?;
    let parts: Vec<Part> = serde_json::from_value(parts_json)?;

    let compressed_json: Value = row.try_get("compressed_versions")?;
    let compressed_versions: HashMap<CompressionLevel, shadow_core::model::CompressedVersion> =
        serde_json::from_value(compressed_json)?;

    let pr_json: Option<Value> = row.try_get("pull_request_snapshot")?;
    let pull_request_snapshot: Option<PullRequestSnapshot> = match pr_json {
        Some(v) if !v.is_null() => Some(serde_json::from_value(v)?),
        _ => None,
    };

    Ok(ChatMessage {
        id: MessageId::from_uuid(row.try_get("id")?),
        task_id: TaskId::from_uuid(row.try_get("task_id")?),
        variant_id: VariantId::from_uuid(row.try_get("variant_id")?),
        role: text_to_enum(row.try_get::<String, _>("role")?.as_str())?,
        content: row.try_get("content")?,
        parts,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        created_at: row.try_get("created_at")?,
        model_id: row.try_get("model_id")?,
        usage: Usage {
            input_tokens: row.try_get::<i32, _>("input_tokens")? as u32,
            output_tokens: row.try_get::<i32, _>("output_tokens")? as u32,
        },
        finish_reason: row.try_get("finish_reason")?,
        active_compression_level: text_to_enum(row.try_get::<String, _>("active_compression_level")?.as_str())?,
        compressed_versions,
        pull_request_snapshot,
    })
}

fn row_to_tool_call(row: &PgRow) -> Result<ToolCall, StoreError> {
    let args: Value = row.try_get("args")?;
    Ok(ToolCall {
        id: ToolCallId::from_uuid(row.try_get("id")?),
        message_id: MessageId::from_uuid(row.try_get("message_id")?),
        tool_name: row.try_get("tool_name")?,
        args,
        status: text_to_enum(row.try_get::<String, _>("status")?.as_str())?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_task(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let id = TaskId::new();
        let now = Utc::now();
        let status = TaskStatus::Initializing;

        sqlx::query(
            "insert into tasks (id, owner, repo_full_name, repo_url, base_branch, base_commit, \
             title, status, total_tokens, pull_request_number, created_at, updated_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, 0, null, $9, $9)",
        )
        .bind(id.as_uuid())
        .bind(&new_task.owner)
        .bind(&new_task.repo_full_name)
        .bind(&new_task.repo_url)
        .bind(&new_task.base_branch)
        .bind(&new_task.base_commit)
        .bind(&new_task.title)
        .bind(enum_to_text(&status))
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query("insert into task_sequences (task_id, next_sequence) values ($1, 0)")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(Task {
            id,
            owner: new_task.owner,
            repo_full_name: new_task.repo_full_name,
            repo_url: new_task.repo_url,
            base_branch: new_task.base_branch,
            base_commit: new_task.base_commit,
            title: new_task.title,
            status,
            total_tokens: 0,
            pull_request_number: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let row = sqlx::query("select * from tasks where id = $1")
            .bind(task_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        row_to_task(&row)
    }

    async fn set_task_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        sqlx::query("update tasks set status = $1, updated_at = now() where id = $2")
            .bind(enum_to_text(&status))
            .bind(task_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_task_tokens(&self, task_id: TaskId, usage: &Usage) -> Result<(), StoreError> {
        let total = (usage.input_tokens + usage.output_tokens) as i64;
        sqlx::query("update tasks set total_tokens = total_tokens + $1, updated_at = now() where id = $2")
            .bind(total)
            .bind(task_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_task_pull_request_number(&self, task_id: TaskId, pr_number: u64) -> Result<(), StoreError> {
        sqlx::query("update tasks set pull_request_number = $1, updated_at = now() where id = $2")
            .bind(pr_number as i64)
            .bind(task_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn archive_by_pull_request(
        &self,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<u32, StoreError> {
        let result = sqlx::query(
            "update variants set status = $1, updated_at = now() \
             where task_id in (select id from tasks where repo_full_name = $2 and pull_request_number = $3)",
        )
        .bind(enum_to_text(&VariantStatus::Stopped))
        .bind(repo_full_name)
        .bind(pr_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    async fn create_variant(&self, new_variant: NewVariant) -> Result<Variant, StoreError> {
        let id = VariantId::new();
        let now = Utc::now();
        let status = VariantStatus::Initializing;
        let init_status = InitStatus::Inactive;

        sqlx::query(
            "insert into variants (id, task_id, model_id, sequence, shadow_branch, status, \
             init_status, init_error, workspace_path, created_at, updated_at) \
             values ($1, $2, $3, $4, $5, $6, $7, null, $8, $9, $9)",
        )
        .bind(id.as_uuid())
        .bind(new_variant.task_id.as_uuid())
        .bind(&new_variant.model_id)
        .bind(new_variant.sequence as i32)
        .bind(&new_variant.shadow_branch)
        .bind(enum_to_text(&status))
        .bind(enum_to_text(&init_status))
        .bind(&new_variant.workspace_path)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Variant {
            id,
            task_id: new_variant.task_id,
            model_id: new_variant.model_id,
            sequence: new_variant.sequence,
            shadow_branch: new_variant.shadow_branch,
            status,
            init_status,
            init_error: None,
            workspace_path: new_variant.workspace_path,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_variant(&self, variant_id: VariantId) -> Result<Variant, StoreError> {
        let row = sqlx::query("select * from variants where id = $1")
            .bind(variant_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(variant_id.to_string()))?;
        row_to_variant(&row)
    }

    async fn list_variants(&self, task_id: TaskId) -> Result<Vec<Variant>, StoreError> {
        let rows = sqlx::query("select * from variants where task_id = $1 order by sequence")
            .bind(task_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_variant).collect()
    }

    async fn set_variant_status(&self, variant_id: VariantId, status: VariantStatus) -> Result<(), StoreError> {
        sqlx::query("update variants set status = $1, updated_at = now() where id = $2")
            .bind(enum_to_text(&status))
            .bind(variant_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_variant_init_status(
        &self,
        variant_id: VariantId,
        init_status: InitStatus,
        init_error: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query("update variants set init_status = $1, init_error = $2, updated_at = now() where id = $3")
            .bind(enum_to_text(&init_status))
            .bind(init_error)
            .bind(variant_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_sequence(&self, task_id: TaskId) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "update task_sequences set next_sequence = next_sequence + 1 \
             where task_id = $1 returning next_sequence",
        )
        .bind(task_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("next_sequence")? as u64)
    }

    async fn append_message(&self, mut message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut tx = self.pool.begin().await?;

        let seq_row = sqlx::query(
            "update task_sequences set next_sequence = next_sequence + 1 \
             where task_id = $1 returning next_sequence",
        )
        .bind(message.task_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        message.sequence = seq_row.try_get::<i64, _>("next_sequence")? as u64;

        sqlx::query(
            "insert into chat_messages (id, task_id, variant_id, role, content, parts, sequence, \
             created_at, model_id, input_tokens, output_tokens, finish_reason, \
             active_compression_level, compressed_versions, pull_request_snapshot) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(message.id.as_uuid())
        .bind(message.task_id.as_uuid())
        .bind(message.variant_id.as_uuid())
        .bind(enum_to_text(&message.role))
        .bind(&message.content)
        .bind(serde_json::to_value(&message.parts)?)
        .bind(message.sequence as i64)
        .bind(message.created_at)
        .bind(&message.model_id)
        .bind(message.usage.input_tokens as i32)
        .bind(message.usage.output_tokens as i32)
        .bind(&message.finish_reason)
        .bind(enum_to_text(&message.active_compression_level))
        .bind(serde_json::to_value(&message.compressed_versions)?)
        .bind(
            message
                .pull_request_snapshot
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn get_message(&self, message_id: MessageId) -> Result<ChatMessage, StoreError> {
        let row = sqlx::query("select * from chat_messages where id = $1")
            .bind(message_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        row_to_message(&row)
    }

    async fn list_messages(&self, task_id: TaskId) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query("select * from chat_messages where task_id = $1 order by sequence")
            .bind(task_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn set_message_parts(&self, message_id: MessageId, parts: Vec<Part>) -> Result<(), StoreError> {
        sqlx::query("update chat_messages set parts = $1 where id = $2")
            .bind(serde_json::to_value(&parts)?)
            .bind(message_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_message_finish(
        &self,
        message_id: MessageId,
        finish_reason: String,
        usage: Usage,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "update chat_messages set finish_reason = $1, input_tokens = $2, output_tokens = $3 where id = $4",
        )
        .bind(finish_reason)
        .bind(usage.input_tokens as i32)
        .bind(usage.output_tokens as i32)
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await?;
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
        let mut message = self.get_message(message_id).await?;
        message.compressed_versions.insert(
            level,
            shadow_core::model::CompressedVersion {
                content,
                tokens,
                compressed_at,
            },
        );
        sqlx::query("update chat_messages set compressed_versions = $1 where id = $2")
            .bind(serde_json::to_value(&message.compressed_versions)?)
            .bind(message_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_pull_request_snapshot(
        &self,
        message_id: MessageId,
        snapshot: PullRequestSnapshot,
    ) -> Result<(), StoreError> {
        sqlx::query("update chat_messages set pull_request_snapshot = $1 where id = $2")
            .bind(serde_json::to_value(&snapshot)?)
            .bind(message_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_tool_call(&self, tool_call: ToolCall) -> Result<ToolCall, StoreError> {
        let message = self.get_message(tool_call.message_id).await?;
        sqlx::query(
            "insert into tool_calls (id, task_id, message_id, tool_name, args, status, result, \
             error, created_at, completed_at) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(tool_call.id.as_uuid())
        .bind(message.task_id.as_uuid())
        .bind(tool_call.message_id.as_uuid())
        .bind(&tool_call.tool_name)
        .bind(&tool_call.args)
        .bind(enum_to_text(&tool_call.status))
        .bind(&tool_call.result)
        .bind(&tool_call.error)
        .bind(tool_call.created_at)
        .bind(tool_call.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(tool_call)
    }

    async fn set_tool_call_status(
        &self,
        tool_call_id: ToolCallId,
        status: ToolCallStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let completed_at = matches!(status, ToolCallStatus::Success | ToolCallStatus::Error).then(Utc::now);
        sqlx::query(
            "update tool_calls set status = $1, result = $2, error = $3, completed_at = coalesce($4, completed_at) where id = $5",
        )
        .bind(enum_to_text(&status))
        .bind(result)
        .bind(error)
        .bind(completed_at)
        .bind(tool_call_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_codebase_understanding(
        &self,
        repo_full_name: &str,
    ) -> Result<Option<CodebaseUnderstanding>, StoreError> {
        let row = sqlx::query("select * from codebase_understanding where repo_full_name = $1")
            .bind(repo_full_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(CodebaseUnderstanding {
                repo_full_name: row.try_get("repo_full_name")?,
                summary: row.try_get("summary")?,
                generated_at: row.try_get("generated_at")?,
            }),
            None => None,
        })
    }

    async fn put_codebase_understanding(&self, understanding: CodebaseUnderstanding) -> Result<(), StoreError> {
        sqlx::query(
            "insert into codebase_understanding (repo_full_name, summary, generated_at) \
             values ($1, $2, $3) \
             on conflict (repo_full_name) do update set summary = excluded.summary, generated_at = excluded.generated_at",
        )
        .bind(&understanding.repo_full_name)
        .bind(&understanding.summary)
        .bind(understanding.generated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
