//! HTTP surface: task ingress, message/history reads, the file-tree/content
//! proxies, context-usage introspection, and the indexing surface. The
//! real-time channel lives in `ws`; the webhook in `webhook`. Uses typed
//! `axum` extractors (`Json<T>` bodies, `Arc<AppState>` via `State`) across
//! the full external-interface route list.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shadow_core::{ChatMessage, TaskId, VariantId};
use shadow_tools::builtin::SemanticIndex as _;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::background::BackgroundServiceManager;
use crate::hub::SessionHub;
use crate::orchestrator::Orchestrator;
use crate::repo_lock::RepoLock;
use crate::store::{NewTask, NewVariant, Store};
use crate::webhook;
use crate::ws;

/// Everything a handler needs, shared behind `Arc` so each request clones
/// a cheap handle to the daemon's long-lived singletons.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<SessionHub>,
    pub background: Arc<BackgroundServiceManager>,
    pub repo_lock: Arc<dyn RepoLock>,
    pub webhook_secret: String,
    pub workspace_root: PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/tasks/{taskId}/initiate", post(initiate_task))
        .route("/api/tasks/{taskId}", get(get_task))
        .route("/api/tasks/{taskId}/{variantId}/messages", get(list_messages))
        .route("/api/tasks/{taskId}/files/tree", get(file_tree))
        .route("/api/tasks/{taskId}/files/content", get(file_content))
        .route("/api/context/usage/{taskId}", get(context_usage))
        .route("/api/indexing/index", post(trigger_index))
        .route("/api/indexing/search", post(search_index))
        .route("/api/indexing/clear-namespace", delete(clear_namespace))
        .route("/webhooks/github/pull-request", post(pull_request_webhook))
        .route("/ws/{taskId}/{variantId}", get(ws::upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error(transparent)]
    Store(#[from] crate::error::StoreError),
    #[error(transparent)]
    Daemon(#[from] crate::error::DaemonError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            HttpError::Store(crate::error::StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::Store(_) | HttpError::Daemon(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

type HttpResult<T> = Result<T, HttpError>;

#[derive(Debug, Deserialize)]
pub struct InitiateTaskBody {
    pub message: String,
    pub models: Vec<String>,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub owner: String,
    #[serde(rename = "repoFullName")]
    pub repo_full_name: String,
    #[serde(rename = "repoUrl")]
    pub repo_url: String,
    #[serde(rename = "baseBranch", default = "default_base_branch")]
    pub base_branch: String,
    #[serde(rename = "baseCommit", default)]
    pub base_commit: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Serialize)]
pub struct InitiateTaskResponse {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub variants: Vec<VariantSummary>,
}

#[derive(Debug, Serialize)]
pub struct VariantSummary {
    #[serde(rename = "variantId")]
    pub variant_id: VariantId,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub sequence: u32,
    #[serde(rename = "shadowBranch")]
    pub shadow_branch: String,
}

/// `POST /api/tasks/:taskId/initiate`. The task identifier in the path is
/// advisory for routing consistency with the rest of the surface; a fresh
/// `Task` row is minted here with the ids the store actually assigns
/// (mirrors the upstream system's behavior of allocating ids server-side
/// on first contact rather than trusting a client-supplied task id).
/// Workspace preparation itself (the clone/sidecar) is out of scope per
/// spec §1 — this handler assumes `workspace_root/<taskId>/<variantId>`
/// already exists or will be prepared by an external collaborator before
/// the first `sendMessage`.
async fn initiate_task(
    State(state): State<Arc<AppState>>,
    AxumPath(_task_id): AxumPath<String>,
    Json(body): Json<InitiateTaskBody>,
) -> HttpResult<Json<InitiateTaskResponse>> {
    if body.models.is_empty() {
        return Err(HttpError::BadRequest("at least one model is required".to_string()));
    }

    let task = state
        .store
        .create_task(NewTask {
            owner: body.owner,
            repo_full_name: body.repo_full_name.clone(),
            repo_url: body.repo_url,
            base_branch: body.base_branch,
            base_commit: body.base_commit,
            title: body.message.clone(),
        })
        .await?;

    let mut variants = Vec::with_capacity(body.models.len());
    for (idx, model_id) in body.models.into_iter().enumerate() {
        let sequence = (idx + 1) as u32;
        let shadow_branch = format!("shadow/task-{}/variant-{sequence}", task.id);
        let workspace_path = state
            .workspace_root
            .join(task.id.to_string())
            .join(sequence.to_string());

        let variant = state
            .store
            .create_variant(NewVariant {
                task_id: task.id,
                model_id,
                sequence,
                shadow_branch,
                workspace_path: workspace_path.to_string_lossy().into_owned(),
            })
            .await?;

        variants.push(VariantSummary {
            variant_id: variant.id,
            model_id: variant.model_id.clone(),
            sequence: variant.sequence,
            shadow_branch: variant.shadow_branch.clone(),
        });
    }

    state
        .background
        .spawn_for_task(task.id, body.repo_full_name, state.workspace_root.clone());

    Ok(Json(InitiateTaskResponse {
        task_id: task.id,
        variants,
    }))
}

#[derive(Debug, Serialize)]
struct TaskSummaryResponse {
    task: shadow_core::Task,
    variants: Vec<shadow_core::Variant>,
}

/// `GET /api/tasks/:taskId`.
async fn get_task(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<TaskId>,
) -> HttpResult<Json<TaskSummaryResponse>> {
    let task = state.store.get_task(task_id).await?;
    let variants = state.store.list_variants(task_id).await?;
    Ok(Json(TaskSummaryResponse { task, variants }))
}

/// `GET /api/tasks/:taskId/:variantId/messages`.
async fn list_messages(
    State(state): State<Arc<AppState>>,
    AxumPath((task_id, variant_id)): AxumPath<(TaskId, VariantId)>,
) -> HttpResult<Json<Vec<ChatMessage>>> {
    let mut messages = state.store.list_messages(task_id).await?;
    messages.retain(|m| m.variant_id == variant_id);
    messages.sort_by_key(|m| m.sequence);
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct FileTreeQuery {
    #[serde(rename = "variantId")]
    variant_id: VariantId,
}

#[derive(Debug, Serialize)]
struct FileTreeEntry {
    path: String,
    kind: &'static str,
}

/// `GET /api/tasks/:taskId/files/tree?variantId=`. Walks the variant's
/// workspace directory; this is a read-only snapshot proxy, not a watcher —
/// `fs-change` events over the real-time channel (`ws`) carry live deltas.
async fn file_tree(
    State(state): State<Arc<AppState>>,
    AxumPath(_task_id): AxumPath<TaskId>,
    Query(query): Query<FileTreeQuery>,
) -> HttpResult<Json<Vec<FileTreeEntry>>> {
    let variant = state.store.get_variant(query.variant_id).await?;
    let root = PathBuf::from(&variant.workspace_path);

    let entries = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if entry.path() == root {
                continue;
            }
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            out.push(FileTreeEntry {
                path: rel.to_string_lossy().into_owned(),
                kind: if entry.file_type().is_dir() { "dir" } else { "file" },
            });
        }
        out
    })
    .await
    .map_err(|e| HttpError::BadRequest(e.to_string()))?;

    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct FileContentQuery {
    #[serde(rename = "variantId")]
    variant_id: VariantId,
    path: String,
}

/// `GET /api/tasks/:taskId/files/content?path=`. Rejects any path that
/// resolves outside the variant's workspace root, the same containment
/// rule the Tool Executor enforces (spec §4.6, §5).
async fn file_content(
    State(state): State<Arc<AppState>>,
    AxumPath(_task_id): AxumPath<TaskId>,
    Query(query): Query<FileContentQuery>,
) -> HttpResult<String> {
    let variant = state.store.get_variant(query.variant_id).await?;
    let root = PathBuf::from(&variant.workspace_path);
    let resolved = shadow_tools::sandbox::resolve_in_workspace(&root, &query.path)
        .map_err(|e| HttpError::BadRequest(e.to_string()))?;

    tokio::fs::read_to_string(&resolved)
        .await
        .map_err(|e| HttpError::NotFound(format!("{}: {e}", query.path)))
}

#[derive(Debug, Deserialize)]
struct ContextUsageQuery {
    model: String,
}

#[derive(Debug, Serialize)]
struct ContextUsageResponse {
    #[serde(rename = "taskId")]
    task_id: TaskId,
    model: String,
    #[serde(rename = "totalMessages")]
    total_messages: usize,
    #[serde(rename = "totalTokens")]
    total_tokens: u32,
    #[serde(rename = "tokenLimit")]
    token_limit: u32,
    #[serde(rename = "compressionThreshold")]
    compression_threshold: f32,
    #[serde(rename = "usagePercentage")]
    usage_percentage: f32,
    #[serde(rename = "compressionActive")]
    compression_active: bool,
    #[serde(rename = "compressedMessages")]
    compressed_messages: u32,
    #[serde(rename = "compressionBreakdown")]
    compression_breakdown: String,
}

/// Sums token estimates the same way the Context Manager does: assistant
/// messages carry their text in `parts` (persisted `content` is empty for
/// them), so linearize and estimate each part rather than reading `content`
/// directly. Falls back to `content` only for messages with no parts at all
/// (plain user turns).
fn estimate_message_tokens(message: &ChatMessage, model: &str) -> u32 {
    if message.parts.is_empty() {
        shadow_core::tokens::estimate_str(&message.content)
    } else {
        shadow_core::tokens::count(shadow_core::tokens::Content::Parts(&message.parts), model)
    }
}

/// `GET /api/context/usage/:taskId?model=`. Reports the *pre-compression*
/// total — the real total before `buildOptimalContext` would trim or
/// summarize anything — alongside the compression state that call would
/// produce if invoked right now.
async fn context_usage(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<TaskId>,
    Query(query): Query<ContextUsageQuery>,
) -> HttpResult<Json<ContextUsageResponse>> {
    let messages = state.store.list_messages(task_id).await?;
    let settings = shadow_compaction::settings::resolve(&query.model)
        .map_err(|e| HttpError::BadRequest(e.to_string()))?;

    let total_tokens: u32 = messages.iter().map(|m| estimate_message_tokens(m, &query.model)).sum();
    let usage_percentage = if settings.token_limit == 0 {
        0.0
    } else {
        (total_tokens as f32 / settings.token_limit as f32) * 100.0
    };
    let compression_active = total_tokens > settings.target_tokens();

    Ok(Json(ContextUsageResponse {
        task_id,
        model: query.model,
        total_messages: messages.len(),
        total_tokens,
        token_limit: settings.token_limit,
        compression_threshold: settings.compression_threshold,
        usage_percentage,
        compression_active,
        compressed_messages: messages
            .iter()
            .filter(|m| m.active_compression_level != shadow_core::CompressionLevel::None)
            .count() as u32,
        compression_breakdown: format!(
            "{} messages, target {} tokens",
            messages.len(),
            settings.target_tokens()
        ),
    }))
}

#[derive(Debug, Deserialize)]
struct IndexBody {
    #[serde(rename = "repoFullName")]
    repo_full_name: String,
}

/// `POST /api/indexing/index`.
async fn trigger_index(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IndexBody>,
) -> HttpResult<Json<serde_json::Value>> {
    let workspace = state.workspace_root.join(sanitize_repo(&body.repo_full_name));
    state
        .background
        .index_namespace(body.repo_full_name, workspace)
        .await?;
    Ok(Json(json!({"status": "indexed"})))
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(rename = "repoFullName")]
    repo_full_name: String,
    query: String,
}

/// `POST /api/indexing/search`.
async fn search_index(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> HttpResult<Json<serde_json::Value>> {
    let Some(index) = state.background.semantic_index(&body.repo_full_name) else {
        return Ok(Json(json!({"hits": [], "indexed": false})));
    };
    let hits = index
        .query(&body.query, &[])
        .await
        .map_err(HttpError::BadRequest)?;
    Ok(Json(json!({
        "hits": hits.iter().map(|h| json!({
            "file": h.file,
            "startLine": h.start_line,
            "endLine": h.end_line,
            "score": h.score,
        })).collect::<Vec<_>>(),
        "indexed": true,
    })))
}

#[derive(Debug, Deserialize)]
struct ClearNamespaceBody {
    #[serde(rename = "repoFullName")]
    repo_full_name: String,
}

/// `DELETE /api/indexing/clear-namespace`.
async fn clear_namespace(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClearNamespaceBody>,
) -> HttpResult<Json<serde_json::Value>> {
    let existed = state.background.clear_namespace(&body.repo_full_name);
    Ok(Json(json!({"cleared": existed})))
}

/// GitHub `pull_request` webhook. Signature verification happens before
/// the body is ever deserialized into a typed payload (spec §7: signature
/// failures are `401`, payload failures are `400`).
async fn pull_request_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if webhook::verify_signature(&state.webhook_secret, &body, signature).is_err() {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid signature"}))).into_response();
    }

    match webhook::handle_pull_request_event(state.store.as_ref(), &body).await {
        Ok(result) => Json(result).into_response(),
        Err(crate::error::WebhookError::InvalidPayload(msg)) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
        }
        Err(err) => {
            warn!(error = %err, "pull request webhook handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))).into_response()
        }
    }
}

fn sanitize_repo(repo_full_name: &str) -> String {
    repo_full_name.replace('/', "__")
}
