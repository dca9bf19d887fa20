use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use shadow_compaction::{build_optimal_context, MessageSource};
use shadow_core::parts::FinishReason;
use shadow_core::{
    ChatMessage, ChatRole, CompressionLevel, MessageId, Part, TaskId, ToolCall, ToolCallId,
    ToolCallStatus, Usage, VariantId, VariantStatus,
};
use shadow_provider::{InferenceError, InferenceRequest, ProviderClient, StreamProcessor, ThinkingConfig};
use shadow_tools::ToolPipeline;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::ShadowConfig;
use crate::error::DaemonError;
use crate::hub::SessionHub;
use crate::pr_metadata::{self, PrMetadataInput};
use crate::store::Store;
use crate::tools::build_pipeline;

/// Per-variant state, exactly as spec §4.8 names it. `IDLE` is the only
/// state `send_message` accepts from; every other state rejects a new run
/// rather than queuing it (at most one active run per variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantState {
    Initializing,
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Tool names that mutate the workspace. A run that only reads is never a
/// PR metadata candidate even if it completes cleanly.
const MUTATING_TOOLS: &[&str] = &["edit_file", "search_replace", "delete_file"];

/// Bridges `Store::list_messages` to the Context Manager's `MessageSource`
/// so `build_optimal_context` never needs to know about Postgres or the
/// in-memory store directly.
pub struct StoreMessageSource {
    store: Arc<dyn Store>,
}

impl StoreMessageSource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl MessageSource for StoreMessageSource {
    async fn load_messages(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<ChatMessage>, shadow_compaction::CompactionError> {
        self.store
            .list_messages(task_id)
            .await
            .map_err(|e| shadow_compaction::CompactionError::MessageSource(e.to_string()))
    }
}

const SYSTEM_PREAMBLE: &str = "\
You are Shadow, an autonomous coding agent working inside a sandboxed git \
workspace. You have a closed set of tools for reading, searching, and \
editing files and for running shell commands. Use them to accomplish the \
user's task, then stop once the work is complete.";

pub(crate) const SUMMARIZER_MODEL: &str = "claude-haiku-4-20250514";

/// Drives every variant's turn loop: one `Orchestrator` per daemon process,
/// shared across all tasks and variants via `Arc`. A `for turn in
/// start_turn..max_turns` loop races a `tokio::select!` against
/// cancellation each turn, dispatching tools in between; the unit of work
/// per turn is a buffered `Vec<Part>` from `StreamProcessor::process_turn`,
/// with persistence and broadcast side effects triggered per part.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    hub: Arc<SessionHub>,
    config: Arc<ShadowConfig>,
    provider: Arc<dyn ProviderClient>,
    states: Mutex<HashMap<VariantId, VariantState>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<SessionHub>,
        config: Arc<ShadowConfig>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            store,
            hub,
            config,
            provider,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_of(&self, variant_id: VariantId) -> VariantState {
        self.states
            .lock()
            .unwrap()
            .get(&variant_id)
            .copied()
            .unwrap_or(VariantState::Initializing)
    }

    fn set_state(&self, variant_id: VariantId, state: VariantState) {
        self.states.lock().unwrap().insert(variant_id, state);
    }

    /// Marks a freshly-initialized variant eligible to receive messages.
    /// Called by the Background Service Manager once non-blocking setup
    /// completes (spec §4.10).
    pub fn mark_idle(&self, variant_id: VariantId) {
        self.set_state(variant_id, VariantState::Idle);
    }

    /// `IDLE -> RUNNING` on `sendMessage(userText, modelId)`. Persists the
    /// USER message, then spawns the turn loop in the background so the
    /// caller (an HTTP handler) returns immediately; progress is observed
    /// through the Session Hub.
    pub async fn send_message(
        self: &Arc<Self>,
        task_id: TaskId,
        variant_id: VariantId,
        user_text: String,
        model_id: String,
    ) -> Result<MessageId, DaemonError> {
        {
            let mut states = self.states.lock().unwrap();
            let current = states.get(&variant_id).copied().unwrap_or(VariantState::Initializing);
            if current != VariantState::Idle {
                return Err(DaemonError::BackgroundJob(format!(
                    "variant {variant_id} is not idle (state: {current:?})"
                )));
            }
            states.insert(variant_id, VariantState::Running);
        }

        let user_message = ChatMessage {
            id: MessageId::new(),
            task_id,
            variant_id,
            role: ChatRole::User,
            content: user_text,
            parts: vec![],
            sequence: 0,
            created_at: Utc::now(),
            model_id: None,
            usage: Usage::default(),
            finish_reason: None,
            active_compression_level: CompressionLevel::None,
            compressed_versions: HashMap::new(),
            pull_request_snapshot: None,
        };
        let user_message = self.store.append_message(user_message).await?;
        let user_message_id = user_message.id;

        let (_run_id, cancel) = self.hub.start_run(variant_id);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this
                .run_turn_loop(task_id, variant_id, model_id, cancel.clone())
                .await
            {
                error!(%variant_id, error = %err, "variant run failed");
                let _ = this.store.set_variant_status(variant_id, VariantStatus::Failed).await;
                this.set_state(variant_id, VariantState::Failed);
            }
            this.hub.finish_run(variant_id);
        });

        Ok(user_message_id)
    }

    /// `RUNNING -> STOPPING`. Signals the run's `CancellationToken`; the
    /// turn loop observes it between provider events and while a tool is
    /// executing (`run_terminal_cmd`'s child is killed via
    /// `kill_on_drop(true)` when the losing branch of the `select!` drops
    /// its future).
    pub fn stop_stream(&self, variant_id: VariantId) -> Result<(), DaemonError> {
        self.hub
            .cancel(variant_id)
            .map_err(|e| DaemonError::BackgroundJob(e.to_string()))?;
        self.set_state(variant_id, VariantState::Stopping);
        Ok(())
    }

    async fn run_turn_loop(
        self: &Arc<Self>,
        task_id: TaskId,
        variant_id: VariantId,
        model_id: String,
        cancel: CancellationToken,
    ) -> Result<(), DaemonError> {
        let descriptor = shadow_pricing::resolve(&model_id).map_err(|e| {
            DaemonError::BackgroundJob(format!("unsupported model {model_id}: {e}"))
        })?;
        if descriptor.provider != shadow_pricing::Provider::Anthropic {
            return Err(DaemonError::BackgroundJob(format!(
                "no ProviderClient implementation for provider behind {model_id}"
            )));
        }

        let variant = self.store.get_variant(variant_id).await?;
        let task = self.store.get_task(task_id).await?;

        let source = StoreMessageSource::new(self.store.clone());
        let context = build_optimal_context(
            task_id,
            &model_id,
            &source,
            self.provider.as_ref(),
            SUMMARIZER_MODEL,
        )
        .await?;

        let mut messages: Vec<Value> = context
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let system_prompt = self.build_system_prompt(&task.repo_full_name).await;

        let tool_pipeline = build_pipeline(
            PathBuf::from(&variant.workspace_path),
            Duration::from_secs(self.config.tool_timeout_secs),
            None,
        );

        let assistant_message = ChatMessage {
            id: MessageId::new(),
            task_id,
            variant_id,
            role: ChatRole::Assistant,
            content: String::new(),
            parts: vec![],
            sequence: 0,
            created_at: Utc::now(),
            model_id: Some(model_id.clone()),
            usage: Usage::default(),
            finish_reason: None,
            active_compression_level: CompressionLevel::None,
            compressed_versions: HashMap::new(),
            pull_request_snapshot: None,
        };
        let assistant_message = self.store.append_message(assistant_message).await?;
        let message_id = assistant_message.id;

        let synthesize_reasoning = !descriptor.supports_interleaved_reasoning;

        let mut all_parts: Vec<Part> = Vec::new();
        let mut unflushed: u32 = 0;
        let mut total_usage = Usage::default();
        let mut steps: u32 = 0;
        let mut mutated_files = false;
        let mut terminal_reason = FinishReason::Stop;
        // Tracks whether a terminal `Finish`/`Error` part has already been
        // published to the hub for this run, so the post-loop synthetic
        // publish below only fires on paths that broke out without one
        // (cancellation or the step cap hitting before a turn starts, or the
        // provider stream ending without an explicit finish part).
        let mut published_terminal = false;

        'turns: loop {
            if cancel.is_cancelled() {
                terminal_reason = FinishReason::Cancelled;
                break;
            }
            if steps >= self.config.max_steps_per_run {
                terminal_reason = FinishReason::Length;
                break;
            }
            steps += 1;

            let request = InferenceRequest {
                model: model_id.clone(),
                max_tokens: 8192,
                system: Some(system_prompt.clone()),
                tools: tool_pipeline.schemas(),
                messages: messages.clone(),
                thinking: descriptor
                    .thinking_budget_tokens
                    .map(|budget_tokens| ThinkingConfig { budget_tokens }),
            };

            let processor = StreamProcessor::new(self.provider.as_ref(), tool_pipeline.schemas())
                .with_synthetic_reasoning(synthesize_reasoning);

            let parts = match processor.process_turn(request, Some(&cancel)).await {
                Ok(parts) => parts,
                Err(InferenceError::Cancelled) => {
                    terminal_reason = FinishReason::Cancelled;
                    break;
                }
                Err(err) => return Err(DaemonError::Inference(err)),
            };

            let mut turn_text = String::new();
            let mut assistant_blocks: Vec<Value> = Vec::new();
            let mut tool_result_blocks: Vec<Value> = Vec::new();
            let mut turn_finish: Option<FinishReason> = None;

            for part in parts {
                all_parts.push(part.clone());
                self.hub
                    .publish(variant_id, part.clone())
                    .map_err(|e| DaemonError::BackgroundJob(e.to_string()))?;
                unflushed += 1;

                match &part {
                    Part::TextDelta { text } => turn_text.push_str(text),
                    Part::ToolCall { tool_call_id, name, args } => {
                        if MUTATING_TOOLS.contains(&name.as_str()) {
                            mutated_files = true;
                        }

                        let tool_call = ToolCall {
                            id: ToolCallId::new(),
                            message_id,
                            tool_name: name.clone(),
                            args: args.clone(),
                            status: ToolCallStatus::Running,
                            result: None,
                            error: None,
                            created_at: Utc::now(),
                            completed_at: None,
                        };
                        self.store.create_tool_call(tool_call.clone()).await?;

                        let (content, is_error) = self.execute_tool(&tool_pipeline, name, args, &cancel).await;

                        self.store
                            .set_tool_call_status(
                                tool_call.id,
                                if is_error { ToolCallStatus::Error } else { ToolCallStatus::Success },
                                Some(content.clone()),
                                if is_error { Some(content.clone()) } else { None },
                            )
                            .await?;

                        let result_part = Part::ToolResult {
                            tool_call_id: tool_call_id.clone(),
                            content: content.clone(),
                            is_error,
                        };
                        all_parts.push(result_part.clone());
                        self.hub
                            .publish(variant_id, result_part)
                            .map_err(|e| DaemonError::BackgroundJob(e.to_string()))?;

                        self.store.set_message_parts(message_id, all_parts.clone()).await?;
                        unflushed = 0;

                        assistant_blocks.push(json!({
                            "type": "tool_use",
                            "id": tool_call_id,
                            "name": name,
                            "input": args,
                        }));
                        tool_result_blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": tool_call_id,
                            "content": content,
                            "is_error": is_error,
                        }));
                    }
                    Part::Finish { reason, usage } => {
                        turn_finish = Some(*reason);
                        total_usage.accumulate(usage);
                        if *reason != FinishReason::ToolCalls {
                            published_terminal = true;
                        }
                        self.store.set_message_parts(message_id, all_parts.clone()).await?;
                        unflushed = 0;
                    }
                    Part::Error { message } => {
                        warn!(%variant_id, %message, "provider emitted an error part");
                        published_terminal = true;
                        self.store.set_message_parts(message_id, all_parts.clone()).await?;
                        unflushed = 0;
                        terminal_reason = FinishReason::Error;
                        break 'turns;
                    }
                    _ => {}
                }

                if unflushed >= self.config.persist_debounce_parts {
                    self.store.set_message_parts(message_id, all_parts.clone()).await?;
                    unflushed = 0;
                }
            }

            match turn_finish {
                Some(FinishReason::ToolCalls) => {
                    if !turn_text.is_empty() {
                        assistant_blocks.insert(0, json!({"type": "text", "text": turn_text}));
                    }
                    messages.push(json!({"role": "assistant", "content": assistant_blocks}));
                    messages.push(json!({"role": "user", "content": tool_result_blocks}));
                    continue;
                }
                Some(reason) => {
                    terminal_reason = reason;
                    break;
                }
                None => {
                    // Stream ended without an explicit finish part (e.g. the
                    // provider dropped the connection mid-turn). Treat as a
                    // clean stop rather than looping forever.
                    terminal_reason = FinishReason::Stop;
                    break;
                }
            }
        }

        // Every run must end with a terminal marker a hub subscriber can
        // recognize, even when the loop broke out on a path that never saw
        // a provider `Finish`/`Error` part this turn (cancellation, the step
        // cap, or a stream that ended without one).
        if !published_terminal {
            let finish_part = Part::Finish {
                reason: terminal_reason,
                usage: total_usage.clone(),
            };
            all_parts.push(finish_part.clone());
            self.hub
                .publish(variant_id, finish_part)
                .map_err(|e| DaemonError::BackgroundJob(e.to_string()))?;
            unflushed += 1;
        }

        if unflushed > 0 {
            self.store.set_message_parts(message_id, all_parts.clone()).await?;
        }

        let finish_reason_text = serde_json::to_value(terminal_reason)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "stop".to_string());
        self.store
            .set_message_finish(message_id, finish_reason_text, total_usage.clone())
            .await?;
        self.store.add_task_tokens(task_id, &total_usage).await?;

        let (variant_status, orch_state) = match terminal_reason {
            FinishReason::Cancelled => (VariantStatus::Stopped, VariantState::Stopped),
            FinishReason::Error => (VariantStatus::Failed, VariantState::Failed),
            _ => (VariantStatus::Running, VariantState::Idle),
        };
        self.store.set_variant_status(variant_id, variant_status).await?;
        self.set_state(variant_id, orch_state);

        if terminal_reason == FinishReason::Stop && mutated_files {
            self.try_generate_pr_snapshot(&task, &variant, message_id, &model_id).await;
        }

        Ok(())
    }

    /// Races tool execution against cancellation so a `run_terminal_cmd`
    /// child is killed rather than waited on when `stopStream` lands
    /// mid-execution.
    async fn execute_tool(
        &self,
        pipeline: &ToolPipeline,
        name: &str,
        args: &Value,
        cancel: &CancellationToken,
    ) -> (String, bool) {
        let result = tokio::select! {
            result = pipeline.execute(name, args) => result,
            _ = cancel.cancelled() => Err(shadow_tools::ToolError::ToolExecutionError {
                tool: name.to_string(),
                message: "cancelled".to_string(),
            }),
        };

        match result {
            Ok(content) => (content, false),
            Err(err) => (err.as_tool_result(), true),
        }
    }

    async fn build_system_prompt(&self, repo_full_name: &str) -> String {
        match self.store.get_codebase_understanding(repo_full_name).await {
            Ok(Some(understanding)) => format!(
                "{SYSTEM_PREAMBLE}\n\nRepository overview:\n{}",
                understanding.summary
            ),
            _ => SYSTEM_PREAMBLE.to_string(),
        }
    }

    /// Best-effort PR metadata generation (spec §4.11). Shells out to `git`
    /// inside the variant's workspace; any failure (no commits, not a repo,
    /// provider error) is logged and swallowed rather than failing the run,
    /// since the run itself already finished successfully.
    async fn try_generate_pr_snapshot(
        &self,
        task: &shadow_core::Task,
        variant: &shadow_core::Variant,
        message_id: MessageId,
        model_id: &str,
    ) {
        let workspace = PathBuf::from(&variant.workspace_path);

        let diff = match run_git(&workspace, &["diff", &variant.shadow_branch, "--stat", "-p"]).await {
            Some(output) if !output.trim().is_empty() => output,
            _ => return,
        };

        let stat = run_git(&workspace, &["diff", "--numstat", &variant.shadow_branch])
            .await
            .unwrap_or_default();
        let (lines_added, lines_removed, files_changed) = parse_numstat(&stat);

        let commit_sha = run_git(&workspace, &["rev-parse", "HEAD"])
            .await
            .unwrap_or_default()
            .trim()
            .to_string();

        let commit_log = run_git(&workspace, &["log", "--format=%s", &format!("{}..HEAD", variant.shadow_branch)])
            .await
            .unwrap_or_default();
        let commit_messages: Vec<String> = commit_log.lines().map(str::to_string).collect();

        let input = PrMetadataInput {
            task_title: &task.title,
            git_diff: &diff,
            commit_messages: &commit_messages,
            was_task_completed: true,
        };

        match pr_metadata::generate(
            self.provider.as_ref(),
            SUMMARIZER_MODEL,
            input,
            lines_added,
            lines_removed,
            files_changed,
            &commit_sha,
        )
        .await
        {
            Ok(snapshot) => {
                if let Err(err) = self.store.set_pull_request_snapshot(message_id, snapshot).await {
                    warn!(%model_id, error = %err, "failed to persist pull request snapshot");
                }
            }
            Err(err) => warn!(error = %err, "pull request metadata generation failed"),
        }
    }
}

async fn run_git(workspace: &std::path::Path, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `git diff --numstat` output into `(lines_added, lines_removed, files_changed)`.
fn parse_numstat(numstat: &str) -> (u32, u32, u32) {
    let mut added = 0u32;
    let mut removed = 0u32;
    let mut files = 0u32;
    for line in numstat.lines() {
        let mut cols = line.split_whitespace();
        let a = cols.next().and_then(|s| s.parse::<u32>().ok());
        let r = cols.next().and_then(|s| s.parse::<u32>().ok());
        if let (Some(a), Some(r)) = (a, r) {
            added += a;
            removed += r;
            files += 1;
        }
    }
    (added, removed, files)
}
