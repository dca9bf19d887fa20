use futures::StreamExt;
use serde_json::Value;
use shadow_core::parts::FinishReason;
use shadow_core::Part;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::ProviderClient;
use crate::error::InferenceError;
use crate::types::{InferenceRequest, RawEvent, RawFinishReason};
use crate::validate;

/// Wraps a `ProviderClient`'s raw chunk stream and emits the normalized,
/// validated `Part` sequence for a single model turn. Owns tool-call repair
/// and the synthetic reasoning framing for models that don't natively
/// stream chain-of-thought.
pub struct StreamProcessor<'a> {
    client: &'a dyn ProviderClient,
    tool_schemas: Vec<Value>,
    synthesize_reasoning: bool,
}

impl<'a> StreamProcessor<'a> {
    pub fn new(client: &'a dyn ProviderClient, tool_schemas: Vec<Value>) -> Self {
        Self {
            client,
            tool_schemas,
            synthesize_reasoning: false,
        }
    }

    /// Enable synthetic reasoning framing — for reasoning-capable models
    /// (e.g. the GPT-5 family) whose provider doesn't emit native
    /// `reasoning`/`reasoning-signature` events, a synthetic `reasoning`
    /// part is emitted at step-start and a `reasoning-signature` part the
    /// first time a `text-delta` arrives. Tool calls between the two do not
    /// close the block.
    pub fn with_synthetic_reasoning(mut self, enabled: bool) -> Self {
        self.synthesize_reasoning = enabled;
        self
    }

    fn schema_for<'s>(&'s self, name: &str) -> Option<&'s Value> {
        self.tool_schemas.iter().find(|s| s["name"] == name)
    }

    /// Run one model turn, returning the ordered normalized parts. `cancel`
    /// is polled between events; cancellation propagates to the underlying
    /// provider stream and any parts already emitted remain valid (the
    /// caller keeps whatever was pushed before the cancellation observed).
    pub async fn process_turn(
        &self,
        request: InferenceRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Part>, InferenceError> {
        let messages = request.messages.clone();
        let model = request.model.clone();
        let max_tokens = request.max_tokens;

        let mut stream = self.client.stream(request).await?;
        let mut parts = Vec::new();

        let mut reasoning_opened = false;
        let mut reasoning_closed = false;
        if self.synthesize_reasoning {
            parts.push(Part::Reasoning { text: String::new() });
            reasoning_opened = true;
        }

        // pending tool-call-done events awaiting validation/repair
        loop {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(InferenceError::Cancelled);
                }
            }

            let Some(event) = stream.next().await else { break };
            let event = event?;

            match event {
                RawEvent::TextDelta(text) => {
                    if reasoning_opened && !reasoning_closed {
                        parts.push(Part::ReasoningSignature {
                            signature: "synthetic".into(),
                        });
                        reasoning_closed = true;
                    }
                    parts.push(Part::TextDelta { text });
                }
                RawEvent::ReasoningDelta(text) => {
                    parts.push(Part::Reasoning { text });
                }
                RawEvent::ReasoningSignature(signature) => {
                    parts.push(Part::ReasoningSignature { signature });
                }
                RawEvent::RedactedReasoning(data) => {
                    parts.push(Part::RedactedReasoning { data });
                }
                RawEvent::ToolCallStart { id, name } => {
                    parts.push(Part::ToolCallStreamingStart {
                        tool_call_id: id,
                        name,
                    });
                }
                RawEvent::ToolCallDelta { id, args_fragment } => {
                    parts.push(Part::ToolCallDelta {
                        tool_call_id: id,
                        args_fragment,
                    });
                }
                RawEvent::ToolCallDone { id, name, args } => {
                    let validated = match self.schema_for(&name) {
                        Some(schema) => validate::validate_args(schema, &args),
                        None => Err(format!("unknown tool: {name}")),
                    };

                    match validated {
                        Ok(()) => {
                            parts.push(Part::ToolCall {
                                tool_call_id: id,
                                name,
                                args,
                            });
                        }
                        Err(validation_error) if self.schema_for(&name).is_some() => {
                            info!(tool = %name, error = %validation_error, "repairing invalid tool call");
                            match self
                                .repair(&model, max_tokens, &messages, &name, &validation_error)
                                .await
                            {
                                Ok(Some((repaired_name, repaired_args))) => {
                                    parts.push(Part::ToolCall {
                                        tool_call_id: id,
                                        name: repaired_name,
                                        args: repaired_args,
                                    });
                                }
                                Ok(None) => {
                                    warn!(tool = %name, "repair produced no tool call, passing through error");
                                    parts.push(Part::Error {
                                        message: format!(
                                            "tool call `{name}` failed validation and repair produced no call: {validation_error}"
                                        ),
                                    });
                                }
                                Err(e) => {
                                    warn!(tool = %name, error = %e, "repair call failed");
                                    parts.push(Part::Error {
                                        message: format!("repair call failed: {e}"),
                                    });
                                }
                            }
                        }
                        Err(unknown_tool_error) => {
                            // Unknown-tool errors are not repaired — pass through.
                            parts.push(Part::Error {
                                message: unknown_tool_error,
                            });
                        }
                    }
                }
                RawEvent::Finish { reason, usage } => {
                    let reason = match reason {
                        RawFinishReason::EndTurn => FinishReason::Stop,
                        RawFinishReason::ToolUse => FinishReason::ToolCalls,
                        RawFinishReason::MaxTokens => FinishReason::Length,
                    };
                    parts.push(Part::Finish { reason, usage });
                }
                RawEvent::Error(message) => {
                    parts.push(Part::Error { message });
                    break;
                }
            }
        }

        Ok(parts)
    }

    /// Issue a corrective follow-up call: original messages plus the
    /// validation error, extract the first tool-call in the repair
    /// response. Only called for schema-validation failures.
    async fn repair(
        &self,
        model: &str,
        max_tokens: u32,
        messages: &[Value],
        failed_tool: &str,
        validation_error: &str,
    ) -> Result<Option<(String, Value)>, InferenceError> {
        let mut repair_messages = messages.to_vec();
        repair_messages.push(serde_json::json!({
            "role": "user",
            "content": format!(
                "Your call to `{failed_tool}` failed validation: {validation_error}. \
                 Please re-issue the call with corrected arguments."
            ),
        }));

        let request = InferenceRequest {
            model: model.to_string(),
            max_tokens,
            system: None,
            tools: self.tool_schemas.clone(),
            messages: repair_messages,
            thinking: None,
        };

        let mut stream = self.client.stream(request).await?;
        while let Some(event) = stream.next().await {
            if let RawEvent::ToolCallDone { name, args, .. } = event? {
                return Ok(Some((name, args)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedClient {
        calls: AtomicUsize,
        scripts: Mutex<Vec<Vec<RawEvent>>>,
    }

    impl ScriptedClient {
        fn new(scripts: Vec<Vec<RawEvent>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                scripts: Mutex::new(scripts),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn stream(
            &self,
            _request: InferenceRequest,
        ) -> Result<futures::stream::BoxStream<'static, Result<RawEvent, InferenceError>>, InferenceError>
        {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let events = self.scripts.lock().unwrap()[idx].clone();
            Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    fn read_file_schema() -> Value {
        json!({
            "name": "read_file",
            "input_schema": {
                "type": "object",
                "properties": {"target_file": {"type": "string"}},
                "required": ["target_file"]
            }
        })
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            system: None,
            tools: vec![read_file_schema()],
            messages: vec![json!({"role": "user", "content": "read it"})],
            thinking: None,
        }
    }

    #[tokio::test]
    async fn valid_tool_call_passes_through() {
        let client = ScriptedClient::new(vec![vec![RawEvent::ToolCallDone {
            id: "c1".into(),
            name: "read_file".into(),
            args: json!({"target_file": "src/main.rs"}),
        }]]);
        let processor = StreamProcessor::new(&client, vec![read_file_schema()]);
        let parts = processor.process_turn(request(), None).await.unwrap();
        assert!(matches!(&parts[0], Part::ToolCall { name, .. } if name == "read_file"));
    }

    #[tokio::test]
    async fn invalid_tool_call_triggers_repair_under_same_id() {
        let client = ScriptedClient::new(vec![
            vec![RawEvent::ToolCallDone {
                id: "c1".into(),
                name: "read_file".into(),
                args: json!({}), // missing required target_file
            }],
            vec![RawEvent::ToolCallDone {
                id: "ignored-by-repair-response".into(),
                name: "read_file".into(),
                args: json!({"target_file": "src/main.rs"}),
            }],
        ]);
        let processor = StreamProcessor::new(&client, vec![read_file_schema()]);
        let parts = processor.process_turn(request(), None).await.unwrap();
        match &parts[0] {
            Part::ToolCall {
                tool_call_id, args, ..
            } => {
                assert_eq!(tool_call_id, "c1"); // original id preserved
                assert_eq!(args["target_file"], "src/main.rs");
            }
            other => panic!("expected repaired ToolCall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_not_repaired() {
        let client = ScriptedClient::new(vec![vec![RawEvent::ToolCallDone {
            id: "c1".into(),
            name: "nonexistent_tool".into(),
            args: json!({}),
        }]]);
        let processor = StreamProcessor::new(&client, vec![read_file_schema()]);
        let parts = processor.process_turn(request(), None).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "no repair call issued");
        assert!(matches!(&parts[0], Part::Error { .. }));
    }

    #[tokio::test]
    async fn synthetic_reasoning_wraps_first_text_delta() {
        let client = ScriptedClient::new(vec![vec![
            RawEvent::TextDelta("Hello".into()),
            RawEvent::TextDelta(" world".into()),
        ]]);
        let processor =
            StreamProcessor::new(&client, vec![]).with_synthetic_reasoning(true);
        let parts = processor.process_turn(request(), None).await.unwrap();
        assert!(matches!(parts[0], Part::Reasoning { .. }));
        assert!(matches!(parts[1], Part::ReasoningSignature { .. }));
        assert!(matches!(&parts[2], Part::TextDelta { text } if text == "Hello"));
        // second text delta does not reopen the reasoning block
        assert!(matches!(&parts[3], Part::TextDelta { text } if text == " world"));
    }

    #[tokio::test]
    async fn cancellation_stops_consumption() {
        let client = ScriptedClient::new(vec![vec![RawEvent::TextDelta("hi".into())]]);
        let processor = StreamProcessor::new(&client, vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = processor.process_turn(request(), Some(&cancel)).await;
        assert!(matches!(result, Err(InferenceError::Cancelled)));
    }
}
