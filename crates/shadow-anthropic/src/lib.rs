use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use shadow_core::Usage;
use shadow_provider::{InferenceError, InferenceRequest, ProviderClient, RawEvent, RawFinishReason};
use tracing::{debug, warn};

/// Claude Messages API client. Streams via SSE (`"stream": true`) and
/// normalizes Anthropic's `content_block_*`/`message_*` event vocabulary
/// into `RawEvent`s for the Stream Processor.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_client(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_body(&self, request: &InferenceRequest) -> Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": request.messages,
            "stream": true,
        });

        if let Some(ref system) = request.system {
            body["system"] = Value::String(system.clone());
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }
        if let Some(ref thinking) = request.thinking {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": thinking.budget_tokens,
            });
        }

        body
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    async fn stream(
        &self,
        request: InferenceRequest,
    ) -> Result<BoxStream<'static, Result<RawEvent, InferenceError>>, InferenceError> {
        let body = self.build_body(&request);

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(InferenceError::ApiError {
                status: status.as_u16(),
                body: text,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(128);
        tokio::spawn(pump_sse(resp, tx));

        Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
    }
}

/// Tool-use block state accumulated across `content_block_delta` events
/// until the matching `content_block_stop`.
struct PendingToolBlock {
    id: String,
    name: String,
    json_buf: String,
}

async fn pump_sse(
    resp: reqwest::Response,
    tx: tokio::sync::mpsc::Sender<Result<RawEvent, InferenceError>>,
) {
    let mut byte_stream = resp.bytes_stream();
    let mut leftover = String::new();

    // index -> pending tool-use block, or None for text/thinking blocks we don't track by content.
    let mut tool_blocks: HashMap<u64, PendingToolBlock> = HashMap::new();
    let mut usage = Usage::default();
    let mut stop_reason = RawFinishReason::EndTurn;

    loop {
        let chunk = match byte_stream.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx.send(Err(InferenceError::Request(e.to_string()))).await;
                return;
            }
            None => break,
        };

        leftover.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(boundary) = leftover.find("\n\n") {
            let event_block: String = leftover.drain(..boundary + 2).collect();
            process_event_block(&event_block, &mut tool_blocks, &mut usage, &mut stop_reason, &tx)
                .await;
        }
    }

    if !leftover.trim().is_empty() {
        process_event_block(&leftover, &mut tool_blocks, &mut usage, &mut stop_reason, &tx).await;
    }
}

async fn process_event_block(
    block: &str,
    tool_blocks: &mut HashMap<u64, PendingToolBlock>,
    usage: &mut Usage,
    stop_reason: &mut RawFinishReason,
    tx: &tokio::sync::mpsc::Sender<Result<RawEvent, InferenceError>>,
) {
    let mut data_line = None;
    for line in block.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            data_line = Some(data);
        }
    }
    let Some(data) = data_line else { return };

    let parsed: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse anthropic SSE event");
            return;
        }
    };

    let event_type = parsed["type"].as_str().unwrap_or("");
    match event_type {
        "message_start" => {
            usage.input_tokens = parsed["message"]["usage"]["input_tokens"]
                .as_u64()
                .unwrap_or(0) as u32;
        }
        "content_block_start" => {
            let index = parsed["index"].as_u64().unwrap_or(0);
            let block = &parsed["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "tool_use" => {
                    tool_blocks.insert(
                        index,
                        PendingToolBlock {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            json_buf: String::new(),
                        },
                    );
                    if let Some(pending) = tool_blocks.get(&index) {
                        let _ = tx
                            .send(Ok(RawEvent::ToolCallStart {
                                id: pending.id.clone(),
                                name: pending.name.clone(),
                            }))
                            .await;
                    }
                }
                "redacted_thinking" => {
                    let data = block["data"].as_str().unwrap_or_default().to_string();
                    let _ = tx.send(Ok(RawEvent::RedactedReasoning(data))).await;
                }
                _ => {}
            }
        }
        "content_block_delta" => {
            let index = parsed["index"].as_u64().unwrap_or(0);
            let delta = &parsed["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or_default().to_string();
                    let _ = tx.send(Ok(RawEvent::TextDelta(text))).await;
                }
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or_default().to_string();
                    let _ = tx.send(Ok(RawEvent::ReasoningDelta(text))).await;
                }
                "signature_delta" => {
                    let sig = delta["signature"].as_str().unwrap_or_default().to_string();
                    let _ = tx.send(Ok(RawEvent::ReasoningSignature(sig))).await;
                }
                "input_json_delta" => {
                    if let Some(pending) = tool_blocks.get_mut(&index) {
                        let fragment = delta["partial_json"].as_str().unwrap_or_default();
                        pending.json_buf.push_str(fragment);
                        let _ = tx
                            .send(Ok(RawEvent::ToolCallDelta {
                                id: pending.id.clone(),
                                args_fragment: fragment.to_string(),
                            }))
                            .await;
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            let index = parsed["index"].as_u64().unwrap_or(0);
            if let Some(pending) = tool_blocks.remove(&index) {
                let args: Value = if pending.json_buf.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&pending.json_buf) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(error = %e, buf = %pending.json_buf, "tool args did not parse as json");
                            serde_json::json!({})
                        }
                    }
                };
                let _ = tx
                    .send(Ok(RawEvent::ToolCallDone {
                        id: pending.id,
                        name: pending.name,
                        args,
                    }))
                    .await;
            }
        }
        "message_delta" => {
            if let Some(out) = parsed["usage"]["output_tokens"].as_u64() {
                usage.output_tokens = out as u32;
            }
            match parsed["delta"]["stop_reason"].as_str() {
                Some("tool_use") => *stop_reason = RawFinishReason::ToolUse,
                Some("max_tokens") => *stop_reason = RawFinishReason::MaxTokens,
                Some("end_turn") | Some("stop_sequence") => {
                    *stop_reason = RawFinishReason::EndTurn
                }
                _ => {}
            }
        }
        "message_stop" => {
            let _ = tx
                .send(Ok(RawEvent::Finish {
                    reason: *stop_reason,
                    usage: usage.clone(),
                }))
                .await;
        }
        "error" => {
            let message = parsed["error"]["message"]
                .as_str()
                .unwrap_or("unknown anthropic stream error")
                .to_string();
            let _ = tx.send(Ok(RawEvent::Error(message))).await;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_body_with_system_and_tools() {
        let client = AnthropicClient::new("test-key");
        let request = InferenceRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 512,
            system: Some("be terse".into()),
            tools: vec![serde_json::json!({"name": "read_file"})],
            messages: vec![serde_json::json!({"role": "user", "content": "hi"})],
            thinking: None,
        };
        let body = client.build_body(&request);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn thinking_config_maps_to_budget() {
        let client = AnthropicClient::new("test-key");
        let request = InferenceRequest {
            model: "claude-opus-4-20250514".into(),
            max_tokens: 512,
            system: None,
            tools: vec![],
            messages: vec![],
            thinking: Some(shadow_provider::ThinkingConfig { budget_tokens: 8000 }),
        };
        let body = client.build_body(&request);
        assert_eq!(body["thinking"]["budget_tokens"], 8000);
        assert_eq!(body["thinking"]["type"], "enabled");
    }
}
