use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single normalized unit of a model's streamed response. This is the type
/// both the Stream Processor produces and the Persistence Adapter stores —
/// `ChatMessage::parts` is `Vec<Part>`.
///
/// Ordering guarantee per `tool_call_id`: `ToolCallStreamingStart` →
/// `ToolCallDelta*` → `ToolCall` → `ToolResult`. Reasoning parts may
/// interleave with text and tool parts but never split a single tool-call
/// frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    TextDelta {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ReasoningSignature {
        signature: String,
    },
    RedactedReasoning {
        data: String,
    },
    ToolCallStreamingStart {
        tool_call_id: String,
        name: String,
    },
    ToolCallDelta {
        tool_call_id: String,
        args_fragment: String,
    },
    ToolCall {
        tool_call_id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    Finish {
        reason: FinishReason,
        usage: crate::model::Usage,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Cancelled,
    Error,
}

impl Part {
    /// Linearize a part into plain text the way the Context Manager does when
    /// flattening assistant messages for a prompt. Used for both token
    /// estimation and prompt construction — never mutates persisted parts.
    pub fn linearize(&self) -> Option<String> {
        match self {
            Part::TextDelta { text } => Some(text.clone()),
            Part::Reasoning { text } => Some(text.clone()),
            Part::ToolCall { name, args, .. } => {
                Some(format!("[Tool Call: {name}] args={args}"))
            }
            Part::ToolResult { content, .. } => {
                Some(format!("[Tool Result] {content}"))
            }
            Part::ReasoningSignature { .. }
            | Part::RedactedReasoning { .. }
            | Part::ToolCallStreamingStart { .. }
            | Part::ToolCallDelta { .. }
            | Part::Finish { .. }
            | Part::Error { .. } => None,
        }
    }
}
