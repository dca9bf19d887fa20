use serde_json::Value;

/// Fully-formed request — a `ProviderClient` impl just sends it.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub tools: Vec<Value>,
    pub messages: Vec<Value>,
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

/// One event off a provider's raw chunk stream, before tool-call validation
/// or synthetic reasoning framing. Providers that do not natively stream
/// reasoning never emit `ReasoningDelta`/`ReasoningSignature` — the Stream
/// Processor synthesizes those around the model's first text delta instead.
#[derive(Debug, Clone)]
pub enum RawEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ReasoningSignature(String),
    RedactedReasoning(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, args_fragment: String },
    ToolCallDone { id: String, name: String, args: Value },
    Finish { reason: RawFinishReason, usage: shadow_core::Usage },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}
