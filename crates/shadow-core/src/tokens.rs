use serde_json::Value;

use crate::parts::Part;

/// Anything the token counter can size. `model_id` is accepted for interface
/// symmetry with the Model Registry (different model families may eventually
/// want different estimators) but the heuristic below is currently uniform.
pub enum Content<'a> {
    Text(&'a str),
    Parts(&'a [Part]),
    ToolSchema(&'a Value),
}

/// chars/4 heuristic. Not exact, but stable, cheap, and good enough to drive
/// compression decisions — the same trade-off Claude Code's own local
/// estimator makes.
pub fn count(content: Content<'_>, _model_id: &str) -> u32 {
    match content {
        Content::Text(s) => estimate_str(s),
        Content::Parts(parts) => parts.iter().map(estimate_part).sum(),
        Content::ToolSchema(v) => estimate_value(v),
    }
}

pub fn estimate_str(s: &str) -> u32 {
    (s.len() as u32) / 4
}

pub fn estimate_value(v: &Value) -> u32 {
    estimate_str(&v.to_string())
}

fn estimate_part(part: &Part) -> u32 {
    match part {
        Part::TextDelta { text } => estimate_str(text),
        Part::Reasoning { text } => estimate_str(text),
        Part::ReasoningSignature { signature } => estimate_str(signature),
        Part::RedactedReasoning { data } => estimate_str(data),
        Part::ToolCallStreamingStart { name, .. } => estimate_str(name),
        Part::ToolCallDelta { args_fragment, .. } => estimate_str(args_fragment),
        Part::ToolCall { name, args, .. } => estimate_str(name) + estimate_value(args),
        Part::ToolResult { content, .. } => estimate_str(content),
        Part::Finish { .. } => 0,
        Part::Error { message } => estimate_str(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chars_div_four() {
        assert_eq!(estimate_str("hello world"), 2);
        assert_eq!(estimate_str(""), 0);
        assert_eq!(estimate_str(&"a".repeat(400)), 100);
    }

    #[test]
    fn json_value_has_positive_tokens() {
        let v = serde_json::json!({"role": "user", "content": "hello"});
        assert!(estimate_value(&v) > 0);
    }

    #[test]
    fn parts_sum_across_kinds() {
        let parts = vec![
            Part::TextDelta { text: "hi there".into() },
            Part::ToolResult {
                tool_call_id: "t1".into(),
                content: "ok".into(),
                is_error: false,
            },
        ];
        assert_eq!(count(Content::Parts(&parts), "claude"), estimate_str("hi there") + estimate_str("ok"));
    }
}
