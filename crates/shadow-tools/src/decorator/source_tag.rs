use async_trait::async_trait;
use serde_json::Value;

use super::{Decoration, DecoratorError, ToolDecorator};

/// Tags file-reading tool output with its source path, so the model can
/// attribute content it quotes later without re-reading the file.
pub struct SourceTagTransform;

impl SourceTagTransform {
    const TAGGED_TOOLS: &'static [&'static str] = &["read_file", "grep_search", "codebase_search"];

    fn skip(&self, output: &str) -> bool {
        output.trim().is_empty() || output.starts_with("Error")
    }

    fn extract_source(&self, tool_name: &str, input: &Value) -> Option<String> {
        match tool_name {
            "read_file" => input.get("target_file").and_then(Value::as_str).map(String::from),
            "grep_search" => input.get("path").and_then(Value::as_str).map(String::from),
            "codebase_search" => input
                .get("target_directories")
                .and_then(Value::as_array)
                .and_then(|dirs| dirs.first())
                .and_then(Value::as_str)
                .map(String::from),
            _ => None,
        }
    }
}

#[async_trait]
impl ToolDecorator for SourceTagTransform {
    fn name(&self) -> &str {
        "source_tag"
    }

    fn applies_to(&self, tool_name: &str, _input: &Value) -> bool {
        Self::TAGGED_TOOLS.contains(&tool_name)
    }

    async fn decorate(
        &self,
        tool_name: &str,
        input: &Value,
        output: &str,
    ) -> Result<Option<Decoration>, DecoratorError> {
        if self.skip(output) {
            return Ok(None);
        }

        let Some(source) = self.extract_source(tool_name, input) else {
            return Ok(None);
        };

        Ok(Some(Decoration {
            label: "source".to_string(),
            content: source,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tags_read_file_with_path() {
        let decorator = SourceTagTransform;
        let input = json!({"target_file": "src/lib.rs"});
        let deco = decorator
            .decorate("read_file", &input, "fn main() {}")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deco.content, "src/lib.rs");
    }

    #[tokio::test]
    async fn skips_empty_output() {
        let decorator = SourceTagTransform;
        let input = json!({"target_file": "src/lib.rs"});
        let deco = decorator.decorate("read_file", &input, "").await.unwrap();
        assert!(deco.is_none());
    }

    #[tokio::test]
    async fn skips_error_output() {
        let decorator = SourceTagTransform;
        let input = json!({"target_file": "src/lib.rs"});
        let deco = decorator
            .decorate("read_file", &input, "Error: file not found")
            .await
            .unwrap();
        assert!(deco.is_none());
    }

    #[test]
    fn does_not_apply_to_untagged_tools() {
        let decorator = SourceTagTransform;
        assert!(!decorator.applies_to("run_terminal_cmd", &json!({})));
    }

    #[tokio::test]
    async fn codebase_search_tags_first_directory() {
        let decorator = SourceTagTransform;
        let input = json!({"target_directories": ["src/", "tests/"]});
        let deco = decorator
            .decorate("codebase_search", &input, "match found")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deco.content, "src/");
    }
}
