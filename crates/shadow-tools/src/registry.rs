use serde_json::Value;

use crate::error::ToolError;
use crate::handler::{ToolDef, ToolHandler};

/// Catalog of the closed tool set. Stores definitions, provides schemas for
/// the model request, looks up handlers by name, and validates arguments
/// before dispatch.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn add(
        mut self,
        name: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        self.tools.push(ToolDef {
            name: name.into(),
            schema,
            handler: Box::new(handler),
        });
        self
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn schema(&self, name: &str) -> Option<&Value> {
        self.tools.iter().find(|t| t.name == name).map(|t| &t.schema)
    }

    /// Validate arguments against the tool's schema, then execute.
    /// `ValidationError` and `ToolExecutionError` are distinct outcomes —
    /// both are structured results, never exceptions.
    pub async fn execute(&self, name: &str, input: &Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        crate::validate::validate_args(&tool.schema, input).map_err(|message| {
            ToolError::ValidationError {
                tool: name.to_string(),
                message,
            }
        })?;

        tool.handler
            .call(input)
            .await
            .map_err(|message| ToolError::ToolExecutionError {
                tool: name.to_string(),
                message,
            })
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ToolHandler for NoopHandler {
        async fn call(&self, _input: &Value) -> Result<String, String> {
            Ok("ok".into())
        }
    }

    fn schema() -> Value {
        json!({
            "name": "read_file",
            "input_schema": {
                "type": "object",
                "properties": {"target_file": {"type": "string"}},
                "required": ["target_file"]
            }
        })
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_before_dispatch() {
        let registry = ToolRegistry::new().add("read_file", schema(), NoopHandler);
        let err = registry.execute("write_file", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn invalid_args_are_rejected_before_dispatch() {
        let registry = ToolRegistry::new().add("read_file", schema(), NoopHandler);
        let err = registry.execute("read_file", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn valid_call_dispatches() {
        let registry = ToolRegistry::new().add("read_file", schema(), NoopHandler);
        let result = registry
            .execute("read_file", &json!({"target_file": "a.rs"}))
            .await
            .unwrap();
        assert_eq!(result, "ok");
    }
}
