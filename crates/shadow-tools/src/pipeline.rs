use serde_json::Value;
use tracing::warn;

use crate::decorator::{Decoration, ToolDecorator, ToolTransform};
use crate::error::ToolError;
use crate::registry::ToolRegistry;

/// Runs a tool call through validation, execution, transforms, and decorators.
/// Transforms and decorators are both advisory: a failure in either is logged
/// and the pipeline continues with the output it already has.
pub struct ToolPipeline {
    registry: ToolRegistry,
    transforms: Vec<Box<dyn ToolTransform>>,
    decorators: Vec<Box<dyn ToolDecorator>>,
}

impl ToolPipeline {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            transforms: Vec::new(),
            decorators: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: impl ToolTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn with_decorator(mut self, decorator: impl ToolDecorator + 'static) -> Self {
        self.decorators.push(Box::new(decorator));
        self
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.registry.schemas()
    }

    /// Execute a single tool call by name. `name` must be one of the closed
    /// tool set's schema names — there is no separate meta-tool dispatch path.
    pub async fn execute(&self, name: &str, input: &Value) -> Result<String, ToolError> {
        let raw = self.registry.execute(name, input).await?;
        let transformed = self.apply_transforms(name, input, raw).await;
        let decorated = self.apply_decorators(name, input, &transformed).await;
        Ok(decorated)
    }

    async fn apply_transforms(&self, name: &str, input: &Value, mut output: String) -> String {
        for transform in &self.transforms {
            if !transform.applies_to(name, input) {
                continue;
            }
            match transform.transform(name, input, output.clone()).await {
                Ok(next) => output = next,
                Err(err) => {
                    warn!(tool = name, transform = transform.name(), error = %err, "tool transform failed, keeping prior output");
                }
            }
        }
        output
    }

    async fn apply_decorators(&self, name: &str, input: &Value, output: &str) -> String {
        let mut decorations: Vec<Decoration> = Vec::new();
        for decorator in &self.decorators {
            if !decorator.applies_to(name, input) {
                continue;
            }
            match decorator.decorate(name, input, output).await {
                Ok(Some(decoration)) => decorations.push(decoration),
                Ok(None) => {}
                Err(err) => {
                    warn!(tool = name, decorator = decorator.name(), error = %err, "tool decorator failed, skipping");
                }
            }
        }

        if decorations.is_empty() {
            return output.to_string();
        }

        let mut result = output.to_string();
        for decoration in decorations {
            result.push_str("\n\n");
            result.push_str(&decoration.to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ToolHandler;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, input: &Value) -> Result<String, String> {
            Ok(input["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn schema() -> Value {
        json!({
            "name": "echo",
            "input_schema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        })
    }

    #[tokio::test]
    async fn runs_transforms_then_decorators() {
        let registry = ToolRegistry::new().add("echo", schema(), EchoHandler);
        let pipeline = ToolPipeline::new(registry).with_decorator(crate::decorator::source_tag::SourceTagTransform);
        let out = pipeline
            .execute("echo", &json!({"text": "hello sk-abcdefghijklmnopqrstuvwxyz123456"}))
            .await
            .unwrap();
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn tool_search_is_not_a_registered_tool() {
        let registry = ToolRegistry::new().add("echo", schema(), EchoHandler);
        let pipeline = ToolPipeline::new(registry);
        let err = pipeline.execute("tool_search", &json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn decorator_failure_does_not_fail_the_call() {
        struct FailingDecorator;
        #[async_trait::async_trait]
        impl ToolDecorator for FailingDecorator {
            fn name(&self) -> &str {
                "failing"
            }
            fn applies_to(&self, _tool_name: &str, _input: &Value) -> bool {
                true
            }
            async fn decorate(
                &self,
                _tool_name: &str,
                _input: &Value,
                _output: &str,
            ) -> Result<Option<Decoration>, crate::decorator::DecoratorError> {
                Err(crate::decorator::DecoratorError::Failed("boom".into()))
            }
        }

        let registry = ToolRegistry::new().add("echo", schema(), EchoHandler);
        let pipeline = ToolPipeline::new(registry).with_decorator(FailingDecorator);
        let out = pipeline.execute("echo", &json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
    }
}
