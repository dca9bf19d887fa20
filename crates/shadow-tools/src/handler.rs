use async_trait::async_trait;
use serde_json::Value;

/// A tool's execution handler. One impl per closed-set tool, bound to a
/// single variant's workspace at construction time.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<String, String>;
}

/// A tool definition: schema for the model + handler for execution.
pub struct ToolDef {
    pub name: String,
    pub schema: Value,
    pub(crate) handler: Box<dyn ToolHandler>,
}
