/// Tool-execution error taxonomy: validation failures are distinct from
/// execution failures, and an unknown tool name is distinct from both.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("validation failed for `{tool}`: {message}")]
    ValidationError { tool: String, message: String },
    #[error("execution failed for `{tool}`: {message}")]
    ToolExecutionError { tool: String, message: String },
    #[error("path escapes workspace: {0}")]
    PathEscape(String),
}

impl ToolError {
    /// Render as the structured result the model sees — tool errors are
    /// returned as results, not raised as exceptions.
    pub fn as_tool_result(&self) -> String {
        self.to_string()
    }
}
