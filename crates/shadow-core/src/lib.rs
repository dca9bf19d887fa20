pub mod error;
pub mod ids;
pub mod model;
pub mod parts;
pub mod tokens;

pub use error::CoreError;
pub use ids::{MessageId, TaskId, ToolCallId, VariantId};
pub use model::{
    ChatMessage, ChatRole, CodebaseUnderstanding, CompressionLevel, InitStatus, PullRequestSnapshot,
    Task, TaskStatus, ToolCall, ToolCallStatus, Usage, Variant, VariantStatus,
};
pub use parts::{FinishReason, Part};
pub use tokens::count;
