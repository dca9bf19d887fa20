pub mod client;
pub mod error;
pub mod stream_processor;
pub mod types;
pub mod validate;

pub use client::{CompletedResponse, ProviderClient};
pub use error::InferenceError;
pub use stream_processor::StreamProcessor;
pub use types::{InferenceRequest, RawEvent, RawFinishReason, ThinkingConfig};
