//! Static table mapping model id to provider, context window, capability
//! flags, and pricing hints. No I/O, no side effects.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown model: {0}")]
pub struct UnknownModel(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

/// Per-token USD pricing. Resolves the Model Registry's "pricing hints" —
/// the distilled spec names the field but not its shape; we follow the
/// common cost-dashboard convention of per-million-token rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
    pub cached_input_cost_per_mtok: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub provider: Provider,
    pub context_window: u32,
    pub supports_tool_use: bool,
    pub supports_interleaved_reasoning: bool,
    pub supports_prompt_caching: bool,
    pub reasoning_effort_default: Option<&'static str>,
    pub thinking_budget_tokens: Option<u32>,
    pub pricing: Pricing,
}

const REGISTRY: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "claude-opus-4-20250514",
        provider: Provider::Anthropic,
        context_window: 200_000,
        supports_tool_use: true,
        supports_interleaved_reasoning: true,
        supports_prompt_caching: true,
        reasoning_effort_default: None,
        thinking_budget_tokens: Some(32_000),
        pricing: Pricing {
            input_cost_per_mtok: 15.0,
            output_cost_per_mtok: 75.0,
            cached_input_cost_per_mtok: 1.5,
        },
    },
    ModelDescriptor {
        id: "claude-sonnet-4-20250514",
        provider: Provider::Anthropic,
        context_window: 200_000,
        supports_tool_use: true,
        supports_interleaved_reasoning: true,
        supports_prompt_caching: true,
        reasoning_effort_default: None,
        thinking_budget_tokens: Some(16_000),
        pricing: Pricing {
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
            cached_input_cost_per_mtok: 0.3,
        },
    },
    ModelDescriptor {
        id: "claude-haiku-4-20250514",
        provider: Provider::Anthropic,
        context_window: 200_000,
        supports_tool_use: true,
        supports_interleaved_reasoning: false,
        supports_prompt_caching: true,
        reasoning_effort_default: None,
        thinking_budget_tokens: None,
        pricing: Pricing {
            input_cost_per_mtok: 0.8,
            output_cost_per_mtok: 4.0,
            cached_input_cost_per_mtok: 0.08,
        },
    },
    ModelDescriptor {
        id: "gpt-5",
        provider: Provider::OpenAi,
        context_window: 272_000,
        supports_tool_use: true,
        supports_interleaved_reasoning: true,
        supports_prompt_caching: false,
        reasoning_effort_default: Some("medium"),
        thinking_budget_tokens: None,
        pricing: Pricing {
            input_cost_per_mtok: 5.0,
            output_cost_per_mtok: 20.0,
            cached_input_cost_per_mtok: 0.5,
        },
    },
];

/// Look up a model by id. Pure, no side effects, fails closed on unregistered ids.
pub fn resolve(model_id: &str) -> Result<ModelDescriptor, UnknownModel> {
    REGISTRY
        .iter()
        .find(|m| m.id == model_id)
        .copied()
        .ok_or_else(|| UnknownModel(model_id.to_string()))
}

pub fn all_models() -> impl Iterator<Item = &'static ModelDescriptor> {
    REGISTRY.iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_model() {
        let d = resolve("claude-sonnet-4-20250514").unwrap();
        assert_eq!(d.context_window, 200_000);
        assert!(d.supports_tool_use);
    }

    #[test]
    fn unknown_model_fails_closed() {
        let err = resolve("gpt-2-small").unwrap_err();
        assert_eq!(err.0, "gpt-2-small");
    }

    #[test]
    fn registry_is_nonempty() {
        assert!(all_models().count() >= 3);
    }
}
