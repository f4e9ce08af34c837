//! Known models, their context windows and prices.

use serde::Serialize;

use super::TokenUsage;
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }

    /// OpenAI-compatible endpoint of each provider.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: ProviderKind,
    pub context_window: i64,
    pub default_max_tokens: i64,
    /// USD per million tokens.
    pub cost_per_1m_in: f64,
    pub cost_per_1m_out: f64,
    pub cost_per_1m_in_cached: f64,
    pub cost_per_1m_out_cached: f64,
    pub can_reason: bool,
    pub supports_attachments: bool,
}

impl ModelInfo {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (self.cost_per_1m_in * usage.input_tokens as f64
            + self.cost_per_1m_out * usage.output_tokens as f64
            + self.cost_per_1m_in_cached * usage.cache_creation_tokens as f64
            + self.cost_per_1m_out_cached * usage.cache_read_tokens as f64)
            / 1_000_000.0
    }
}

struct Entry {
    id: &'static str,
    provider: ProviderKind,
    context_window: i64,
    max_tokens: i64,
    prices: [f64; 4],
    can_reason: bool,
}

const MODELS: &[Entry] = &[
    Entry { id: "claude-sonnet-4-5", provider: ProviderKind::Anthropic, context_window: 200_000, max_tokens: 16_000, prices: [3.0, 15.0, 3.75, 0.30], can_reason: true },
    Entry { id: "claude-haiku-4-5", provider: ProviderKind::Anthropic, context_window: 200_000, max_tokens: 8_192, prices: [1.0, 5.0, 1.25, 0.10], can_reason: true },
    Entry { id: "claude-opus-4-1", provider: ProviderKind::Anthropic, context_window: 200_000, max_tokens: 16_000, prices: [15.0, 75.0, 18.75, 1.50], can_reason: true },
    Entry { id: "gpt-4.1", provider: ProviderKind::OpenAi, context_window: 1_047_576, max_tokens: 16_000, prices: [2.0, 8.0, 0.0, 0.50], can_reason: false },
    Entry { id: "gpt-4.1-mini", provider: ProviderKind::OpenAi, context_window: 1_047_576, max_tokens: 8_192, prices: [0.40, 1.60, 0.0, 0.10], can_reason: false },
    Entry { id: "gpt-4o", provider: ProviderKind::OpenAi, context_window: 128_000, max_tokens: 4_096, prices: [2.50, 10.0, 0.0, 1.25], can_reason: false },
    Entry { id: "o4-mini", provider: ProviderKind::OpenAi, context_window: 200_000, max_tokens: 50_000, prices: [1.10, 4.40, 0.0, 0.275], can_reason: true },
    Entry { id: "gemini-2.5-pro", provider: ProviderKind::Gemini, context_window: 1_000_000, max_tokens: 50_000, prices: [1.25, 10.0, 0.0, 0.31], can_reason: true },
    Entry { id: "gemini-2.5-flash", provider: ProviderKind::Gemini, context_window: 1_000_000, max_tokens: 50_000, prices: [0.30, 2.50, 0.0, 0.075], can_reason: true },
];

const FALLBACK_CONTEXT_WINDOW: i64 = 128_000;
const FALLBACK_MAX_TOKENS: i64 = 4_096;

/// Look up a model. Unknown tags get a provider guessed from the prefix and
/// zero prices.
pub fn model_info(model: &str) -> ModelInfo {
    if let Some(entry) = MODELS.iter().find(|e| e.id == model) {
        return ModelInfo {
            id: entry.id.to_string(),
            provider: entry.provider,
            context_window: entry.context_window,
            default_max_tokens: entry.max_tokens,
            cost_per_1m_in: entry.prices[0],
            cost_per_1m_out: entry.prices[1],
            cost_per_1m_in_cached: entry.prices[2],
            cost_per_1m_out_cached: entry.prices[3],
            can_reason: entry.can_reason,
            supports_attachments: true,
        };
    }
    let provider = if model.starts_with("claude") {
        ProviderKind::Anthropic
    } else if model.starts_with("gemini") {
        ProviderKind::Gemini
    } else {
        ProviderKind::OpenAi
    };
    ModelInfo {
        id: model.to_string(),
        provider,
        context_window: FALLBACK_CONTEXT_WINDOW,
        default_max_tokens: FALLBACK_MAX_TOKENS,
        cost_per_1m_in: 0.0,
        cost_per_1m_out: 0.0,
        cost_per_1m_in_cached: 0.0,
        cost_per_1m_out_cached: 0.0,
        can_reason: false,
        supports_attachments: false,
    }
}

/// Large and small default models for the first usable provider.
///
/// Providers are tried in the order anthropic, openai, gemini; with none
/// configured the anthropic pair is returned.
pub fn default_models(config: &Config) -> (&'static str, &'static str) {
    let usable = |name: &str| {
        config
            .provider(name)
            .is_some_and(|p| !p.disabled && p.api_key.as_deref().is_some_and(|k| !k.is_empty()))
    };
    if usable("anthropic") {
        ("claude-sonnet-4-5", "claude-haiku-4-5")
    } else if usable("openai") {
        ("gpt-4.1", "gpt-4.1-mini")
    } else if usable("gemini") {
        ("gemini-2.5-pro", "gemini-2.5-flash")
    } else {
        ("claude-sonnet-4-5", "claude-haiku-4-5")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    #[test]
    fn test_known_and_unknown_models() {
        let sonnet = model_info("claude-sonnet-4-5");
        assert_eq!(sonnet.provider, ProviderKind::Anthropic);
        assert_eq!(sonnet.context_window, 200_000);

        let unknown = model_info("gemini-exp");
        assert_eq!(unknown.provider, ProviderKind::Gemini);
        assert_eq!(unknown.cost(&TokenUsage { input_tokens: 1000, ..Default::default() }), 0.0);
    }

    #[test]
    fn test_cost_uses_per_million_prices() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            ..Default::default()
        };
        let cost = model_info("gpt-4.1").cost(&usage);
        assert!((cost - 2.8).abs() < 1e-9);
    }

    #[test]
    fn test_default_models_follow_configured_provider() {
        let mut config = Config::default();
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: Some("sk".into()),
                ..Default::default()
            },
        );
        assert_eq!(default_models(&config), ("gpt-4.1", "gpt-4.1-mini"));
    }
}
