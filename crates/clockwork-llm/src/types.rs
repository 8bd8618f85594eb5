//! Request and streaming-chunk types exchanged with provider adapters.

use clockwork_core::{Message, Usage};
use serde::{Deserialize, Serialize};

/// One request to a provider adapter.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for ProviderRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            system: None,
            max_tokens: Some(8192),
            temperature: None,
        }
    }
}

/// One chunk of a streamed provider response. `finish_reason` and `usage`
/// typically arrive on the final chunk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn done(finish_reason: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: String::new(),
            finish_reason: Some(finish_reason.into()),
            usage: Some(usage),
            raw: None,
        }
    }
}

/// USD price per million tokens for one model.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_per_mtok: Option<f64>,
}

impl ModelPricing {
    pub fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            cached_input_per_mtok: None,
        }
    }

    /// Cost of one call in USD. Cached input tokens are billed at the cached
    /// rate when one is set, otherwise at the input rate.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let cached = usage.cached_input_tokens.unwrap_or(0) as f64;
        let fresh = (usage.input_tokens as f64 - cached).max(0.0);
        let cached_rate = self.cached_input_per_mtok.unwrap_or(self.input_per_mtok);
        (fresh * self.input_per_mtok
            + cached * cached_rate
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}
