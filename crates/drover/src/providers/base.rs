use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::message::Message;

/// One extracted unit of intended execution: a single shell command
/// derived from an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub command: String,
}

impl Action {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Action {
            command: command.into(),
        }
    }
}

/// Running totals of the shared provider ledger. Cost is in the
/// provider's currency (usually dollars) and only ever increases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub cost: f64,
    pub n_calls: u64,
}

impl ModelStats {
    pub fn record(&mut self, cost: f64) {
        self.cost += cost;
        self.n_calls += 1;
    }
}

/// One model turn: the assistant message, the actions extracted from it,
/// and what the turn cost.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub message: Message,
    pub actions: Vec<Action>,
    pub cost: f64,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider responded but the payload could not be interpreted.
    /// The coordinator treats this as a retryable format failure.
    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Well-known model parameters plus an opaque extension map.
///
/// `model_kwargs` is merged verbatim into the request payload so
/// provider-specific parameters pass through without being typed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Dollars per input token, used to price a turn from reported usage.
    pub input_cost_per_token: f64,
    /// Dollars per output token.
    pub output_cost_per_token: f64,
    pub model_kwargs: Map<String, Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            model: "gpt-4o".to_string(),
            temperature: None,
            max_tokens: None,
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            model_kwargs: Map::new(),
        }
    }
}

/// Base trait for model backends (OpenAI-compatible, scripted, etc).
///
/// Implementations are stateless across calls apart from the cost ledger:
/// everything the model needs is in the message history it is handed. The
/// ledger is shared by every agent in a hierarchy, which is what makes
/// step/cost ceilings root-anchored.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next assistant turn for the given history.
    async fn query(&self, messages: &[Message]) -> Result<ModelTurn, ProviderError>;

    /// Current ledger totals across all calls served by this instance.
    fn stats(&self) -> ModelStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_accumulates() {
        let mut stats = ModelStats::default();
        stats.record(0.5);
        stats.record(0.25);
        assert_eq!(stats.n_calls, 2);
        assert!((stats.cost - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_model_config_defaults() {
        let config: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.model, "gpt-4o");
        assert!(config.model_kwargs.is_empty());
    }

    #[test]
    fn test_model_config_keeps_unknown_kwargs() {
        let config: ModelConfig = serde_json::from_str(
            r#"{"model": "local", "model_kwargs": {"top_p": 0.9, "stop": ["\n"]}}"#,
        )
        .unwrap();
        assert_eq!(config.model_kwargs["top_p"], serde_json::json!(0.9));
    }
}
