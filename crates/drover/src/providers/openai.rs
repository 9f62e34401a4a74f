use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::actions::extract_actions;
use super::base::{ModelConfig, ModelStats, ModelTurn, Provider, ProviderError};
use crate::models::message::Message;

pub const OPENAI_HOST: &str = "https://api.openai.com";

/// Adapter for any OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiProvider {
    client: Client,
    host: String,
    api_key: String,
    config: ModelConfig,
    stats: Mutex<ModelStats>,
}

impl OpenAiProvider {
    pub fn new(config: ModelConfig, host: String, api_key: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        Ok(Self {
            client,
            host,
            api_key,
            config,
            stats: Mutex::new(ModelStats::default()),
        })
    }

    /// Price a turn from reported token usage. Unpriced models cost 0.0;
    /// the ledger still counts the call.
    fn turn_cost(&self, data: &Value) -> f64 {
        let usage = &data["usage"];
        let input = usage["prompt_tokens"].as_f64().unwrap_or(0.0);
        let output = usage["completion_tokens"].as_f64().unwrap_or(0.0);
        input * self.config.input_cost_per_token + output * self.config.output_cost_per_token
    }

    fn build_payload(&self, messages: &[Message]) -> Value {
        let messages_spec: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.text()}))
            .collect();

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_spec,
        });
        if let Some(temperature) = self.config.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        // Provider-specific parameters pass through untyped.
        for (key, value) in &self.config.model_kwargs {
            payload[key] = value.clone();
        }
        payload
    }

    async fn post(&self, payload: Value) -> Result<Value, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Auth(format!(
                "server returned {}",
                response.status()
            ))),
            status => Err(ProviderError::Request(format!(
                "server returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn query(&self, messages: &[Message]) -> Result<ModelTurn, ProviderError> {
        let data = self.post(self.build_payload(messages)).await?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::Malformed(format!("no message content in response: {data}"))
            })?
            .to_string();

        let cost = self.turn_cost(&data);
        self.stats.lock().unwrap().record(cost);

        let actions = extract_actions(&content);
        Ok(ModelTurn {
            message: Message::assistant().with_text(content),
            actions,
            cost,
        })
    }

    fn stats(&self) -> ModelStats {
        *self.stats.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced_config() -> ModelConfig {
        ModelConfig {
            model: "test-model".to_string(),
            input_cost_per_token: 0.001,
            output_cost_per_token: 0.002,
            ..ModelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_query_parses_reply_and_prices_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                json!({
                    "choices": [{"message": {"role": "assistant", "content": "Run it\n```bash\nls\n```"}}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let provider =
            OpenAiProvider::new(priced_config(), server.url(), "test-key".to_string()).unwrap();
        let history = vec![Message::user().with_text("list files")];
        let turn = provider.query(&history).await.unwrap();

        mock.assert_async().await;
        assert_eq!(turn.actions.len(), 1);
        assert_eq!(turn.actions[0].command, "ls");
        assert!((turn.cost - 0.02).abs() < 1e-9);
        assert_eq!(provider.stats().n_calls, 1);
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(json!({"choices": []}).to_string())
            .create_async()
            .await;

        let provider =
            OpenAiProvider::new(ModelConfig::default(), server.url(), "k".to_string()).unwrap();
        let err = provider.query(&[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .create_async()
            .await;

        let provider =
            OpenAiProvider::new(ModelConfig::default(), server.url(), "bad".to_string()).unwrap();
        let err = provider.query(&[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn test_payload_merges_model_kwargs() {
        let mut config = ModelConfig::default();
        config.temperature = Some(0.2);
        config
            .model_kwargs
            .insert("top_p".to_string(), json!(0.9));

        let provider =
            OpenAiProvider::new(config, OPENAI_HOST.to_string(), "k".to_string()).unwrap();
        let payload = provider.build_payload(&[Message::user().with_text("hi")]);

        assert_eq!(payload["temperature"], json!(0.2));
        assert_eq!(payload["top_p"], json!(0.9));
        assert_eq!(payload["messages"][0]["role"], json!("user"));
    }
}
