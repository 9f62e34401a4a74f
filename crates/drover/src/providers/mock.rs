use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::actions::extract_actions;
use super::base::{ModelStats, ModelTurn, Provider, ProviderError};
use crate::models::message::Message;

/// A scripted provider that replays pre-configured replies in order.
///
/// Each call costs a fixed amount so limit behavior is deterministic in
/// tests. Received histories are recorded for inspection.
pub struct MockProvider {
    outputs: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<Vec<Message>>>,
    stats: Mutex<ModelStats>,
    cost_per_call: f64,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of replies
    pub fn new<S: Into<String>>(outputs: Vec<S>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(ModelStats::default()),
            cost_per_call: 1.0,
        }
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    /// Histories received so far, one entry per query
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn query(&self, messages: &[Message]) -> Result<ModelTurn, ProviderError> {
        self.calls.lock().unwrap().push(messages.to_vec());

        let output = self
            .outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Malformed("no scripted replies left".to_string()))?;

        self.stats.lock().unwrap().record(self.cost_per_call);

        let actions = extract_actions(&output);
        Ok(ModelTurn {
            message: Message::assistant().with_text(output),
            actions,
            cost: self.cost_per_call,
        })
    }

    fn stats(&self) -> ModelStats {
        *self.stats.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order_and_extracts_actions() {
        let provider = MockProvider::new(vec!["one\n```bash\necho 'one'\n```", "two"]);

        let first = provider.query(&[]).await.unwrap();
        assert_eq!(first.actions.len(), 1);
        assert_eq!(first.actions[0].command, "echo 'one'");

        let second = provider.query(&[]).await.unwrap();
        assert!(second.actions.is_empty());
        assert_eq!(second.message.text(), "two");
    }

    #[tokio::test]
    async fn test_ledger_accumulates() {
        let provider = MockProvider::new(vec!["a", "b"]).with_cost_per_call(0.5);
        provider.query(&[]).await.unwrap();
        provider.query(&[]).await.unwrap();

        let stats = provider.stats();
        assert_eq!(stats.n_calls, 2);
        assert!((stats.cost - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_malformed() {
        let provider = MockProvider::new(Vec::<String>::new());
        let err = provider.query(&[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_records_received_history() {
        let provider = MockProvider::new(vec!["reply"]);
        let history = vec![Message::system().with_text("prompt")];
        provider.query(&history).await.unwrap();
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(provider.calls()[0][0].text(), "prompt");
    }
}
