use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Raw result of executing one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Combined stdout/stderr, already truncated per the environment's
    /// elision policy.
    pub output: String,
    pub returncode: i32,
    pub duration_ms: u64,
    /// Characters removed by truncation; 0 when the output fit.
    pub elided_chars: usize,
}

impl ExecutionOutput {
    pub fn new<S: Into<String>>(output: S, returncode: i32) -> Self {
        ExecutionOutput {
            output: output.into(),
            returncode,
            duration_ms: 0,
            elided_chars: 0,
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EnvironmentError {
    /// The action ran past its deadline and was killed. Whatever it
    /// printed before dying is carried along for the observation.
    #[error("command timed out after {timeout_secs}s")]
    Timeout {
        timeout_secs: u64,
        partial_output: String,
    },

    #[error("failed to run command: {0}")]
    Launch(String),
}

/// Core trait for command-execution backends.
///
/// One instance is shared by a whole agent hierarchy: process state such
/// as the working directory is deliberately common, so a child's `cd`
/// persists for its parent. Implementations must enforce a per-action
/// timeout rather than hang.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Execute one shell action and return its raw output.
    async fn execute(&self, command: &str) -> Result<ExecutionOutput, EnvironmentError>;

    /// Environment-reported state exposed to prompt templates
    /// (e.g. working directory).
    fn template_vars(&self) -> Map<String, Value> {
        Map::new()
    }
}
