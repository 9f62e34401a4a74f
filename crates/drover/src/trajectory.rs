use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, RunOutcome};
use crate::errors::ExitStatus;
use crate::models::message::Message;
use crate::providers::ModelStats;

/// Bumped whenever any field of the persisted form changes meaning.
pub const TRAJECTORY_FORMAT: &str = "drover-trajectory-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub agent_id: String,
    pub exit_status: ExitStatus,
    pub submission: Option<String>,
    /// Ledger totals across the hierarchy at the time of capture.
    pub model_stats: ModelStats,
    /// Steps taken by the captured agent itself.
    pub steps: u64,
}

/// The persisted form of a finished run: pure data, stable shape.
///
/// Messages round-trip in order with their `extra` maps untouched, so
/// downstream tooling can rely on the history reading exactly as the
/// agent accumulated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub info: TrajectoryInfo,
    pub messages: Vec<Message>,
    pub trajectory_format: String,
}

impl Trajectory {
    pub fn from_run(agent: &Agent, outcome: &RunOutcome) -> Self {
        Trajectory {
            info: TrajectoryInfo {
                agent_id: agent.agent_id().to_string(),
                exit_status: outcome.status,
                submission: outcome.submission.clone(),
                model_stats: agent.model_stats(),
                steps: agent.steps(),
            },
            messages: agent.messages().to_vec(),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize trajectory")
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("failed to deserialize trajectory")
    }

    /// Write the trajectory to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write trajectory to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read trajectory from {}", path.display()))?;
        Self::from_json(&data)
    }
}
