use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal state of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum ExitStatus {
    Submitted,
    LimitsExceeded,
    Error,
    Interrupted,
}

/// A flow-control signal unwinding the run loop.
///
/// All interrupt conditions share this one type so the loop can catch any
/// of them in a single place, append the carried message to history and
/// either continue (recoverable variants) or exit to a terminal state.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowInterrupt {
    /// The agent declared the task finished; payload is the submission text.
    #[error("{0}")]
    Submitted(String),

    /// Step or cost ceiling reached, or a recoverable condition escalated.
    #[error("{0}")]
    LimitsExceeded(String),

    /// The model's reply could not be parsed into an action. Recoverable.
    #[error("{0}")]
    FormatError(String),

    /// The environment killed the action at its deadline. Recoverable.
    #[error("{0}")]
    ExecutionTimeout(String),

    /// External cancellation. Always fatal.
    #[error("{0}")]
    Interrupted(String),

    /// Unrecoverable internal failure (provider, template rendering).
    #[error("{0}")]
    Fatal(String),
}

impl FlowInterrupt {
    /// Whether this signal ends the run. Recoverable signals are appended
    /// to history as corrective messages and the loop continues.
    pub fn is_terminal(&self) -> bool {
        self.exit_status().is_some()
    }

    /// The terminal state this signal maps onto, if any.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            FlowInterrupt::Submitted(_) => Some(ExitStatus::Submitted),
            FlowInterrupt::LimitsExceeded(_) => Some(ExitStatus::LimitsExceeded),
            FlowInterrupt::Interrupted(_) => Some(ExitStatus::Interrupted),
            FlowInterrupt::Fatal(_) => Some(ExitStatus::Error),
            FlowInterrupt::FormatError(_) | FlowInterrupt::ExecutionTimeout(_) => None,
        }
    }
}
