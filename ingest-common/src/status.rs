use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of a tracked record (ML inference requests and batch jobs).
///
/// Processing: written together with the record, before any backend call.
/// Completed: the class stage finished and its result is attached.
/// Failed: the invocation failed after the record was written. No result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// The only valid transitions are `processing -> completed` and `processing -> failed`.
    pub fn transition(self, to: ProcessingStatus) -> Result<StatusTransition, TransitionError> {
        match (self, to) {
            (ProcessingStatus::Processing, ProcessingStatus::Completed)
            | (ProcessingStatus::Processing, ProcessingStatus::Failed) => {
                Ok(StatusTransition { from: self, to })
            }
            (from, to) => Err(TransitionError { from, to }),
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            invalid => Err(format!("{invalid} is not a valid ProcessingStatus")),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid status transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ProcessingStatus,
    pub to: ProcessingStatus,
}

/// A transition that passed the guard. Only constructible through `ProcessingStatus::transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    from: ProcessingStatus,
    to: ProcessingStatus,
}

impl StatusTransition {
    pub fn source(&self) -> ProcessingStatus {
        self.from
    }

    pub fn target(&self) -> ProcessingStatus {
        self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_moves_to_terminal_states() {
        let completed = ProcessingStatus::Processing
            .transition(ProcessingStatus::Completed)
            .expect("processing -> completed is valid");
        assert_eq!(completed.source(), ProcessingStatus::Processing);
        assert_eq!(completed.target(), ProcessingStatus::Completed);

        let failed = ProcessingStatus::Processing
            .transition(ProcessingStatus::Failed)
            .expect("processing -> failed is valid");
        assert_eq!(failed.source(), ProcessingStatus::Processing);
        assert_eq!(failed.target(), ProcessingStatus::Failed);
    }

    #[test]
    fn terminal_states_never_move() {
        for from in [ProcessingStatus::Completed, ProcessingStatus::Failed] {
            for to in [
                ProcessingStatus::Processing,
                ProcessingStatus::Completed,
                ProcessingStatus::Failed,
            ] {
                assert_eq!(from.transition(to), Err(TransitionError { from, to }));
            }
        }
        assert!(ProcessingStatus::Processing
            .transition(ProcessingStatus::Processing)
            .is_err());
    }

    #[test]
    fn parses_lowercase_names() {
        assert_eq!(
            "completed".parse::<ProcessingStatus>(),
            Ok(ProcessingStatus::Completed)
        );
        assert!("done".parse::<ProcessingStatus>().is_err());
        assert_eq!(
            serde_json::to_value(ProcessingStatus::Failed).unwrap(),
            serde_json::json!("failed")
        );
    }
}
