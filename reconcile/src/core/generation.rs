//! Evaluate-then-build lifecycle of one selected commit.
//!
//! ```text
//! Init -> Evaluating -> EvaluationSucceeded -> Building -> BuildSucceeded
//!                   \-> EvaluationFailed               \-> BuildFailed
//! ```
//!
//! Transitions take the current time explicitly so the machine stays pure.
//! A terminal generation is never mutated again; a newer commit gets a new
//! generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generation lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Init,
    Evaluating,
    EvaluationSucceeded,
    EvaluationFailed,
    Building,
    BuildSucceeded,
    BuildFailed,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::EvaluationFailed | Self::BuildSucceeded | Self::BuildFailed
        )
    }
}

/// A lifecycle method was called from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {machine} transition from {from} to {to}")]
pub struct TransitionError {
    pub machine: &'static str,
    pub from: String,
    pub to: String,
}

impl TransitionError {
    pub(crate) fn new(machine: &'static str, from: impl std::fmt::Debug, to: &str) -> Self {
        Self {
            machine,
            from: format!("{from:?}"),
            to: to.to_string(),
        }
    }
}

/// Build plan produced by a successful evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub drv_path: String,
    pub out_path: String,
    /// Machine id the configuration is meant for, when it declares one.
    pub machine_id: Option<String>,
}

/// Commit a generation is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSource {
    pub remote_name: String,
    pub branch_name: String,
    pub branch_is_testing: bool,
    pub commit_id: String,
    pub commit_msg: String,
}

/// One evaluate-and-build attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Generation {
    pub flake_url: String,
    pub hostname: String,
    pub selected_remote_name: String,
    pub selected_branch_name: String,
    pub selected_branch_is_testing: bool,
    pub selected_commit_id: String,
    pub selected_commit_msg: String,
    pub status: GenerationStatus,
    pub eval_started_at: Option<DateTime<Utc>>,
    pub eval_ended_at: Option<DateTime<Utc>>,
    pub eval_error: String,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_ended_at: Option<DateTime<Utc>>,
    pub build_error: String,
    pub drv_path: String,
    pub out_path: String,
    pub machine_id: String,
}

impl Generation {
    pub fn new(source: GenerationSource, flake_url: String, hostname: String) -> Self {
        Self {
            flake_url,
            hostname,
            selected_remote_name: source.remote_name,
            selected_branch_name: source.branch_name,
            selected_branch_is_testing: source.branch_is_testing,
            selected_commit_id: source.commit_id,
            selected_commit_msg: source.commit_msg,
            ..Self::default()
        }
    }

    pub fn start_eval(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect(GenerationStatus::Init, "Evaluating")?;
        self.status = GenerationStatus::Evaluating;
        self.eval_started_at = Some(now);
        Ok(())
    }

    /// Record the evaluation outcome. `Err` carries a rendered error message.
    pub fn finish_eval(
        &mut self,
        now: DateTime<Utc>,
        outcome: Result<Evaluation, String>,
    ) -> Result<(), TransitionError> {
        let to = if outcome.is_ok() {
            "EvaluationSucceeded"
        } else {
            "EvaluationFailed"
        };
        self.expect(GenerationStatus::Evaluating, to)?;
        self.eval_ended_at = Some(now);
        match outcome {
            Ok(evaluation) => {
                self.drv_path = evaluation.drv_path;
                self.out_path = evaluation.out_path;
                self.machine_id = evaluation.machine_id.unwrap_or_default();
                self.status = GenerationStatus::EvaluationSucceeded;
            }
            Err(message) => {
                self.eval_error = message;
                self.status = GenerationStatus::EvaluationFailed;
            }
        }
        Ok(())
    }

    pub fn start_build(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect(GenerationStatus::EvaluationSucceeded, "Building")?;
        self.status = GenerationStatus::Building;
        self.build_started_at = Some(now);
        Ok(())
    }

    pub fn finish_build(
        &mut self,
        now: DateTime<Utc>,
        outcome: Result<(), String>,
    ) -> Result<(), TransitionError> {
        let to = if outcome.is_ok() {
            "BuildSucceeded"
        } else {
            "BuildFailed"
        };
        self.expect(GenerationStatus::Building, to)?;
        self.build_ended_at = Some(now);
        match outcome {
            Ok(()) => self.status = GenerationStatus::BuildSucceeded,
            Err(message) => {
                self.build_error = message;
                self.status = GenerationStatus::BuildFailed;
            }
        }
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.status == GenerationStatus::BuildSucceeded
    }

    fn expect(&self, from: GenerationStatus, to: &str) -> Result<(), TransitionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(TransitionError::new("generation", self.status, to))
        }
    }
}
