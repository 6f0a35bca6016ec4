//! Activation lifecycle of a built generation.
//!
//! ```text
//! Init -> Running -> Done
//!                \-> Failed
//! ```

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::generation::{Generation, TransitionError};

/// Activation operation handed to `switch-to-configuration`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    #[default]
    Switch,
    Boot,
    Test,
    DryActivate,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Boot => "boot",
            Self::Test => "test",
            Self::DryActivate => "dry-activate",
        }
    }

    /// Whether the operation makes the new system the boot default.
    pub fn updates_profile(self) -> bool {
        matches!(self, Self::Switch | Self::Boot)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(Self::Switch),
            "boot" => Ok(Self::Boot),
            "test" => Ok(Self::Test),
            "dry-activate" => Ok(Self::DryActivate),
            other => Err(anyhow!(
                "unknown operation '{other}' (expected switch, boot, test or dry-activate)"
            )),
        }
    }
}

/// Deployment lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Init,
    Running,
    Done,
    Failed,
}

/// Result of a successful activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// The agent's own service definition changed; it must restart itself.
    pub needs_restart: bool,
    /// System profile link written by the activation, empty when none was.
    pub profile_path: String,
}

/// One activation attempt of a successfully built generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Deployment {
    pub generation: Generation,
    pub operation: Operation,
    pub status: DeploymentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_msg: String,
    pub restart_required: bool,
    pub profile_path: String,
}

impl Deployment {
    /// Start a deployment; only a generation that finished building qualifies.
    pub fn new(generation: Generation, operation: Operation) -> Result<Self, TransitionError> {
        if !generation.is_built() {
            return Err(TransitionError::new(
                "deployment",
                generation.status,
                "Init",
            ));
        }
        Ok(Self {
            generation,
            operation,
            ..Self::default()
        })
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != DeploymentStatus::Init {
            return Err(TransitionError::new("deployment", self.status, "Running"));
        }
        self.status = DeploymentStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn finish(
        &mut self,
        now: DateTime<Utc>,
        outcome: Result<Activation, String>,
    ) -> Result<(), TransitionError> {
        if self.status != DeploymentStatus::Running {
            let to = if outcome.is_ok() { "Done" } else { "Failed" };
            return Err(TransitionError::new("deployment", self.status, to));
        }
        self.ended_at = Some(now);
        match outcome {
            Ok(activation) => {
                self.restart_required = activation.needs_restart;
                self.profile_path = activation.profile_path;
                self.status = DeploymentStatus::Done;
            }
            Err(message) => {
                self.error_msg = message;
                self.status = DeploymentStatus::Failed;
            }
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.status == DeploymentStatus::Done
    }
}
