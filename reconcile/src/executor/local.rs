//! Executor that evaluates, builds and activates with the local `nix`.

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::deployment::{Activation, Operation};
use crate::core::generation::Evaluation;
use crate::error::Error;
use crate::executor::Executor;
use crate::executor::activation::{Activator, SystemActivator, activate};
use crate::io::nix::{Nix, all_outputs};

pub struct LocalExecutor<A: Activator = SystemActivator> {
    nix: Nix,
    activator: A,
    /// Derivation of the latest successful evaluation; only it may be built.
    evaluated: Option<String>,
}

impl<A: Activator> LocalExecutor<A> {
    pub fn new(nix: Nix, activator: A) -> Self {
        Self {
            nix,
            activator,
            evaluated: None,
        }
    }

    fn remember(&mut self, drv_path: &str) {
        self.evaluated = Some(drv_path.to_string());
    }
}

impl<A: Activator> Executor for LocalExecutor<A> {
    #[instrument(skip_all, fields(hostname = %hostname))]
    fn eval(&mut self, flake_url: &str, hostname: &str) -> Result<Evaluation> {
        let eval_failed = |err: anyhow::Error| Error::EvalFailed {
            hostname: hostname.to_string(),
            reason: format!("{err:#}"),
        };
        let (drv_path, out_path) = self
            .nix
            .show_derivation(flake_url, hostname)
            .map_err(eval_failed)?;
        let machine_id = self
            .nix
            .machine_id(flake_url, hostname)
            .map_err(eval_failed)?;
        info!(drv_path = %drv_path, out_path = %out_path, "evaluated");
        self.remember(&drv_path);
        Ok(Evaluation {
            drv_path,
            out_path,
            machine_id,
        })
    }

    fn build(&mut self, drv_path: &str) -> Result<()> {
        if self.evaluated.as_deref() != Some(drv_path) {
            return Err(Error::BuildNotEvaluated {
                drv_path: drv_path.to_string(),
            }
            .into());
        }
        self.nix.build(&all_outputs(drv_path))
    }

    fn deploy(&mut self, out_path: &str, operation: Operation) -> Result<Activation> {
        activate(&mut self.activator, out_path, operation)
    }
}
