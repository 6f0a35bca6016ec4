//! Executor abstraction for evaluating, building and activating a host
//! configuration.
//!
//! The [`Executor`] trait decouples the reconciliation loop from the backend
//! doing the work. [`Backend`] picks the concrete implementation once from
//! the configuration; tests use scripted executors instead.

pub mod activation;
pub mod local;
pub mod remote_ci;

use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::deployment::{Activation, Operation};
use crate::core::generation::Evaluation;
use crate::executor::activation::SystemActivator;
use crate::executor::local::LocalExecutor;
use crate::executor::remote_ci::{HttpCi, PollPolicy, RemoteCiExecutor, cache_capacity};
use crate::io::config::{AgentConfig, ExecutorKind};
use crate::io::nix::Nix;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Evaluate, build and deploy a host configuration.
pub trait Executor {
    /// Resolve the build plan of `hostname` in `flake_url` without building it.
    fn eval(&mut self, flake_url: &str, hostname: &str) -> Result<Evaluation>;

    /// Materialize the outputs of a derivation returned by [`Executor::eval`].
    fn build(&mut self, drv_path: &str) -> Result<()>;

    /// Activate a built output.
    fn deploy(&mut self, out_path: &str, operation: Operation) -> Result<Activation>;
}

/// The executor backend selected by the configuration.
pub enum Backend {
    Local(LocalExecutor),
    RemoteCi(RemoteCiExecutor),
}

impl Backend {
    pub fn from_config(cfg: &AgentConfig) -> Result<Self> {
        let limits = cfg.commands.limits();
        let activator = SystemActivator {
            unit_name: cfg.activation.unit_name.clone(),
            profile_path: cfg.activation.profile_path.clone(),
            dry_run: cfg.dry_run,
            limits,
        };
        let nix = Nix::new(limits);

        match cfg.executor.kind {
            ExecutorKind::Local => Ok(Self::Local(LocalExecutor::new(nix, activator))),
            ExecutorKind::Garnix => {
                let garnix = &cfg.executor.garnix;
                let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
                let ci = HttpCi::new(&garnix.base_url, &garnix.cache_url, agent)
                    .context("configure ci executor")?;
                let poll = PollPolicy {
                    retry_interval: Duration::from_secs(garnix.retry_interval_secs),
                    timeout: garnix.poll_timeout_secs.map(Duration::from_secs),
                };
                Ok(Self::RemoteCi(RemoteCiExecutor::new(
                    ci,
                    nix,
                    activator,
                    poll,
                    cache_capacity(garnix.cache_size)?,
                )))
            }
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            Self::Local(_) => ExecutorKind::Local,
            Self::RemoteCi(_) => ExecutorKind::Garnix,
        }
    }
}

impl Executor for Backend {
    fn eval(&mut self, flake_url: &str, hostname: &str) -> Result<Evaluation> {
        match self {
            Self::Local(executor) => executor.eval(flake_url, hostname),
            Self::RemoteCi(executor) => executor.eval(flake_url, hostname),
        }
    }

    fn build(&mut self, drv_path: &str) -> Result<()> {
        match self {
            Self::Local(executor) => executor.build(drv_path),
            Self::RemoteCi(executor) => executor.build(drv_path),
        }
    }

    fn deploy(&mut self, out_path: &str, operation: Operation) -> Result<Activation> {
        match self {
            Self::Local(executor) => executor.deploy(out_path, operation),
            Self::RemoteCi(executor) => executor.deploy(out_path, operation),
        }
    }
}

impl<E: Executor + ?Sized> Executor for &mut E {
    fn eval(&mut self, flake_url: &str, hostname: &str) -> Result<Evaluation> {
        (**self).eval(flake_url, hostname)
    }

    fn build(&mut self, drv_path: &str) -> Result<()> {
        (**self).build(drv_path)
    }

    fn deploy(&mut self, out_path: &str, operation: Operation) -> Result<Activation> {
        (**self).deploy(out_path, operation)
    }
}
