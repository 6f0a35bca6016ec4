//! Reconciliation loop: fetch, select, evaluate, build, deploy.
//!
//! The manager is the only writer of the repository status, the current
//! generation and the current deployment. Readers get a [`State`] copy
//! through the publisher callback after every transition.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::core::deployment::{Deployment, DeploymentStatus, Operation};
use crate::core::generation::{Generation, GenerationSource, GenerationStatus};
use crate::error::Error;
use crate::executor::Executor;
use crate::io::config::AgentConfig;
use crate::io::host::Host;
use crate::io::state_store::{PersistedState, load_state, write_state};
use crate::repository::Repository;
use crate::status::{BuilderState, FetcherState, State};

/// What woke the worker up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Periodic,
    /// Explicit fetch request, optionally limited to one remote.
    Fetch { remote: Option<String> },
}

impl Tick {
    pub fn remote_filter(&self) -> Option<&str> {
        match self {
            Self::Periodic => None,
            Self::Fetch { remote } => remote.as_deref(),
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// A new generation was created for a newly selected commit.
    pub new_generation: bool,
    /// A deployment finished successfully during this pass.
    pub deployed: bool,
    /// The agent's own service changed and the process must restart.
    pub restart_required: bool,
}

type Publisher = Box<dyn FnMut(&State) + Send>;

pub struct Manager<E: Executor> {
    repository: Repository,
    executor: E,
    host: Host,
    hostname: String,
    subdir: String,
    state_path: PathBuf,
    generation: Option<Generation>,
    deployment: Option<Deployment>,
    publisher: Option<Publisher>,
}

impl<E: Executor> Manager<E> {
    /// Restore persisted state, open the repository and wire the executor.
    pub fn new(cfg: &AgentConfig, executor: E, host: Host) -> Result<Self> {
        let state_path = cfg.state_path();
        let persisted = load_state(&state_path)?;
        let repository = Repository::open(cfg, &persisted.repository_status)?;

        // Only a finished deployment pins its commit; an interrupted one is
        // built and activated again.
        let generation = persisted
            .deployment
            .as_ref()
            .filter(|d| d.status == DeploymentStatus::Done)
            .map(|d| d.generation.clone());
        if let Some(g) = &generation {
            info!(commit = %g.selected_commit_id, "resuming after deployed commit");
        }

        Ok(Self {
            repository,
            executor,
            host,
            hostname: cfg.hostname.clone(),
            subdir: cfg.repository.subdir.clone(),
            state_path,
            generation,
            deployment: persisted.deployment,
            publisher: None,
        })
    }

    /// Install the callback that receives a snapshot after every change.
    pub fn with_publisher(mut self, publisher: impl FnMut(&State) + Send + 'static) -> Self {
        self.publisher = Some(Box::new(publisher));
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn state(&self) -> State {
        State {
            builder: BuilderState {
                hostname: self.hostname.clone(),
                need_to_reboot: self.host.need_to_reboot(),
            },
            fetcher: FetcherState {
                repository_status: self.repository.status().clone(),
            },
            generation: self.generation.clone(),
            deployment: self.deployment.clone(),
        }
    }

    /// Publish the current snapshot without doing any work.
    pub fn publish(&mut self) {
        let state = self.state();
        if let Some(publisher) = self.publisher.as_mut() {
            publisher(&state);
        }
    }

    /// Run one reconciliation pass.
    #[instrument(skip_all, fields(tick = ?tick))]
    pub fn tick(&mut self, tick: &Tick) -> Result<TickOutcome> {
        self.repository.fetch(tick.remote_filter())?;
        let updated = self.repository.update();
        self.persist()?;
        self.publish();
        updated?;

        let status = self.repository.status();
        let commit = status.selected_commit_id.clone();
        // A commit first deployed from a testing branch and then promoted to
        // main is a new generation: it has to be switched, not only tested.
        if self.generation.as_ref().is_some_and(|g| {
            g.selected_commit_id == commit
                && g.selected_branch_is_testing == status.selected_branch_is_testing
        }) {
            return Ok(TickOutcome::default());
        }

        let source = GenerationSource {
            remote_name: status.selected_remote_name.clone(),
            branch_name: status.selected_branch_name.clone(),
            branch_is_testing: status.selected_branch_is_testing,
            commit_id: commit.clone(),
            commit_msg: status.selected_commit_msg(),
        };
        let flake = flake_url(self.repository.path(), &self.subdir, &commit);
        info!(commit = %commit, flake_url = %flake, "new generation");
        let generation = Generation::new(source, flake, self.hostname.clone());

        let mut outcome = TickOutcome {
            new_generation: true,
            ..TickOutcome::default()
        };
        let Some(generation) = self.evaluate_and_build(generation)? else {
            return Ok(outcome);
        };

        let operation = if generation.selected_branch_is_testing {
            Operation::Test
        } else {
            Operation::Switch
        };
        let deployment = self.deploy(generation, operation)?;
        outcome.deployed = deployment.is_done();
        outcome.restart_required = deployment.restart_required;
        Ok(outcome)
    }

    /// Drive `generation` to a terminal state; returns it when built.
    fn evaluate_and_build(&mut self, mut generation: Generation) -> Result<Option<Generation>> {
        generation.start_eval(Utc::now())?;
        self.set_generation(&generation);

        let evaluated = self
            .executor
            .eval(&generation.flake_url, &generation.hostname)
            .map_err(|err| format!("{err:#}"));
        if let Err(reason) = &evaluated {
            error!(reason = %reason, "evaluation failed");
        }
        generation.finish_eval(Utc::now(), evaluated)?;
        self.set_generation(&generation);
        if generation.status != GenerationStatus::EvaluationSucceeded {
            return Ok(None);
        }

        generation.start_build(Utc::now())?;
        self.set_generation(&generation);
        let built = self
            .executor
            .build(&generation.drv_path)
            .map_err(|err| format!("{err:#}"));
        if let Err(reason) = &built {
            error!(reason = %reason, "build failed");
        }
        generation.finish_build(Utc::now(), built)?;
        self.set_generation(&generation);

        Ok(generation.is_built().then_some(generation))
    }

    fn deploy(&mut self, generation: Generation, operation: Operation) -> Result<Deployment> {
        let mut deployment = Deployment::new(generation, operation)?;
        self.set_deployment(&deployment)?;

        deployment.start(Utc::now())?;
        self.set_deployment(&deployment)?;

        let activated = self
            .check_machine_id(&deployment.generation)
            .and_then(|()| {
                self.executor
                    .deploy(&deployment.generation.out_path, operation)
            })
            .map_err(|err| format!("{err:#}"));
        match &activated {
            Ok(_) => info!(operation = %operation, "deployment done"),
            Err(reason) => error!(reason = %reason, "deployment failed"),
        }
        deployment.finish(Utc::now(), activated)?;
        self.set_deployment(&deployment)?;
        Ok(deployment)
    }

    fn check_machine_id(&self, generation: &Generation) -> Result<()> {
        if generation.machine_id.is_empty() {
            return Ok(());
        }
        let actual = self.host.machine_id().context("read host machine id")?;
        if actual != generation.machine_id {
            warn!(expected = %generation.machine_id, actual = %actual, "machine id mismatch");
            return Err(Error::MachineIdMismatch {
                expected: generation.machine_id.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    fn set_generation(&mut self, generation: &Generation) {
        self.generation = Some(generation.clone());
        self.publish();
    }

    fn set_deployment(&mut self, deployment: &Deployment) -> Result<()> {
        self.deployment = Some(deployment.clone());
        self.persist()?;
        self.publish();
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        write_state(
            &self.state_path,
            &PersistedState {
                repository_status: self.repository.status().clone(),
                deployment: self.deployment.clone(),
            },
        )
        .context("persist agent state")
    }
}

/// Flake reference of `commit` in the local working copy.
pub fn flake_url(repository: &Path, subdir: &str, commit: &str) -> String {
    format!(
        "git+file://{}?dir={subdir}&rev={commit}",
        repository.display()
    )
}
