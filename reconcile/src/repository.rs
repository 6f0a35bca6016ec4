//! Repository tracker: fetches the configured remotes, selects the commit to
//! deploy and forces the working copy onto it.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::selector::select_commit;
use crate::core::types::RepositoryStatus;
use crate::error::Error;
use crate::io::config::AgentConfig;
use crate::io::git::Git;
use crate::io::process::CommandLimits;

pub struct Repository {
    git: Git,
    status: RepositoryStatus,
    fetch_limits: CommandLimits,
}

impl Repository {
    /// Open (or create) the working copy, configure its remotes and seed the
    /// status from `persisted`.
    #[instrument(skip_all, fields(path = %cfg.repository.path.display()))]
    pub fn open(cfg: &AgentConfig, persisted: &RepositoryStatus) -> Result<Self> {
        let git = Git::open_or_init(&cfg.repository.path)?;
        for remote in &cfg.repository.remotes {
            git.ensure_remote(&remote.name, &remote.url)
                .with_context(|| format!("configure remote {}", remote.name))?;
        }
        let status = cfg.initial_status().merge_persisted(persisted);
        Ok(Self {
            git,
            status,
            fetch_limits: cfg.commands.fetch_limits(),
        })
    }

    pub fn status(&self) -> &RepositoryStatus {
        &self.status
    }

    pub fn path(&self) -> &Path {
        self.git.workdir()
    }

    /// Fetch every remote, or only `filter` when given.
    ///
    /// A failing remote records its error and does not stop the others.
    pub fn fetch(&mut self, filter: Option<&str>) -> Result<()> {
        if let Some(name) = filter {
            if self.status.remote(name).is_none() {
                return Err(Error::UnknownRemote {
                    remote: name.to_string(),
                }
                .into());
            }
        }

        for remote in &mut self.status.remotes {
            if filter.is_some_and(|name| name != remote.name) {
                continue;
            }
            match self.git.fetch(&remote.name, &self.fetch_limits) {
                Ok(()) => {
                    remote.fetch_error_msg.clear();
                    remote.fetched = true;
                }
                Err(err) => {
                    warn!(remote = %remote.name, err = %format!("{err:#}"), "fetch failed");
                    remote.fetch_error_msg = format!("{err:#}");
                }
            }
            remote.fetched_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Recompute the selected commit and hard reset the working copy to it.
    ///
    /// When the reset fails the previous selection is restored.
    #[instrument(skip_all)]
    pub fn update(&mut self) -> Result<()> {
        let previous = self.status.clone();
        let git = &self.git;
        let changed = select_commit(&mut self.status, |remote, branch| {
            git.remote_head(remote, branch)
        });
        if changed {
            info!(
                remote = %self.status.selected_remote_name,
                branch = %self.status.selected_branch_name,
                commit = %self.status.selected_commit_id,
                testing = self.status.selected_branch_is_testing,
                "selected commit changed"
            );
        }

        if let Err(err) = self.checkout_selected() {
            restore_selection(&mut self.status, &previous);
            return Err(err);
        }
        Ok(())
    }

    fn checkout_selected(&self) -> Result<()> {
        let commit = self.status.selected_commit_id.clone();
        let failed = |reason: String| Error::CheckoutFailed {
            commit: commit.clone(),
            reason,
        };
        if commit.is_empty() {
            return Err(failed("no commit selected".to_string()).into());
        }
        if !self.git.has_commit(&commit)? {
            return Err(failed("commit not found in the local repository".to_string()).into());
        }
        self.git
            .hard_reset(&commit)
            .map_err(|err| failed(format!("{err:#}")))?;
        Ok(())
    }
}

fn restore_selection(status: &mut RepositoryStatus, previous: &RepositoryStatus) {
    status.selected_commit_id = previous.selected_commit_id.clone();
    status.selected_branch_name = previous.selected_branch_name.clone();
    status.selected_remote_name = previous.selected_remote_name.clone();
    status.selected_branch_is_testing = previous.selected_branch_is_testing;
    status.main_commit_id = previous.main_commit_id.clone();
    status.main_branch_name = previous.main_branch_name.clone();
    status.main_remote_name = previous.main_remote_name.clone();
}
