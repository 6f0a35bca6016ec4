//! Git adapter for the repository tracker.
//!
//! The tracker only needs a handful of plumbing operations, so we keep a
//! small, explicit wrapper around `git` subprocess calls. Fetches run with a
//! deadline because they touch the network.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::types::Head;
use crate::io::process::{CommandLimits, run_command};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Open the repository at `workdir`, initializing it when missing.
    #[instrument(skip_all, fields(workdir = %workdir.as_ref().display()))]
    pub fn open_or_init(workdir: impl AsRef<Path>) -> Result<Self> {
        let workdir = workdir.as_ref();
        std::fs::create_dir_all(workdir)
            .with_context(|| format!("create repository dir {}", workdir.display()))?;
        let git = Self::new(workdir);
        if !workdir.join(".git").exists() {
            info!("initializing repository");
            git.run_checked(&["init", "--quiet"])?;
        }
        Ok(git)
    }

    /// Names of the remotes currently configured in the repository.
    pub fn remotes(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["remote"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Add `name` pointing at `url`, or update its URL if it already exists.
    #[instrument(skip_all, fields(remote = name))]
    pub fn ensure_remote(&self, name: &str, url: &str) -> Result<()> {
        if self.remotes()?.iter().any(|existing| existing == name) {
            let current = self.run_capture(&["remote", "get-url", name])?;
            if current.trim() != url {
                info!(url, "updating remote url");
                self.run_checked(&["remote", "set-url", name, url])?;
            }
        } else {
            info!(url, "adding remote");
            self.run_checked(&["remote", "add", name, url])?;
        }
        Ok(())
    }

    /// Fetch all branches of `remote` into `refs/remotes/<remote>/`.
    #[instrument(skip_all, fields(remote = %remote))]
    pub fn fetch(&self, remote: &str, limits: &CommandLimits) -> Result<()> {
        debug!("fetching remote");
        let mut cmd = self.command();
        cmd.args(["fetch", "--prune", "--quiet", remote]);
        run_command(cmd, limits)
            .with_context(|| format!("git fetch {remote}"))?
            .ensure_success(&format!("git fetch {remote}"), limits)?;
        Ok(())
    }

    /// Head of `remote/branch` as last fetched.
    pub fn remote_head(&self, remote: &str, branch: &str) -> Result<Head> {
        let reference = format!("refs/remotes/{remote}/{branch}^{{commit}}");
        let commit_id = self
            .run_capture(&["rev-parse", "--verify", "--quiet", &reference])
            .map_err(|_| anyhow!("branch {remote}/{branch} not found"))?
            .trim()
            .to_string();
        let commit_msg = self.commit_message(&commit_id)?;
        Ok(Head {
            commit_id,
            commit_msg,
        })
    }

    /// Full message of `commit_id`.
    pub fn commit_message(&self, commit_id: &str) -> Result<String> {
        let out = self.run_capture(&["log", "-1", "--format=%B", commit_id])?;
        Ok(out.trim_end().to_string())
    }

    /// True if `commit_id` names a commit present in the local object store.
    pub fn has_commit(&self, commit_id: &str) -> Result<bool> {
        if commit_id.is_empty() {
            return Ok(false);
        }
        let object = format!("{commit_id}^{{commit}}");
        Ok(self.run(&["cat-file", "-e", &object])?.status.success())
    }

    /// Force the work tree and index to `commit_id`, discarding local changes.
    #[instrument(skip_all, fields(commit_id = %commit_id))]
    pub fn hard_reset(&self, commit_id: &str) -> Result<()> {
        debug!("hard resetting work tree");
        self.run_checked(&["reset", "--hard", "--quiet", commit_id])?;
        Ok(())
    }

    /// Commit currently checked out, if any.
    pub fn head_commit(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        cmd
    }
}
