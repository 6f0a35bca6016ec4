//! Test-only fixtures: throwaway upstream repositories, agent configs and
//! scripted executor backends.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::deployment::{Activation, Operation};
use crate::core::generation::Evaluation;
use crate::executor::Executor;
use crate::executor::activation::Activator;
use crate::executor::remote_ci::revision;
use crate::io::config::{AgentConfig, BranchConfig, RemoteConfig};

/// A local git repository standing in for a remote.
///
/// Commits are written with plumbing commands so no work tree, user
/// configuration or default branch name is involved.
pub struct Upstream {
    dir: TempDir,
}

impl Upstream {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("upstream tempdir")?;
        let upstream = Self { dir };
        upstream.git(&["init", "--quiet", "--bare"])?;
        Ok(upstream)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path().display())
    }

    /// Add a commit on top of `branch` (creating it) and return its id.
    pub fn commit(&self, branch: &str, message: &str) -> Result<String> {
        let parent = self.branch_head(branch)?;
        let tree = self.git(&["mktree"])?;
        let mut args = vec!["commit-tree", tree.as_str(), "-m", message];
        if let Some(parent) = parent.as_deref() {
            args.extend(["-p", parent]);
        }
        let commit = self.git(&args)?;
        self.set_branch(branch, &commit)?;
        Ok(commit)
    }

    /// Point `branch` at an existing commit.
    pub fn set_branch(&self, branch: &str, commit: &str) -> Result<()> {
        self.git(&["update-ref", &format!("refs/heads/{branch}"), commit])?;
        Ok(())
    }

    /// Copy `branch` of `other` into this repository, objects included.
    pub fn fetch_from(&self, other: &Upstream, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        self.git(&["fetch", "--quiet", &other.url(), &refspec])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git(&["update-ref", "-d", &format!("refs/heads/{branch}")])?;
        Ok(())
    }

    pub fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        let out = self
            .command()
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .output()
            .context("spawn git rev-parse")?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Make the upstream unreachable.
    pub fn remove(&self) -> Result<()> {
        fs::remove_dir_all(self.path()).context("remove upstream")
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let out = self
            .command()
            .args(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(self.path())
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com");
        cmd
    }
}

/// Agent configuration rooted in `root`, tracking the given upstreams in
/// order. Each entry is `(remote name, upstream, testing branch)`.
pub fn agent_config(root: &Path, remotes: &[(&str, &Upstream, Option<&str>)]) -> AgentConfig {
    let mut cfg = AgentConfig {
        hostname: "web-1".to_string(),
        state_dir: root.join("state"),
        ..AgentConfig::default()
    };
    cfg.repository.path = root.join("checkout");
    cfg.repository.remotes = remotes
        .iter()
        .map(|(name, upstream, testing)| RemoteConfig {
            name: (*name).to_string(),
            url: upstream.url(),
            main: BranchConfig::default(),
            testing: testing.map(BranchConfig::new),
        })
        .collect();
    cfg
}

/// Root directory with an `/etc/machine-id` for [`crate::io::host::Host`].
pub fn host_root(machine_id: &str) -> Result<TempDir> {
    let dir = tempfile::tempdir().context("host tempdir")?;
    fs::create_dir_all(dir.path().join("etc")).context("create etc")?;
    fs::write(dir.path().join("etc/machine-id"), format!("{machine_id}\n"))
        .context("write machine-id")?;
    Ok(dir)
}

/// Activator that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingActivator {
    /// Hashes returned by successive `unit_file_hash` calls.
    pub hashes: VecDeque<Option<String>>,
    pub profiles: Vec<String>,
    pub switched: Vec<(String, Operation)>,
}

impl Activator for RecordingActivator {
    fn unit_file_hash(&mut self) -> Option<String> {
        self.hashes.pop_front().flatten()
    }

    fn set_system_profile(&mut self, out_path: &str) -> Result<String> {
        self.profiles.push(out_path.to_string());
        Ok(format!("/nix/var/nix/profiles/system-{}-link", self.profiles.len()))
    }

    fn switch_to_configuration(&mut self, out_path: &str, operation: Operation) -> Result<()> {
        self.switched.push((out_path.to_string(), operation));
        Ok(())
    }
}

/// Executor whose results are derived from the flake `rev`, with failures
/// injected per commit.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    pub fail_eval: HashSet<String>,
    pub fail_build: HashSet<String>,
    pub fail_deploy: HashSet<String>,
    pub machine_id: Option<String>,
    pub needs_restart: bool,
    /// Every call, in order, as `eval <rev>`, `build <drv>` or `deploy <out> <op>`.
    pub calls: Vec<String>,
}

impl ScriptedExecutor {
    pub fn drv_path(rev: &str) -> String {
        format!("/nix/store/{rev}-system.drv")
    }

    pub fn out_path(rev: &str) -> String {
        format!("/nix/store/{rev}-system")
    }

    pub fn deployed(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|call| call.starts_with("deploy "))
            .cloned()
            .collect()
    }
}

fn rev_of_store_path(path: &str) -> String {
    path.trim_start_matches("/nix/store/")
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string()
}

impl Executor for ScriptedExecutor {
    fn eval(&mut self, flake_url: &str, _hostname: &str) -> Result<Evaluation> {
        let rev = revision(flake_url).ok_or_else(|| anyhow!("no rev in {flake_url}"))?;
        self.calls.push(format!("eval {rev}"));
        if self.fail_eval.contains(&rev) {
            return Err(anyhow!("evaluation of {rev} failed"));
        }
        Ok(Evaluation {
            drv_path: Self::drv_path(&rev),
            out_path: Self::out_path(&rev),
            machine_id: self.machine_id.clone(),
        })
    }

    fn build(&mut self, drv_path: &str) -> Result<()> {
        self.calls.push(format!("build {drv_path}"));
        if self.fail_build.contains(&rev_of_store_path(drv_path)) {
            return Err(anyhow!("build of {drv_path} failed"));
        }
        Ok(())
    }

    fn deploy(&mut self, out_path: &str, operation: Operation) -> Result<Activation> {
        self.calls.push(format!("deploy {out_path} {operation}"));
        if self.fail_deploy.contains(&rev_of_store_path(out_path)) {
            return Err(anyhow!("activation of {out_path} failed"));
        }
        Ok(Activation {
            needs_restart: self.needs_restart,
            profile_path: if operation.updates_profile() {
                "/nix/var/nix/profiles/system-1-link".to_string()
            } else {
                String::new()
            },
        })
    }
}
