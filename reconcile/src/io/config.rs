//! Agent configuration, read from a TOML file (`/etc/reconcile/config.toml`
//! unless overridden on the command line).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::types::{BranchStatus, RemoteStatus, RepositoryStatus};
use crate::io::host;
use crate::io::process::CommandLimits;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/reconcile/config.toml";

/// Agent configuration (TOML).
///
/// Every section has defaults; only `repository.remotes` must be filled in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Configuration attribute to deploy. Empty means the system hostname.
    pub hostname: String,
    /// Directory holding `state.json`.
    pub state_dir: PathBuf,
    /// Build and evaluate as usual but never call the activation script.
    pub dry_run: bool,
    pub repository: RepositoryConfig,
    pub poller: PollerConfig,
    pub executor: ExecutorConfig,
    pub commands: CommandsConfig,
    pub activation: ActivationConfig,
    pub http: HttpConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            state_dir: PathBuf::from("/var/lib/reconcile"),
            dry_run: false,
            repository: RepositoryConfig::default(),
            poller: PollerConfig::default(),
            executor: ExecutorConfig::default(),
            commands: CommandsConfig::default(),
            activation: ActivationConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Local working copy the remotes are fetched into.
    pub path: PathBuf,
    /// Directory of the flake inside the repository.
    pub subdir: String,
    /// Remotes in trust order; the first one is the most trusted.
    pub remotes: Vec<RemoteConfig>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/reconcile/repository"),
            subdir: ".".to_string(),
            remotes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub main: BranchConfig,
    /// Exploratory branch that may override the main selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testing: Option<BranchConfig>,
}

/// A tracked branch of a remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchConfig {
    pub name: String,
}

impl BranchConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self::new("main")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollerConfig {
    pub period_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { period_secs: 60 }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    #[serde(alias = "nix", alias = "")]
    Local,
    Garnix,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub kind: ExecutorKind,
    pub garnix: GarnixConfig,
}

/// Remote CI service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GarnixConfig {
    pub base_url: String,
    pub cache_url: String,
    /// Capacity of the derivation to output path cache.
    pub cache_size: usize,
    pub retry_interval_secs: u64,
    /// Give up polling for a build after this long. Unset polls forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_timeout_secs: Option<u64>,
}

impl Default for GarnixConfig {
    fn default() -> Self {
        Self {
            base_url: "https://garnix.io/".to_string(),
            cache_url: "https://cache.garnix.io/".to_string(),
            cache_size: 2,
            retry_interval_secs: 60,
            poll_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
    /// Deadline for `nix` and activation commands.
    pub timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            fetch_timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl CommandsConfig {
    pub fn limits(&self) -> CommandLimits {
        CommandLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    pub fn fetch_limits(&self) -> CommandLimits {
        CommandLimits {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActivationConfig {
    /// Service unit of the agent itself, watched for changes on activation.
    pub unit_name: String,
    pub profile_path: PathBuf,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            unit_name: "reconcile.service".to_string(),
            profile_path: PathBuf::from("/nix/var/nix/profiles/system"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 4242,
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.bind_addr())
    }
}

impl AgentConfig {
    /// Parse a configuration document without touching the host.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("parse config toml")
    }

    /// Fill an empty hostname with `fallback`.
    pub fn with_hostname_fallback(mut self, fallback: impl FnOnce() -> Result<String>) -> Result<Self> {
        if self.hostname.trim().is_empty() {
            self.hostname = fallback().context("determine hostname")?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(anyhow!("hostname must not be empty"));
        }
        if self.repository.remotes.is_empty() {
            return Err(anyhow!("repository.remotes must list at least one remote"));
        }
        let mut seen = HashSet::new();
        for remote in &self.repository.remotes {
            if remote.name.trim().is_empty() {
                return Err(anyhow!("repository.remotes: name must not be empty"));
            }
            if !seen.insert(remote.name.as_str()) {
                return Err(anyhow!(
                    "repository.remotes: duplicate remote '{}'",
                    remote.name
                ));
            }
            if remote.url.trim().is_empty() {
                return Err(anyhow!("remote '{}': url must not be empty", remote.name));
            }
            if remote.main.name.trim().is_empty() {
                return Err(anyhow!(
                    "remote '{}': main.name must not be empty",
                    remote.name
                ));
            }
            if remote
                .testing
                .as_ref()
                .is_some_and(|branch| branch.name.trim().is_empty())
            {
                return Err(anyhow!(
                    "remote '{}': testing.name must not be empty when set",
                    remote.name
                ));
            }
        }
        if self.poller.period_secs == 0 {
            return Err(anyhow!("poller.period_secs must be > 0"));
        }
        if self.commands.timeout_secs == 0 || self.commands.fetch_timeout_secs == 0 {
            return Err(anyhow!("commands timeouts must be > 0"));
        }
        if self.commands.output_limit_bytes == 0 {
            return Err(anyhow!("commands.output_limit_bytes must be > 0"));
        }
        if self.executor.kind == ExecutorKind::Garnix {
            let garnix = &self.executor.garnix;
            Url::parse(&garnix.base_url).context("executor.garnix.base_url")?;
            Url::parse(&garnix.cache_url).context("executor.garnix.cache_url")?;
            if garnix.cache_size == 0 {
                return Err(anyhow!("executor.garnix.cache_size must be > 0"));
            }
            if garnix.retry_interval_secs == 0 {
                return Err(anyhow!("executor.garnix.retry_interval_secs must be > 0"));
            }
        }
        Ok(())
    }

    /// Initial repository status: every configured remote, nothing fetched.
    pub fn initial_status(&self) -> RepositoryStatus {
        RepositoryStatus {
            remotes: self
                .repository
                .remotes
                .iter()
                .map(|remote| RemoteStatus {
                    name: remote.name.clone(),
                    url: remote.url.clone(),
                    main: BranchStatus::new(&remote.main.name),
                    testing: remote
                        .testing
                        .as_ref()
                        .map(|branch| BranchStatus::new(&branch.name)),
                    ..RemoteStatus::default()
                })
                .collect(),
            ..RepositoryStatus::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}

/// Load, complete and validate the configuration at `path`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg = AgentConfig::from_toml(&contents)
        .with_context(|| format!("load {}", path.display()))?
        .with_hostname_fallback(host::system_hostname)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
