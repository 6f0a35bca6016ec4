//! Read-only snapshot of the agent, as served on `GET /api/status`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::deployment::Deployment;
use crate::core::generation::Generation;
use crate::core::types::RepositoryStatus;

pub const STATUS_PATH: &str = "/api/status";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct State {
    pub builder: BuilderState,
    pub fetcher: FetcherState,
    pub generation: Option<Generation>,
    pub deployment: Option<Deployment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BuilderState {
    pub hostname: String,
    pub need_to_reboot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FetcherState {
    pub repository_status: RepositoryStatus,
}

/// Fetch the snapshot from a running agent at `base_url`.
pub fn fetch_state(base_url: &str, timeout: Duration) -> Result<State> {
    let url = format!("{}{STATUS_PATH}", base_url.trim_end_matches('/'));
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    agent
        .get(&url)
        .call()
        .with_context(|| format!("GET {url}"))?
        .into_json()
        .context("decode status")
}
