//! Persisted agent state (`<state_dir>/state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::deployment::Deployment;
use crate::core::types::RepositoryStatus;

/// What survives an agent restart: tracked branch heads and the last
/// deployment attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct PersistedState {
    pub repository_status: RepositoryStatus,
    pub deployment: Option<Deployment>,
}

/// Load state from disk. A missing file yields the default state.
pub fn load_state(path: &Path) -> Result<PersistedState> {
    if !path.exists() {
        debug!(path = %path.display(), "no persisted state");
        return Ok(PersistedState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let state: PersistedState = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    debug!(
        path = %path.display(),
        selected = %state.repository_status.selected_commit_id,
        "state loaded"
    );
    Ok(state)
}

/// Atomically write state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &PersistedState) -> Result<()> {
    debug!(path = %path.display(), "writing state");
    let mut buf = serde_json::to_string_pretty(state).context("serialize state")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}
