//! Repository tracking types shared by the selector, the tracker and the
//! status snapshot.
//!
//! Field names serialize in `PascalCase` because they form the public JSON
//! shape of the status endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Last known state of one tracked branch of a remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BranchStatus {
    /// Tracked branch name on the remote.
    pub name: String,
    /// Last resolved commit id.
    pub commit_id: String,
    /// Message of the last resolved commit.
    pub commit_msg: String,
    /// Main baseline commit id at the time this branch was resolved.
    pub on_top_of: String,
    /// Resolution error; empty when healthy.
    pub error_msg: String,
}

impl BranchStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Fetch health and branch heads of a configured remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteStatus {
    pub name: String,
    pub url: String,
    /// When the last fetch attempt finished (successful or not).
    pub fetched_at: Option<DateTime<Utc>>,
    /// Error of the last fetch attempt; empty when it succeeded.
    pub fetch_error_msg: String,
    /// True once any fetch of this remote has succeeded.
    pub fetched: bool,
    pub main: BranchStatus,
    /// Serialized as a branch with an empty name when not configured.
    #[serde(with = "unconfigured_branch")]
    pub testing: Option<BranchStatus>,
}

mod unconfigured_branch {
    use super::{BranchStatus, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        branch: &Option<BranchStatus>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match branch {
            Some(branch) => branch.serialize(serializer),
            None => BranchStatus::default().serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BranchStatus>, D::Error> {
        let branch = Option::<BranchStatus>::deserialize(deserializer)?;
        Ok(branch.filter(|branch| !branch.name.is_empty()))
    }
}

impl RemoteStatus {
    pub fn is_healthy(&self) -> bool {
        self.fetch_error_msg.is_empty()
    }
}

/// Ordered remote statuses plus the global commit selection.
///
/// At most one remote/branch pair is selected; `selected_commit_id` always
/// equals a commit id some branch resolved to in this or an earlier update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RepositoryStatus {
    pub remotes: Vec<RemoteStatus>,
    pub selected_commit_id: String,
    pub selected_branch_name: String,
    pub selected_remote_name: String,
    pub selected_branch_is_testing: bool,
    pub main_commit_id: String,
    pub main_branch_name: String,
    pub main_remote_name: String,
}

impl RepositoryStatus {
    pub fn remote(&self, name: &str) -> Option<&RemoteStatus> {
        self.remotes.iter().find(|remote| remote.name == name)
    }

    /// Commit message recorded for the current selection, if the selected
    /// branch still carries it.
    pub fn selected_commit_msg(&self) -> String {
        let Some(remote) = self.remote(&self.selected_remote_name) else {
            return String::new();
        };
        let branch = if self.selected_branch_is_testing {
            remote.testing.as_ref()
        } else {
            Some(&remote.main)
        };
        branch
            .filter(|branch| branch.commit_id == self.selected_commit_id)
            .map(|branch| branch.commit_msg.clone())
            .unwrap_or_default()
    }

    /// Carry persisted branch data over to a status freshly built from the
    /// configuration.
    ///
    /// Branch heads survive only where the remote name and branch name still
    /// match. The selection and the main baseline survive only when the
    /// branch they point at is still tracked.
    pub fn merge_persisted(mut self, persisted: &RepositoryStatus) -> Self {
        for remote in &mut self.remotes {
            let Some(old) = persisted.remote(&remote.name) else {
                continue;
            };
            remote.fetched = old.fetched;
            remote.fetched_at = old.fetched_at;
            keep_branch(&mut remote.main, &old.main);
            if let (Some(testing), Some(old_testing)) = (remote.testing.as_mut(), &old.testing) {
                keep_branch(testing, old_testing);
            }
        }

        if self.tracks(
            &persisted.selected_remote_name,
            &persisted.selected_branch_name,
            persisted.selected_branch_is_testing,
        ) {
            self.selected_commit_id = persisted.selected_commit_id.clone();
            self.selected_remote_name = persisted.selected_remote_name.clone();
            self.selected_branch_name = persisted.selected_branch_name.clone();
            self.selected_branch_is_testing = persisted.selected_branch_is_testing;
        }
        if self.tracks(&persisted.main_remote_name, &persisted.main_branch_name, false) {
            self.main_commit_id = persisted.main_commit_id.clone();
            self.main_remote_name = persisted.main_remote_name.clone();
            self.main_branch_name = persisted.main_branch_name.clone();
        }
        self
    }

    fn tracks(&self, remote: &str, branch: &str, testing: bool) -> bool {
        let Some(remote) = self.remote(remote) else {
            return false;
        };
        if testing {
            remote.testing.as_ref().is_some_and(|t| t.name == branch)
        } else {
            remote.main.name == branch
        }
    }
}

fn keep_branch(branch: &mut BranchStatus, old: &BranchStatus) {
    if branch.name == old.name {
        branch.commit_id = old.commit_id.clone();
        branch.commit_msg = old.commit_msg.clone();
        branch.on_top_of = old.on_top_of.clone();
    }
}

/// Head of a branch as seen in the local object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub commit_id: String,
    pub commit_msg: String,
}
