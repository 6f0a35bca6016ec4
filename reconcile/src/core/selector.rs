//! Deterministic commit selection over the tracked remotes.
//!
//! Remote order is trust priority. The main pass settles the conservative
//! baseline first; only then may a testing branch override the selection.
//! A testing commit is not checked for ancestry over the baseline: the
//! baseline is recorded in `on_top_of` and nothing more.

use anyhow::Result;
use tracing::debug;

use crate::core::types::{BranchStatus, Head, RepositoryStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pick {
    remote: String,
    branch: String,
    commit_id: String,
}

/// Recompute the selected commit of `status`.
///
/// `resolve(remote, branch)` returns the branch head from the local object
/// store. Resolution errors are recorded on the branch and the branch is
/// skipped for this round. Returns true when the selection changed.
pub fn select_commit<F>(status: &mut RepositoryStatus, mut resolve: F) -> bool
where
    F: FnMut(&str, &str) -> Result<Head>,
{
    let before = (
        status.selected_commit_id.clone(),
        status.selected_remote_name.clone(),
        status.selected_branch_name.clone(),
        status.selected_branch_is_testing,
    );

    main_pass(status, &mut resolve);
    testing_pass(status, &mut resolve);

    before
        != (
            status.selected_commit_id.clone(),
            status.selected_remote_name.clone(),
            status.selected_branch_name.clone(),
            status.selected_branch_is_testing,
        )
}

fn main_pass<F>(status: &mut RepositoryStatus, resolve: &mut F)
where
    F: FnMut(&str, &str) -> Result<Head>,
{
    let baseline = status.main_commit_id.clone();
    let nothing_selected = status.selected_commit_id.is_empty();
    let mut default_pick: Option<Pick> = None;
    let mut new_main: Option<Pick> = None;

    for remote in &mut status.remotes {
        if !remote.is_healthy() {
            debug!(
                remote = %remote.name,
                error = %remote.fetch_error_msg,
                "remote skipped because of the fetch error"
            );
            continue;
        }
        let Some(head) = resolve_branch(resolve, &remote.name, &mut remote.main, &baseline)
        else {
            continue;
        };
        let pick = Pick {
            remote: remote.name.clone(),
            branch: remote.main.name.clone(),
            commit_id: head.commit_id,
        };
        if nothing_selected && default_pick.is_none() {
            default_pick = Some(pick.clone());
        }
        if pick.commit_id != baseline {
            new_main = Some(pick);
            break;
        }
    }

    if let Some(pick) = default_pick {
        apply(status, &pick, false);
    }
    if let Some(pick) = new_main {
        debug!(
            remote = %pick.remote,
            branch = %pick.branch,
            commit = %pick.commit_id,
            "main branch moved, new baseline"
        );
        apply(status, &pick, false);
        status.main_commit_id = pick.commit_id;
        status.main_branch_name = pick.branch;
        status.main_remote_name = pick.remote;
    }
}

fn testing_pass<F>(status: &mut RepositoryStatus, resolve: &mut F)
where
    F: FnMut(&str, &str) -> Result<Head>,
{
    let baseline = status.main_commit_id.clone();
    let selected = status.selected_commit_id.clone();
    let mut override_pick: Option<Pick> = None;

    for remote in &mut status.remotes {
        if !remote.is_healthy() {
            debug!(
                remote = %remote.name,
                error = %remote.fetch_error_msg,
                "remote skipped because of the fetch error"
            );
            continue;
        }
        let Some(testing) = remote.testing.as_mut() else {
            continue;
        };
        let Some(head) = resolve_branch(resolve, &remote.name, testing, &baseline) else {
            continue;
        };
        if head.commit_id != selected && head.commit_id != baseline {
            override_pick = Some(Pick {
                remote: remote.name.clone(),
                branch: testing.name.clone(),
                commit_id: head.commit_id,
            });
            break;
        }
    }

    if let Some(pick) = override_pick {
        debug!(
            remote = %pick.remote,
            branch = %pick.branch,
            commit = %pick.commit_id,
            "testing branch overrides the selection"
        );
        apply(status, &pick, true);
    }
}

/// Resolve a branch head and record the outcome on the branch.
fn resolve_branch<F>(
    resolve: &mut F,
    remote: &str,
    branch: &mut BranchStatus,
    baseline: &str,
) -> Option<Head>
where
    F: FnMut(&str, &str) -> Result<Head>,
{
    match resolve(remote, &branch.name) {
        Ok(head) => {
            branch.error_msg.clear();
            branch.commit_id = head.commit_id.clone();
            branch.commit_msg = head.commit_msg.clone();
            branch.on_top_of = baseline.to_string();
            Some(head)
        }
        Err(err) => {
            debug!(remote, branch = %branch.name, error = %format!("{err:#}"), "failed to resolve branch head");
            branch.error_msg = format!("{err:#}");
            None
        }
    }
}

fn apply(status: &mut RepositoryStatus, pick: &Pick, testing: bool) {
    status.selected_commit_id = pick.commit_id.clone();
    status.selected_branch_name = pick.branch.clone();
    status.selected_remote_name = pick.remote.clone();
    status.selected_branch_is_testing = testing;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::anyhow;

    use super::*;
    use crate::core::types::RemoteStatus;

    fn remote(name: &str, testing: Option<&str>) -> RemoteStatus {
        RemoteStatus {
            name: name.to_string(),
            url: format!("https://example.com/{name}.git"),
            main: BranchStatus::new("main"),
            testing: testing.map(BranchStatus::new),
            ..RemoteStatus::default()
        }
    }

    fn status(remotes: Vec<RemoteStatus>) -> RepositoryStatus {
        RepositoryStatus {
            remotes,
            ..RepositoryStatus::default()
        }
    }

    /// Resolver backed by a `remote/branch -> commit` table.
    fn heads(table: &[(&str, &str)]) -> impl FnMut(&str, &str) -> Result<Head> + use<> {
        let table: HashMap<String, String> = table
            .iter()
            .map(|(key, commit)| (key.to_string(), commit.to_string()))
            .collect();
        move |remote, branch| {
            table
                .get(&format!("{remote}/{branch}"))
                .map(|commit| Head {
                    commit_id: commit.clone(),
                    commit_msg: format!("message of {commit}"),
                })
                .ok_or_else(|| anyhow!("branch {remote}/{branch} not found"))
        }
    }

    fn selection(status: &RepositoryStatus) -> (&str, &str, &str, bool) {
        (
            status.selected_remote_name.as_str(),
            status.selected_branch_name.as_str(),
            status.selected_commit_id.as_str(),
            status.selected_branch_is_testing,
        )
    }

    #[test]
    fn first_resolvable_main_becomes_selection_and_baseline() {
        let mut st = status(vec![remote("origin", None), remote("mirror", None)]);
        let changed = select_commit(&mut st, heads(&[("origin/main", "a"), ("mirror/main", "a")]));

        assert!(changed);
        assert_eq!(selection(&st), ("origin", "main", "a", false));
        assert_eq!(st.main_commit_id, "a");
        assert_eq!(st.main_remote_name, "origin");
        assert_eq!(st.remotes[0].main.commit_msg, "message of a");
    }

    #[test]
    fn higher_priority_main_change_wins() {
        let mut st = status(vec![remote("r1", None), remote("r2", None)]);
        select_commit(&mut st, heads(&[("r1/main", "a"), ("r2/main", "a")]));

        let changed = select_commit(&mut st, heads(&[("r1/main", "b"), ("r2/main", "a")]));
        assert!(changed);
        assert_eq!(selection(&st), ("r1", "main", "b", false));
        assert_eq!(st.main_commit_id, "b");
    }

    #[test]
    fn first_differing_remote_stops_the_main_pass() {
        let mut st = status(vec![remote("r1", None), remote("r2", None)]);
        select_commit(&mut st, heads(&[("r1/main", "a"), ("r2/main", "a")]));

        select_commit(&mut st, heads(&[("r1/main", "a"), ("r2/main", "c")]));
        assert_eq!(selection(&st), ("r2", "main", "c", false));
        // r1 was resolved before r2 won; nothing after r2 is consulted.
        assert_eq!(st.remotes[0].main.on_top_of, "a");
    }

    #[test]
    fn unchanged_heads_keep_the_selection() {
        let mut st = status(vec![remote("origin", None)]);
        select_commit(&mut st, heads(&[("origin/main", "a")]));
        let changed = select_commit(&mut st, heads(&[("origin/main", "a")]));
        assert!(!changed);
        assert_eq!(selection(&st), ("origin", "main", "a", false));
    }

    #[test]
    fn testing_branch_ahead_of_baseline_overrides() {
        let mut st = status(vec![remote("origin", None), remote("fork", Some("exp"))]);
        select_commit(&mut st, heads(&[("origin/main", "a"), ("fork/main", "a")]));

        let changed = select_commit(
            &mut st,
            heads(&[("origin/main", "a"), ("fork/main", "a"), ("fork/exp", "d")]),
        );
        assert!(changed);
        assert_eq!(selection(&st), ("fork", "exp", "d", true));
        assert_eq!(st.main_commit_id, "a", "baseline is not moved by testing");
        let testing = st.remotes[1].testing.as_ref().expect("testing branch");
        assert_eq!(testing.on_top_of, "a");
    }

    #[test]
    fn testing_branch_equal_to_baseline_is_ignored() {
        let mut st = status(vec![remote("origin", Some("exp"))]);
        select_commit(&mut st, heads(&[("origin/main", "c"), ("origin/exp", "c")]));
        assert_eq!(selection(&st), ("origin", "main", "c", false));
    }

    #[test]
    fn testing_branch_equal_to_selection_is_ignored() {
        let mut st = status(vec![remote("origin", Some("exp"))]);
        select_commit(&mut st, heads(&[("origin/main", "c"), ("origin/exp", "d")]));
        assert_eq!(selection(&st), ("origin", "exp", "d", true));

        let changed = select_commit(&mut st, heads(&[("origin/main", "c"), ("origin/exp", "d")]));
        assert!(!changed);
        assert_eq!(selection(&st), ("origin", "exp", "d", true));
    }

    #[test]
    fn failed_fetch_skips_only_that_remote() {
        let mut st = status(vec![remote("a", Some("exp")), remote("b", None)]);
        st.remotes[0].fetch_error_msg = "connection refused".to_string();

        select_commit(&mut st, heads(&[("a/main", "x"), ("a/exp", "y"), ("b/main", "z")]));

        assert_eq!(selection(&st), ("b", "main", "z", false));
        assert_eq!(st.remotes[0].main.commit_id, "", "unhealthy remote untouched");
        assert!(st.remotes[0].testing.as_ref().expect("testing").commit_id.is_empty());
    }

    #[test]
    fn resolution_error_is_recorded_on_the_branch() {
        let mut st = status(vec![remote("origin", Some("exp")), remote("backup", None)]);
        select_commit(&mut st, heads(&[("backup/main", "k")]));

        assert!(st.remotes[0].main.error_msg.contains("origin/main not found"));
        assert!(
            st.remotes[0]
                .testing
                .as_ref()
                .expect("testing")
                .error_msg
                .contains("origin/exp not found")
        );
        assert_eq!(selection(&st), ("backup", "main", "k", false));

        select_commit(&mut st, heads(&[("origin/main", "k"), ("origin/exp", "k"), ("backup/main", "k")]));
        assert!(st.remotes[0].main.error_msg.is_empty(), "error cleared on success");
    }

    #[test]
    fn no_resolvable_branch_leaves_selection_empty() {
        let mut st = status(vec![remote("origin", None)]);
        let changed = select_commit(&mut st, heads(&[]));
        assert!(!changed);
        assert!(st.selected_commit_id.is_empty());
    }
}
