//! Reconciliation passes driven end to end against local upstreams and a
//! scripted executor.

use std::sync::{Arc, Mutex};

use reconcile::core::deployment::{DeploymentStatus, Operation};
use reconcile::core::generation::GenerationStatus;
use reconcile::error::Error;
use reconcile::io::config::AgentConfig;
use reconcile::io::host::Host;
use reconcile::io::state_store::load_state;
use reconcile::manager::{Manager, Tick};
use reconcile::status::State;
use reconcile::test_support::{ScriptedExecutor, Upstream, agent_config, host_root};
use tempfile::TempDir;

const MACHINE_ID: &str = "0123456789abcdef0123456789abcdef";

struct Fixture {
    origin: Upstream,
    cfg: AgentConfig,
    host: TempDir,
    _root: TempDir,
}

fn fixture(testing: Option<&str>) -> Fixture {
    let origin = Upstream::new().expect("origin");
    let root = tempfile::tempdir().expect("tempdir");
    let cfg = agent_config(root.path(), &[("origin", &origin, testing)]);
    Fixture {
        origin,
        cfg,
        host: host_root(MACHINE_ID).expect("host root"),
        _root: root,
    }
}

impl Fixture {
    fn manager(&self, executor: ScriptedExecutor) -> Manager<ScriptedExecutor> {
        Manager::new(&self.cfg, executor, Host::new(self.host.path())).expect("manager")
    }
}

fn deploy_call(rev: &str, operation: Operation) -> String {
    format!("deploy {} {operation}", ScriptedExecutor::out_path(rev))
}

/// A new commit on main is evaluated, built and switched to.
#[test]
fn new_commit_is_deployed_with_switch() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    let mut manager = fx.manager(ScriptedExecutor::default());

    let outcome = manager.tick(&Tick::Periodic).expect("tick");
    assert!(outcome.new_generation);
    assert!(outcome.deployed);
    assert!(!outcome.restart_required);

    assert_eq!(
        manager.executor().calls,
        vec![
            format!("eval {a}"),
            format!("build {}", ScriptedExecutor::drv_path(&a)),
            deploy_call(&a, Operation::Switch),
        ]
    );
    let state = manager.state();
    let generation = state.generation.expect("generation");
    assert_eq!(generation.status, GenerationStatus::BuildSucceeded);
    assert_eq!(generation.selected_commit_id, a);
    assert_eq!(generation.selected_commit_msg, "A");
    assert_eq!(generation.hostname, "web-1");
    assert!(generation.flake_url.ends_with(&format!("rev={a}")));
    let deployment = state.deployment.expect("deployment");
    assert_eq!(deployment.status, DeploymentStatus::Done);
    assert_eq!(deployment.operation, Operation::Switch);
    assert!(!deployment.profile_path.is_empty());
}

/// Ticks without upstream movement do no work.
#[test]
fn unchanged_commit_is_not_redeployed() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    let mut manager = fx.manager(ScriptedExecutor::default());

    manager.tick(&Tick::Periodic).expect("first tick");
    let outcome = manager.tick(&Tick::Periodic).expect("second tick");
    assert!(!outcome.new_generation);
    assert!(!outcome.deployed);
    assert_eq!(manager.executor().deployed(), vec![deploy_call(&a, Operation::Switch)]);

    let b = fx.origin.commit("main", "B").expect("B");
    let outcome = manager.tick(&Tick::Periodic).expect("third tick");
    assert!(outcome.deployed);
    assert_eq!(
        manager.executor().deployed(),
        vec![
            deploy_call(&a, Operation::Switch),
            deploy_call(&b, Operation::Switch)
        ]
    );
}

/// An evaluation failure leaves the previous deployment in place and is not
/// retried until a new commit shows up.
#[test]
fn eval_failure_skips_deploy_until_next_commit() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    let mut executor = ScriptedExecutor::default();
    executor.fail_eval.insert(a.clone());
    let mut manager = fx.manager(executor);

    let outcome = manager.tick(&Tick::Periodic).expect("tick");
    assert!(outcome.new_generation);
    assert!(!outcome.deployed);
    let state = manager.state();
    let generation = state.generation.expect("generation");
    assert_eq!(generation.status, GenerationStatus::EvaluationFailed);
    assert!(generation.eval_error.contains("evaluation of"));
    assert!(state.deployment.is_none());

    manager.tick(&Tick::Periodic).expect("retry tick");
    assert_eq!(manager.executor().calls, vec![format!("eval {a}")]);

    let b = fx.origin.commit("main", "B").expect("B");
    let outcome = manager.tick(&Tick::Periodic).expect("recovery tick");
    assert!(outcome.deployed);
    assert_eq!(manager.executor().deployed(), vec![deploy_call(&b, Operation::Switch)]);
}

#[test]
fn build_failure_is_recorded_on_generation() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    let mut executor = ScriptedExecutor::default();
    executor.fail_build.insert(a.clone());
    let mut manager = fx.manager(executor);

    let outcome = manager.tick(&Tick::Periodic).expect("tick");
    assert!(!outcome.deployed);
    let generation = manager.state().generation.expect("generation");
    assert_eq!(generation.status, GenerationStatus::BuildFailed);
    assert!(!generation.build_error.is_empty());
    assert!(manager.executor().deployed().is_empty());
}

/// A commit selected from a testing branch is activated without touching the
/// boot profile.
#[test]
fn testing_branch_deploys_with_test_operation() {
    let fx = fixture(Some("exp"));
    let a = fx.origin.commit("main", "A").expect("A");
    let mut manager = fx.manager(ScriptedExecutor::default());
    manager.tick(&Tick::Periodic).expect("first tick");

    fx.origin.set_branch("exp", &a).expect("branch exp");
    let b = fx.origin.commit("exp", "B").expect("B");
    let outcome = manager.tick(&Tick::Periodic).expect("second tick");
    assert!(outcome.deployed);

    assert_eq!(
        manager.executor().deployed(),
        vec![
            deploy_call(&a, Operation::Switch),
            deploy_call(&b, Operation::Test)
        ]
    );
    let deployment = manager.state().deployment.expect("deployment");
    assert_eq!(deployment.operation, Operation::Test);
    assert!(deployment.generation.selected_branch_is_testing);
    assert!(deployment.profile_path.is_empty());
}

/// Promoting a tested commit onto main switches to it so it survives a reboot.
#[test]
fn testing_commit_promoted_to_main_is_switched() {
    let fx = fixture(Some("exp"));
    let a = fx.origin.commit("main", "A").expect("A");
    let mut manager = fx.manager(ScriptedExecutor::default());
    manager.tick(&Tick::Periodic).expect("first tick");

    fx.origin.set_branch("exp", &a).expect("branch exp");
    let b = fx.origin.commit("exp", "B").expect("B");
    manager.tick(&Tick::Periodic).expect("testing tick");

    fx.origin.set_branch("main", &b).expect("promote B");
    let outcome = manager.tick(&Tick::Periodic).expect("promotion tick");
    assert!(outcome.new_generation);
    assert!(outcome.deployed);

    let status = manager.state().fetcher.repository_status;
    assert_eq!(status.selected_commit_id, b);
    assert_eq!(status.selected_branch_name, "main");
    assert!(!status.selected_branch_is_testing);
    assert_eq!(
        manager.executor().deployed(),
        vec![
            deploy_call(&a, Operation::Switch),
            deploy_call(&b, Operation::Test),
            deploy_call(&b, Operation::Switch),
        ]
    );
    let deployment = manager.state().deployment.expect("deployment");
    assert_eq!(deployment.operation, Operation::Switch);
    assert!(!deployment.generation.selected_branch_is_testing);

    let outcome = manager.tick(&Tick::Periodic).expect("idle tick");
    assert!(!outcome.new_generation);
}

#[test]
fn machine_id_mismatch_fails_deployment() {
    let fx = fixture(None);
    fx.origin.commit("main", "A").expect("A");
    let executor = ScriptedExecutor {
        machine_id: Some("ffffffffffffffffffffffffffffffff".to_string()),
        ..ScriptedExecutor::default()
    };
    let mut manager = fx.manager(executor);

    let outcome = manager.tick(&Tick::Periodic).expect("tick");
    assert!(!outcome.deployed);
    assert!(manager.executor().deployed().is_empty());
    let deployment = manager.state().deployment.expect("deployment");
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error_msg.contains("machine id"));
}

#[test]
fn matching_machine_id_deploys() {
    let fx = fixture(None);
    fx.origin.commit("main", "A").expect("A");
    let executor = ScriptedExecutor {
        machine_id: Some(MACHINE_ID.to_string()),
        ..ScriptedExecutor::default()
    };
    let mut manager = fx.manager(executor);
    assert!(manager.tick(&Tick::Periodic).expect("tick").deployed);
}

#[test]
fn activation_failure_marks_deployment_failed() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    let mut executor = ScriptedExecutor::default();
    executor.fail_deploy.insert(a);
    let mut manager = fx.manager(executor);

    let outcome = manager.tick(&Tick::Periodic).expect("tick");
    assert!(!outcome.deployed);
    let deployment = manager.state().deployment.expect("deployment");
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error_msg.contains("activation of"));
}

#[test]
fn restart_required_is_reported() {
    let fx = fixture(None);
    fx.origin.commit("main", "A").expect("A");
    let executor = ScriptedExecutor {
        needs_restart: true,
        ..ScriptedExecutor::default()
    };
    let mut manager = fx.manager(executor);

    let outcome = manager.tick(&Tick::Periodic).expect("tick");
    assert!(outcome.restart_required);
    assert!(manager.state().deployment.expect("deployment").restart_required);
}

/// After a restart the persisted deployment pins its commit.
#[test]
fn persisted_deployment_survives_restart() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    {
        let mut manager = fx.manager(ScriptedExecutor::default());
        manager.tick(&Tick::Periodic).expect("tick");
    }

    let persisted = load_state(&fx.cfg.state_path()).expect("load");
    assert_eq!(persisted.repository_status.selected_commit_id, a);
    let deployment = persisted.deployment.expect("deployment");
    assert_eq!(deployment.status, DeploymentStatus::Done);

    let mut manager = fx.manager(ScriptedExecutor::default());
    assert_eq!(
        manager.state().generation.expect("generation").selected_commit_id,
        a
    );
    let outcome = manager.tick(&Tick::Periodic).expect("tick after restart");
    assert!(!outcome.new_generation);
    assert!(manager.executor().calls.is_empty());
}

/// A deployment that never finished is redone after a restart.
#[test]
fn failed_deployment_is_retried_after_restart() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    {
        let mut executor = ScriptedExecutor::default();
        executor.fail_deploy.insert(a.clone());
        let mut manager = fx.manager(executor);
        manager.tick(&Tick::Periodic).expect("tick");
    }

    let mut manager = fx.manager(ScriptedExecutor::default());
    let outcome = manager.tick(&Tick::Periodic).expect("tick after restart");
    assert!(outcome.deployed);
    assert_eq!(manager.executor().deployed(), vec![deploy_call(&a, Operation::Switch)]);
}

#[test]
fn publisher_sees_every_stage() {
    let fx = fixture(None);
    fx.origin.commit("main", "A").expect("A");
    let seen: Arc<Mutex<Vec<State>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let mut manager = fx
        .manager(ScriptedExecutor::default())
        .with_publisher(move |state| sink.lock().expect("lock").push(state.clone()));

    manager.tick(&Tick::Periodic).expect("tick");

    let seen = seen.lock().expect("lock");
    let generation_states: Vec<GenerationStatus> = seen
        .iter()
        .filter_map(|state| state.generation.as_ref().map(|g| g.status))
        .collect();
    assert!(generation_states.contains(&GenerationStatus::Evaluating));
    assert!(generation_states.contains(&GenerationStatus::Building));
    let deployment_states: Vec<DeploymentStatus> = seen
        .iter()
        .filter_map(|state| state.deployment.as_ref().map(|d| d.status))
        .collect();
    assert!(deployment_states.contains(&DeploymentStatus::Running));
    assert_eq!(deployment_states.last(), Some(&DeploymentStatus::Done));
    assert_eq!(seen.last().expect("snapshot").builder.hostname, "web-1");
}

#[test]
fn fetch_of_unknown_remote_is_rejected() {
    let fx = fixture(None);
    fx.origin.commit("main", "A").expect("A");
    let mut manager = fx.manager(ScriptedExecutor::default());

    let err = manager
        .tick(&Tick::Fetch {
            remote: Some("upstream".to_string()),
        })
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<Error>(),
        Some(&Error::UnknownRemote {
            remote: "upstream".to_string()
        })
    );
    assert!(manager.executor().calls.is_empty());
}

#[test]
fn fetch_of_named_remote_deploys() {
    let fx = fixture(None);
    let a = fx.origin.commit("main", "A").expect("A");
    let mut manager = fx.manager(ScriptedExecutor::default());
    let outcome = manager
        .tick(&Tick::Fetch {
            remote: Some("origin".to_string()),
        })
        .expect("tick");
    assert!(outcome.deployed);
    assert_eq!(manager.executor().deployed(), vec![deploy_call(&a, Operation::Switch)]);
}
