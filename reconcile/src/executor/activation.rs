//! Activation of a built system, shared by every executor backend.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::core::deployment::{Activation, Operation};
use crate::io::process::{CommandLimits, run_command};

/// Host-side steps of an activation.
pub trait Activator {
    /// Content hash of the agent's own service definition, `None` when it
    /// cannot be read.
    fn unit_file_hash(&mut self) -> Option<String>;

    /// Register `out_path` as the system profile; returns the profile link.
    fn set_system_profile(&mut self, out_path: &str) -> Result<String>;

    /// Run the activation script of `out_path`.
    fn switch_to_configuration(&mut self, out_path: &str, operation: Operation) -> Result<()>;
}

/// Activate `out_path` and report whether the agent must restart.
#[instrument(skip_all, fields(out_path = %out_path, operation = %operation))]
pub fn activate<A: Activator>(
    activator: &mut A,
    out_path: &str,
    operation: Operation,
) -> Result<Activation> {
    let before = activator.unit_file_hash();

    let profile_path = if operation.updates_profile() {
        activator
            .set_system_profile(out_path)
            .context("set system profile")?
    } else {
        String::new()
    };

    activator
        .switch_to_configuration(out_path, operation)
        .with_context(|| format!("switch-to-configuration {operation}"))?;

    let after = activator.unit_file_hash();
    let needs_restart = before != after;
    if needs_restart {
        info!("service definition changed, agent restart required");
    }
    info!(profile_path = %profile_path, "activation finished");
    Ok(Activation {
        needs_restart,
        profile_path,
    })
}

/// Activator for the running host: `systemctl`, `nix-env` and the
/// configuration's own `switch-to-configuration`.
#[derive(Debug, Clone)]
pub struct SystemActivator {
    pub unit_name: String,
    pub profile_path: PathBuf,
    pub dry_run: bool,
    pub limits: CommandLimits,
}

impl Activator for SystemActivator {
    fn unit_file_hash(&mut self) -> Option<String> {
        let mut cmd = Command::new("systemctl");
        cmd.args(["cat", &self.unit_name]);
        match run_command(cmd, &self.limits) {
            Ok(out) if out.success() => Some(hex::encode(Sha256::digest(&out.stdout))),
            Ok(out) => {
                warn!(
                    reason = %out.failure_reason("systemctl cat", &self.limits),
                    "cannot read service definition"
                );
                None
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "cannot read service definition");
                None
            }
        }
    }

    fn set_system_profile(&mut self, out_path: &str) -> Result<String> {
        if self.dry_run {
            info!("dry run, system profile left untouched");
            return Ok(String::new());
        }
        let mut cmd = Command::new("nix-env");
        cmd.arg("--profile").arg(&self.profile_path).args(["--set", out_path]);
        run_command(cmd, &self.limits)
            .context("nix-env --set")?
            .ensure_success("nix-env --set", &self.limits)?;
        resolve_profile_link(&self.profile_path)
    }

    fn switch_to_configuration(&mut self, out_path: &str, operation: Operation) -> Result<()> {
        let exe = Path::new(out_path).join("bin").join("switch-to-configuration");
        if self.dry_run {
            info!(exe = %exe.display(), %operation, "dry run, activation script not executed");
            return Ok(());
        }
        info!(exe = %exe.display(), %operation, "running activation script");
        let label = format!("switch-to-configuration {operation}");
        let mut cmd = Command::new(&exe);
        cmd.arg(operation.as_str());
        run_command(cmd, &self.limits)
            .with_context(|| label.clone())?
            .ensure_success(&label, &self.limits)?;
        Ok(())
    }
}

/// Generation link the profile symlink points at.
fn resolve_profile_link(profile: &Path) -> Result<String> {
    let target = std::fs::read_link(profile)
        .with_context(|| format!("read profile link {}", profile.display()))?;
    let resolved = match profile.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };
    Ok(resolved.display().to_string())
}
