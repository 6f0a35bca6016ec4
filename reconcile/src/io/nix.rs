//! `nix` command wrappers used by the executors and the `build` command.

use std::collections::BTreeMap;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::io::process::{CommandLimits, run_command};

const STORE_DIR: &str = "/nix/store/";

/// Thin wrapper for `nix` invocations sharing one set of limits.
#[derive(Debug, Clone)]
pub struct Nix {
    limits: CommandLimits,
}

impl Nix {
    pub fn new(limits: CommandLimits) -> Self {
        Self { limits }
    }

    /// Evaluate a host configuration to its derivation and output path.
    #[instrument(skip_all, fields(hostname = %hostname))]
    pub fn show_derivation(&self, flake_url: &str, hostname: &str) -> Result<(String, String)> {
        let installable = format!(
            "{}.config.system.build.toplevel",
            configuration_attr(flake_url, hostname)
        );
        let stdout = self.run(&["derivation", "show", &installable], "nix derivation show")?;
        parse_derivation_show(&stdout)
    }

    /// Machine id declared by a host configuration, if any.
    #[instrument(skip_all, fields(hostname = %hostname))]
    pub fn machine_id(&self, flake_url: &str, hostname: &str) -> Result<Option<String>> {
        let installable = format!("{}.config", configuration_attr(flake_url, hostname));
        let stdout = self.run(
            &[
                "eval",
                "--json",
                &installable,
                "--apply",
                "c: c.services.reconcile.machineId or null",
            ],
            "nix eval",
        )?;
        parse_machine_id(&stdout)
    }

    /// Build or substitute `installable` without creating a result link.
    #[instrument(skip_all, fields(installable = %installable))]
    pub fn build(&self, installable: &str) -> Result<()> {
        info!("building");
        self.run(&["build", installable, "-L", "--no-link"], "nix build")?;
        Ok(())
    }

    /// Names of the NixOS configurations a flake exposes.
    pub fn list_hosts(&self, flake_url: &str) -> Result<Vec<String>> {
        let stdout = self.run(&["flake", "show", "--json", flake_url], "nix flake show")?;
        parse_flake_hosts(&stdout)
    }

    fn run(&self, args: &[&str], label: &str) -> Result<String> {
        let mut cmd = Command::new("nix");
        cmd.args([
            "--extra-experimental-features",
            "nix-command",
            "--extra-experimental-features",
            "flakes",
            "--accept-flake-config",
        ])
        .args(args);
        debug!(?args, "running nix");
        let output = run_command(cmd, &self.limits)
            .with_context(|| label.to_string())?
            .ensure_success(label, &self.limits)?;
        Ok(output.stdout_lossy())
    }
}

/// `<flake>#nixosConfigurations."<host>"`
pub fn configuration_attr(flake_url: &str, hostname: &str) -> String {
    format!("{flake_url}#nixosConfigurations.\"{hostname}\"")
}

/// Installable that builds every output of a derivation.
pub fn all_outputs(drv_path: &str) -> String {
    format!("{drv_path}^*")
}

fn store_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{STORE_DIR}{path}")
    }
}

#[derive(Debug, Deserialize)]
struct DerivationInfo {
    #[serde(default)]
    outputs: BTreeMap<String, DerivationOutput>,
}

#[derive(Debug, Deserialize)]
struct DerivationOutput {
    #[serde(default)]
    path: Option<String>,
}

pub(crate) fn parse_derivation_show(stdout: &str) -> Result<(String, String)> {
    let map: BTreeMap<String, DerivationInfo> =
        serde_json::from_str(stdout).context("parse nix derivation show output")?;
    let (drv, info) = map
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("nix derivation show returned no derivation"))?;
    let out = info
        .outputs
        .get("out")
        .and_then(|output| output.path.as_deref())
        .ok_or_else(|| anyhow!("derivation {drv} has no out path"))?;
    Ok((store_path(&drv), store_path(out)))
}

pub(crate) fn parse_machine_id(stdout: &str) -> Result<Option<String>> {
    let value: Option<String> =
        serde_json::from_str(stdout.trim()).context("parse machine id")?;
    Ok(value.filter(|id| !id.trim().is_empty()))
}

pub(crate) fn parse_flake_hosts(stdout: &str) -> Result<Vec<String>> {
    let value: serde_json::Value =
        serde_json::from_str(stdout).context("parse nix flake show output")?;
    let Some(configs) = value
        .get("nixosConfigurations")
        .and_then(serde_json::Value::as_object)
    else {
        return Ok(Vec::new());
    };
    Ok(configs.keys().cloned().collect())
}
