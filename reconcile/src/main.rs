//! `reconcile` command line: inspect a running agent, build host
//! configurations and check configuration files.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use reconcile::exit_codes;
use reconcile::io::config::{CommandsConfig, DEFAULT_CONFIG_PATH, HttpConfig, load_config};
use reconcile::io::nix::{Nix, all_outputs};
use reconcile::logging;
use reconcile::status::fetch_state;

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "reconcile",
    version,
    about = "Git-driven continuous deployment for NixOS hosts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the status snapshot of the local agent as JSON.
    Status {
        /// Base URL of the agent's HTTP endpoint.
        #[arg(long)]
        url: Option<String>,
    },
    /// Evaluate and build host configurations of a flake.
    Build {
        /// Flake reference, e.g. `.` or `git+file:///srv/infra`.
        #[arg(long, default_value = ".")]
        flake_url: String,
        /// Only build this host; all configurations when omitted.
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Load and validate a configuration file.
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Status { url } => cmd_status(url),
        Command::Build {
            flake_url,
            hostname,
        } => cmd_build(&flake_url, hostname),
        Command::CheckConfig { config } => cmd_check_config(&config),
    }
}

fn cmd_status(url: Option<String>) -> Result<i32> {
    let url = url.unwrap_or_else(|| HttpConfig::default().base_url());
    let state = match fetch_state(&url, STATUS_TIMEOUT) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("{err:#}");
            return Ok(exit_codes::UNREACHABLE);
        }
    };
    let out = serde_json::to_string_pretty(&state).context("serialize status")?;
    println!("{out}");
    Ok(exit_codes::OK)
}

fn cmd_build(flake_url: &str, hostname: Option<String>) -> Result<i32> {
    let nix = Nix::new(CommandsConfig::default().limits());
    let hosts = match hostname {
        Some(host) => vec![host],
        None => nix.list_hosts(flake_url).context("list host configurations")?,
    };

    let mut failed = 0usize;
    for host in &hosts {
        info!(host = %host, "building configuration");
        let built = nix
            .show_derivation(flake_url, host)
            .and_then(|(drv_path, out_path)| {
                nix.build(&all_outputs(&drv_path))?;
                Ok(out_path)
            });
        match built {
            Ok(out_path) => println!("{host}: {out_path}"),
            Err(err) => {
                error!(host = %host, err = %format!("{err:#}"), "build failed");
                eprintln!("{host}: {err:#}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Ok(exit_codes::BUILD_FAILED);
    }
    Ok(exit_codes::OK)
}

fn cmd_check_config(path: &std::path::Path) -> Result<i32> {
    let cfg = load_config(path)?;
    println!(
        "{}: ok (host {}, {} remote(s), {:?} executor)",
        path.display(),
        cfg.hostname,
        cfg.repository.remotes.len(),
        cfg.executor.kind
    );
    Ok(exit_codes::OK)
}
