//! Facts about the machine the agent runs on.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Files read relative to a root directory, `/` in production.
#[derive(Debug, Clone)]
pub struct Host {
    root: PathBuf,
}

impl Default for Host {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Host {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn machine_id(&self) -> Result<String> {
        let path = self.root.join("etc/machine-id");
        let id = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(id.trim().to_string())
    }

    /// True when the running system boots a different kernel, initrd or
    /// module set than the one currently activated.
    pub fn need_to_reboot(&self) -> bool {
        let booted = self.root.join("run/booted-system");
        let current = self.root.join("run/current-system");
        ["kernel", "initrd", "kernel-modules"]
            .iter()
            .any(|component| differs(&booted.join(component), &current.join(component)))
    }
}

fn differs(booted: &Path, current: &Path) -> bool {
    match (fs::read_link(booted), fs::read_link(current)) {
        (Ok(a), Ok(b)) => a != b,
        (Err(err), _) | (_, Err(err)) => {
            debug!(err = %err, "cannot compare boot components");
            false
        }
    }
}

/// Kernel hostname, used when the configuration does not name the host.
pub fn system_hostname() -> Result<String> {
    let raw = fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| fs::read_to_string("/etc/hostname"))
        .context("read hostname")?;
    let name = raw.trim();
    if name.is_empty() {
        return Err(anyhow!("system hostname is empty"));
    }
    Ok(name.to_string())
}
