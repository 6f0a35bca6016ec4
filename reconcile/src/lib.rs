//! Git-driven continuous deployment agent for NixOS hosts.
//!
//! The agent tracks a set of git remotes, picks the commit a host should run,
//! evaluates and builds it, and activates the result. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (commit selection, generation and
//!   deployment state machines). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git, nix, processes, files, HTTP).
//!
//! [`repository`], [`executor`] and [`manager`] combine the two into the
//! reconciliation loop that [`scheduler`] drives.

pub mod core;
pub mod error;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod manager;
pub mod repository;
pub mod scheduler;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
