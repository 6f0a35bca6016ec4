//! Stable exit codes for the `reconcile` CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, arguments or other unexpected errors.
pub const INVALID: i32 = 1;
/// `reconcile build` failed for at least one host.
pub const BUILD_FAILED: i32 = 2;
/// `reconcile status` could not reach the agent.
pub const UNREACHABLE: i32 = 3;
