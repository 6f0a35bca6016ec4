//! Side-effecting adapters: processes, git, nix, files and HTTP caches.

pub mod binary_cache;
pub mod config;
pub mod git;
pub mod host;
pub mod nix;
pub mod process;
pub mod state_store;
