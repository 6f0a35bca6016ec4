//! Deterministic, pure logic of the reconciliation engine.
//!
//! Core modules are free of I/O side effects. Time and branch resolution are
//! passed in by the caller so every transition is reproducible in tests.

pub mod deployment;
pub mod generation;
pub mod selector;
pub mod types;
