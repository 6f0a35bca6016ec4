//! Domain errors callers need to tell apart from transient failures.
//!
//! Orchestration code returns `anyhow::Result`; these variants travel inside
//! the `anyhow::Error` and are recovered with `downcast_ref::<Error>()`.

/// Failures with a stable meaning across the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A filtered fetch named a remote that is not configured.
    #[error("the remote '{remote}' doesn't exist")]
    UnknownRemote {
        /// The name that was requested.
        remote: String,
    },

    /// The working tree could not be forced to the selected commit.
    #[error("failed to check out commit '{commit}': {reason}")]
    CheckoutFailed {
        /// Commit id that was targeted (may be empty when nothing was selected).
        commit: String,
        /// Underlying cause.
        reason: String,
    },

    /// The package manager could not produce a build plan for the host.
    #[error("evaluation of '{hostname}' failed: {reason}")]
    EvalFailed {
        /// Host whose configuration was evaluated.
        hostname: String,
        /// Underlying cause.
        reason: String,
    },

    /// The flake reference handed to the remote-CI backend has no `rev`.
    #[error("flake reference '{flake_url}' has no rev query parameter")]
    MissingRevision {
        /// The offending reference.
        flake_url: String,
    },

    /// The remote-CI backend was asked to build a derivation it never evaluated.
    #[error("build called before eval for '{drv_path}'")]
    BuildBeforeEval {
        /// Derivation path passed to `build`.
        drv_path: String,
    },

    /// A build was requested for a derivation path with no evaluation behind it.
    #[error("derivation '{drv_path}' was never evaluated")]
    BuildNotEvaluated {
        /// Derivation path passed to `build`.
        drv_path: String,
    },

    /// A binary cache served an archive in a compression we cannot read.
    #[error("unsupported narinfo compression '{compression}'")]
    UnsupportedCompression {
        /// Value of the `Compression` field.
        compression: String,
    },

    /// The configuration targets a different machine than the one we run on.
    #[error("machine id mismatch: expected '{expected}', host is '{actual}'")]
    MachineIdMismatch {
        /// Machine id declared by the evaluated configuration.
        expected: String,
        /// Machine id read from the host.
        actual: String,
    },
}
