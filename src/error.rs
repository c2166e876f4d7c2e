//! Unified error type for refit operations.
//!
//! Each variant carries enough context to print an actionable message: what
//! went wrong and what the user (or a wrapping tool) should do next. Terminal
//! errors map to the documented process exit codes via [`RefitError::exit_code`].

use std::path::PathBuf;

use thiserror::Error;

use crate::model::BatchId;

/// Exit code for user errors (bad arguments, invalid config).
pub const EXIT_USER_ERROR: i32 = 2;
/// Exit code when the baseline verifier fails before any batch runs.
pub const EXIT_BASELINE_FAILED: i32 = 3;
/// Exit code when a batch fails after all retries.
pub const EXIT_BATCH_FAILED: i32 = 4;
/// Exit code when the agent binary is missing or not authenticated.
pub const EXIT_AGENT_UNAVAILABLE: i32 = 5;
/// Exit code for a user-initiated cancellation.
pub const EXIT_CANCELLED: i32 = 130;

/// Errors returned by refit library operations.
#[derive(Debug, Error)]
pub enum RefitError {
    /// The agent binary could not be executed.
    #[error(
        "agent binary '{binary}' is not installed or not on PATH.\n  \
         To fix: install the agent CLI, or set its location in .refit.toml:\n    \
         [claude]\n    binary = \"/path/to/claude\""
    )]
    AgentNotInstalled {
        /// The binary name or path that failed to spawn.
        binary: String,
    },

    /// The agent binary runs but a trivial probe prompt failed.
    #[error(
        "agent binary '{binary}' is installed but not usable: {detail}\n  \
         To fix: authenticate the agent CLI and retry (run it once interactively)."
    )]
    AgentNotAuthenticated {
        /// The binary that was probed.
        binary: String,
        /// What the probe observed.
        detail: String,
    },

    /// The agent produced output that failed JSON parsing or schema
    /// validation twice in a row.
    #[error("agent returned an invalid payload after retry: {detail}")]
    AgentPayload {
        /// Parse or validation failure description.
        detail: String,
    },

    /// An agent invocation exceeded its timeout.
    #[error("agent invocation timed out after {seconds}s")]
    AgentTimeout {
        /// The configured ceiling that was exceeded.
        seconds: u64,
    },

    /// The baseline verifier failed on the untouched worktree.
    #[error(
        "baseline verifier failed before any batch ran: {detail}\n  \
         To fix: make the configured verifier pass on the unmodified repo,\n  \
         or adjust fast_verifier/full_verifier in .refit.toml."
    )]
    BaselineFailed {
        /// Which command failed and how.
        detail: String,
    },

    /// A batch exhausted its retries.
    #[error(
        "batch {batch} failed after {attempts} attempt(s): {detail}\n  \
         Partial work up to the last checkpoint is preserved in the worktree.\n  \
         To recover: accept the partial result, or roll back:\n    \
         refit rollback <repo> --backup-id <run-id>"
    )]
    BatchFailed {
        /// The failing batch.
        batch: BatchId,
        /// Total attempts made (`retry_per_batch + 1`).
        attempts: u32,
        /// Last failure description.
        detail: String,
    },

    /// The run was cancelled at an external wait point.
    #[error("run cancelled; worktree reset to the last checkpoint")]
    Cancelled,

    /// A configuration file could not be loaded or parsed.
    #[error(
        "configuration error in '{}': {detail}\n  \
         To fix: edit the config file and correct the issue.",
        path.display()
    )]
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// A worktree for this run id already exists.
    #[error(
        "a stale worktree already exists at {0}.\n  \
         Refusing to reuse it.\n  \
         To fix: inspect it, then remove it:\n    \
         git -C <repo> worktree remove --force {0}",
        path.display()
    )]
    StaleWorktree {
        /// Path of the pre-existing worktree.
        path: PathBuf,
    },

    /// The worktree was mutated by something other than refit.
    #[error(
        "worktree at {} is unexpectedly dirty: {detail}\n  \
         Another process modified the isolated copy. The run cannot continue safely.",
        path.display()
    )]
    DirtyWorktree {
        /// Path to the worktree root.
        path: PathBuf,
        /// What was dirty.
        detail: String,
    },

    /// A git command failed.
    #[error("git command failed: {command}{}\n  To fix: check git state and retry.",
        if stderr.is_empty() { String::new() } else { format!("\n  stderr: {stderr}") })]
    Git {
        /// The git command that was run (e.g. `"git worktree add"`).
        command: String,
        /// Captured stderr from git.
        stderr: String,
    },

    /// A named backup could not be found.
    #[error(
        "no backup found for id '{id}' under {}.\n  \
         To fix: list available backups:\n    refit list-backups <repo>",
        dir.display()
    )]
    BackupNotFound {
        /// The requested backup (run) id.
        id: String,
        /// The directory that was searched.
        dir: PathBuf,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}\n  To fix: check file permissions and disk space.")]
    Io(#[from] std::io::Error),
}

impl RefitError {
    /// The process exit code this error maps to.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::AgentNotInstalled { .. } | Self::AgentNotAuthenticated { .. } => {
                EXIT_AGENT_UNAVAILABLE
            }
            Self::BaselineFailed { .. } => EXIT_BASELINE_FAILED,
            Self::BatchFailed { .. } => EXIT_BATCH_FAILED,
            Self::Cancelled => EXIT_CANCELLED,
            Self::Config { .. } | Self::BackupNotFound { .. } => EXIT_USER_ERROR,
            _ => 1,
        }
    }
}

impl From<crate::model::ValidationError> for RefitError {
    fn from(err: crate::model::ValidationError) -> Self {
        Self::Config {
            path: PathBuf::new(),
            detail: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
