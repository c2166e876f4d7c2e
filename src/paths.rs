//! Filesystem layout for refit's persisted state.
//!
//! Everything refit writes lives in one of two places: the per-user cache
//! root (worktrees, backups, plan artifacts) and the hidden `.refit/` state
//! directory inside a worktree (ledger, verifier captures, snapshots). The
//! original repository is never written to.

use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "REFIT_CACHE_DIR";

/// Name of the hidden state directory inside a worktree.
pub const STATE_DIR: &str = ".refit";

/// The per-user cache root: `$REFIT_CACHE_DIR`, or `~/.cache/refit`.
#[must_use]
pub fn cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("refit")
}

/// Directory holding all isolated worktrees.
#[must_use]
pub fn worktrees_dir(cache: &Path) -> PathBuf {
    cache.join("worktrees")
}

/// The worktree path for one run.
#[must_use]
pub fn worktree_dir(cache: &Path, run_id: &str) -> PathBuf {
    worktrees_dir(cache).join(run_id)
}

/// Directory holding backups for one repository.
#[must_use]
pub fn backups_dir(cache: &Path, repo_name: &str) -> PathBuf {
    cache.join("backups").join(repo_name)
}

/// The backup directory for one run of one repository.
#[must_use]
pub fn backup_dir(cache: &Path, repo_name: &str, run_id: &str) -> PathBuf {
    backups_dir(cache, repo_name).join(run_id)
}

/// Where `refit plan` stores the standalone plan artifact for a repository.
#[must_use]
pub fn plan_artifact(cache: &Path, repo_name: &str) -> PathBuf {
    cache.join("plans").join(format!("{repo_name}.json"))
}

/// The hidden state directory inside a worktree.
#[must_use]
pub fn state_dir(worktree: &Path) -> PathBuf {
    worktree.join(STATE_DIR)
}

/// The append-only ledger file inside a worktree.
#[must_use]
pub fn ledger_path(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("ledger.jsonl")
}

/// The frozen plan for the run, inside the worktree.
#[must_use]
pub fn plan_path(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("plan.json")
}

/// The run metadata record, inside the worktree.
#[must_use]
pub fn run_record_path(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("run.json")
}

/// Directory of captured verifier/agent output, inside the worktree.
#[must_use]
pub fn captures_dir(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("captures")
}

/// The public-API snapshot, inside the worktree.
#[must_use]
pub fn api_snapshot_path(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("api-snapshot.json")
}

/// The symbol/import index snapshot, inside the worktree.
#[must_use]
pub fn index_path(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("index.json")
}

/// The final Markdown report, inside the worktree.
#[must_use]
pub fn report_path(worktree: &Path) -> PathBuf {
    state_dir(worktree).join("report.md")
}

/// The repository's short name, used to key backups.
#[must_use]
pub fn repo_name(repo: &Path) -> String {
    repo.file_name()
        .map_or_else(|| "repo".to_owned(), |n| n.to_string_lossy().into_owned())
}
