//! Patch proposal validation and application.
//!
//! Every `ok` proposal is validated before the filesystem is touched: the
//! touched files must sit inside the batch scope minus excludes, the diff
//! must parse, the line total must fit the batch budget, binary hunks are
//! rejected unless allowed, and a check-only application must succeed.
//! Application itself is the worktree's native `git apply`; on failure the
//! tree is untouched and the attempt is retry-eligible.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

use crate::model::{Batch, PatchProposal};

// ---------------------------------------------------------------------------
// Rejection
// ---------------------------------------------------------------------------

/// Why a proposal was rejected before (or during) application.
///
/// Constraint violations feed back into the agent retry prompt; apply
/// failures are retried as-is.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchRejection {
    /// A touched file is outside the batch scope or matches an exclude.
    #[error("file '{path}' is outside the batch scope")]
    OutOfScope {
        /// The offending path.
        path: String,
    },

    /// The diff does not look like a unified diff.
    #[error("diff could not be parsed: {detail}")]
    Unparsable {
        /// Parse failure description.
        detail: String,
    },

    /// The diff's touched paths disagree with the proposal manifest.
    #[error("diff touches '{path}' which is not listed in touched_files")]
    UndeclaredFile {
        /// The path found in the diff but not declared.
        path: String,
    },

    /// Added+removed exceeds the batch budget.
    #[error("patch changes {lines} lines, over the {budget}-line budget")]
    OverBudget {
        /// Added+removed line count.
        lines: usize,
        /// The batch's budget.
        budget: usize,
    },

    /// Binary content where it is not allowed.
    #[error("binary hunk for '{path}' is not allowed")]
    BinaryHunk {
        /// The binary path.
        path: String,
    },

    /// A format-only batch touched a non-formatter file.
    #[error("format-only batch may not edit '{path}' (not a formatter extension)")]
    NotFormatterFile {
        /// The offending path.
        path: String,
    },

    /// `git apply --check` refused the patch.
    #[error("patch does not apply cleanly: {detail}")]
    CheckFailed {
        /// Trimmed git stderr.
        detail: String,
    },
}

impl PatchRejection {
    /// Constraint violations are re-prompted with added constraint language;
    /// apply failures are simply retried.
    #[must_use]
    pub const fn is_constraint(&self) -> bool {
        !matches!(self, Self::CheckFailed { .. })
    }
}

// ---------------------------------------------------------------------------
// Scope matching
// ---------------------------------------------------------------------------

/// True if `path` matches at least one scope glob and no exclude glob.
///
/// Invalid patterns never match; config validation rejects them up front, so
/// this only defends against agent-supplied globs in refined plans.
#[must_use]
pub fn in_scope(path: &str, scope: &[String], excludes: &[String]) -> bool {
    let matches = |pattern: &String| {
        glob::Pattern::new(pattern).is_ok_and(|p| {
            p.matches_with(
                path,
                glob::MatchOptions {
                    require_literal_separator: false,
                    ..glob::MatchOptions::new()
                },
            )
        })
    };
    scope.iter().any(matches) && !excludes.iter().any(matches)
}

// ---------------------------------------------------------------------------
// Diff parsing
// ---------------------------------------------------------------------------

/// What a textual scan of a unified diff found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Paths named by `+++`/`---` headers (repo-relative, `a/`/`b/` stripped).
    pub files: Vec<String>,
    /// Added line count.
    pub added: usize,
    /// Removed line count.
    pub removed: usize,
    /// Paths carrying git binary patches.
    pub binary_files: Vec<String>,
}

impl DiffStats {
    /// Total changed lines (added + removed).
    #[must_use]
    pub const fn total_lines(&self) -> usize {
        self.added + self.removed
    }
}

/// Scan a unified diff without applying it.
///
/// # Errors
/// Returns [`PatchRejection::Unparsable`] if no file headers or hunks are found.
pub fn parse_diff(diff: &str) -> Result<DiffStats, PatchRejection> {
    let mut stats = DiffStats::default();
    let mut in_hunk = false;
    let mut saw_hunk = false;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            in_hunk = false;
            push_header_path(&mut stats.files, rest, "a/");
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            in_hunk = false;
            push_header_path(&mut stats.files, rest, "b/");
        } else if line.starts_with("@@") {
            in_hunk = true;
            saw_hunk = true;
        } else if line.starts_with("GIT binary patch") {
            saw_hunk = true;
            if let Some(path) = stats.files.last() {
                stats.binary_files.push(path.clone());
            }
        } else if line.starts_with("Binary files ") {
            saw_hunk = true;
            if let Some(path) = binary_header_path(line) {
                if !stats.files.contains(&path) {
                    stats.files.push(path.clone());
                }
                stats.binary_files.push(path);
            }
        } else if in_hunk {
            if line.starts_with('+') {
                stats.added += 1;
            } else if line.starts_with('-') {
                stats.removed += 1;
            }
        }
    }

    if stats.files.is_empty() {
        return Err(PatchRejection::Unparsable {
            detail: "no file headers found".to_owned(),
        });
    }
    if !saw_hunk {
        return Err(PatchRejection::Unparsable {
            detail: "no hunks found".to_owned(),
        });
    }
    Ok(stats)
}

fn push_header_path(files: &mut Vec<String>, header: &str, prefix: &str) {
    let raw = header.split_whitespace().next().unwrap_or("");
    if raw == "/dev/null" {
        return;
    }
    let path = raw.strip_prefix(prefix).unwrap_or(raw).to_owned();
    if !path.is_empty() && !files.contains(&path) {
        files.push(path);
    }
}

/// Extract a path from `Binary files a/x and b/x differ`.
fn binary_header_path(line: &str) -> Option<String> {
    let rest = line.strip_prefix("Binary files ")?;
    let first = rest.split_whitespace().next()?;
    Some(first.strip_prefix("a/").unwrap_or(first).to_owned())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate an `ok` proposal against its batch, without touching the tree.
///
/// # Errors
/// Returns the first rejection found, in cheapest-check-first order.
pub fn validate(
    proposal: &PatchProposal,
    batch: &Batch,
    excludes: &[String],
    allow_binary: bool,
    formatter_extensions: &[String],
) -> Result<DiffStats, PatchRejection> {
    for path in &proposal.touched_files {
        if !in_scope(path, &batch.scope, excludes) {
            return Err(PatchRejection::OutOfScope { path: path.clone() });
        }
    }

    let stats = parse_diff(&proposal.diff)?;

    for path in &stats.files {
        if !proposal.touched_files.contains(path) {
            return Err(PatchRejection::UndeclaredFile { path: path.clone() });
        }
    }

    if stats.total_lines() > batch.diff_budget_loc {
        return Err(PatchRejection::OverBudget {
            lines: stats.total_lines(),
            budget: batch.diff_budget_loc,
        });
    }

    if !allow_binary
        && let Some(path) = stats.binary_files.first()
    {
        return Err(PatchRejection::BinaryHunk { path: path.clone() });
    }

    if batch.is_format_only() {
        for path in &stats.files {
            let ext = Path::new(path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            if !formatter_extensions.iter().any(|e| e == ext) {
                return Err(PatchRejection::NotFormatterFile { path: path.clone() });
            }
        }
    }

    Ok(stats)
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Run `git apply --check` in the worktree.
///
/// # Errors
/// Returns [`PatchRejection::CheckFailed`] if the patch does not apply.
pub fn check(worktree: &Path, diff: &str) -> Result<(), PatchRejection> {
    run_apply(worktree, diff, true)
}

/// Apply the diff in the worktree. The caller must have validated first.
///
/// # Errors
/// Returns [`PatchRejection::CheckFailed`] if git refuses the patch; the
/// worktree is untouched in that case.
pub fn apply(worktree: &Path, diff: &str) -> Result<(), PatchRejection> {
    run_apply(worktree, diff, false)
}

fn run_apply(worktree: &Path, diff: &str, check_only: bool) -> Result<(), PatchRejection> {
    use std::io::Write as _;
    use std::process::Stdio;

    let mut args = vec!["apply", "--whitespace=nowarn"];
    if check_only {
        args.push("--check");
    }
    let spawn = Command::new("git")
        .args(&args)
        .current_dir(worktree)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = spawn.map_err(|e| PatchRejection::CheckFailed {
        detail: format!("failed to spawn git apply: {e}"),
    })?;
    if let Some(mut stdin) = child.stdin.take() {
        // A closed pipe means git already failed; the wait below reports it.
        let _ = stdin.write_all(diff.as_bytes());
    }
    let output = child
        .wait_with_output()
        .map_err(|e| PatchRejection::CheckFailed {
            detail: format!("git apply did not finish: {e}"),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(PatchRejection::CheckFailed {
            detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
