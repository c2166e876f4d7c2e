//! Isolated working copies and the checkpoint chain.
//!
//! For a git repository the worktree is a second checkout sharing the object
//! database, rooted at a fresh branch named after the run. For an unversioned
//! tree the contents are copied into the worktree area and a repository is
//! initialized there; the original is never written to either way. Checkpoint
//! commits form a linear chain rooted at the baseline.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::RefitError;
use crate::model::{CommitId, RunId};
use crate::paths;

/// Name of the refit branch for a run.
#[must_use]
pub fn branch_name(run_id: &RunId) -> String {
    format!("refit/{run_id}")
}

/// An isolated working copy for one run.
#[derive(Clone, Debug)]
pub struct Worktree {
    /// Absolute path of the checkout.
    pub root: PathBuf,
    /// The branch holding the checkpoint chain.
    pub branch: String,
    /// The commit the worktree started at.
    pub baseline: CommitId,
}

/// Creates and manipulates the isolated working copy.
#[derive(Clone, Debug)]
pub struct RepoManager {
    repo: PathBuf,
    cache: PathBuf,
}

impl RepoManager {
    /// A manager for one target repository and cache root.
    #[must_use]
    pub fn new(repo: &Path, cache: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
            cache: cache.to_path_buf(),
        }
    }

    /// Whether the target is itself a git repository.
    #[must_use]
    pub fn is_git_repo(&self) -> bool {
        self.repo.join(".git").exists()
    }

    /// Materialize the isolated working copy for a run.
    ///
    /// # Errors
    /// Fails fatally on a stale worktree for the same run id, or any git
    /// failure; the original repository is untouched in every case.
    pub fn prepare(&self, run_id: &RunId) -> Result<Worktree, RefitError> {
        let root = paths::worktree_dir(&self.cache, run_id.as_str());
        if root.exists() {
            return Err(RefitError::StaleWorktree { path: root });
        }
        std::fs::create_dir_all(paths::worktrees_dir(&self.cache))?;

        let branch = branch_name(run_id);
        let root_str = root.display().to_string();
        if self.is_git_repo() {
            run_git(
                &self.repo,
                &["worktree", "add", "-b", &branch, &root_str, "HEAD"],
            )?;
        } else {
            // Unversioned target: copy the tree, then version the copy.
            copy_tree(&self.repo, &root)?;
            run_git(&root, &["init", "-q", "-b", &branch])?;
            configure_identity(&root)?;
            run_git(&root, &["add", "-A"])?;
            run_git(&root, &["commit", "-q", "-m", "refit: baseline import"])?;
        }

        // State lives inside the worktree but outside version control.
        std::fs::create_dir_all(paths::state_dir(&root))?;
        exclude_state_dir(&root)?;

        let baseline = head(&root)?;
        Ok(Worktree {
            root,
            branch,
            baseline,
        })
    }

    /// Stage everything and create one checkpoint commit.
    ///
    /// # Errors
    /// A commit rejected by a hook (or any git failure) is fatal.
    pub fn commit_checkpoint(
        &self,
        worktree: &Worktree,
        message: &str,
    ) -> Result<CommitId, RefitError> {
        run_git(&worktree.root, &["add", "-A"])?;
        run_git(&worktree.root, &["commit", "-q", "-m", message])?;
        head(&worktree.root)
    }

    /// Hard-reset the worktree to a prior checkpoint and drop stray files.
    ///
    /// # Errors
    /// Fails if git cannot reset; the state directory is always preserved.
    pub fn reset_to(&self, worktree: &Worktree, commit: &CommitId) -> Result<(), RefitError> {
        run_git(&worktree.root, &["reset", "--hard", "-q", commit.as_str()])?;
        run_git(
            &worktree.root,
            &["clean", "-fdq", "-e", paths::STATE_DIR],
        )?;
        Ok(())
    }

    /// Whether the worktree has uncommitted changes (outside the state dir).
    ///
    /// # Errors
    /// Fails if git status cannot run.
    pub fn is_dirty(&self, worktree: &Worktree) -> Result<bool, RefitError> {
        let out = run_git(&worktree.root, &["status", "--porcelain"])?;
        Ok(out
            .lines()
            .any(|line| !line.get(3..).unwrap_or("").starts_with(paths::STATE_DIR)))
    }

    /// Remove the worktree, or leave it for inspection.
    ///
    /// # Errors
    /// Fails if git refuses to remove the checkout.
    pub fn teardown(&self, worktree: &Worktree, keep: bool) -> Result<(), RefitError> {
        if keep {
            return Ok(());
        }
        if self.is_git_repo() {
            let root_str = worktree.root.display().to_string();
            run_git(
                &self.repo,
                &["worktree", "remove", "--force", &root_str],
            )?;
            run_git(&self.repo, &["branch", "-D", &worktree.branch])?;
        } else {
            std::fs::remove_dir_all(&worktree.root)?;
        }
        Ok(())
    }
}

/// Resolve HEAD of a checkout.
///
/// # Errors
/// Fails if git cannot resolve HEAD or prints a malformed OID.
pub fn head(dir: &Path) -> Result<CommitId, RefitError> {
    let out = run_git(dir, &["rev-parse", "HEAD"])?;
    CommitId::new(out.trim()).map_err(|e| RefitError::Git {
        command: "git rev-parse HEAD".to_owned(),
        stderr: e.to_string(),
    })
}

/// Run a git command, returning trimmed stdout.
///
/// # Errors
/// Non-zero exit becomes [`RefitError::Git`] with captured stderr.
pub fn run_git(dir: &Path, args: &[&str]) -> Result<String, RefitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| RefitError::Git {
            command: format!("git {}", args.join(" ")),
            stderr: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(RefitError::Git {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Commit identity for repos initialized by refit (test fixtures, imports).
fn configure_identity(dir: &Path) -> Result<(), RefitError> {
    run_git(dir, &["config", "user.email", "refit@localhost"])?;
    run_git(dir, &["config", "user.name", "refit"])?;
    Ok(())
}

fn exclude_state_dir(worktree: &Path) -> Result<(), RefitError> {
    // Worktree checkouts keep their metadata under the parent's .git dir;
    // resolve the real git dir rather than assuming .git is a directory.
    let git_dir_raw = run_git(worktree, &["rev-parse", "--absolute-git-dir"])?;
    let info = PathBuf::from(git_dir_raw.trim()).join("info");
    std::fs::create_dir_all(&info)?;
    let exclude = info.join("exclude");
    let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
    let line = format!("{}/", paths::STATE_DIR);
    if !existing.lines().any(|l| l == line) {
        std::fs::write(&exclude, format!("{existing}{line}\n"))?;
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), RefitError> {
    std::fs::create_dir_all(to)?;
    let mut pending = vec![from.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let src = entry.path();
            let rel = src.strip_prefix(from).map_err(|_| {
                std::io::Error::other(format!("path escape while copying {}", src.display()))
            })?;
            let dst = to.join(rel);
            if src.is_dir() {
                std::fs::create_dir_all(&dst)?;
                pending.push(src);
            } else {
                std::fs::copy(&src, &dst)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
