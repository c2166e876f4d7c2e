//! Pre-run snapshots and user-initiated restore.
//!
//! Before a plan executes, the target gets a full snapshot under the cache:
//! a `git bundle` of all refs (for version-controlled repos) plus a
//! compressed archive of the working tree. Restore unpacks into a staging
//! directory and swaps it in, so a half-finished restore never leaves a
//! mangled target behind.

use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::RefitError;
use crate::model::RunId;
use crate::paths;
use crate::repo::run_git;

/// File name of the refs bundle inside a backup directory.
const BUNDLE_NAME: &str = "backup.bundle";
/// File name of the tree archive inside a backup directory.
const ARCHIVE_NAME: &str = "snapshot.tar.gz";

/// Entries never archived: version control internals and refit state.
const ARCHIVE_SKIP: &[&str] = &[".git", ".refit"];

/// An immutable pre-run snapshot, keyed by run id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupArtifact {
    /// The run this backup belongs to.
    pub run_id: String,
    /// Refs bundle, present for version-controlled repos.
    pub bundle: Option<PathBuf>,
    /// Compressed working-tree archive. Always present.
    pub archive: PathBuf,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Snapshot the repository into the cache, keyed by repo name and run id.
///
/// # Errors
/// Fails if the bundle or archive cannot be written. The target repository
/// is only read.
pub fn snapshot(repo: &Path, run_id: &RunId, cache: &Path) -> Result<BackupArtifact, RefitError> {
    let dir = paths::backup_dir(cache, &paths::repo_name(repo), run_id.as_str());
    std::fs::create_dir_all(&dir)?;

    let bundle = if repo.join(".git").exists() {
        let bundle_path = dir.join(BUNDLE_NAME);
        let bundle_str = bundle_path.display().to_string();
        run_git(repo, &["bundle", "create", &bundle_str, "--all"])?;
        Some(bundle_path)
    } else {
        None
    };

    let archive = dir.join(ARCHIVE_NAME);
    write_archive(repo, &archive)?;

    Ok(BackupArtifact {
        run_id: run_id.as_str().to_owned(),
        bundle,
        archive,
    })
}

fn write_archive(root: &Path, archive: &Path) -> Result<(), RefitError> {
    let file = std::fs::File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if ARCHIVE_SKIP.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(RefitError::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// Restore a snapshot over `target`, atomically at the directory level.
///
/// The archive is unpacked into a staging directory next to the target, the
/// target's version-control internals are carried over, and the directories
/// are swapped. Idempotent: restoring twice yields the same tree.
///
/// # Errors
/// Fails if the archive is unreadable or the swap cannot complete; the
/// target is only replaced after a fully successful unpack.
pub fn restore(artifact: &BackupArtifact, target: &Path) -> Result<(), RefitError> {
    let parent = target.parent().ok_or_else(|| {
        std::io::Error::other(format!("restore target {} has no parent", target.display()))
    })?;
    let staging = tempfile::Builder::new()
        .prefix(".refit-restore-")
        .tempdir_in(parent)?;

    let file = std::fs::File::open(&artifact.archive)?;
    let mut unpacker = tar::Archive::new(GzDecoder::new(file));
    unpacker.unpack(staging.path())?;

    // Keep the target's VCS internals: the bundle already preserves refs,
    // and the object database under .git is not part of the working tree.
    let staged_root = staging.path();
    if target.join(".git").exists() {
        std::fs::rename(target.join(".git"), staged_root.join(".git"))?;
    }

    let displaced = parent.join(format!(
        ".refit-displaced-{}",
        artifact.run_id
    ));
    if displaced.exists() {
        std::fs::remove_dir_all(&displaced)?;
    }
    std::fs::rename(target, &displaced)?;
    match std::fs::rename(staged_root, target) {
        Ok(()) => {
            std::fs::remove_dir_all(&displaced)?;
            // The staging TempDir was moved; forget it so drop doesn't error.
            std::mem::forget(staging);
            Ok(())
        }
        Err(e) => {
            // Put the original (and its .git) back before reporting.
            let _ = std::fs::rename(staged_root.join(".git"), displaced.join(".git"));
            let _ = std::fs::rename(&displaced, target);
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Enumerate cached backups for a repository, newest first.
///
/// # Errors
/// Fails only if the backups directory exists but cannot be read.
pub fn list(repo: &Path, cache: &Path) -> Result<Vec<BackupArtifact>, RefitError> {
    let dir = paths::backups_dir(cache, &paths::repo_name(repo));
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let archive = entry.path().join(ARCHIVE_NAME);
        if !archive.exists() {
            continue;
        }
        let bundle_path = entry.path().join(BUNDLE_NAME);
        artifacts.push(BackupArtifact {
            run_id: entry.file_name().to_string_lossy().into_owned(),
            bundle: bundle_path.exists().then_some(bundle_path),
            archive,
        });
    }
    // Run ids are time-sortable, so newest first is a reverse sort.
    artifacts.sort_by(|a, b| b.run_id.cmp(&a.run_id));
    Ok(artifacts)
}

/// Find one backup by run id.
///
/// # Errors
/// Returns [`RefitError::BackupNotFound`] if no such backup exists.
pub fn find(repo: &Path, cache: &Path, backup_id: &str) -> Result<BackupArtifact, RefitError> {
    list(repo, cache)?
        .into_iter()
        .find(|a| a.run_id == backup_id)
        .ok_or_else(|| RefitError::BackupNotFound {
            id: backup_id.to_owned(),
            dir: paths::backups_dir(cache, &paths::repo_name(repo)),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id() -> RunId {
        RunId::new("r20260101120000-abcd").unwrap()
    }

    fn plain_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.py"), "def foo():\n    return 1\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
        dir
    }

    fn git_repo() -> tempfile::TempDir {
        let dir = plain_repo();
        run_git(dir.path(), &["init", "-q", "-b", "main"]).unwrap();
        run_git(dir.path(), &["config", "user.email", "t@example.com"]).unwrap();
        run_git(dir.path(), &["config", "user.name", "t"]).unwrap();
        run_git(dir.path(), &["add", "-A"]).unwrap();
        run_git(dir.path(), &["commit", "-q", "-m", "init"]).unwrap();
        dir
    }

    #[test]
    fn snapshot_plain_repo_has_archive_only() {
        let repo = plain_repo();
        let cache = tempfile::tempdir().unwrap();
        let artifact = snapshot(repo.path(), &run_id(), cache.path()).unwrap();
        assert!(artifact.bundle.is_none());
        assert!(artifact.archive.exists());
    }

    #[test]
    fn snapshot_git_repo_has_bundle_and_archive() {
        let repo = git_repo();
        let cache = tempfile::tempdir().unwrap();
        let artifact = snapshot(repo.path(), &run_id(), cache.path()).unwrap();
        assert!(artifact.bundle.as_ref().is_some_and(|b| b.exists()));
        assert!(artifact.archive.exists());
    }

    #[test]
    fn restore_recovers_modified_tree() {
        let repo = git_repo();
        let cache = tempfile::tempdir().unwrap();
        let artifact = snapshot(repo.path(), &run_id(), cache.path()).unwrap();

        // Mutate and delete after the snapshot.
        std::fs::write(repo.path().join("src/a.py"), "wrecked\n").unwrap();
        std::fs::remove_file(repo.path().join("README.md")).unwrap();
        std::fs::write(repo.path().join("intruder.txt"), "new\n").unwrap();

        restore(&artifact, repo.path()).unwrap();

        let a = std::fs::read_to_string(repo.path().join("src/a.py")).unwrap();
        assert!(a.contains("def foo"));
        assert!(repo.path().join("README.md").exists());
        assert!(!repo.path().join("intruder.txt").exists());
        // VCS internals survive the swap.
        assert!(repo.path().join(".git").exists());
    }

    #[test]
    fn restore_is_idempotent() {
        let repo = plain_repo();
        let cache = tempfile::tempdir().unwrap();
        let artifact = snapshot(repo.path(), &run_id(), cache.path()).unwrap();

        restore(&artifact, repo.path()).unwrap();
        let first = std::fs::read_to_string(repo.path().join("src/a.py")).unwrap();
        restore(&artifact, repo.path()).unwrap();
        let second = std::fs::read_to_string(repo.path().join("src/a.py")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn restore_leaves_artifact_in_place() {
        let repo = plain_repo();
        let cache = tempfile::tempdir().unwrap();
        let artifact = snapshot(repo.path(), &run_id(), cache.path()).unwrap();
        restore(&artifact, repo.path()).unwrap();
        assert!(artifact.archive.exists());
    }

    #[test]
    fn list_orders_newest_first() {
        let repo = plain_repo();
        let cache = tempfile::tempdir().unwrap();
        let old = RunId::new("r20250101120000-aaaa").unwrap();
        let new = RunId::new("r20260101120000-bbbb").unwrap();
        snapshot(repo.path(), &old, cache.path()).unwrap();
        snapshot(repo.path(), &new, cache.path()).unwrap();

        let listed = list(repo.path(), cache.path()).unwrap();
        let ids: Vec<&str> = listed.iter().map(|a| a.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r20260101120000-bbbb", "r20250101120000-aaaa"]);
    }

    #[test]
    fn find_unknown_id_is_user_error() {
        let repo = plain_repo();
        let cache = tempfile::tempdir().unwrap();
        let err = find(repo.path(), cache.path(), "r20990101000000-dead").unwrap_err();
        assert!(matches!(err, RefitError::BackupNotFound { .. }));
    }
}
