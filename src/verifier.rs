//! Deterministic verification of the worktree.
//!
//! Runs the configured command list for a level in the worktree, one child
//! process at a time, capturing output to files under the state directory.
//! A level passes iff every command exits zero within the timeout. Output is
//! drained through a bounded channel so a chatty command cannot wedge the
//! supervisor on a full pipe.

use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use wait_timeout::ChildExt as _;

use crate::cancel::{CancelToken, terminate_child};
use crate::error::RefitError;
use crate::index::Index;
use crate::model::VerifierLevel;

/// Grace period between SIGTERM and SIGKILL for timed-out commands.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long each wait slice is; bounds cancellation latency.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Bound on buffered output lines between reader threads and the supervisor.
const LINE_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one verifier command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    /// The command as configured.
    pub command: String,
    /// Exit code; `None` means the command timed out or was cancelled.
    pub exit_code: Option<i32>,
    /// Wall-clock time spent.
    pub elapsed: Duration,
    /// Where the captured output was written.
    pub output_path: PathBuf,
}

impl CommandResult {
    /// Whether the command passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of one verifier level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifierResult {
    /// Which level ran.
    pub level: VerifierLevel,
    /// Per-command results in execution order. Stops at the first failure.
    pub commands: Vec<CommandResult>,
    /// True iff every configured command exited zero.
    pub passed: bool,
}

impl VerifierResult {
    /// One-line summary for the ledger.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.passed {
            format!("{}: {} command(s) passed", self.level, self.commands.len())
        } else {
            let failed = self
                .commands
                .iter()
                .find(|c| !c.passed())
                .map_or("?", |c| c.command.as_str());
            format!("{}: failed at '{failed}'", self.level)
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Runs configured command lists in a worktree.
#[derive(Clone, Debug)]
pub struct Verifier {
    fast: Vec<String>,
    full: Vec<String>,
    timeout: Duration,
    captures_dir: PathBuf,
}

impl Verifier {
    /// Build a verifier from the configured command lists.
    #[must_use]
    pub fn new(
        fast: Vec<String>,
        full: Vec<String>,
        timeout: Duration,
        captures_dir: PathBuf,
    ) -> Self {
        Self {
            fast,
            full,
            timeout,
            captures_dir,
        }
    }

    /// Run one level in the worktree. Stops at the first failing command.
    ///
    /// # Errors
    /// Returns `Cancelled` if the token fires mid-run; command failures are
    /// reported in the result, not as errors.
    pub fn run(
        &self,
        level: VerifierLevel,
        worktree: &Path,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<VerifierResult, RefitError> {
        let commands = match level {
            VerifierLevel::Fast => &self.fast,
            VerifierLevel::Full => &self.full,
        };
        std::fs::create_dir_all(&self.captures_dir)?;

        let mut results = Vec::new();
        let mut passed = true;
        for (i, command) in commands.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(RefitError::Cancelled);
            }
            let output_path = self
                .captures_dir
                .join(format!("{label}-{level}-{i}.log"));
            let result = self.run_one(command, worktree, &output_path, cancel)?;
            let ok = result.passed();
            tracing::debug!(command = %result.command, exit = ?result.exit_code, "verifier command done");
            results.push(result);
            if !ok {
                passed = false;
                break;
            }
        }
        Ok(VerifierResult {
            level,
            commands: results,
            passed,
        })
    }

    fn run_one(
        &self,
        command: &str,
        worktree: &Path,
        output_path: &Path,
        cancel: &CancelToken,
    ) -> Result<CommandResult, RefitError> {
        let words = shell_words::split(command)
            .map_err(|e| std::io::Error::other(format!("bad verifier command '{command}': {e}")))?;
        let Some((program, args)) = words.split_first() else {
            return Err(std::io::Error::other(format!("empty verifier command '{command}'")).into());
        };

        let start = Instant::now();
        let mut capture = std::fs::File::create(output_path)?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| std::io::Error::other(format!("failed to spawn '{command}': {e}")))?;

        let (tx, rx) = mpsc::sync_channel::<String>(LINE_BUFFER);
        let readers = [
            child.stdout.take().map(|out| spawn_reader(out, tx.clone())),
            child.stderr.take().map(|err| spawn_reader(err, tx)),
        ];

        let exit_code = loop {
            // Drain whatever is buffered before each wait slice.
            while let Ok(line) = rx.try_recv() {
                let _ = writeln!(capture, "{line}");
            }
            if cancel.is_cancelled() {
                terminate_child(&mut child, KILL_GRACE);
                break None;
            }
            if start.elapsed() >= self.timeout {
                let _ = writeln!(capture, "[refit] command timed out, terminating");
                terminate_child(&mut child, KILL_GRACE);
                break None;
            }
            match child.wait_timeout(WAIT_SLICE)? {
                Some(status) => break status.code(),
                None => continue,
            }
        };

        // Drain until both readers hang up; recv-before-join keeps a full
        // buffer from wedging the reader threads.
        while let Ok(line) = rx.recv() {
            let _ = writeln!(capture, "{line}");
        }
        for reader in readers.into_iter().flatten() {
            let _ = reader.join();
        }
        capture.flush()?;

        if cancel.is_cancelled() {
            return Err(RefitError::Cancelled);
        }
        Ok(CommandResult {
            command: command.to_owned(),
            exit_code,
            elapsed: start.elapsed(),
            output_path: output_path.to_path_buf(),
        })
    }
}

fn spawn_reader<R: std::io::Read + Send + 'static>(
    source: R,
    tx: mpsc::SyncSender<String>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            let Ok(line) = line else { break };
            // A full buffer blocks the reader, never the supervisor.
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Contract snapshots
// ---------------------------------------------------------------------------

/// Snapshot the public surface: the exported-name set from the index.
#[must_use]
pub fn api_snapshot(index: &Index) -> std::collections::BTreeSet<String> {
    index.exported_names()
}

/// Exported names that disappeared relative to a baseline snapshot.
///
/// Additions are allowed; removals and renames of public surface are what
/// break downstream consumers.
#[must_use]
pub fn api_regressions(
    baseline: &std::collections::BTreeSet<String>,
    current: &Index,
) -> Vec<String> {
    let now = current.exported_names();
    baseline.difference(&now).cloned().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_with(fast: &[&str], dir: &Path) -> Verifier {
        Verifier::new(
            fast.iter().map(|s| (*s).to_owned()).collect(),
            vec![],
            Duration::from_secs(10),
            dir.join("captures"),
        )
    }

    #[test]
    fn passing_commands_pass() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_with(&["true", "echo ok"], dir.path());
        let result = v
            .run(VerifierLevel::Fast, dir.path(), "b001", &CancelToken::new())
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.commands.len(), 2);
        assert!(result.summary().contains("2 command(s) passed"));
    }

    #[test]
    fn failure_stops_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_with(&["false", "echo never-runs"], dir.path());
        let result = v
            .run(VerifierLevel::Fast, dir.path(), "b001", &CancelToken::new())
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].exit_code, Some(1));
        assert!(result.summary().contains("failed at 'false'"));
    }

    #[test]
    fn output_is_captured_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_with(&["echo hello-capture"], dir.path());
        let result = v
            .run(VerifierLevel::Fast, dir.path(), "base", &CancelToken::new())
            .unwrap();
        let content = std::fs::read_to_string(&result.commands[0].output_path).unwrap();
        assert!(content.contains("hello-capture"));
    }

    #[test]
    fn empty_level_passes_vacuously() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_with(&[], dir.path());
        let result = v
            .run(VerifierLevel::Fast, dir.path(), "b001", &CancelToken::new())
            .unwrap();
        assert!(result.passed);
        assert!(result.commands.is_empty());
    }

    #[test]
    fn timeout_fails_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let v = Verifier::new(
            vec!["sleep 30".to_owned()],
            vec![],
            Duration::from_millis(200),
            dir.path().join("captures"),
        );
        let start = Instant::now();
        let result = v
            .run(VerifierLevel::Fast, dir.path(), "b001", &CancelToken::new())
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.commands[0].exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn cancelled_token_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let v = verifier_with(&["echo hi"], dir.path());
        let token = CancelToken::new();
        token.cancel();
        let err = v
            .run(VerifierLevel::Fast, dir.path(), "b001", &token)
            .unwrap_err();
        assert!(matches!(err, RefitError::Cancelled));
    }

    #[test]
    fn api_regressions_flag_removals_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.py"), "def kept():\n    pass\n\ndef gone():\n    pass\n")
            .unwrap();
        let baseline = api_snapshot(&Index::scan(dir.path()).unwrap());

        std::fs::write(
            dir.path().join("m.py"),
            "def kept():\n    pass\n\ndef added():\n    pass\n",
        )
        .unwrap();
        let after = Index::scan(dir.path()).unwrap();

        let regressions = api_regressions(&baseline, &after);
        assert_eq!(regressions, vec!["m.py::gone"]);
    }
}
