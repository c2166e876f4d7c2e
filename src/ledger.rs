//! The append-only run ledger.
//!
//! One JSON record per line, flushed and synced after every append. The
//! ledger is the source of truth for progress: every other component records
//! its outcome here before acknowledging success. Readers (context builder,
//! reports) take read-only snapshots of the file; nothing ever rewrites it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::RefitError;
use crate::model::{LedgerEntry, Outcome, RunId};

/// Append handle to a ledger file. Exclusively owned by the orchestrator.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path` for appending.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened for append.
    pub fn open(path: &Path) -> Result<Self, RefitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Append one entry, then flush and sync before returning.
    ///
    /// # Errors
    /// Returns an error if serialization or the durable write fails.
    pub fn append(&mut self, entry: &LedgerEntry) -> Result<(), RefitError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::other(format!("ledger serialization: {e}")))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// The ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every entry from a ledger file. Missing file is an empty ledger.
///
/// Unparsable lines are skipped rather than failing the read: a torn final
/// line after a crash must not make the whole history unreadable.
///
/// # Errors
/// Returns an error only if the file exists but cannot be read.
pub fn read_all(path: &Path) -> Result<Vec<LedgerEntry>, RefitError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(error = %e, "skipping unparsable ledger line"),
        }
    }
    Ok(entries)
}

/// The last `n` entries of a ledger file, oldest first.
///
/// # Errors
/// Returns an error if the file exists but cannot be read.
pub fn tail(path: &Path, n: usize) -> Result<Vec<LedgerEntry>, RefitError> {
    let mut entries = read_all(path)?;
    let start = entries.len().saturating_sub(n);
    Ok(entries.split_off(start))
}

/// Per-outcome counts for one run, for the final report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    /// Batches applied and verified.
    pub applied: usize,
    /// Batches the agent declined.
    pub noop: usize,
    /// Batches blocked by the agent or constraint validation.
    pub blocked: usize,
    /// Failed verify attempts.
    pub verify_failed: usize,
    /// Worktree resets.
    pub rolled_back: usize,
    /// Cancellation events.
    pub cancelled: usize,
}

/// Summarize the entries belonging to one run.
///
/// # Errors
/// Returns an error if the ledger cannot be read.
pub fn summarize(path: &Path, run: &RunId) -> Result<LedgerSummary, RefitError> {
    let mut summary = LedgerSummary::default();
    for entry in read_all(path)? {
        if entry.run != *run {
            continue;
        }
        match entry.outcome {
            Outcome::Applied => summary.applied += 1,
            Outcome::Noop => summary.noop += 1,
            Outcome::Blocked => summary.blocked += 1,
            Outcome::VerifyFailed => summary.verify_failed += 1,
            Outcome::RolledBack => summary.rolled_back += 1,
            Outcome::Cancelled => summary.cancelled += 1,
            Outcome::Rollback => {}
        }
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchId;
    use chrono::Utc;

    fn entry(run: &RunId, batch: usize, attempt: u32, outcome: Outcome) -> LedgerEntry {
        LedgerEntry {
            run: run.clone(),
            batch: Some(BatchId::nth(batch)),
            attempt,
            at: Utc::now(),
            outcome,
            checkpoint: None,
            touched_files: Vec::new(),
            verifier: None,
            error: None,
        }
    }

    fn run_id() -> RunId {
        RunId::new("r20260101120000-abcd").unwrap()
    }

    #[test]
    fn append_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = run_id();

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry(&run, 1, 1, Outcome::Applied)).unwrap();
        ledger.append(&entry(&run, 2, 1, Outcome::Noop)).unwrap();

        let entries = read_all(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, Outcome::Applied);
        assert_eq!(entries[1].outcome, Outcome::Noop);
    }

    #[test]
    fn append_is_monotonic() {
        // Prior bytes are unchanged by later appends.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = run_id();

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry(&run, 1, 1, Outcome::Applied)).unwrap();
        let before = std::fs::read(&path).unwrap();

        ledger
            .append(&entry(&run, 2, 1, Outcome::Blocked))
            .unwrap();
        let after = std::fs::read(&path).unwrap();

        assert!(after.len() > before.len());
        assert_eq!(&after[..before.len()], &before[..]);
    }

    #[test]
    fn reopen_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = run_id();

        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.append(&entry(&run, 1, 1, Outcome::Applied)).unwrap();
        }
        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.append(&entry(&run, 2, 1, Outcome::Applied)).unwrap();
        }
        assert_eq!(read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.jsonl");
        assert!(read_all(&path).unwrap().is_empty());
        assert!(tail(&path, 5).unwrap().is_empty());
    }

    #[test]
    fn torn_final_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = run_id();

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry(&run, 1, 1, Outcome::Applied)).unwrap();
        drop(ledger);

        // Simulate a crash mid-write.
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"run\":\"r2026").unwrap();

        let entries = read_all(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn tail_returns_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = run_id();

        let mut ledger = Ledger::open(&path).unwrap();
        for i in 1..=5 {
            ledger.append(&entry(&run, i, 1, Outcome::Applied)).unwrap();
        }
        let last_two = tail(&path, 2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].batch, Some(BatchId::nth(4)));
        assert_eq!(last_two[1].batch, Some(BatchId::nth(5)));
    }

    #[test]
    fn summarize_counts_by_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = run_id();
        let other = RunId::new("r20250101120000-ffff").unwrap();

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry(&run, 1, 1, Outcome::Applied)).unwrap();
        ledger
            .append(&entry(&run, 2, 1, Outcome::VerifyFailed))
            .unwrap();
        ledger.append(&entry(&run, 2, 2, Outcome::Applied)).unwrap();
        ledger.append(&entry(&run, 3, 1, Outcome::Noop)).unwrap();
        ledger
            .append(&entry(&other, 1, 1, Outcome::Blocked))
            .unwrap();

        let summary = summarize(&path, &run).unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.verify_failed, 1);
        assert_eq!(summary.noop, 1);
        assert_eq!(summary.blocked, 0);
    }
}
