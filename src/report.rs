//! The final run report.
//!
//! Renders one line per batch with its terminal outcome, checkpoint, and a
//! pointer to captured verifier output, plus the recommended recovery action
//! when the run aborted. Written to the state directory and printed.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::RefitError;
use crate::model::{LedgerEntry, Outcome, Plan, RunId, RunStatus};

/// Terminal summary of one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    /// Batch id.
    pub id: String,
    /// The batch goal.
    pub goal: String,
    /// Final outcome, if the batch was reached at all.
    pub outcome: Option<Outcome>,
    /// Attempts consumed.
    pub attempts: u32,
    /// Checkpoint commit for applied batches.
    pub checkpoint: Option<String>,
    /// One-line verifier summary from the last attempt.
    pub verifier: Option<String>,
}

/// The whole-run report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    /// The run.
    pub run_id: RunId,
    /// Terminal status.
    pub status: RunStatus,
    /// Branch holding the checkpoint chain.
    pub branch: String,
    /// Where captured verifier output lives.
    pub captures_hint: String,
    /// Per-batch terminal summaries, in plan order.
    pub batches: Vec<BatchReport>,
}

impl Report {
    /// Assemble the report from the frozen plan and the run's ledger entries.
    #[must_use]
    pub fn from_ledger(
        run_id: RunId,
        status: RunStatus,
        branch: String,
        captures_hint: String,
        plan: &Plan,
        entries: &[LedgerEntry],
    ) -> Self {
        let batches = plan
            .batches
            .iter()
            .map(|batch| {
                let last = entries
                    .iter()
                    .filter(|e| e.run == run_id && e.batch.as_ref() == Some(&batch.id))
                    .next_back();
                BatchReport {
                    id: batch.id.as_str().to_owned(),
                    goal: batch.goal.clone(),
                    outcome: last.map(|e| e.outcome),
                    attempts: last.map_or(0, |e| e.attempt),
                    checkpoint: last
                        .and_then(|e| e.checkpoint.as_ref())
                        .map(|c| c.as_str().to_owned()),
                    verifier: last.and_then(|e| e.verifier.clone()),
                }
            })
            .collect();
        Self {
            run_id,
            status,
            branch,
            captures_hint,
            batches,
        }
    }

    /// Render the report as Markdown.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# refit run {}\n", self.run_id);
        let _ = writeln!(out, "Status: **{}**", self.status);
        let _ = writeln!(out, "Branch: `{}`", self.branch);
        let _ = writeln!(out, "Verifier captures: {}\n", self.captures_hint);

        let _ = writeln!(out, "| batch | outcome | attempts | checkpoint | goal |");
        let _ = writeln!(out, "|-------|---------|----------|------------|------|");
        for b in &self.batches {
            let outcome = b
                .outcome
                .map_or_else(|| "not reached".to_owned(), |o| o.to_string());
            let checkpoint = b
                .checkpoint
                .as_deref()
                .map_or_else(|| "-".to_owned(), |c| c[..12].to_owned());
            let _ = writeln!(
                out,
                "| {} | {outcome} | {} | {checkpoint} | {} |",
                b.id, b.attempts, b.goal
            );
        }

        let _ = writeln!(out, "\n{}", self.recommendation());
        out
    }

    /// What the user should do next.
    #[must_use]
    pub fn recommendation(&self) -> String {
        match self.status {
            RunStatus::AwaitingUser => format!(
                "All batches processed and the full verifier passed.\n\
                 To accept: merge branch `{}` (refit does not merge for you).\n\
                 To discard: refit rollback <repo> --backup-id {}",
                self.branch, self.run_id
            ),
            RunStatus::Aborted => format!(
                "The run stopped early. Work up to the last checkpoint is intact on \
                 branch `{}`.\n\
                 To accept the partial result: merge that branch.\n\
                 To return to the pre-run state: refit rollback <repo> --backup-id {}",
                self.branch, self.run_id
            ),
            RunStatus::Completed => "Run accepted; nothing further to do.".to_owned(),
        }
    }

    /// Write the rendered report.
    ///
    /// # Errors
    /// Fails if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<(), RefitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
