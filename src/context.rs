//! Deterministic, budget-bounded context packs.
//!
//! For each batch the orchestrator sends the agent a single text packet:
//! the batch card, a tail of recent ledger outcomes, and bounded excerpts
//! from the most relevant in-scope files. Budgets are enforced in both
//! characters and excerpt lines; the agent never produces these summaries.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use crate::index::Index;
use crate::model::{Batch, LedgerEntry};
use crate::patch::in_scope;

/// Hard budgets for one context pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextBudget {
    /// Total character cap for the packet.
    pub max_chars: usize,
    /// Total excerpt lines across all files.
    pub max_excerpt_lines: usize,
    /// Excerpt lines around any one referenced symbol.
    pub lines_per_excerpt: usize,
    /// Files at or under this line count are included whole.
    pub tiny_file_lines: usize,
    /// Ledger entries shown as recent memory.
    pub ledger_tail: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_chars: 40_000,
            max_excerpt_lines: 600,
            lines_per_excerpt: 30,
            tiny_file_lines: 60,
            ledger_tail: 10,
        }
    }
}

/// The packet plus a manifest of every file it references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextPack {
    /// The text sent to the agent.
    pub text: String,
    /// Repo-relative paths of all referenced files, in inclusion order.
    pub manifest: Vec<String>,
}

/// Build the context pack for one batch.
///
/// Retrieval order: in-scope files recently touched per the ledger (all
/// in-scope files if none were ever touched), then in-scope files by
/// descending fan-in, then files imported by in-scope modules. Selection is
/// purely a function of its inputs.
#[must_use]
pub fn build(
    batch: &Batch,
    index: &Index,
    ledger_tail: &[LedgerEntry],
    worktree: &Path,
    excludes: &[String],
    budget: &ContextBudget,
) -> ContextPack {
    let in_scope_files: Vec<String> = index
        .files
        .keys()
        .filter(|path| in_scope(path, &batch.scope, excludes))
        .cloned()
        .collect();

    // 1. In-scope files recently touched per the ledger, most recent first.
    let mut ordered: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for entry in ledger_tail.iter().rev() {
        for path in &entry.touched_files {
            if in_scope_files.contains(path) && seen.insert(path.clone()) {
                ordered.push(path.clone());
            }
        }
    }

    // 2. The rest of the in-scope set, highest fan-in first (path as
    // tiebreak keeps the ordering a pure function of the inputs).
    let mut remaining: Vec<String> = in_scope_files
        .iter()
        .filter(|p| !seen.contains(*p))
        .cloned()
        .collect();
    remaining.sort_by_key(|path| (std::cmp::Reverse(index.fan_in(path)), path.clone()));
    for path in remaining {
        seen.insert(path.clone());
        ordered.push(path);
    }

    // 3. Files imported by in-scope modules ride at the tail.
    let scope_refs: Vec<&str> = in_scope_files.iter().map(String::as_str).collect();
    for path in index.imports_of(&scope_refs) {
        if seen.insert(path.clone()) {
            ordered.push(path);
        }
    }

    let ordered_refs: Vec<&str> = ordered.iter().map(String::as_str).collect();
    render(batch, index, ledger_tail, worktree, &ordered_refs, budget)
}

fn render(
    batch: &Batch,
    index: &Index,
    ledger_tail: &[LedgerEntry],
    worktree: &Path,
    ordered: &[&str],
    budget: &ContextBudget,
) -> ContextPack {
    let mut text = String::new();
    let mut manifest = Vec::new();
    let mut excerpt_lines = 0usize;

    let _ = writeln!(text, "## Batch {}: {}", batch.id, batch.goal);
    let _ = writeln!(text, "Scope: {}", batch.scope.join(", "));
    let ops: Vec<String> = batch.ops.iter().map(ToString::to_string).collect();
    let _ = writeln!(text, "Allowed operations: {}", ops.join(", "));
    let _ = writeln!(text, "Diff budget: {} lines", batch.diff_budget_loc);
    if !batch.notes.is_empty() {
        let _ = writeln!(text, "Notes: {}", batch.notes);
    }

    if !ledger_tail.is_empty() {
        let _ = writeln!(text, "\n## Recent outcomes");
        let start = ledger_tail.len().saturating_sub(budget.ledger_tail);
        for entry in &ledger_tail[start..] {
            let batch_id = entry
                .batch
                .as_ref()
                .map_or("-", crate::model::BatchId::as_str);
            let _ = writeln!(
                text,
                "- {batch_id} attempt {}: {}{}",
                entry.attempt,
                entry.outcome,
                entry
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }

    let _ = writeln!(text, "\n## Files");
    for path in ordered {
        if text.len() >= budget.max_chars || excerpt_lines >= budget.max_excerpt_lines {
            break;
        }
        let Some(entry) = index.files.get(*path) else {
            continue;
        };
        let mut section = String::new();
        let _ = writeln!(section, "\n### {path} ({} lines)", entry.lines);

        let content = std::fs::read_to_string(worktree.join(path)).unwrap_or_default();
        let section_lines;
        if entry.lines <= budget.tiny_file_lines && !content.is_empty() {
            section_lines = entry.lines;
            let _ = writeln!(section, "```\n{}```", ensure_trailing_newline(&content));
        } else {
            // Signatures plus a short excerpt starting at the first one.
            for symbol in &entry.symbols {
                let vis = if symbol.exported { "pub" } else { "priv" };
                let _ = writeln!(
                    section,
                    "- {:?} {} [{vis}] line {}",
                    symbol.kind, symbol.name, symbol.line
                );
            }
            let excerpt = excerpt_around(
                &content,
                entry.symbols.first().map_or(1, |s| s.line),
                budget.lines_per_excerpt,
            );
            section_lines = excerpt.lines().count();
            if !excerpt.is_empty() {
                let _ = writeln!(section, "```\n{}```", ensure_trailing_newline(&excerpt));
            }
        }

        if text.len() + section.len() > budget.max_chars
            || excerpt_lines + section_lines > budget.max_excerpt_lines
        {
            continue; // a smaller later file may still fit
        }
        excerpt_lines += section_lines;
        text.push_str(&section);
        manifest.push((*path).to_owned());
    }

    // Final hard clamp in case the header alone overflowed.
    if text.len() > budget.max_chars {
        text.truncate(budget.max_chars);
    }

    ContextPack { text, manifest }
}

fn excerpt_around(content: &str, line: usize, span: usize) -> String {
    if content.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    let start = line.saturating_sub(1);
    let end = (start + span).min(lines.len());
    lines[start..end].join("\n")
}

fn ensure_trailing_newline(s: &str) -> String {
    if s.ends_with('\n') {
        s.to_owned()
    } else {
        format!("{s}\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchId, OpKind, VerifierLevel};

    fn sample_batch() -> Batch {
        Batch {
            id: BatchId::nth(1),
            goal: "rename helpers".to_owned(),
            scope: vec!["src/**".to_owned()],
            ops: vec![OpKind::Rename],
            diff_budget_loc: 100,
            risk: 20,
            verifier: VerifierLevel::Fast,
            critical: false,
            notes: String::new(),
        }
    }

    fn tree_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Index) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let index = Index::scan(dir.path()).unwrap();
        (dir, index)
    }

    #[test]
    fn pack_contains_batch_card_and_files() {
        let (dir, index) = tree_with(&[
            ("src/a.py", "def foo():\n    return 1\n"),
            ("src/b.py", "def bar():\n    return 2\n"),
        ]);
        let pack = build(
            &sample_batch(),
            &index,
            &[],
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        assert!(pack.text.contains("Batch b001"));
        assert!(pack.text.contains("rename helpers"));
        assert!(pack.manifest.contains(&"src/a.py".to_owned()));
        assert!(pack.manifest.contains(&"src/b.py".to_owned()));
    }

    #[test]
    fn out_of_scope_files_excluded() {
        let (dir, index) = tree_with(&[
            ("src/a.py", "def foo():\n    return 1\n"),
            ("docs/readme.py", "def doc():\n    return 3\n"),
        ]);
        let pack = build(
            &sample_batch(),
            &index,
            &[],
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        assert!(pack.manifest.contains(&"src/a.py".to_owned()));
        assert!(!pack.manifest.contains(&"docs/readme.py".to_owned()));
    }

    #[test]
    fn excluded_globs_subtract_from_scope() {
        let (dir, index) = tree_with(&[
            ("src/a.py", "def foo():\n    return 1\n"),
            ("src/gen/x.py", "def gen():\n    return 0\n"),
        ]);
        let pack = build(
            &sample_batch(),
            &index,
            &[],
            dir.path(),
            &["src/gen/**".to_owned()],
            &ContextBudget::default(),
        );
        assert!(!pack.manifest.contains(&"src/gen/x.py".to_owned()));
    }

    #[test]
    fn tiny_files_included_whole() {
        let (dir, index) = tree_with(&[("src/a.py", "def foo():\n    return 1\n")]);
        let pack = build(
            &sample_batch(),
            &index,
            &[],
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        assert!(pack.text.contains("return 1"));
    }

    #[test]
    fn char_budget_is_enforced() {
        let big = "def f():\n    pass\n".repeat(400);
        let (dir, index) = tree_with(&[
            ("src/big1.py", big.as_str()),
            ("src/big2.py", big.as_str()),
        ]);
        let budget = ContextBudget {
            max_chars: 2_000,
            ..ContextBudget::default()
        };
        let pack = build(&sample_batch(), &index, &[], dir.path(), &[], &budget);
        assert!(pack.text.len() <= 2_000);
    }

    #[test]
    fn excerpt_line_budget_is_enforced() {
        let big = "def f():\n    pass\n".repeat(200);
        let (dir, index) = tree_with(&[
            ("src/a.py", big.as_str()),
            ("src/b.py", big.as_str()),
            ("src/c.py", big.as_str()),
        ]);
        let budget = ContextBudget {
            max_excerpt_lines: 40,
            lines_per_excerpt: 30,
            ..ContextBudget::default()
        };
        let pack = build(&sample_batch(), &index, &[], dir.path(), &[], &budget);
        // At most one 30-line excerpt fits under a 40-line total.
        assert!(pack.manifest.len() <= 2);
    }

    #[test]
    fn ledger_tail_rendered_most_recent() {
        use chrono::Utc;
        use crate::model::{LedgerEntry, Outcome, RunId};
        let (dir, index) = tree_with(&[("src/a.py", "def foo():\n    return 1\n")]);
        let run = RunId::new("r20260101120000-abcd").unwrap();
        let entries: Vec<LedgerEntry> = (1..=3)
            .map(|i| LedgerEntry {
                run: run.clone(),
                batch: Some(BatchId::nth(i)),
                attempt: 1,
                at: Utc::now(),
                outcome: Outcome::Applied,
                checkpoint: None,
                touched_files: Vec::new(),
                verifier: None,
                error: None,
            })
            .collect();
        let pack = build(
            &sample_batch(),
            &index,
            &entries,
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        assert!(pack.text.contains("Recent outcomes"));
        assert!(pack.text.contains("b003 attempt 1: applied"));
    }

    #[test]
    fn recently_touched_files_lead_the_pack() {
        use chrono::Utc;
        use crate::model::{LedgerEntry, Outcome, RunId};
        let (dir, index) = tree_with(&[
            ("src/a.py", "def foo():\n    return 1\n"),
            ("src/b.py", "def bar():\n    return 2\n"),
        ]);
        let entry = LedgerEntry {
            run: RunId::new("r20260101120000-abcd").unwrap(),
            batch: Some(BatchId::nth(1)),
            attempt: 1,
            at: Utc::now(),
            outcome: Outcome::Applied,
            checkpoint: None,
            touched_files: vec!["src/b.py".to_owned()],
            verifier: None,
            error: None,
        };
        let pack = build(
            &sample_batch(),
            &index,
            std::slice::from_ref(&entry),
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        assert_eq!(pack.manifest.first().map(String::as_str), Some("src/b.py"));
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let (dir, index) = tree_with(&[
            ("src/a.py", "def foo():\n    return 1\n"),
            ("src/b.py", "import a\n\ndef bar():\n    return 2\n"),
        ]);
        let one = build(
            &sample_batch(),
            &index,
            &[],
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        let two = build(
            &sample_batch(),
            &index,
            &[],
            dir.path(),
            &[],
            &ContextBudget::default(),
        );
        assert_eq!(one, two);
    }
}
