//! Two-phase batch planning.
//!
//! Phase one is a deterministic heuristic that orders work by risk: a
//! formatting pass first (when a formatter is configured), then import
//! cleanup and dead-code removal, local renames and extractions, test-seam
//! additions, and structural work last. Phase two optionally hands the draft
//! to the agent for refinement; a refinement that widens scope, invents
//! operation kinds, or exceeds the batch cap is rejected and the draft kept.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::RefitConfig;
use crate::error::RefitError;
use crate::index::Index;
use crate::model::{Batch, BatchId, OpKind, Plan, VerifierLevel};
use crate::patch::in_scope;

// ---------------------------------------------------------------------------
// Heuristic draft
// ---------------------------------------------------------------------------

struct PhaseSpec {
    goal: &'static str,
    ops: &'static [OpKind],
    risk: u8,
    verifier: VerifierLevel,
    /// Rough lines a single file contributes; sizes batches to the budget.
    loc_per_file: usize,
    /// One batch over the whole tree instead of per-directory groups.
    whole_tree: bool,
}

const PHASES: &[PhaseSpec] = &[
    PhaseSpec {
        goal: "Apply mechanical formatting",
        ops: &[OpKind::FormatOnly],
        risk: 5,
        verifier: VerifierLevel::Fast,
        loc_per_file: 0,
        whole_tree: true,
    },
    PhaseSpec {
        goal: "Remove unused imports and dead code",
        ops: &[OpKind::RemoveDeadCode],
        risk: 15,
        verifier: VerifierLevel::Fast,
        loc_per_file: 20,
        whole_tree: false,
    },
    PhaseSpec {
        goal: "Rename for clarity and extract small helpers",
        ops: &[OpKind::Rename, OpKind::Extract],
        risk: 30,
        verifier: VerifierLevel::Fast,
        loc_per_file: 40,
        whole_tree: false,
    },
    PhaseSpec {
        goal: "Introduce seams to improve testability",
        ops: &[OpKind::AddTestSeam, OpKind::Extract],
        risk: 45,
        verifier: VerifierLevel::Fast,
        loc_per_file: 60,
        whole_tree: false,
    },
    PhaseSpec {
        goal: "Restructure module internals",
        ops: &[OpKind::Restructure, OpKind::Extract, OpKind::Rename],
        risk: 70,
        verifier: VerifierLevel::Full,
        loc_per_file: 80,
        whole_tree: false,
    },
    PhaseSpec {
        goal: "Consolidate cross-module structure",
        ops: &[OpKind::Restructure],
        risk: 90,
        verifier: VerifierLevel::Full,
        loc_per_file: 0,
        whole_tree: true,
    },
];

/// Produce the ordered naive plan from the index.
#[must_use]
pub fn heuristic_plan(index: &Index, config: &RefitConfig) -> Plan {
    let eligible: Vec<String> = index
        .files
        .keys()
        .filter(|path| in_scope(path, &[String::from("**")], &config.scope_excludes))
        .cloned()
        .collect();

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in &eligible {
        groups
            .entry(top_dir(path))
            .or_default()
            .push(path.clone());
    }

    let mut batches = Vec::new();
    let mut n = 0usize;

    for phase in PHASES {
        if phase.ops == [OpKind::FormatOnly] && config.format.command.is_none() {
            continue;
        }
        if eligible.is_empty() {
            break;
        }
        if phase.whole_tree {
            n += 1;
            batches.push(Batch {
                id: BatchId::nth(n),
                goal: phase.goal.to_owned(),
                scope: vec!["**".to_owned()],
                ops: phase.ops.to_vec(),
                diff_budget_loc: config.diff_budget_loc,
                risk: phase.risk,
                verifier: phase.verifier,
                critical: false,
                notes: String::new(),
            });
            continue;
        }
        let cap = (config.diff_budget_loc / phase.loc_per_file.max(1)).max(1);
        for (dir, files) in &groups {
            for chunk in files.chunks(cap) {
                n += 1;
                batches.push(Batch {
                    id: BatchId::nth(n),
                    goal: format!("{} in {dir}", phase.goal),
                    scope: chunk.to_vec(),
                    ops: phase.ops.to_vec(),
                    diff_budget_loc: config.diff_budget_loc,
                    risk: phase.risk,
                    verifier: phase.verifier,
                    critical: false,
                    notes: String::new(),
                });
            }
        }
    }

    batches.truncate(config.max_batches);
    Plan { batches }
}

fn top_dir(path: &str) -> String {
    match path.split_once('/') {
        Some((dir, _)) => dir.to_owned(),
        None => ".".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Refinement validation
// ---------------------------------------------------------------------------

/// Check a refined plan against its draft's bounds.
///
/// # Errors
/// Returns a description of the first violation; the caller keeps the draft.
pub fn validate_refinement(
    draft: &Plan,
    refined: &Plan,
    max_batches: usize,
) -> Result<(), String> {
    refined.check()?;

    if refined.batches.len() > max_batches {
        return Err(format!(
            "refined plan has {} batches, over the cap of {max_batches}",
            refined.batches.len()
        ));
    }

    let draft_scope: Vec<String> = draft
        .batches
        .iter()
        .flat_map(|b| b.scope.iter().cloned())
        .collect();
    let allowed_ops: Vec<OpKind> = draft.batches.iter().flat_map(|b| b.ops.clone()).collect();

    for batch in &refined.batches {
        for pattern in &batch.scope {
            let covered = draft_scope.contains(pattern)
                || draft_scope
                    .iter()
                    .any(|d| in_scope(pattern, std::slice::from_ref(d), &[]));
            if !covered {
                return Err(format!(
                    "batch {} scope '{pattern}' is outside the draft scope",
                    batch.id
                ));
            }
        }
        for op in &batch.ops {
            if !allowed_ops.contains(op) {
                return Err(format!(
                    "batch {} uses operation '{op}' not present in the draft",
                    batch.id
                ));
            }
        }
    }
    Ok(())
}

/// Keep the refinement if it honors the draft's bounds, else the draft.
#[must_use]
pub fn refined_or_draft(draft: Plan, refined: Plan, max_batches: usize) -> Plan {
    match validate_refinement(&draft, &refined, max_batches) {
        Ok(()) => refined,
        Err(reason) => {
            tracing::warn!(%reason, "rejecting plan refinement, keeping draft");
            draft
        }
    }
}

// ---------------------------------------------------------------------------
// Plan artifact IO
// ---------------------------------------------------------------------------

/// Write a plan as pretty JSON.
///
/// # Errors
/// Returns an error if serialization or the write fails.
pub fn save_plan(plan: &Plan, path: &Path) -> Result<(), RefitError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(plan)
        .map_err(|e| std::io::Error::other(format!("plan serialization: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read a plan artifact.
///
/// # Errors
/// Returns an error if the file is missing or unparsable.
pub fn load_plan(path: &Path) -> Result<Plan, RefitError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| std::io::Error::other(format!("plan at {}: {e}", path.display())).into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
