//! The batch state machine.
//!
//! Drives a run end to end: probe the agent, snapshot the target, prepare
//! the isolated worktree, verify the baseline, freeze the plan, then advance
//! each batch through context → agent → patch validation → apply →
//! checkpoint → verify, with retries, resets, and a durable ledger entry for
//! every outcome. One batch is active at a time; the ledger append for an
//! event is flushed before anything acknowledges that event.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::agent::{AgentDriver, Availability};
use crate::backup;
use crate::cancel::{self, CancelToken};
use crate::config::RefitConfig;
use crate::context::{self, ContextBudget};
use crate::error::RefitError;
use crate::index::Index;
use crate::ledger::{self, Ledger};
use crate::model::{
    Batch, BatchId, CommitId, LedgerEntry, Outcome, PatchProposal, Plan, ProposalStatus, RunId,
    RunRecord, RunStatus,
};
use crate::patch::{self, PatchRejection};
use crate::paths;
use crate::planner;
use crate::repo::{RepoManager, Worktree};
use crate::report::Report;
use crate::verifier::{Verifier, api_regressions, api_snapshot};

/// Where a batch currently sits in its lifecycle. Logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    /// Queued, nothing done yet.
    Pending,
    /// Context pack assembled.
    ContextBuilt,
    /// Agent subprocess invoked.
    AgentCalled,
    /// Proposal received with the given status.
    Proposed(ProposalStatus),
    /// Patch applied to the worktree.
    Applied,
    /// Verifier passed.
    Verified,
    /// Checkpoint commit recorded and acknowledged.
    Checkpointed,
    /// Terminal: agent declined.
    Nooped,
    /// Terminal: blocked by agent or constraints.
    Blocked,
    /// Patch did not apply; retry-eligible.
    ApplyFailed,
    /// Verifier failed; retry-eligible after reset.
    VerifyFailed,
}

fn transition(batch: &BatchId, state: BatchState) {
    tracing::info!(batch = %batch, ?state, "batch transition");
}

/// Knobs for one `run` invocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// Skip the interactive confirmation prompt.
    pub assume_yes: bool,
}

// ---------------------------------------------------------------------------
// Run-scoped context
// ---------------------------------------------------------------------------

/// Everything a run threads through its components. No global state.
struct RunContext {
    config: RefitConfig,
    repo: PathBuf,
    cache: PathBuf,
    run_id: RunId,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl RunContext {
    fn new(repo: &Path, config: RefitConfig, cancel: CancelToken) -> Self {
        let deadline = config
            .max_run_seconds
            .map(|s| Instant::now() + Duration::from_secs(s));
        Self {
            config,
            repo: repo.to_path_buf(),
            cache: paths::cache_root(),
            run_id: RunId::generate(Utc::now()),
            cancel,
            deadline,
        }
    }

    /// True once the user cancelled or the run ceiling elapsed.
    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            tracing::warn!("run ceiling reached, cancelling gracefully");
            self.cancel.cancel();
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// plan command
// ---------------------------------------------------------------------------

/// Index the repo and produce (and persist) a plan. No worktree is created.
///
/// # Errors
/// Fails on a stale worktree for this repo, config problems, or I/O.
pub fn plan_only(repo: &Path, config: &RefitConfig) -> Result<Plan, RefitError> {
    let cache = paths::cache_root();
    refuse_stale_worktrees(repo, &cache)?;

    let index = Index::scan(repo)?;
    let draft = planner::heuristic_plan(&index, config);

    let plan = if config.refine_plan {
        let driver = AgentDriver::new(
            &config.claude,
            repo,
            Duration::from_secs(config.command_timeout_secs),
        );
        match driver.check_available() {
            Availability::Ok => {
                let context = plan_context_summary(&index);
                match driver.plan_refine(&draft, &context, &CancelToken::new()) {
                    Ok(refined) => {
                        planner::refined_or_draft(draft, refined, config.max_batches)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "plan refinement failed, keeping draft");
                        draft
                    }
                }
            }
            _ => {
                tracing::warn!("agent unavailable, keeping heuristic draft");
                draft
            }
        }
    } else {
        draft
    };

    plan.check()
        .map_err(|detail| RefitError::Config {
            path: repo.join(".refit.toml"),
            detail,
        })?;
    planner::save_plan(&plan, &paths::plan_artifact(&cache, &paths::repo_name(repo)))?;
    Ok(plan)
}

/// A compact, deterministic repo summary for the plan refiner.
fn plan_context_summary(index: &Index) -> String {
    use std::fmt::Write as _;
    let mut out = String::from("Files (path, lines, fan-in):\n");
    for (path, entry) in &index.files {
        let _ = writeln!(out, "- {path}: {} lines, fan-in {}", entry.lines, index.fan_in(path));
        if out.len() > 8_000 {
            out.push_str("- ...\n");
            break;
        }
    }
    out
}

/// Refuse to operate while another run's worktree of this repo exists.
fn refuse_stale_worktrees(repo: &Path, cache: &Path) -> Result<(), RefitError> {
    let dir = paths::worktrees_dir(cache);
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let record_path = paths::run_record_path(&entry.path());
        let Ok(content) = std::fs::read_to_string(&record_path) else {
            continue;
        };
        let Ok(record) = serde_json::from_str::<RunRecord>(&content) else {
            continue;
        };
        if record.repo == repo && record.status.is_none() {
            return Err(RefitError::StaleWorktree { path: entry.path() });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// verify command
// ---------------------------------------------------------------------------

/// Run the baseline (fast) verifier directly against the repo. Read-only.
///
/// # Errors
/// Returns [`RefitError::BaselineFailed`] if any command fails.
pub fn verify_only(repo: &Path, config: &RefitConfig) -> Result<(), RefitError> {
    let captures = std::env::temp_dir().join("refit-verify");
    let verifier = Verifier::new(
        config.fast_verifier.clone(),
        config.full_verifier.clone(),
        Duration::from_secs(config.command_timeout_secs),
        captures,
    );
    let result = verifier.run(
        crate::model::VerifierLevel::Fast,
        repo,
        "baseline",
        &CancelToken::new(),
    )?;
    if result.passed {
        Ok(())
    } else {
        Err(RefitError::BaselineFailed {
            detail: result.summary(),
        })
    }
}

// ---------------------------------------------------------------------------
// run command
// ---------------------------------------------------------------------------

/// Execute the full pipeline. Returns the final report.
///
/// # Errors
/// Every error path maps to a documented exit code; see [`RefitError`].
#[allow(clippy::too_many_lines)]
pub fn execute_run(
    repo: &Path,
    config: RefitConfig,
    opts: RunOptions,
) -> Result<Report, RefitError> {
    let cancel = CancelToken::new();
    cancel::install_signal_handler(&cancel)?;
    let ctx = RunContext::new(repo, config, cancel);

    // Precondition: the agent must be usable before anything is mutated.
    let probe_driver = AgentDriver::new(
        &ctx.config.claude,
        &ctx.repo,
        Duration::from_secs(ctx.config.command_timeout_secs),
    );
    match probe_driver.check_available() {
        Availability::Ok => {}
        Availability::NotInstalled => {
            return Err(RefitError::AgentNotInstalled {
                binary: ctx.config.claude.binary.clone(),
            });
        }
        Availability::NotAuthenticated { detail } => {
            return Err(RefitError::AgentNotAuthenticated {
                binary: ctx.config.claude.binary.clone(),
                detail,
            });
        }
    }

    // Snapshot first, then isolate. The original repo is read-only from here.
    println!("Backing up {} ...", ctx.repo.display());
    let artifact = backup::snapshot(&ctx.repo, &ctx.run_id, &ctx.cache)?;

    let repo_mgr = RepoManager::new(&ctx.repo, &ctx.cache);
    let worktree = repo_mgr.prepare(&ctx.run_id)?;
    println!(
        "Worktree ready at {} (branch {})",
        worktree.root.display(),
        worktree.branch
    );

    let mut record = RunRecord {
        id: ctx.run_id.clone(),
        repo: ctx.repo.clone(),
        worktree: worktree.root.clone(),
        branch: worktree.branch.clone(),
        baseline: worktree.baseline.clone(),
        backup_dir: artifact.archive.parent().map(Path::to_path_buf).unwrap_or_default(),
        started: Utc::now(),
        finished: None,
        status: None,
    };
    write_record(&worktree, &record)?;

    let verifier = Verifier::new(
        ctx.config.fast_verifier.clone(),
        ctx.config.full_verifier.clone(),
        Duration::from_secs(ctx.config.command_timeout_secs),
        paths::captures_dir(&worktree.root),
    );

    // Baseline must pass on the untouched worktree, before any confirmation.
    let baseline_result = verifier.run(
        crate::model::VerifierLevel::Fast,
        &worktree.root,
        "baseline",
        &ctx.cancel,
    )?;
    if !baseline_result.passed {
        repo_mgr.teardown(&worktree, false)?;
        return Err(RefitError::BaselineFailed {
            detail: baseline_result.summary(),
        });
    }

    // Index and plan against the worktree.
    let mut index = Index::load_or_scan(&worktree.root, &paths::index_path(&worktree.root))?;
    index.write_snapshot(&paths::index_path(&worktree.root))?;
    let api_baseline = api_snapshot(&index);
    std::fs::write(
        paths::api_snapshot_path(&worktree.root),
        serde_json::to_string_pretty(&api_baseline)
            .map_err(|e| std::io::Error::other(format!("api snapshot: {e}")))?,
    )?;

    let driver = AgentDriver::new(
        &ctx.config.claude,
        &worktree.root,
        Duration::from_secs(ctx.config.command_timeout_secs),
    );
    let draft = planner::heuristic_plan(&index, &ctx.config);
    let plan = if ctx.config.refine_plan {
        match driver.plan_refine(&draft, &plan_context_summary(&index), &ctx.cancel) {
            Ok(refined) => planner::refined_or_draft(draft, refined, ctx.config.max_batches),
            Err(RefitError::Cancelled) => {
                repo_mgr.teardown(&worktree, false)?;
                return Err(RefitError::Cancelled);
            }
            Err(e) => {
                tracing::warn!(error = %e, "plan refinement failed, keeping draft");
                draft
            }
        }
    } else {
        draft
    };
    plan.check().map_err(|detail| RefitError::Config {
        path: ctx.repo.join(".refit.toml"),
        detail,
    })?;
    planner::save_plan(&plan, &paths::plan_path(&worktree.root))?;

    // One confirmation, then autonomous.
    println!(
        "Plan: {} batch(es). Backup: {}",
        plan.batches.len(),
        record.backup_dir.display()
    );
    if !opts.assume_yes && !confirm("Proceed with the run?")? {
        repo_mgr.teardown(&worktree, false)?;
        println!("Aborted before any change.");
        return Err(RefitError::Cancelled);
    }

    let mut ledger = Ledger::open(&paths::ledger_path(&worktree.root))?;
    let outcome = run_batches(
        &ctx, &repo_mgr, &worktree, &driver, &verifier, &plan, &mut ledger, &mut index,
        &api_baseline,
    );

    let status = match &outcome {
        Ok(()) => RunStatus::AwaitingUser,
        Err(_) => RunStatus::Aborted,
    };
    record.finished = Some(Utc::now());
    record.status = Some(status);
    write_record(&worktree, &record)?;

    let entries = ledger::read_all(&paths::ledger_path(&worktree.root))?;
    let report = Report::from_ledger(
        ctx.run_id.clone(),
        status,
        worktree.branch.clone(),
        paths::captures_dir(&worktree.root).display().to_string(),
        &plan,
        &entries,
    );
    report.write(&paths::report_path(&worktree.root))?;
    println!("{}", report.render());
    let summary = ledger::summarize(&paths::ledger_path(&worktree.root), &ctx.run_id)?;
    println!(
        "Totals: {} applied, {} noop, {} blocked, {} verify failures",
        summary.applied, summary.noop, summary.blocked, summary.verify_failed
    );

    // The worktree is left in place for inspection and promotion.
    outcome.map(|()| report)
}

fn confirm(question: &str) -> Result<bool, RefitError> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn write_record(worktree: &Worktree, record: &RunRecord) -> Result<(), RefitError> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| std::io::Error::other(format!("run record: {e}")))?;
    std::fs::write(paths::run_record_path(&worktree.root), json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// The batch loop
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
fn run_batches(
    ctx: &RunContext,
    repo_mgr: &RepoManager,
    worktree: &Worktree,
    driver: &AgentDriver,
    verifier: &Verifier,
    plan: &Plan,
    ledger: &mut Ledger,
    index: &mut Index,
    api_baseline: &std::collections::BTreeSet<String>,
) -> Result<(), RefitError> {
    let mut last_checkpoint = worktree.baseline.clone();
    let mut successes: u32 = 0;
    let max_attempts = ctx.config.retry_per_batch + 1;

    for batch in &plan.batches {
        transition(&batch.id, BatchState::Pending);
        if ctx.should_stop() {
            return Err(cancel_run(ctx, repo_mgr, worktree, ledger, &last_checkpoint));
        }
        println!("[{}] {}", batch.id, batch.goal);

        if batch.is_format_only() {
            run_format_batch(
                ctx, repo_mgr, worktree, verifier, batch, ledger, &mut last_checkpoint,
                &mut successes,
            )?;
            continue;
        }

        let mut constraint: Option<String> = None;
        let mut attempt: u32 = 0;
        'attempts: loop {
            attempt += 1;
            if ctx.should_stop() {
                return Err(cancel_run(ctx, repo_mgr, worktree, ledger, &last_checkpoint));
            }
            // Only refit writes here; anything else having touched the tree
            // means the isolation guarantee is already gone.
            if repo_mgr.is_dirty(worktree)? {
                return Err(RefitError::DirtyWorktree {
                    path: worktree.root.clone(),
                    detail: "uncommitted changes appeared outside a batch".to_owned(),
                });
            }

            let tail = ledger::tail(ledger.path(), ContextBudget::default().ledger_tail)?;
            let pack = context::build(
                batch,
                index,
                &tail,
                &worktree.root,
                &ctx.config.scope_excludes,
                &ContextBudget::default(),
            );
            transition(&batch.id, BatchState::ContextBuilt);

            transition(&batch.id, BatchState::AgentCalled);
            let proposal =
                match driver.propose_patch(batch, &pack.text, constraint.as_deref(), &ctx.cancel) {
                    Ok(p) => p,
                    Err(RefitError::Cancelled) => {
                        return Err(cancel_run(ctx, repo_mgr, worktree, ledger, &last_checkpoint));
                    }
                    // Payload failures already consumed the in-driver retry;
                    // treat the invocation as a blocked proposal.
                    Err(e) => PatchProposal {
                        status: ProposalStatus::Blocked,
                        rationale: e.to_string(),
                        risk_notes: vec![],
                        diff: String::new(),
                        touched_files: vec![],
                        expected_commands: vec![],
                        follow_ups: vec![],
                    },
                };
            transition(&batch.id, BatchState::Proposed(proposal.status));

            match proposal.status {
                ProposalStatus::Noop => {
                    transition(&batch.id, BatchState::Nooped);
                    append(ledger, ctx, batch, attempt, Outcome::Noop, None, &[], None, None)?;
                    println!("[{}] noop: {}", batch.id, proposal.rationale);
                    break 'attempts;
                }
                ProposalStatus::Blocked => {
                    transition(&batch.id, BatchState::Blocked);
                    append(
                        ledger, ctx, batch, attempt, Outcome::Blocked, None, &[], None,
                        Some(proposal.rationale.clone()),
                    )?;
                    if batch.critical {
                        return Err(RefitError::BatchFailed {
                            batch: batch.id.clone(),
                            attempts: attempt,
                            detail: format!("critical batch blocked: {}", proposal.rationale),
                        });
                    }
                    println!("[{}] blocked: {}", batch.id, proposal.rationale);
                    break 'attempts;
                }
                ProposalStatus::Ok => {}
            }

            // Validate, dry-run, then apply.
            let stats = match patch::validate(
                &proposal,
                batch,
                &ctx.config.scope_excludes,
                ctx.config.allow_binary_patches,
                &ctx.config.format.extensions,
            )
            .and_then(|stats| patch::check(&worktree.root, &proposal.diff).map(|()| stats))
            {
                Ok(stats) => stats,
                Err(rejection) => {
                    transition(&batch.id, BatchState::ApplyFailed);
                    if attempt >= max_attempts {
                        if rejection.is_constraint() {
                            // Out-of-scope and friends: record blocked, move on.
                            append(
                                ledger, ctx, batch, attempt, Outcome::Blocked, None, &[], None,
                                Some(rejection.to_string()),
                            )?;
                            if batch.critical {
                                return Err(RefitError::BatchFailed {
                                    batch: batch.id.clone(),
                                    attempts: attempt,
                                    detail: rejection.to_string(),
                                });
                            }
                            println!("[{}] blocked: {rejection}", batch.id);
                            break 'attempts;
                        }
                        // A patch that never applies exhausts the run.
                        append(
                            ledger, ctx, batch, attempt, Outcome::Blocked, None, &[], None,
                            Some(rejection.to_string()),
                        )?;
                        return Err(RefitError::BatchFailed {
                            batch: batch.id.clone(),
                            attempts: attempt,
                            detail: rejection.to_string(),
                        });
                    }
                    constraint = Some(constraint_language(&rejection, batch));
                    continue 'attempts;
                }
            };

            if let Err(rejection) = patch::apply(&worktree.root, &proposal.diff) {
                transition(&batch.id, BatchState::ApplyFailed);
                if attempt >= max_attempts {
                    append(
                        ledger, ctx, batch, attempt, Outcome::Blocked, None, &[], None,
                        Some(rejection.to_string()),
                    )?;
                    return Err(RefitError::BatchFailed {
                        batch: batch.id.clone(),
                        attempts: attempt,
                        detail: rejection.to_string(),
                    });
                }
                constraint = Some(constraint_language(&rejection, batch));
                continue 'attempts;
            }
            transition(&batch.id, BatchState::Applied);

            // A clean application is immediately checkpointed; a failed
            // verify resets the chain back to the previous checkpoint.
            let message = format!("refit: {} {}", batch.id, batch.goal);
            let candidate = repo_mgr.commit_checkpoint(worktree, &message)?;

            let result = match verifier.run(batch.verifier, &worktree.root, batch.id.as_str(), &ctx.cancel)
            {
                Ok(result) => result,
                Err(RefitError::Cancelled) => {
                    return Err(cancel_run(ctx, repo_mgr, worktree, ledger, &last_checkpoint));
                }
                Err(e) => return Err(e),
            };

            // Contract snapshot: exported surface must not shrink.
            let mut api_failure = None;
            if !ctx.config.allow_public_api_changes {
                let refreshed = Index::scan(&worktree.root)?;
                let regressions = api_regressions(api_baseline, &refreshed);
                if regressions.is_empty() {
                    *index = refreshed;
                } else {
                    api_failure = Some(format!(
                        "public API surface changed: removed {}",
                        regressions.join(", ")
                    ));
                }
            }

            if result.passed && api_failure.is_none() {
                transition(&batch.id, BatchState::Verified);
                // Ledger first; the checkpoint is acknowledged only after
                // the applied entry is durable.
                append(
                    ledger, ctx, batch, attempt, Outcome::Applied,
                    Some(candidate.clone()), &stats.files, Some(result.summary()), None,
                )?;
                transition(&batch.id, BatchState::Checkpointed);
                last_checkpoint = candidate;
                successes += 1;
                println!(
                    "[{}] applied at {} ({} lines)",
                    batch.id,
                    last_checkpoint.short(),
                    stats.total_lines()
                );

                if ctx.config.allow_public_api_changes {
                    refresh_index_if_needed(index, worktree, plan, batch, &stats.files)?;
                }

                if successes % ctx.config.run_full_verifier_every == 0 {
                    let full = verifier.run(
                        crate::model::VerifierLevel::Full,
                        &worktree.root,
                        &format!("periodic-{successes}"),
                        &ctx.cancel,
                    )?;
                    if !full.passed {
                        append(
                            ledger, ctx, batch, attempt, Outcome::VerifyFailed, None, &[],
                            Some(full.summary()), Some("periodic full verification failed".to_owned()),
                        )?;
                        return Err(RefitError::BatchFailed {
                            batch: batch.id.clone(),
                            attempts: attempt,
                            detail: full.summary(),
                        });
                    }
                }
                break 'attempts;
            }

            // VERIFY_FAILED: record, reset, maybe retry.
            transition(&batch.id, BatchState::VerifyFailed);
            let detail = api_failure.unwrap_or_else(|| result.summary());
            append(
                ledger, ctx, batch, attempt, Outcome::VerifyFailed, None, &[],
                Some(result.summary()), Some(detail.clone()),
            )?;
            repo_mgr.reset_to(worktree, &last_checkpoint)?;
            if !ctx.config.allow_public_api_changes {
                *index = Index::scan(&worktree.root)?;
            }
            if attempt >= max_attempts {
                return Err(RefitError::BatchFailed {
                    batch: batch.id.clone(),
                    attempts: attempt,
                    detail,
                });
            }
        }
    }

    // Final gate: the full verifier once more over the finished tree.
    let final_result = verifier.run(
        crate::model::VerifierLevel::Full,
        &worktree.root,
        "final",
        &ctx.cancel,
    )?;
    if !final_result.passed {
        if let Some(last) = plan.batches.last() {
            append(
                ledger, ctx, last, 1, Outcome::VerifyFailed, None, &[],
                Some(final_result.summary()), Some("final full verification failed".to_owned()),
            )?;
        }
        return Err(RefitError::BatchFailed {
            batch: plan
                .batches
                .last()
                .map_or_else(|| BatchId::nth(0), |b| b.id.clone()),
            attempts: 1,
            detail: final_result.summary(),
        });
    }
    Ok(())
}

/// Run the configured formatter for a format-only batch.
#[allow(clippy::too_many_arguments)]
fn run_format_batch(
    ctx: &RunContext,
    repo_mgr: &RepoManager,
    worktree: &Worktree,
    verifier: &Verifier,
    batch: &Batch,
    ledger: &mut Ledger,
    last_checkpoint: &mut CommitId,
    successes: &mut u32,
) -> Result<(), RefitError> {
    let Some(command) = ctx.config.format.command.clone() else {
        append(ledger, ctx, batch, 1, Outcome::Noop, None, &[], None, None)?;
        return Ok(());
    };

    // The formatter is the only author of format-only edits.
    let format_verifier = Verifier::new(
        vec![command],
        vec![],
        Duration::from_secs(ctx.config.command_timeout_secs),
        paths::captures_dir(&worktree.root),
    );
    let format_result = format_verifier.run(
        crate::model::VerifierLevel::Fast,
        &worktree.root,
        &format!("{}-format", batch.id),
        &ctx.cancel,
    )?;
    if !format_result.passed {
        append(
            ledger, ctx, batch, 1, Outcome::Blocked, None, &[], Some(format_result.summary()),
            Some("formatter command failed".to_owned()),
        )?;
        return Ok(());
    }

    if !repo_mgr.is_dirty(worktree)? {
        append(ledger, ctx, batch, 1, Outcome::Noop, None, &[], None, None)?;
        println!("[{}] noop: formatter made no changes", batch.id);
        return Ok(());
    }

    let message = format!("refit: {} {}", batch.id, batch.goal);
    let candidate = repo_mgr.commit_checkpoint(worktree, &message)?;
    let result = verifier.run(batch.verifier, &worktree.root, batch.id.as_str(), &ctx.cancel)?;
    if result.passed {
        append(
            ledger, ctx, batch, 1, Outcome::Applied, Some(candidate.clone()), &[],
            Some(result.summary()), None,
        )?;
        *last_checkpoint = candidate;
        *successes += 1;
        println!("[{}] applied at {}", batch.id, last_checkpoint.short());
    } else {
        append(
            ledger, ctx, batch, 1, Outcome::VerifyFailed, None, &[], Some(result.summary()),
            Some("verifier rejected formatter output".to_owned()),
        )?;
        repo_mgr.reset_to(worktree, last_checkpoint)?;
    }
    Ok(())
}

/// Refresh the index only when a later batch will look at the touched files.
fn refresh_index_if_needed(
    index: &mut Index,
    worktree: &Worktree,
    plan: &Plan,
    current: &Batch,
    touched: &[String],
) -> Result<(), RefitError> {
    let mut remaining = plan
        .batches
        .iter()
        .skip_while(|b| b.id != current.id)
        .skip(1);
    let needed = remaining.any(|later| {
        touched
            .iter()
            .any(|path| patch::in_scope(path, &later.scope, &[]))
    });
    if needed {
        *index = Index::scan(&worktree.root)?;
    }
    Ok(())
}

/// The cancellation path: reset, record, abort.
fn cancel_run(
    ctx: &RunContext,
    repo_mgr: &RepoManager,
    worktree: &Worktree,
    ledger: &mut Ledger,
    last_checkpoint: &CommitId,
) -> RefitError {
    if let Err(e) = repo_mgr.reset_to(worktree, last_checkpoint) {
        tracing::error!(error = %e, "reset during cancellation failed");
    } else {
        let _ = ledger.append(&LedgerEntry {
            run: ctx.run_id.clone(),
            batch: None,
            attempt: 1,
            at: Utc::now(),
            outcome: Outcome::RolledBack,
            checkpoint: Some(last_checkpoint.clone()),
            touched_files: Vec::new(),
            verifier: None,
            error: None,
        });
    }
    let _ = ledger.append(&LedgerEntry {
        run: ctx.run_id.clone(),
        batch: None,
        attempt: 1,
        at: Utc::now(),
        outcome: Outcome::Cancelled,
        checkpoint: None,
        touched_files: Vec::new(),
        verifier: None,
        error: None,
    });
    RefitError::Cancelled
}

/// Constraint language added to re-proposal prompts after a rejection.
fn constraint_language(rejection: &PatchRejection, batch: &Batch) -> String {
    format!(
        "your previous proposal was rejected: {rejection}. \
         Touch only files matching [{}], keep added+removed lines at or under {}, \
         and produce a unified diff that applies cleanly from the repository root.",
        batch.scope.join(", "),
        batch.diff_budget_loc
    )
}

#[allow(clippy::too_many_arguments)]
fn append(
    ledger: &mut Ledger,
    ctx: &RunContext,
    batch: &Batch,
    attempt: u32,
    outcome: Outcome,
    checkpoint: Option<CommitId>,
    touched: &[String],
    verifier: Option<String>,
    error: Option<String>,
) -> Result<(), RefitError> {
    ledger.append(&LedgerEntry {
        run: ctx.run_id.clone(),
        batch: Some(batch.id.clone()),
        attempt,
        at: Utc::now(),
        outcome,
        checkpoint,
        touched_files: touched.to_vec(),
        verifier,
        error,
    })
}

// ---------------------------------------------------------------------------
// rollback / list-backups commands
// ---------------------------------------------------------------------------

/// Restore a repo from a named backup and record the event.
///
/// # Errors
/// Fails if the backup is missing or the restore cannot complete.
pub fn rollback(repo: &Path, backup_id: &str) -> Result<(), RefitError> {
    let cache = paths::cache_root();
    let artifact = backup::find(repo, &cache, backup_id)?;
    backup::restore(&artifact, repo)?;

    // If the run's worktree is still around, its ledger gets the event.
    let worktree_root = paths::worktree_dir(&cache, backup_id);
    if worktree_root.exists()
        && let Ok(run_id) = RunId::new(backup_id)
    {
        let mut ledger = Ledger::open(&paths::ledger_path(&worktree_root))?;
        ledger.append(&LedgerEntry {
            run: run_id,
            batch: None,
            attempt: 1,
            at: Utc::now(),
            outcome: Outcome::Rollback,
            checkpoint: None,
            touched_files: Vec::new(),
            verifier: None,
            error: None,
        })?;
    }
    Ok(())
}

/// Enumerate cached backups for the repo.
///
/// # Errors
/// Fails only on unreadable cache directories.
pub fn list_backups(repo: &Path) -> Result<Vec<backup::BackupArtifact>, RefitError> {
    backup::list(repo, &paths::cache_root())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
