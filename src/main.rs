use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use refit::config::RefitConfig;
use refit::error::RefitError;
use refit::orchestrator::{self, RunOptions};
use refit::telemetry;

/// Plan-driven repository refactoring orchestrator
///
/// refit drives an external LLM code agent through a sequence of small,
/// verifiable changes. All edits happen in an isolated worktree: the agent
/// proposes one bounded patch per batch, each patch must survive the
/// configured verifiers before it is checkpointed, and the original repo is
/// never written to. A full backup is taken before anything runs.
///
/// SAFETY MODEL:
///   - backup first (git bundle + tree archive under the cache dir)
///   - all edits land in a second checkout on a refit/<run-id> branch
///   - one checkpoint commit per verified batch; failures reset to the
///     last checkpoint
///   - the append-only ledger records every outcome
///
/// QUICK START:
///
///   refit plan .          # inspect what refit would do
///   refit run .           # full pipeline (asks once, then autonomous)
///   refit list-backups .  # see restore points
///   refit rollback . --backup-id <run-id>
///
/// Configuration lives in .refit.toml at the repo root; see the README for
/// recognized keys (verifier commands, budgets, retries, agent binary).
#[derive(Parser)]
#[command(name = "refit")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'refit <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the repo and produce the batch plan (no worktree changes)
    ///
    /// Writes the plan artifact under the cache directory. Safe to run
    /// repeatedly; fails if a previous run's worktree is still live.
    Plan {
        /// Path to the target repository
        repo: PathBuf,
    },

    /// Run the full pipeline: backup, isolate, plan, patch, verify
    ///
    /// Prompts once for confirmation after showing the plan, then runs
    /// autonomously until the plan is exhausted, a batch fails past its
    /// retries, or ctrl-c. Ends in awaiting-user: inspect the report, then
    /// merge the refit branch or roll back.
    Run {
        /// Path to the target repository
        repo: PathBuf,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Run the baseline (fast) verifier against the repo and exit
    Verify {
        /// Path to the target repository
        repo: PathBuf,
    },

    /// Restore the repo from a named backup
    ///
    /// The backup remains in place afterwards, so rollback can be repeated.
    Rollback {
        /// Path to the target repository
        repo: PathBuf,

        /// Backup (run) id to restore, as shown by list-backups
        #[arg(long)]
        backup_id: String,
    },

    /// Enumerate cached backups for the repo, newest first
    ListBackups {
        /// Path to the target repository
        repo: PathBuf,
    },
}

fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();

    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<RefitError>()
                .map_or(1, RefitError::exit_code);
            // Exit codes fit in a byte by construction (max 130).
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            ExitCode::from(code as u8)
        }
    }
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Plan { repo } => {
            let repo = canonical(&repo)?;
            let config = RefitConfig::load(&repo)?;
            let plan = orchestrator::plan_only(&repo, &config)?;
            println!("Planned {} batch(es):", plan.batches.len());
            for batch in &plan.batches {
                println!(
                    "  {}  risk {:>3}  [{}]  {}",
                    batch.id,
                    batch.risk,
                    batch.verifier,
                    batch.goal
                );
            }
            Ok(())
        }
        Commands::Run { repo, yes } => {
            let repo = canonical(&repo)?;
            let config = RefitConfig::load(&repo)?;
            let report = orchestrator::execute_run(&repo, config, RunOptions { assume_yes: yes })?;
            println!(
                "Run {} finished: {}. Worktree kept for inspection.",
                report.run_id, report.status
            );
            Ok(())
        }
        Commands::Verify { repo } => {
            let repo = canonical(&repo)?;
            let config = RefitConfig::load(&repo)?;
            orchestrator::verify_only(&repo, &config)?;
            println!("Baseline verifier passed.");
            Ok(())
        }
        Commands::Rollback { repo, backup_id } => {
            let repo = canonical(&repo)?;
            orchestrator::rollback(&repo, &backup_id)?;
            println!("Restored {} from backup {backup_id}.", repo.display());
            Ok(())
        }
        Commands::ListBackups { repo } => {
            let repo = canonical(&repo)?;
            let backups = orchestrator::list_backups(&repo)?;
            if backups.is_empty() {
                println!("No backups found.");
                return Ok(());
            }
            for artifact in backups {
                let kind = if artifact.bundle.is_some() {
                    "bundle+archive"
                } else {
                    "archive"
                };
                println!("{}  {kind}", artifact.run_id);
            }
            Ok(())
        }
    }
}

fn canonical(repo: &std::path::Path) -> Result<PathBuf> {
    Ok(repo.canonicalize().map_err(|e| RefitError::Config {
        path: repo.to_path_buf(),
        detail: format!("repository path is not accessible: {e}"),
    })?)
}
