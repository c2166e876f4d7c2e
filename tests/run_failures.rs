//! Failure handling: verifier retries, persistent failures, scope policing.

mod common;

use common::{PY_SOURCE, fixture, refit_fails, refit_ok, rename_payload, run_git, tree_digest};
use serde_json::json;

/// A patch that adds a marker line the check script rejects.
fn bad_payload(file: &str) -> serde_json::Value {
    json!({
        "status": "ok",
        "rationale": "introduce a regression",
        "diff": format!(
            "--- a/{file}\n+++ b/{file}\n@@ -1,2 +1,3 @@\n def foo():\n     return 1\n+bad_marker = 1\n"
        ),
        "touched_files": [file],
    })
}

const CHECK_SH: &str = "#!/bin/sh\nif grep -q bad_marker a.py; then exit 1; fi\nexit 0\n";

/// Verifier fails on attempt 1, passes on attempt 2: the worktree resets to
/// baseline in between, and the `applied` entry carries attempt 2.
#[test]
fn verify_failure_then_retry_succeeds() {
    let fx = fixture(
        &[("a.py", PY_SOURCE), ("check.sh", CHECK_SH)],
        &[bad_payload("a.py"), rename_payload("a.py")],
        "max_batches = 1\nretry_per_batch = 1\nallow_public_api_changes = true\n\
         fast_verifier = [\"sh check.sh\"]\n",
    );

    refit_ok(&fx, &["run", ".", "--yes"]);

    assert_eq!(fx.agent_calls(), 2, "exactly two agent invocations");

    let entries = fx.ledger();
    let outcomes: Vec<(&str, u64)> = entries
        .iter()
        .map(|e| (e["outcome"].as_str().unwrap(), e["attempt"].as_u64().unwrap()))
        .collect();
    assert_eq!(outcomes, vec![("verify-failed", 1), ("applied", 2)]);

    // One checkpoint survives; the failed attempt's commit fell off the chain.
    let worktree = fx.worktree().unwrap();
    assert_eq!(run_git(&worktree, &["rev-list", "--count", "HEAD"]).trim(), "2");
    let a = std::fs::read_to_string(worktree.join("a.py")).unwrap();
    assert!(a.contains("def bar"));
    assert!(!a.contains("bad_marker"));
}

/// Verifier fails on every attempt: `retry_per_batch + 1` attempts, the
/// final entry is `verify-failed`, exit code 4, backup untouched.
#[test]
fn persistent_verify_failure_aborts_with_code_4() {
    let fx = fixture(
        &[("a.py", PY_SOURCE), ("check.sh", CHECK_SH)],
        &[bad_payload("a.py")],
        "max_batches = 1\nretry_per_batch = 2\nallow_public_api_changes = true\n\
         fast_verifier = [\"sh check.sh\"]\n",
    );
    let before = tree_digest(fx.repo.path());

    let stderr = refit_fails(&fx, &["run", ".", "--yes"], 4);
    assert!(stderr.contains("b001"), "stderr: {stderr}");

    // retry_per_batch + 1 attempts, each recorded, never more.
    assert_eq!(fx.agent_calls(), 3);
    let entries = fx.ledger();
    let verify_failed = entries
        .iter()
        .filter(|e| e["outcome"] == "verify-failed")
        .count();
    assert_eq!(verify_failed, 3);
    assert_eq!(entries.last().unwrap()["outcome"], "verify-failed");

    // Worktree sits back at the baseline; original repo and backup intact.
    let worktree = fx.worktree().unwrap();
    assert_eq!(run_git(&worktree, &["rev-list", "--count", "HEAD"]).trim(), "1");
    assert_eq!(tree_digest(fx.repo.path()), before);

    let backups = fx.cache.path().join("backups");
    assert!(backups.exists());
}

/// An out-of-scope patch is rejected and re-requested with constraint
/// language; still out of scope after retries means `blocked`, and the run
/// carries on with the remaining batches.
#[test]
fn out_of_scope_patch_blocks_batch_but_run_continues() {
    let out_of_scope = json!({
        "status": "ok",
        "rationale": "sneak in a docs edit",
        "diff": "--- a/src/a.py\n+++ b/src/a.py\n@@ -1,2 +1,2 @@\n-def foo():\n+def bar():\n     return 1\n",
        "touched_files": ["src/a.py", "README.md"],
    });
    let fx = fixture(
        &[("src/a.py", PY_SOURCE), ("README.md", "# docs\n")],
        &[
            out_of_scope.clone(),
            out_of_scope,
            common::noop_payload("giving up on the rename"),
        ],
        "max_batches = 2\nretry_per_batch = 1\nallow_public_api_changes = true\n",
    );

    refit_ok(&fx, &["run", ".", "--yes"]);

    let entries = fx.ledger();
    let outcomes: Vec<&str> = entries
        .iter()
        .filter_map(|e| e["outcome"].as_str())
        .collect();
    assert_eq!(outcomes, vec!["blocked", "noop"]);

    // The blocked entry names the out-of-scope file.
    let blocked = &entries[0];
    assert!(blocked["error"].as_str().unwrap().contains("README.md"));

    // Nothing was committed past the baseline.
    let worktree = fx.worktree().unwrap();
    assert_eq!(run_git(&worktree, &["rev-list", "--count", "HEAD"]).trim(), "1");
}

/// With public API changes disallowed (the default), a rename of an
/// exported symbol is treated as a verifier failure.
#[test]
fn public_api_regression_fails_verification() {
    let fx = fixture(
        &[("a.py", PY_SOURCE)],
        &[rename_payload("a.py")],
        "max_batches = 1\nretry_per_batch = 0\n",
    );

    refit_fails(&fx, &["run", ".", "--yes"], 4);

    let entries = fx.ledger();
    assert_eq!(entries.last().unwrap()["outcome"], "verify-failed");
    assert!(
        entries.last().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("public API"),
    );
}

/// A failing baseline aborts with exit 3 before any batch or confirmation.
#[test]
fn baseline_failure_aborts_with_code_3() {
    let fx = fixture(
        &[("a.py", PY_SOURCE)],
        &[rename_payload("a.py")],
        "max_batches = 1\nfast_verifier = [\"false\"]\n",
    );

    let stderr = refit_fails(&fx, &["run", ".", "--yes"], 3);
    assert!(stderr.contains("baseline"), "stderr: {stderr}");
    assert_eq!(fx.agent_calls(), 0, "no patch invocation before baseline");
    assert!(fx.worktree().is_none(), "worktree torn down on baseline failure");
}

/// A missing agent binary aborts with exit 5 before any mutation.
#[test]
fn missing_agent_aborts_with_code_5() {
    let fx = fixture(&[("a.py", PY_SOURCE)], &[], "");
    std::fs::write(
        fx.repo.path().join(".refit.toml"),
        "refine_plan = false\n[claude]\nbinary = \"/no/such/agent\"\n",
    )
    .unwrap();

    let stderr = refit_fails(&fx, &["run", ".", "--yes"], 5);
    assert!(stderr.contains("not installed"), "stderr: {stderr}");
    assert!(fx.worktree().is_none());
}
