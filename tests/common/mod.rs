//! Shared helpers for refit integration tests.
//!
//! Every test gets its own temp repo and its own cache directory (via
//! `REFIT_CACHE_DIR`), so nothing leaks between tests or into the user's
//! real cache. The external agent is a stub shell script that replays
//! pre-baked JSON payloads, one per invocation.

#![allow(dead_code)] // not every test file uses every helper

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// A repo plus its private cache dir and stub agent.
pub struct Fixture {
    pub repo: TempDir,
    pub cache: TempDir,
    stub_dir: TempDir,
}

impl Fixture {
    /// Path of the stub agent script.
    pub fn stub(&self) -> PathBuf {
        self.stub_dir.path().join("agent.sh")
    }

    /// How many non-probe agent invocations the stub served.
    pub fn agent_calls(&self) -> u32 {
        std::fs::read_to_string(self.stub_dir.path().join("count"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// The single worktree created by a run, if any.
    pub fn worktree(&self) -> Option<PathBuf> {
        let dir = self.cache.path().join("worktrees");
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        entries.sort();
        entries.pop()
    }

    /// Parsed ledger entries from the run's worktree.
    pub fn ledger(&self) -> Vec<serde_json::Value> {
        let Some(worktree) = self.worktree() else {
            return Vec::new();
        };
        let path = worktree.join(".refit").join("ledger.jsonl");
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("ledger line parses"))
            .collect()
    }
}

/// Build a git repo containing the given files, a stub agent that replays
/// `payloads` in order, and a `.refit.toml` wired to both.
pub fn fixture(files: &[(&str, &str)], payloads: &[serde_json::Value], config_extra: &str) -> Fixture {
    let repo = TempDir::new().expect("repo tempdir");
    let cache = TempDir::new().expect("cache tempdir");
    let stub_dir = TempDir::new().expect("stub tempdir");

    for (rel, content) in files {
        let path = repo.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    write_stub(stub_dir.path(), payloads);

    let fx = Fixture {
        repo,
        cache,
        stub_dir,
    };
    // Tests may override the defaults through config_extra; TOML rejects
    // duplicate keys, so only emit defaults the extra block doesn't set.
    let mut config = String::new();
    if !config_extra.contains("fast_verifier") {
        config.push_str("fast_verifier = [\"true\"]\n");
    }
    if !config_extra.contains("full_verifier") {
        config.push_str("full_verifier = [\"true\"]\n");
    }
    config.push_str("refine_plan = false\n");
    config.push_str(config_extra);
    config.push_str(&format!("\n[claude]\nbinary = \"{}\"\n", fx.stub().display()));
    std::fs::write(fx.repo.path().join(".refit.toml"), config).unwrap();

    git_init(fx.repo.path());
    fx
}

fn write_stub(dir: &Path, payloads: &[serde_json::Value]) {
    for (i, payload) in payloads.iter().enumerate() {
        std::fs::write(
            dir.join(format!("payload{}.json", i + 1)),
            serde_json::to_string(payload).unwrap(),
        )
        .unwrap();
    }
    if let Some(last) = payloads.last() {
        // Extra invocations replay the final payload.
        std::fs::write(
            dir.join("payload_default.json"),
            serde_json::to_string(last).unwrap(),
        )
        .unwrap();
    }

    let script = r#"#!/bin/sh
# Test stand-in for the external agent binary.
for arg in "$@"; do
  case "$arg" in
    --version) echo "stub-agent 1.0"; exit 0;;
  esac
done
for arg in "$@"; do last="$arg"; done
case "$last" in
  *"Reply with the single word ok"*) echo '{"result":"ok"}'; exit 0;;
esac
dir="$(dirname "$0")"
n=$(cat "$dir/count" 2>/dev/null || echo 0)
n=$((n+1))
printf '%s' "$n" > "$dir/count"
payload="$dir/payload$n.json"
[ -f "$payload" ] || payload="$dir/payload_default.json"
printf '{"result": %s}\n' "$(cat "$payload")"
"#;
    let path = dir.join("agent.sh");
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn git_init(dir: &Path) {
    run_git(dir, &["init", "-q", "-b", "main"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "user.name", "test"]);
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-q", "-m", "initial commit"]);
}

/// Run a git command in the given directory. Panics on failure.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        out.status.success(),
        "git {} failed:\nstdout: {}\nstderr: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Run refit with the fixture's cache dir.
pub fn refit_in(fx: &Fixture, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_refit"))
        .args(args)
        .current_dir(fx.repo.path())
        .env("REFIT_CACHE_DIR", fx.cache.path())
        .output()
        .expect("failed to execute refit")
}

/// Run refit and assert success. Returns stdout.
pub fn refit_ok(fx: &Fixture, args: &[&str]) -> String {
    let out = refit_in(fx, args);
    assert!(
        out.status.success(),
        "refit {} failed (code {:?}):\nstdout: {}\nstderr: {}",
        args.join(" "),
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Run refit, assert failure with the given exit code. Returns stderr.
pub fn refit_fails(fx: &Fixture, args: &[&str], expected_code: i32) -> String {
    let out = refit_in(fx, args);
    assert_eq!(
        out.status.code(),
        Some(expected_code),
        "refit {}:\nstdout: {}\nstderr: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Every file (path -> bytes) under a directory, excluding `.git`.
pub fn tree_digest(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut digest = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if name != ".git" {
                    pending.push(path);
                }
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                digest.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    digest
}

/// A unified diff renaming `foo` to `bar` in the given root-level file.
pub fn rename_diff(file: &str) -> String {
    format!(
        "--- a/{file}\n+++ b/{file}\n@@ -1,2 +1,2 @@\n-def foo():\n+def bar():\n     return 1\n"
    )
}

/// An `ok` proposal payload for a rename of one file.
pub fn rename_payload(file: &str) -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "rationale": format!("rename foo to bar in {file}"),
        "diff": rename_diff(file),
        "touched_files": [file],
    })
}

/// A noop proposal payload.
pub fn noop_payload(reason: &str) -> serde_json::Value {
    serde_json::json!({ "status": "noop", "rationale": reason })
}

/// Standard two-line python source used by most fixtures.
pub const PY_SOURCE: &str = "def foo():\n    return 1\n";
