//! Repository configuration (`.refit.toml`).
//!
//! Defines the typed configuration read from the target repo root, including
//! verifier command lists, batch budgets, retry policy, and the external
//! agent binary. Missing fields use defaults; a missing file is all defaults.

use std::path::Path;

use serde::Deserialize;

use crate::error::RefitError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level refit configuration, parsed from `.refit.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefitConfig {
    /// Glob list subtracted from every batch scope.
    #[serde(default = "default_scope_excludes")]
    pub scope_excludes: Vec<String>,

    /// Ordered command list for the per-batch (fast) verifier level.
    #[serde(default)]
    pub fast_verifier: Vec<String>,

    /// Ordered command list for the periodic/final (full) verifier level.
    #[serde(default)]
    pub full_verifier: Vec<String>,

    /// Hard cap on plan length.
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,

    /// Default per-batch added+removed line budget.
    #[serde(default = "default_diff_budget_loc")]
    pub diff_budget_loc: usize,

    /// Max re-attempts on apply or verify failure.
    #[serde(default = "default_retry_per_batch")]
    pub retry_per_batch: u32,

    /// Run the full verifier after every N successful batches.
    #[serde(default = "default_run_full_verifier_every")]
    pub run_full_verifier_every: u32,

    /// When false, a public-API snapshot mismatch fails verification.
    #[serde(default)]
    pub allow_public_api_changes: bool,

    /// When false, binary hunks in a patch are rejected.
    #[serde(default)]
    pub allow_binary_patches: bool,

    /// Per-command timeout (verifier commands and agent invocations).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Optional ceiling on total run time; exceeding it cancels gracefully.
    #[serde(default)]
    pub max_run_seconds: Option<u64>,

    /// Hand the heuristic plan to the agent for refinement.
    #[serde(default = "default_refine_plan")]
    pub refine_plan: bool,

    /// External agent settings.
    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Formatter settings for format-only batches.
    #[serde(default)]
    pub format: FormatConfig,
}

impl Default for RefitConfig {
    fn default() -> Self {
        Self {
            scope_excludes: default_scope_excludes(),
            fast_verifier: Vec::new(),
            full_verifier: Vec::new(),
            max_batches: default_max_batches(),
            diff_budget_loc: default_diff_budget_loc(),
            retry_per_batch: default_retry_per_batch(),
            run_full_verifier_every: default_run_full_verifier_every(),
            allow_public_api_changes: false,
            allow_binary_patches: false,
            command_timeout_secs: default_command_timeout_secs(),
            max_run_seconds: None,
            refine_plan: default_refine_plan(),
            claude: ClaudeConfig::default(),
            format: FormatConfig::default(),
        }
    }
}

fn default_scope_excludes() -> Vec<String> {
    vec![".git/**".to_owned(), ".refit/**".to_owned()]
}

const fn default_max_batches() -> usize {
    200
}

const fn default_diff_budget_loc() -> usize {
    120
}

const fn default_retry_per_batch() -> u32 {
    2
}

const fn default_run_full_verifier_every() -> u32 {
    5
}

const fn default_command_timeout_secs() -> u64 {
    600
}

const fn default_refine_plan() -> bool {
    true
}

// ---------------------------------------------------------------------------
// ClaudeConfig
// ---------------------------------------------------------------------------

/// Settings for the external LLM agent binary.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaudeConfig {
    /// Path or name of the agent binary.
    #[serde(default = "default_claude_binary")]
    pub binary: String,

    /// Tool allowlist passed through to the agent. `tools` is accepted as an
    /// alias for compatibility with older config files.
    #[serde(default = "default_allowed_tools", alias = "tools")]
    pub allowed_tools: Vec<String>,

    /// Turn cap for patch-producing invocations.
    #[serde(default = "default_max_turns_patcher")]
    pub max_turns_patcher: u32,

    /// Turn cap for plan-refinement invocations.
    #[serde(default = "default_max_turns_planner")]
    pub max_turns_planner: u32,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: default_claude_binary(),
            allowed_tools: default_allowed_tools(),
            max_turns_patcher: default_max_turns_patcher(),
            max_turns_planner: default_max_turns_planner(),
        }
    }
}

fn default_claude_binary() -> String {
    "claude".to_owned()
}

fn default_allowed_tools() -> Vec<String> {
    vec!["Read".to_owned(), "Grep".to_owned(), "Glob".to_owned()]
}

const fn default_max_turns_patcher() -> u32 {
    30
}

const fn default_max_turns_planner() -> u32 {
    15
}

// ---------------------------------------------------------------------------
// FormatConfig
// ---------------------------------------------------------------------------

/// Formatter used for format-only batches.
///
/// Format-only edits are produced by running this command in the worktree,
/// never by model-authored hunks. When no command is configured the planner
/// skips the formatting pass entirely.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    /// The formatter command, e.g. `"black ."` or `"cargo fmt"`.
    #[serde(default)]
    pub command: Option<String>,

    /// File extensions the formatter owns (without dots).
    #[serde(default = "default_format_extensions")]
    pub extensions: Vec<String>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            command: None,
            extensions: default_format_extensions(),
        }
    }
}

fn default_format_extensions() -> Vec<String> {
    ["py", "rs", "js", "ts", "go"]
        .map(str::to_owned)
        .to_vec()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl RefitConfig {
    /// Load config from `<repo>/.refit.toml`. Missing file is all defaults.
    ///
    /// # Errors
    /// Returns [`RefitError::Config`] on unreadable or unparsable files.
    pub fn load(repo_root: &Path) -> Result<Self, RefitError> {
        let path = repo_root.join(".refit.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| RefitError::Config {
            path: path.clone(),
            detail: format!("failed to read: {e}"),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| RefitError::Config {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        config.validate(&path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), RefitError> {
        let fail = |detail: String| RefitError::Config {
            path: path.to_path_buf(),
            detail,
        };
        if self.max_batches == 0 {
            return Err(fail("max_batches must be at least 1".to_owned()));
        }
        if self.diff_budget_loc == 0 {
            return Err(fail("diff_budget_loc must be at least 1".to_owned()));
        }
        if self.run_full_verifier_every == 0 {
            return Err(fail(
                "run_full_verifier_every must be at least 1".to_owned(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(fail("command_timeout_secs must be at least 1".to_owned()));
        }
        for pattern in &self.scope_excludes {
            glob::Pattern::new(pattern)
                .map_err(|e| fail(format!("bad glob in scope_excludes '{pattern}': {e}")))?;
        }
        Ok(())
    }

    /// The commands configured for the given verifier level.
    #[must_use]
    pub fn verifier_commands(&self, level: crate::model::VerifierLevel) -> &[String] {
        match level {
            crate::model::VerifierLevel::Fast => &self.fast_verifier,
            crate::model::VerifierLevel::Full => &self.full_verifier,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
