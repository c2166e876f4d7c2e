//! Core domain types for refit runs, batches, and agent proposals.
//!
//! Foundation types used throughout refit: run and batch identifiers, commit
//! IDs, the frozen plan, agent patch proposals, and ledger entries. Outcome
//! and status types are closed enumerations; there is no open-ended state.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CommitId
// ---------------------------------------------------------------------------

/// A validated 40-character lowercase hex git commit ID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Create a new `CommitId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the string is not exactly 40 lowercase hex characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the inner hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 12 characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.len() != 40 {
            return Err(ValidationError {
                kind: ErrorKind::CommitId,
                value: s.to_owned(),
                reason: format!("expected 40 hex characters, got {}", s.len()),
            });
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ValidationError {
                kind: ErrorKind::CommitId,
                value: s.to_owned(),
                reason: "must contain only lowercase hex characters (0-9, a-f)".to_owned(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommitId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CommitId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A time-sortable run identifier: `r<yyyymmddHHMMSS>-<4 hex>`.
///
/// Lexicographic order on run IDs equals chronological order, which keeps the
/// worktree and backup directory listings sorted by age.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run ID from the given instant plus random suffix.
    #[must_use]
    pub fn generate(now: DateTime<Utc>) -> Self {
        use rand::Rng as _;
        let suffix: u16 = rand::rng().random();
        Self(format!("r{}-{suffix:04x}", now.format("%Y%m%d%H%M%S")))
    }

    /// Parse and validate a run ID.
    ///
    /// # Errors
    /// Returns an error if the string does not have the `r<14 digits>-<4 hex>` shape.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the run ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let bad = |reason: &str| ValidationError {
            kind: ErrorKind::RunId,
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        let rest = s.strip_prefix('r').ok_or_else(|| bad("must start with 'r'"))?;
        let (stamp, suffix) = rest
            .split_once('-')
            .ok_or_else(|| bad("missing '-' separator"))?;
        if stamp.len() != 14 || !stamp.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad("timestamp must be 14 digits (yyyymmddHHMMSS)"));
        }
        if suffix.len() != 4
            || !suffix
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(bad("suffix must be 4 lowercase hex characters"));
        }
        Ok(())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// BatchId
// ---------------------------------------------------------------------------

/// A batch identifier, unique within a run: `b` followed by digits (`b001`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchId(String);

impl BatchId {
    /// Build the nth batch ID (1-based), zero-padded to three digits.
    #[must_use]
    pub fn nth(n: usize) -> Self {
        Self(format!("b{n:03}"))
    }

    /// Parse and validate a batch ID.
    ///
    /// # Errors
    /// Returns an error if the string is not `b` followed by 1-6 digits.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the batch ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let digits = s.strip_prefix('b').unwrap_or("");
        if digits.is_empty() || digits.len() > 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError {
                kind: ErrorKind::BatchId,
                value: s.to_owned(),
                reason: "must be 'b' followed by 1-6 digits, e.g. b001".to_owned(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BatchId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BatchId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<BatchId> for String {
    fn from(id: BatchId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// OpKind
// ---------------------------------------------------------------------------

/// The kinds of change a batch is allowed to make.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    /// Whitespace and formatting only, produced by the configured formatter.
    FormatOnly,
    /// Remove unused imports and provably dead code.
    RemoveDeadCode,
    /// Rename a symbol within the batch scope.
    Rename,
    /// Extract a function, constant, or small module.
    Extract,
    /// Introduce a seam (interface, parameter) to make code testable.
    AddTestSeam,
    /// Restructure code within existing module boundaries.
    Restructure,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FormatOnly => "format-only",
            Self::RemoveDeadCode => "remove-dead-code",
            Self::Rename => "rename",
            Self::Extract => "extract",
            Self::AddTestSeam => "add-test-seam",
            Self::Restructure => "restructure",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// VerifierLevel
// ---------------------------------------------------------------------------

/// Which configured verifier command list a batch requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifierLevel {
    /// The quick per-batch list (type check, lint, fast tests).
    #[default]
    Fast,
    /// The exhaustive list, run periodically and at the end of the run.
    Full,
}

impl fmt::Display for VerifierLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Full => write!(f, "full"),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// An atomic unit of planned work. Immutable once the plan is frozen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Identifier, unique within the run.
    pub id: BatchId,
    /// Human-readable goal, embedded in the checkpoint commit message.
    pub goal: String,
    /// Path glob patterns the batch may touch.
    pub scope: Vec<String>,
    /// Operation kinds the agent is allowed to perform.
    pub ops: Vec<OpKind>,
    /// Maximum added+removed lines for this batch's patch.
    pub diff_budget_loc: usize,
    /// Risk score 0-100; drives plan ordering.
    pub risk: u8,
    /// Verifier level required after this batch.
    #[serde(default)]
    pub verifier: VerifierLevel,
    /// A blocked critical batch aborts the whole run.
    #[serde(default)]
    pub critical: bool,
    /// Free-form planner notes forwarded to the agent.
    #[serde(default)]
    pub notes: String,
}

impl Batch {
    /// Whether this batch is restricted to formatter-produced edits.
    #[must_use]
    pub fn is_format_only(&self) -> bool {
        self.ops == [OpKind::FormatOnly]
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The frozen, ordered batch list for a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Batches in execution order.
    pub batches: Vec<Batch>,
}

impl Plan {
    /// Validate internal consistency: unique batch IDs, non-empty scopes.
    ///
    /// # Errors
    /// Returns a description of the first violation found.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for batch in &self.batches {
            if !seen.insert(&batch.id) {
                return Err(format!("duplicate batch id {}", batch.id));
            }
            if batch.scope.is_empty() {
                return Err(format!("batch {} has an empty scope", batch.id));
            }
            if batch.ops.is_empty() {
                return Err(format!("batch {} has no allowed operations", batch.id));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PatchProposal
// ---------------------------------------------------------------------------

/// What one agent invocation reported for one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalStatus {
    /// A patch is attached.
    Ok,
    /// The agent chose to change nothing for this batch.
    Noop,
    /// The agent could not produce a safe patch.
    Blocked,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Noop => write!(f, "noop"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Output of one agent invocation for one batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    /// Whether the agent produced a patch, declined, or was blocked.
    pub status: ProposalStatus,
    /// Why the agent did what it did.
    #[serde(default)]
    pub rationale: String,
    /// Risks the agent wants recorded.
    #[serde(default)]
    pub risk_notes: Vec<String>,
    /// Unified diff text; empty for noop/blocked.
    #[serde(default)]
    pub diff: String,
    /// Files the agent claims the diff touches.
    #[serde(default)]
    pub touched_files: Vec<String>,
    /// Verifier commands the agent expects to pass.
    #[serde(default)]
    pub expected_commands: Vec<String>,
    /// Suggested follow-up work outside this batch's scope.
    #[serde(default)]
    pub follow_ups: Vec<String>,
}

// ---------------------------------------------------------------------------
// Ledger entries
// ---------------------------------------------------------------------------

/// Terminal outcome of one batch attempt (or a run-level event).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Patch applied cleanly and the verifier passed.
    Applied,
    /// The agent declined to change anything.
    Noop,
    /// The agent (or constraint validation) could not produce a usable patch.
    Blocked,
    /// The verifier failed for this attempt.
    VerifyFailed,
    /// The worktree was reset to a prior checkpoint.
    RolledBack,
    /// The run was cancelled at an external wait point.
    Cancelled,
    /// A user-initiated restore from backup.
    Rollback,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::Noop => "noop",
            Self::Blocked => "blocked",
            Self::VerifyFailed => "verify-failed",
            Self::RolledBack => "rolled-back",
            Self::Cancelled => "cancelled",
            Self::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// One append-only ledger record. Never rewritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The run this entry belongs to.
    pub run: RunId,
    /// The batch, if the event is batch-scoped.
    pub batch: Option<BatchId>,
    /// 1-based attempt index within the batch.
    pub attempt: u32,
    /// When the outcome was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub outcome: Outcome,
    /// Checkpoint commit, present for `applied`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CommitId>,
    /// Files the applied patch touched, for scope auditing and retrieval.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_files: Vec<String>,
    /// One-line verifier summary, when a verifier ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
    /// Error detail for failed outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Run record
// ---------------------------------------------------------------------------

/// Terminal status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// The user accepted the result (promotion happens externally).
    Completed,
    /// The run stopped: fatal error, persistent batch failure, or cancellation.
    Aborted,
    /// All batches processed; final verifier passed; waiting for the user.
    AwaitingUser,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::AwaitingUser => write!(f, "awaiting-user"),
        }
    }
}

/// One top-level refactor attempt. Immutable except status and end time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Stable, time-sortable identifier.
    pub id: RunId,
    /// The original repository (never written to).
    pub repo: PathBuf,
    /// The isolated working copy.
    pub worktree: PathBuf,
    /// The branch holding the checkpoint chain.
    pub branch: String,
    /// The commit the worktree started at.
    pub baseline: CommitId,
    /// Where the pre-run backup lives.
    pub backup_dir: PathBuf,
    /// Run start time.
    pub started: DateTime<Utc>,
    /// Run end time, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Terminal status, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// The kind of value that failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A [`CommitId`] validation error.
    CommitId,
    /// A [`RunId`] validation error.
    RunId,
    /// A [`BatchId`] validation error.
    BatchId,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommitId => write!(f, "CommitId"),
            Self::RunId => write!(f, "RunId"),
            Self::BatchId => write!(f, "BatchId"),
        }
    }
}

/// A validation error for refit core types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// What kind of value was being validated.
    pub kind: ErrorKind,
    /// The invalid value.
    pub value: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- CommitId --

    #[test]
    fn commit_id_valid() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let id = CommitId::new(hex).unwrap();
        assert_eq!(id.as_str(), hex);
        assert_eq!(id.short(), "0123456789ab");
    }

    #[test]
    fn commit_id_rejects_short() {
        assert!(CommitId::new("abc123").is_err());
    }

    #[test]
    fn commit_id_rejects_uppercase() {
        let hex = "A".repeat(40);
        assert!(CommitId::new(&hex).is_err());
    }

    #[test]
    fn commit_id_serde_roundtrip() {
        let hex = "d".repeat(40);
        let id = CommitId::new(&hex).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{hex}\""));
        let decoded: CommitId = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn commit_id_serde_rejects_invalid() {
        assert!(serde_json::from_str::<CommitId>("\"nope\"").is_err());
    }

    // -- RunId --

    #[test]
    fn run_id_generate_is_valid() {
        let id = RunId::generate(Utc::now());
        assert!(RunId::new(id.as_str()).is_ok());
    }

    #[test]
    fn run_id_sorts_by_time() {
        let a = RunId::new("r20260101000000-ffff").unwrap();
        let b = RunId::new("r20260102000000-0000").unwrap();
        assert!(a < b);
    }

    #[test]
    fn run_id_rejects_bad_prefix() {
        assert!(RunId::new("x20260101000000-abcd").is_err());
    }

    #[test]
    fn run_id_rejects_short_stamp() {
        assert!(RunId::new("r2026-abcd").is_err());
    }

    #[test]
    fn run_id_rejects_bad_suffix() {
        assert!(RunId::new("r20260101000000-XYZW").is_err());
        assert!(RunId::new("r20260101000000-abc").is_err());
    }

    // -- BatchId --

    #[test]
    fn batch_id_nth() {
        assert_eq!(BatchId::nth(1).as_str(), "b001");
        assert_eq!(BatchId::nth(42).as_str(), "b042");
        assert_eq!(BatchId::nth(1234).as_str(), "b1234");
    }

    #[test]
    fn batch_id_rejects_garbage() {
        assert!(BatchId::new("batch-1").is_err());
        assert!(BatchId::new("b").is_err());
        assert!(BatchId::new("1").is_err());
    }

    // -- enums --

    #[test]
    fn op_kind_serde_kebab() {
        let json = serde_json::to_string(&OpKind::RemoveDeadCode).unwrap();
        assert_eq!(json, "\"remove-dead-code\"");
        let decoded: OpKind = serde_json::from_str("\"format-only\"").unwrap();
        assert_eq!(decoded, OpKind::FormatOnly);
    }

    #[test]
    fn outcome_display_matches_serde() {
        for outcome in [
            Outcome::Applied,
            Outcome::Noop,
            Outcome::Blocked,
            Outcome::VerifyFailed,
            Outcome::RolledBack,
            Outcome::Cancelled,
            Outcome::Rollback,
        ] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{outcome}\""));
        }
    }

    #[test]
    fn verifier_level_default_is_fast() {
        assert_eq!(VerifierLevel::default(), VerifierLevel::Fast);
    }

    // -- Batch / Plan --

    fn sample_batch(n: usize) -> Batch {
        Batch {
            id: BatchId::nth(n),
            goal: format!("batch {n}"),
            scope: vec!["src/**".to_owned()],
            ops: vec![OpKind::Rename],
            diff_budget_loc: 120,
            risk: 30,
            verifier: VerifierLevel::Fast,
            critical: false,
            notes: String::new(),
        }
    }

    #[test]
    fn batch_format_only_detection() {
        let mut b = sample_batch(1);
        assert!(!b.is_format_only());
        b.ops = vec![OpKind::FormatOnly];
        assert!(b.is_format_only());
        b.ops = vec![OpKind::FormatOnly, OpKind::Rename];
        assert!(!b.is_format_only());
    }

    #[test]
    fn plan_check_accepts_valid() {
        let plan = Plan {
            batches: vec![sample_batch(1), sample_batch(2)],
        };
        assert!(plan.check().is_ok());
    }

    #[test]
    fn plan_check_rejects_duplicate_ids() {
        let plan = Plan {
            batches: vec![sample_batch(1), sample_batch(1)],
        };
        let err = plan.check().unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn plan_check_rejects_empty_scope() {
        let mut batch = sample_batch(1);
        batch.scope.clear();
        let plan = Plan {
            batches: vec![batch],
        };
        assert!(plan.check().unwrap_err().contains("empty scope"));
    }

    // -- PatchProposal --

    #[test]
    fn proposal_minimal_json() {
        // Optional fields default so a terse agent payload still parses.
        let p: PatchProposal = serde_json::from_str(r#"{"status":"noop"}"#).unwrap();
        assert_eq!(p.status, ProposalStatus::Noop);
        assert!(p.diff.is_empty());
        assert!(p.touched_files.is_empty());
    }

    #[test]
    fn proposal_full_roundtrip() {
        let p = PatchProposal {
            status: ProposalStatus::Ok,
            rationale: "rename foo to bar".to_owned(),
            risk_notes: vec!["shadowing possible".to_owned()],
            diff: "--- a/a.py\n+++ b/a.py\n".to_owned(),
            touched_files: vec!["a.py".to_owned()],
            expected_commands: vec!["pytest -q".to_owned()],
            follow_ups: vec![],
        };
        let json = serde_json::to_string(&p).unwrap();
        let decoded: PatchProposal = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, p);
    }

    // -- LedgerEntry --

    #[test]
    fn ledger_entry_roundtrip() {
        let entry = LedgerEntry {
            run: RunId::new("r20260101120000-abcd").unwrap(),
            batch: Some(BatchId::nth(3)),
            attempt: 2,
            at: Utc::now(),
            outcome: Outcome::Applied,
            checkpoint: Some(CommitId::new(&"e".repeat(40)).unwrap()),
            touched_files: vec!["src/a.py".to_owned()],
            verifier: Some("fast: 2 commands passed".to_owned()),
            error: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        let decoded: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn ledger_entry_omits_empty_options() {
        let entry = LedgerEntry {
            run: RunId::new("r20260101120000-abcd").unwrap(),
            batch: None,
            attempt: 1,
            at: Utc::now(),
            outcome: Outcome::Cancelled,
            checkpoint: None,
            touched_files: Vec::new(),
            verifier: None,
            error: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("checkpoint"));
        assert!(!json.contains("touched_files"));
        assert!(!json.contains("error"));
    }
}
