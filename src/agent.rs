//! Driver for the external LLM code agent.
//!
//! The agent is an untrusted oracle invoked headless, one fresh session per
//! call: prompt on argv, JSON on stdout, structured output locked to a
//! schema. The runtime is asked to validate against the schema and the
//! driver validates again locally. Prompts and schemas are versioned files
//! compiled into the binary, never synthesized at runtime. A bad payload is
//! retried once with a stricter reminder, then reported upward as blocked.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use wait_timeout::ChildExt as _;

use crate::cancel::{CancelToken, terminate_child};
use crate::config::ClaudeConfig;
use crate::error::RefitError;
use crate::model::{Batch, PatchProposal, Plan};

/// System prompt for plan refinement.
pub const PLANNER_SYSTEM_PROMPT: &str = include_str!("../prompts/planner.md");
/// System prompt for patch proposals.
pub const PATCHER_SYSTEM_PROMPT: &str = include_str!("../prompts/patcher.md");
/// Schema the planner response must satisfy.
pub const PLANNER_SCHEMA: &str = include_str!("../prompts/schemas/planner.json");
/// Schema the patcher response must satisfy.
pub const PATCHER_SCHEMA: &str = include_str!("../prompts/schemas/patcher.json");

const STRICT_REMINDER: &str = "REMINDER: respond with a single JSON object that conforms \
     exactly to the provided schema. No prose, no markdown fences, no keys beyond the schema.\n\n";

const PROBE_PROMPT: &str = "Reply with the single word ok.";

/// Grace period between SIGTERM and SIGKILL for a hung agent.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Wait slice while supervising the agent child.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Bound on buffered stdout lines from the agent.
const LINE_BUFFER: usize = 1024;

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Result of the pre-run agent probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Availability {
    /// Installed and able to answer a trivial prompt.
    Ok,
    /// The binary could not be executed.
    NotInstalled,
    /// The binary runs but the trivial prompt failed.
    NotAuthenticated {
        /// What the probe observed.
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Invokes the external agent binary with schema-locked prompts.
#[derive(Clone, Debug)]
pub struct AgentDriver {
    binary: String,
    allowed_tools: Vec<String>,
    max_turns_patcher: u32,
    max_turns_planner: u32,
    timeout: Duration,
    workdir: PathBuf,
}

impl AgentDriver {
    /// A driver bound to one working directory (the worktree).
    #[must_use]
    pub fn new(config: &ClaudeConfig, workdir: &Path, timeout: Duration) -> Self {
        Self {
            binary: config.binary.clone(),
            allowed_tools: config.allowed_tools.clone(),
            max_turns_patcher: config.max_turns_patcher,
            max_turns_planner: config.max_turns_planner,
            timeout,
            workdir: workdir.to_path_buf(),
        }
    }

    /// Probe the agent: can it run, and can it answer at all?
    #[must_use]
    pub fn check_available(&self) -> Availability {
        let probe = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match probe {
            Err(_) => return Availability::NotInstalled,
            Ok(status) if !status.success() => return Availability::NotInstalled,
            Ok(_) => {}
        }
        // Authentication is tested with a trivial prompt.
        match self.invoke_once(PROBE_PROMPT, None, None, 1, &CancelToken::new()) {
            Ok(_) => Availability::Ok,
            Err(InvokeFailure::Fatal(e)) => Availability::NotAuthenticated {
                detail: e.to_string(),
            },
            Err(InvokeFailure::Payload(detail) | InvokeFailure::Timeout(detail)) => {
                Availability::NotAuthenticated { detail }
            }
        }
    }

    /// Ask the agent to refine a draft plan. Bound by the planner schema.
    ///
    /// # Errors
    /// Returns `AgentPayload` after a failed retry, `Cancelled` on cancel.
    pub fn plan_refine(
        &self,
        draft: &Plan,
        context: &str,
        cancel: &CancelToken,
    ) -> Result<Plan, RefitError> {
        let draft_json = serde_json::to_string_pretty(draft)
            .map_err(|e| std::io::Error::other(format!("draft serialization: {e}")))?;
        let prompt = format!(
            "Refine this draft refactoring plan. Keep every batch inside the draft's \
             scope and operation kinds; merge, split, reorder, or drop batches as useful.\n\n\
             ## Draft plan\n```json\n{draft_json}\n```\n\n## Repository context\n{context}"
        );
        let value = self.invoke_validated(
            &prompt,
            PLANNER_SYSTEM_PROMPT,
            PLANNER_SCHEMA,
            self.max_turns_planner,
            cancel,
        )?;
        serde_json::from_value(value).map_err(|e| RefitError::AgentPayload {
            detail: format!("planner response did not decode: {e}"),
        })
    }

    /// Ask the agent for exactly one patch proposal for one batch.
    ///
    /// `constraint` carries added constraint language on re-proposals after
    /// a rejected patch.
    ///
    /// # Errors
    /// Returns `AgentPayload` after a failed retry, `Cancelled` on cancel.
    pub fn propose_patch(
        &self,
        batch: &Batch,
        context_pack: &str,
        constraint: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<PatchProposal, RefitError> {
        let mut prompt = String::new();
        if let Some(text) = constraint {
            prompt.push_str("CONSTRAINT: ");
            prompt.push_str(text);
            prompt.push_str("\n\n");
        }
        prompt.push_str(context_pack);
        tracing::debug!(batch = %batch.id, retry = constraint.is_some(), "invoking patcher");

        let value = self.invoke_validated(
            &prompt,
            PATCHER_SYSTEM_PROMPT,
            PATCHER_SCHEMA,
            self.max_turns_patcher,
            cancel,
        )?;
        serde_json::from_value(value).map_err(|e| RefitError::AgentPayload {
            detail: format!("patcher response did not decode: {e}"),
        })
    }

    // -- invocation plumbing --

    fn invoke_validated(
        &self,
        prompt: &str,
        system_prompt: &str,
        schema: &str,
        max_turns: u32,
        cancel: &CancelToken,
    ) -> Result<serde_json::Value, RefitError> {
        match self.invoke_once(prompt, Some(system_prompt), Some(schema), max_turns, cancel) {
            Ok(value) => Ok(value),
            Err(InvokeFailure::Fatal(e)) => Err(e),
            Err(InvokeFailure::Payload(first) | InvokeFailure::Timeout(first)) => {
                tracing::warn!(detail = %first, "agent payload invalid, retrying with reminder");
                let stricter = format!("{STRICT_REMINDER}{prompt}");
                match self.invoke_once(&stricter, Some(system_prompt), Some(schema), max_turns, cancel)
                {
                    Ok(value) => Ok(value),
                    Err(InvokeFailure::Fatal(e)) => Err(e),
                    Err(InvokeFailure::Payload(second) | InvokeFailure::Timeout(second)) => {
                        Err(RefitError::AgentPayload {
                            detail: format!("first: {first}; retry: {second}"),
                        })
                    }
                }
            }
        }
    }

    fn invoke_once(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        schema: Option<&str>,
        max_turns: u32,
        cancel: &CancelToken,
    ) -> Result<serde_json::Value, InvokeFailure> {
        use std::io::Write as _;

        // The system prompt travels by file path; keep the handle alive for
        // the duration of the call.
        let system_file = match system_prompt {
            Some(text) => {
                let mut file = tempfile::NamedTempFile::new()
                    .map_err(|e| InvokeFailure::Fatal(e.into()))?;
                file.write_all(text.as_bytes())
                    .map_err(|e| InvokeFailure::Fatal(e.into()))?;
                Some(file)
            }
            None => None,
        };

        let session_id = fresh_session_id();
        let turns = max_turns.to_string();
        let mut command = Command::new(&self.binary);
        command
            .arg("--print")
            .args(["--output-format", "json"])
            .args(["--session-id", &session_id])
            .args(["--max-turns", &turns]);
        if let Some(schema) = schema {
            command.args(["--json-schema", schema]);
        }
        if let Some(file) = &system_file {
            command.arg("--system-prompt-file").arg(file.path());
        }
        if !self.allowed_tools.is_empty() {
            command.args(["--allowed-tools", &self.allowed_tools.join(",")]);
        }
        command
            .arg(prompt)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            // Nothing reads stderr; piping it could wedge a chatty agent.
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|_| {
            InvokeFailure::Fatal(RefitError::AgentNotInstalled {
                binary: self.binary.clone(),
            })
        })?;

        let (tx, rx) = mpsc::sync_channel::<String>(LINE_BUFFER);
        let stdout_reader = child.stdout.take().map(|out| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                use std::io::BufRead as _;
                for line in std::io::BufReader::new(out).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
        });
        drop(tx);

        let start = Instant::now();
        let status = loop {
            if cancel.is_cancelled() {
                terminate_child(&mut child, KILL_GRACE);
                return Err(InvokeFailure::Fatal(RefitError::Cancelled));
            }
            if start.elapsed() >= self.timeout {
                terminate_child(&mut child, KILL_GRACE);
                return Err(InvokeFailure::Timeout(format!(
                    "no response within {}s",
                    self.timeout.as_secs()
                )));
            }
            match child.wait_timeout(WAIT_SLICE) {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(InvokeFailure::Fatal(e.into())),
            }
        };

        // Drain until the reader hangs up; recv-before-join keeps a full
        // buffer from wedging the reader thread.
        let mut stdout = String::new();
        while let Ok(line) = rx.recv() {
            stdout.push_str(&line);
            stdout.push('\n');
        }
        if let Some(reader) = stdout_reader {
            let _ = reader.join();
        }

        if !status.success() {
            return Err(InvokeFailure::Payload(format!(
                "agent exited with {}",
                status.code().map_or_else(|| "signal".to_owned(), |c| c.to_string())
            )));
        }

        let payload = extract_payload(&stdout)?;
        if let Some(schema) = schema {
            validate_against_schema(&payload, schema)?;
        }
        Ok(payload)
    }
}

/// Failure modes of a single invocation.
enum InvokeFailure {
    /// Retry-eligible: bad JSON, schema violation, nonzero exit.
    Payload(String),
    /// Retry-eligible: no response within the timeout.
    Timeout(String),
    /// Not retried here: missing binary, cancellation, I/O breakage.
    Fatal(RefitError),
}

fn fresh_session_id() -> String {
    use rand::Rng as _;
    let mut rng = rand::rng();
    (0..32)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(u32::from(n), 16).unwrap_or('0')
        })
        .collect()
}

/// Pull the structured payload out of the agent runtime's JSON envelope.
///
/// The runtime prints an object whose `result` field holds the structured
/// output, either as a JSON string or inline. A bare schema-shaped object is
/// also accepted.
fn extract_payload(stdout: &str) -> Result<serde_json::Value, InvokeFailure> {
    let envelope: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| InvokeFailure::Payload(format!("stdout is not JSON: {e}")))?;

    match envelope.get("result") {
        // A string result usually wraps the structured JSON; a plain string
        // (e.g. the auth probe's reply) passes through and lets schema
        // validation produce the real diagnostic.
        Some(serde_json::Value::String(inner)) => Ok(serde_json::from_str(inner.trim())
            .unwrap_or_else(|_| serde_json::Value::String(inner.clone()))),
        Some(inner @ serde_json::Value::Object(_)) => Ok(inner.clone()),
        Some(other) => Err(InvokeFailure::Payload(format!(
            "result field has unexpected type: {other}"
        ))),
        None => Ok(envelope),
    }
}

fn validate_against_schema(
    payload: &serde_json::Value,
    schema: &str,
) -> Result<(), InvokeFailure> {
    let schema_value: serde_json::Value = serde_json::from_str(schema)
        .map_err(|e| InvokeFailure::Fatal(std::io::Error::other(format!("bad schema: {e}")).into()))?;
    let validator = jsonschema::validator_for(&schema_value).map_err(|e| {
        InvokeFailure::Fatal(std::io::Error::other(format!("bad schema: {e}")).into())
    })?;
    if let Some(error) = validator.iter_errors(payload).next() {
        return Err(InvokeFailure::Payload(format!(
            "schema violation at {}: {error}",
            error.instance_path()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
