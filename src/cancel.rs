//! Cooperative cancellation for long-running runs.
//!
//! A [`CancelToken`] is shared between the orchestrator and the signal
//! handler. The orchestrator polls it at every external wait point: while
//! the agent subprocess runs, while a verifier command runs, and between
//! batches. Child termination is signal-then-kill with a grace period.

use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use wait_timeout::ChildExt as _;

/// Shared cancellation flag. Clone freely; all clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route SIGINT/SIGTERM to the token so ctrl-c cancels gracefully.
///
/// # Errors
/// Returns an error if the signal handler cannot be installed.
#[cfg(unix)]
pub fn install_signal_handler(token: &CancelToken) -> std::io::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&token.0))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&token.0))?;
    Ok(())
}

/// No-op where POSIX signals are unavailable.
///
/// # Errors
/// Never fails.
#[cfg(not(unix))]
pub fn install_signal_handler(_token: &CancelToken) -> std::io::Result<()> {
    Ok(())
}

/// Terminate a child: SIGTERM, wait out the grace period, then SIGKILL.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // The pid fits; Child ids are small positive integers.
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(child.id() as i32);
        if kill(pid, Signal::SIGTERM).is_ok()
            && let Ok(Some(_)) = child.wait_timeout(grace)
        {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn terminate_kills_stubborn_child() {
        use std::process::{Command, Stdio};
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        terminate_child(&mut child, Duration::from_millis(500));
        // After terminate_child the process has been reaped.
        assert!(matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
    }
}
