//! Per-session logs under `<workspace>/logs/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::process::{KillReason, SessionResult, Termination};

/// What kind of session a log belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Iteration,
    Verification,
}

impl SessionKind {
    fn prefix(self) -> &'static str {
        match self {
            SessionKind::Iteration => "iteration",
            SessionKind::Verification => "verify",
        }
    }
}

/// `logs/iteration-007.log`, `logs/verify-002.log`.
pub fn session_log_path(logs_dir: &Path, kind: SessionKind, number: u32) -> PathBuf {
    logs_dir.join(format!("{}-{number:03}.log", kind.prefix()))
}

/// Write the final log for a session, replacing the live stream file.
pub fn write_session_log(
    path: &Path,
    started_at: DateTime<Utc>,
    command: &str,
    result: &SessionResult,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str(&format!("started: {}\n", started_at.to_rfc3339()));
    buf.push_str(&format!("command: {command}\n"));
    buf.push_str(&format!("duration_ms: {}\n", result.duration.as_millis()));
    buf.push_str(&format!("exit: {}\n", describe_termination(result)));
    buf.push_str("\n=== stdout ===\n");
    buf.push_str(&result.stdout_lossy());
    buf.push_str(&result.stdout_truncated_notice("session"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&result.stderr_lossy());
    buf.push_str(&result.stderr_truncated_notice("session"));
    fs::write(path, buf).with_context(|| format!("write session log {}", path.display()))
}

/// One-line description of how a session ended.
pub fn describe_termination(result: &SessionResult) -> String {
    let code = result
        .exit_code
        .map_or_else(|| "none".to_string(), |code| code.to_string());
    match result.termination {
        Termination::Normal => format!("ok (code {code})"),
        Termination::ErrorExit => format!("failed (code {code})"),
        Termination::Killed { reason, signal } => {
            let reason = match reason {
                KillReason::Timeout => "timeout",
                KillReason::Shutdown => "shutdown",
                KillReason::Requested => "requested",
            };
            match signal {
                Some(signal) => format!("killed ({reason}, signal {signal})"),
                None => format!("killed ({reason}, code {code})"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(termination: Termination, exit_code: Option<i32>) -> SessionResult {
        SessionResult {
            exit_code,
            stdout: b"working\n".to_vec(),
            stderr: Vec::new(),
            stdout_truncated: 5,
            stderr_truncated: 0,
            duration: Duration::from_millis(1_250),
            termination,
        }
    }

    #[test]
    fn log_paths_are_zero_padded() {
        let dir = Path::new("/ws/logs");
        assert_eq!(
            session_log_path(dir, SessionKind::Iteration, 7),
            PathBuf::from("/ws/logs/iteration-007.log")
        );
        assert_eq!(
            session_log_path(dir, SessionKind::Verification, 12),
            PathBuf::from("/ws/logs/verify-012.log")
        );
    }

    #[test]
    fn log_records_outcome_and_truncation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("iteration-001.log");
        let killed = result(
            Termination::Killed {
                reason: KillReason::Timeout,
                signal: Some(15),
            },
            None,
        );

        write_session_log(&path, Utc::now(), "claude --print", &killed).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.contains("command: claude --print"));
        assert!(contents.contains("exit: killed (timeout, signal 15)"));
        assert!(contents.contains("duration_ms: 1250"));
        assert!(contents.contains("working\n"));
        assert!(contents.contains("[session stdout truncated 5 bytes]"));
    }

    #[test]
    fn termination_descriptions() {
        assert_eq!(
            describe_termination(&result(Termination::Normal, Some(0))),
            "ok (code 0)"
        );
        assert_eq!(
            describe_termination(&result(Termination::ErrorExit, Some(2))),
            "failed (code 2)"
        );
    }
}
