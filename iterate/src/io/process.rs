//! Supervision of the external tool process.
//!
//! One [`Supervisor`] tracks at most one child at a time. Each child runs in
//! its own process group and every signal goes to the whole group. Shutdown
//! sends SIGTERM, races a grace timer against the exit signal, and sends a
//! single SIGKILL only when the timer wins.

use std::future::Future;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::settings::ShutdownSettings;

/// Parameters for one supervised session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Written to the child's stdin, which is then closed.
    pub prompt: String,
    pub timeout: Duration,
    /// Per-stream cap on captured output. Excess is drained and counted.
    pub output_limit_bytes: usize,
    /// When set, stdout lines are appended here as they arrive.
    pub stream_path: Option<PathBuf>,
    /// When set, every stdout line is forwarded here as it arrives.
    pub line_tap: Option<mpsc::UnboundedSender<String>>,
}

/// Why the supervisor ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout,
    Shutdown,
    Requested,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Normal,
    ErrorExit,
    Killed {
        reason: KillReason,
        /// Signal that ended the process, when it died from one.
        signal: Option<i32>,
    },
}

/// Captured result of one session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub duration: Duration,
    pub termination: Termination,
}

impl SessionResult {
    pub fn success(&self) -> bool {
        self.termination == Termination::Normal
    }

    pub fn timed_out(&self) -> bool {
        matches!(
            self.termination,
            Termination::Killed {
                reason: KillReason::Timeout,
                ..
            }
        )
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Result of [`Supervisor::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Nothing was running.
    NoProcess,
    /// The process exited within the grace period.
    Graceful,
    /// The process needed SIGKILL and then exited.
    Forced,
    /// SIGKILL was sent but no exit was observed before the backstop.
    Unconfirmed,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor is shutting down; no new sessions are accepted")]
    ShuttingDown,
    #[error("a session is already running")]
    Busy,
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Anything that can run one tool session. The loop and verification are
/// generic over this so tests can script sessions without processes.
pub trait SessionRunner {
    fn run_session(
        &self,
        request: SessionRequest,
    ) -> impl Future<Output = Result<SessionResult, SupervisorError>> + Send;

    /// True once shutdown has begun; no further sessions will run.
    fn is_shutting_down(&self) -> bool;
}

/// Owns the lifecycle of the one running tool process.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    grace: Duration,
    kill_timeout: Duration,
}

#[derive(Debug, Default)]
struct State {
    rejecting: bool,
    busy: bool,
    tracked: Option<Tracked>,
}

#[derive(Debug)]
struct Tracked {
    pid: Pid,
    exited: watch::Receiver<bool>,
    kill_reason: Option<KillReason>,
}

impl Supervisor {
    pub fn new(settings: &ShutdownSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                grace: Duration::from_millis(settings.grace_ms),
                kill_timeout: Duration::from_millis(settings.kill_timeout_ms),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_running_process(&self) -> bool {
        self.state()
            .tracked
            .as_ref()
            .is_some_and(|tracked| !*tracked.exited.borrow())
    }

    pub fn is_rejecting(&self) -> bool {
        self.state().rejecting
    }

    /// Run one session to completion.
    #[instrument(skip_all, fields(command = %request.command, timeout_secs = request.timeout.as_secs()))]
    pub async fn run(&self, request: SessionRequest) -> Result<SessionResult, SupervisorError> {
        let _slot = self.reserve()?;
        let started = Instant::now();
        let stream_file = match &request.stream_path {
            Some(path) => Some(open_stream_file(path).await?),
            None => None,
        };

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        debug!(args = ?request.args, workdir = %request.workdir.display(), "spawning session");
        let mut child = cmd.spawn().map_err(|source| {
            warn!(err = %source, "failed to spawn session");
            SupervisorError::Spawn {
                command: request.command.clone(),
                source,
            }
        })?;

        let pid = child
            .id()
            .and_then(|raw| i32::try_from(raw).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| io::Error::other("spawned child has no pid"))?;
        let (exit_tx, exit_rx) = watch::channel(false);

        let shutting_down = {
            let mut state = self.state();
            state.tracked = Some(Tracked {
                pid,
                exited: exit_rx,
                kill_reason: None,
            });
            state.rejecting
        };

        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(err = %err, "session stdin closed early");
                }
                // Dropping stdin closes the pipe.
            })
        });

        let stdout_capture = Capture::shared();
        let stderr_capture = Capture::shared();
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(read_output(
                stdout,
                request.output_limit_bytes,
                Arc::clone(&stdout_capture),
                stream_file,
                request.line_tap.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(read_output(
                stderr,
                request.output_limit_bytes,
                Arc::clone(&stderr_capture),
                None,
                None,
            ))
        });

        let mut waiter: JoinHandle<io::Result<ExitStatus>> = tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(true);
            status
        });

        if shutting_down {
            self.escalate(KillReason::Shutdown, self.inner.grace).await;
        }

        let status = tokio::select! {
            joined = &mut waiter => flatten_join(joined),
            () = tokio::time::sleep(request.timeout) => {
                warn!(timeout_secs = request.timeout.as_secs(), "session timed out, terminating");
                self.escalate(KillReason::Timeout, self.inner.grace).await;
                match tokio::time::timeout(self.inner.kill_timeout, &mut waiter).await {
                    Ok(joined) => flatten_join(joined),
                    Err(_) => {
                        waiter.abort();
                        None
                    }
                }
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            finish_reader(task, self.inner.kill_timeout).await;
        }
        if let Some(task) = stdin_task {
            task.abort();
        }

        let kill_reason = self
            .state()
            .tracked
            .as_ref()
            .and_then(|tracked| tracked.kill_reason);
        let (stdout, stdout_truncated) = take_capture(&stdout_capture);
        let (stderr, stderr_truncated) = take_capture(&stderr_capture);
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "session output truncated");
        }

        let exit_code = status.and_then(|status| status.code());
        let termination = match (kill_reason, status) {
            (Some(reason), status) => Termination::Killed {
                reason,
                signal: status.and_then(|status| status.signal()),
            },
            (None, Some(status)) if status.success() => Termination::Normal,
            (None, _) => Termination::ErrorExit,
        };

        let duration = started.elapsed();
        info!(exit_code = ?exit_code, termination = ?termination, duration_ms = duration.as_millis() as u64, "session finished");
        Ok(SessionResult {
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
            termination,
        })
    }

    /// Stop accepting sessions and end the running one, if any.
    ///
    /// SIGTERM first; SIGKILL exactly once if the process outlives `grace`.
    #[instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.state().rejecting = true;
        let outcome = self.escalate(KillReason::Shutdown, grace).await;
        info!(outcome = ?outcome, "supervisor shutdown");
        outcome
    }

    /// Send `signal` to the running session's process group.
    ///
    /// Returns false when nothing is running or the group is already gone.
    pub fn kill(&self, signal: Signal) -> bool {
        let pid = {
            let mut state = self.state();
            let Some(tracked) = state.tracked.as_mut() else {
                return false;
            };
            if *tracked.exited.borrow() {
                return false;
            }
            tracked.kill_reason.get_or_insert(KillReason::Requested);
            tracked.pid
        };
        send_signal(pid, signal)
    }

    async fn escalate(&self, reason: KillReason, grace: Duration) -> ShutdownOutcome {
        let (pid, exited, first) = {
            let mut state = self.state();
            let Some(tracked) = state.tracked.as_mut() else {
                return ShutdownOutcome::NoProcess;
            };
            if *tracked.exited.borrow() {
                return ShutdownOutcome::NoProcess;
            }
            let first = tracked.kill_reason.is_none();
            tracked.kill_reason.get_or_insert(reason);
            (tracked.pid, tracked.exited.clone(), first)
        };

        if !first {
            // Another caller is already escalating; only wait for the result.
            return if wait_exit(exited, grace + self.inner.kill_timeout).await {
                ShutdownOutcome::Graceful
            } else {
                ShutdownOutcome::Unconfirmed
            };
        }

        debug!(pid = pid.as_raw(), "sending SIGTERM to session group");
        send_signal(pid, Signal::SIGTERM);
        if wait_exit(exited.clone(), grace).await {
            return ShutdownOutcome::Graceful;
        }

        warn!(pid = pid.as_raw(), grace_ms = grace.as_millis() as u64, "session ignored SIGTERM, sending SIGKILL");
        send_signal(pid, Signal::SIGKILL);
        if wait_exit(exited, self.inner.kill_timeout).await {
            ShutdownOutcome::Forced
        } else {
            warn!(pid = pid.as_raw(), "no exit observed after SIGKILL");
            ShutdownOutcome::Unconfirmed
        }
    }

    fn reserve(&self) -> Result<SlotGuard<'_>, SupervisorError> {
        let mut state = self.state();
        if state.rejecting {
            return Err(SupervisorError::ShuttingDown);
        }
        if state.busy {
            return Err(SupervisorError::Busy);
        }
        state.busy = true;
        Ok(SlotGuard { supervisor: self })
    }
}

impl SessionRunner for Supervisor {
    async fn run_session(&self, request: SessionRequest) -> Result<SessionResult, SupervisorError> {
        self.run(request).await
    }

    fn is_shutting_down(&self) -> bool {
        self.is_rejecting()
    }
}

/// Frees the single session slot when `run` returns, on every path.
struct SlotGuard<'a> {
    supervisor: &'a Supervisor,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.supervisor.state();
        state.busy = false;
        state.tracked = None;
    }
}

fn send_signal(pid: Pid, signal: Signal) -> bool {
    match killpg(pid, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            debug!(pid = pid.as_raw(), signal = ?signal, "process group already gone");
            false
        }
        Err(err) => {
            warn!(pid = pid.as_raw(), signal = ?signal, err = %err, "failed to signal process group");
            false
        }
    }
}

/// Wait until the exit flag flips, bounded by `limit`.
async fn wait_exit(mut exited: watch::Receiver<bool>, limit: Duration) -> bool {
    let wait = async {
        loop {
            if *exited.borrow_and_update() {
                return true;
            }
            if exited.changed().await.is_err() {
                return *exited.borrow();
            }
        }
    };
    tokio::time::timeout(limit, wait).await.unwrap_or(false)
}

fn flatten_join(
    joined: Result<io::Result<ExitStatus>, tokio::task::JoinError>,
) -> Option<ExitStatus> {
    match joined {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(err = %err, "failed to wait for session");
            None
        }
        Err(err) => {
            warn!(err = %err, "session waiter task failed");
            None
        }
    }
}

/// Give a reader a bounded moment to drain; helpers that inherited the pipe
/// can otherwise keep it open forever.
async fn finish_reader(mut task: JoinHandle<()>, limit: Duration) {
    if tokio::time::timeout(limit, &mut task).await.is_err() {
        debug!("output reader still open after exit, abandoning");
        task.abort();
    }
}

#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    truncated: usize,
}

impl Capture {
    fn shared() -> Arc<Mutex<Capture>> {
        Arc::new(Mutex::new(Capture::default()))
    }

    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

fn take_capture(capture: &Mutex<Capture>) -> (Vec<u8>, usize) {
    let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
    (std::mem::take(&mut capture.buf), capture.truncated)
}

async fn open_stream_file(path: &Path) -> io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await
}

/// Bytes read from a child pipe per call.
const READ_CHUNK: usize = 8 * 1024;

/// Longest line forwarded to the tap before it is split.
const MAX_TAP_LINE: usize = 64 * 1024;

/// Splits raw output into lines for the tap. Pending bytes never exceed
/// [`MAX_TAP_LINE`] plus one chunk.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(&[u8])) {
        for piece in chunk.split_inclusive(|byte| *byte == b'\n') {
            self.pending.extend_from_slice(piece);
            if piece.ends_with(b"\n") || self.pending.len() >= MAX_TAP_LINE {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    fn finish(&mut self, mut emit: impl FnMut(&[u8])) {
        if !self.pending.is_empty() {
            emit(&self.pending);
            self.pending.clear();
        }
    }
}

fn send_line(tap: &mpsc::UnboundedSender<String>, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let _ = tap.send(text.trim_end_matches(['\r', '\n']).to_string());
}

async fn read_output<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    capture: Arc<Mutex<Capture>>,
    mut stream_file: Option<tokio::fs::File>,
    tap: Option<mpsc::UnboundedSender<String>>,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut lines = LineSplitter::default();
    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(err = %err, "session output read failed");
                break;
            }
        };
        let bytes = &chunk[..read];

        if let Some(file) = stream_file.as_mut()
            && let Err(err) = file.write_all(bytes).await
        {
            warn!(err = %err, "failed to write session stream");
            stream_file = None;
        }
        if let Some(tap) = &tap {
            lines.feed(bytes, |line| send_line(tap, line));
        }
        capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes, limit);
    }
    if let Some(tap) = &tap {
        lines.finish(|line| send_line(tap, line));
    }
    if let Some(mut file) = stream_file
        && let Err(err) = file.flush().await
    {
        warn!(err = %err, "failed to flush session stream");
    }
}
