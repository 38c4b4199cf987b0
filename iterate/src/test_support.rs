//! Scripted session runner and workspace fixtures for tests.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use crate::core::settings::Settings;
use crate::core::types::Mode;
use crate::io::metadata::{WorkspaceMetadata, load_metadata};
use crate::io::process::{
    KillReason, SessionRequest, SessionResult, SessionRunner, SupervisorError, Termination,
};
use crate::io::prompt::PromptEngine;
use crate::io::workspace::{InitOptions, WorkspacePaths, init_workspace};
use crate::looping::LoopContext;

fn result_with(termination: Termination, exit_code: Option<i32>) -> SessionResult {
    SessionResult {
        exit_code,
        stdout: b"scripted session\n".to_vec(),
        stderr: Vec::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration: Duration::from_millis(10),
        termination,
    }
}

/// What one scripted session does: write files into the session workdir,
/// then report `outcome`.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    writes: Vec<(String, String)>,
    outcome: Outcome,
}

#[derive(Debug, Clone)]
enum Outcome {
    Finished(Termination, Option<i32>),
    SpawnFailure,
}

impl ScriptedSession {
    pub fn ok() -> Self {
        Self {
            writes: Vec::new(),
            outcome: Outcome::Finished(Termination::Normal, Some(0)),
        }
    }

    pub fn writes(file: &str, contents: &str) -> Self {
        Self::ok().and_writes(file, contents)
    }

    pub fn and_writes(mut self, file: &str, contents: &str) -> Self {
        self.writes.push((file.to_string(), contents.to_string()));
        self
    }

    pub fn exit_code(code: i32) -> Self {
        Self {
            writes: Vec::new(),
            outcome: Outcome::Finished(Termination::ErrorExit, Some(code)),
        }
    }

    pub fn killed(reason: KillReason) -> Self {
        Self {
            writes: Vec::new(),
            outcome: Outcome::Finished(
                Termination::Killed {
                    reason,
                    signal: Some(15),
                },
                None,
            ),
        }
    }

    pub fn spawn_failure() -> Self {
        Self {
            writes: Vec::new(),
            outcome: Outcome::SpawnFailure,
        }
    }
}

/// [`SessionRunner`] that plays back scripted sessions in order and records
/// every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<ScriptedSession>>,
    repeat: Option<ScriptedSession>,
    requests: Mutex<Vec<SessionRequest>>,
    shutting_down: AtomicBool,
}

impl ScriptedRunner {
    /// Sessions beyond the script exit 0 without touching the workspace.
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            queue: Mutex::new(sessions.into()),
            ..Self::default()
        }
    }

    /// Every session behaves like `session`.
    pub fn repeating(session: ScriptedSession) -> Self {
        Self {
            repeat: Some(session),
            ..Self::default()
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }

    fn next_session(&self) -> ScriptedSession {
        let scripted = self.queue.lock().expect("queue lock").pop_front();
        scripted
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(ScriptedSession::ok)
    }
}

impl SessionRunner for ScriptedRunner {
    async fn run_session(&self, request: SessionRequest) -> Result<SessionResult, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let session = self.next_session();
        let workdir = request.workdir.clone();
        let command = request.command.clone();
        self.requests.lock().expect("requests lock").push(request);

        match session.outcome {
            Outcome::SpawnFailure => Err(SupervisorError::Spawn {
                command,
                source: io::Error::new(io::ErrorKind::NotFound, "no such file or directory"),
            }),
            Outcome::Finished(termination, exit_code) => {
                for (file, contents) in &session.writes {
                    fs::write(workdir.join(file), contents).expect("scripted write");
                }
                Ok(result_with(termination, exit_code))
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Workspace `demo` initialised inside a temporary project directory.
pub struct TestWorkspace {
    pub project: TempDir,
    pub paths: WorkspacePaths,
}

pub const TEST_INSTRUCTIONS: &str = "# Task\n\nBuild the CSV exporter.\n";

impl TestWorkspace {
    pub fn new(mode: Mode) -> Self {
        let project = tempfile::tempdir().expect("tempdir");
        let paths = WorkspacePaths::new(project.path(), "workspaces", "demo").expect("paths");
        init_workspace(
            &paths,
            &InitOptions {
                mode,
                instructions: Some(TEST_INSTRUCTIONS.to_string()),
                ..InitOptions::default()
            },
            Utc::now(),
        )
        .expect("init workspace");
        Self { project, paths }
    }

    pub fn metadata(&self) -> WorkspaceMetadata {
        self.load_metadata()
    }

    pub fn load_metadata(&self) -> WorkspaceMetadata {
        load_metadata(&self.paths.metadata_path).expect("load metadata")
    }

    pub fn read(&self, file: &str) -> String {
        fs::read_to_string(self.paths.dir.join(file)).expect("read workspace file")
    }

    pub fn context<'a, R>(
        &'a self,
        runner: &'a R,
        settings: &'a Settings,
        prompts: &'a PromptEngine,
    ) -> LoopContext<'a, R> {
        LoopContext {
            runner,
            paths: &self.paths,
            settings,
            prompts,
            line_tap: None,
        }
    }
}
