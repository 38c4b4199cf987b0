//! The iteration loop for `iterate run`.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::core::oracle::{Artifacts, Assessment, StagnationTracker, assess};
use crate::core::settings::Settings;
use crate::core::types::{Mode, WorkspaceStatus};
use crate::io::metadata::{WorkspaceMetadata, write_metadata};
use crate::io::process::{
    KillReason, SessionRequest, SessionResult, SessionRunner, SupervisorError, Termination,
};
use crate::io::prompt::{IterationPrompt, PromptEngine};
use crate::io::session_log::{SessionKind, session_log_path, write_session_log};
use crate::io::status::try_read_status;
use crate::io::workspace::{WorkspacePaths, read_instructions};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The oracle reported the work complete.
    Complete,
    /// The remaining count did not move for `unchanged` consecutive checks.
    Stagnated { remaining: u32, unchanged: u32 },
    /// The iteration budget for this invocation was used up.
    MaxIterations { max_iterations: u32 },
    /// The supervisor is shutting down.
    Interrupted,
}

/// Summary of one `run_loop` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub iterations_run: u32,
    pub remaining: Option<u32>,
    pub stop: LoopStop,
}

/// What one iteration produced, handed to the progress callback.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport {
    /// Workspace-wide iteration number.
    pub iteration: u32,
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub assessment: Assessment,
}

/// Collaborators shared by the loop and verification.
pub struct LoopContext<'a, R> {
    pub runner: &'a R,
    pub paths: &'a WorkspacePaths,
    pub settings: &'a Settings,
    pub prompts: &'a PromptEngine,
    /// Receives every stdout line of every session.
    pub line_tap: Option<mpsc::UnboundedSender<String>>,
}

/// Assess the workspace on disk for `mode`.
pub fn assess_workspace(paths: &WorkspacePaths, mode: Mode, markers: &[String]) -> Assessment {
    let document = fs::read_to_string(&paths.todo_path).ok();
    let snapshot = try_read_status(&paths.status_path);
    assess(
        mode,
        Artifacts {
            document: document.as_deref(),
            snapshot: snapshot.as_ref(),
        },
        markers,
    )
}

/// Run sessions until the work is complete, stalls, runs out of budget, or the
/// supervisor shuts down. At most `budget` sessions run.
///
/// A session that exits non-zero or times out is logged and the loop goes on;
/// a session that cannot be spawned aborts with an error.
#[instrument(skip_all, fields(workspace = %ctx.paths.name, budget = budget))]
pub async fn run_loop<R: SessionRunner, F: FnMut(&IterationReport)>(
    ctx: &LoopContext<'_, R>,
    metadata: &mut WorkspaceMetadata,
    budget: u32,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let settings = ctx.settings;
    let mut tracker = StagnationTracker::new(settings.stagnation_threshold);
    let mut iterations_run = 0u32;
    let mut remaining: Option<u32> = None;

    let stop = loop {
        if ctx.runner.is_shutting_down() {
            break LoopStop::Interrupted;
        }
        if iterations_run >= budget {
            break LoopStop::MaxIterations {
                max_iterations: settings.max_iterations,
            };
        }
        if iterations_run > 0 && settings.delay > 0 {
            tokio::time::sleep(Duration::from_secs(settings.delay)).await;
            if ctx.runner.is_shutting_down() {
                break LoopStop::Interrupted;
            }
        }

        let iteration = metadata.iterations + 1;
        let instructions = read_instructions(ctx.paths)?;
        let prompt = ctx.prompts.render_iteration(&IterationPrompt {
            workspace: &ctx.paths.name,
            mode: metadata.mode,
            iteration,
            max_iterations: settings.max_iterations,
            instructions: &instructions,
            todo_path: &ctx.paths.todo_path,
            status_path: &ctx.paths.status_path,
            completion_marker: settings
                .completion_markers
                .first()
                .map_or("TASK COMPLETE", String::as_str),
            remaining,
        })?;

        info!(iteration, "starting iteration");
        let log_path = session_log_path(&ctx.paths.logs_dir, SessionKind::Iteration, iteration);
        let started_at = Utc::now();
        let result = match run_session(ctx, prompt, Some(log_path.clone())).await {
            Ok(result) => result,
            Err(SupervisorError::ShuttingDown) => break LoopStop::Interrupted,
            Err(err) => {
                return Err(err).with_context(|| format!("run iteration {iteration}"));
            }
        };
        iterations_run += 1;
        write_session_log(&log_path, started_at, &command_line(settings), &result)?;

        metadata.record_iteration(Utc::now());
        write_metadata(&ctx.paths.metadata_path, metadata)?;

        if matches!(
            result.termination,
            Termination::Killed {
                reason: KillReason::Shutdown,
                ..
            }
        ) {
            break LoopStop::Interrupted;
        }
        if !result.success() {
            warn!(
                iteration,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out(),
                "session did not finish cleanly, continuing"
            );
        }

        let assessment = assess_workspace(ctx.paths, metadata.mode, &settings.completion_markers);
        remaining = assessment.remaining;
        debug!(iteration, complete = assessment.complete, remaining = ?assessment.remaining, "assessed workspace");
        on_iteration(&IterationReport {
            iteration,
            termination: result.termination,
            exit_code: result.exit_code,
            duration: result.duration,
            assessment,
        });

        if assessment.complete {
            metadata.status = WorkspaceStatus::Completed;
            write_metadata(&ctx.paths.metadata_path, metadata)?;
            break LoopStop::Complete;
        }
        if tracker.observe(assessment.remaining) {
            warn!(iteration, remaining = ?assessment.remaining, unchanged = tracker.unchanged(), "no progress, stopping");
            break LoopStop::Stagnated {
                remaining: assessment.remaining.unwrap_or_default(),
                unchanged: tracker.unchanged(),
            };
        }
    };

    info!(iterations_run, stop = ?stop, "loop finished");
    Ok(LoopOutcome {
        iterations_run,
        remaining,
        stop,
    })
}

/// Run one session of the external tool with the configured command.
pub(crate) async fn run_session<R: SessionRunner>(
    ctx: &LoopContext<'_, R>,
    prompt: String,
    stream_path: Option<std::path::PathBuf>,
) -> Result<SessionResult, SupervisorError> {
    let settings = ctx.settings;
    let request = SessionRequest {
        command: settings.claude.command.clone(),
        args: settings.claude.session_args(),
        workdir: ctx.paths.dir.clone(),
        prompt,
        timeout: Duration::from_secs(settings.iteration_timeout),
        output_limit_bytes: settings.output_limit_bytes,
        stream_path,
        line_tap: ctx.line_tap.clone(),
    };
    ctx.runner.run_session(request).await
}

pub(crate) fn command_line(settings: &Settings) -> String {
    std::iter::once(settings.claude.command.clone())
        .chain(settings.claude.session_args())
        .collect::<Vec<_>>()
        .join(" ")
}
