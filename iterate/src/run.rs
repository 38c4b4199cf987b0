//! `iterate run`: the loop, verification, and auto-resume end to end.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::report::VerificationResult;
use crate::core::resume::{ResumeDecision, decide};
use crate::core::types::WorkspaceStatus;
use crate::exit_codes;
use crate::io::metadata::{WorkspaceMetadata, write_metadata};
use crate::io::process::SessionRunner;
use crate::looping::{IterationReport, LoopContext, LoopStop, run_loop};
use crate::verify::{VerifyError, apply_resume, prepare_resume_instructions, verify};

/// Final verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    /// Complete and verified.
    Passed,
    /// Complete; verification is switched off.
    Unverified,
    /// Verification failed and no resume cycle is left (or resuming is off).
    VerificationFailed,
    NeedsReview,
    Stagnated,
    MaxIterations,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub iterations_run: u32,
    pub remaining: Option<u32>,
    /// The last verification of this run, if any ran.
    pub verification: Option<VerificationResult>,
    /// Resume cycles started during this run.
    pub resumes: u32,
    pub verdict: RunVerdict,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            RunVerdict::Passed | RunVerdict::Unverified => exit_codes::OK,
            RunVerdict::VerificationFailed | RunVerdict::NeedsReview => {
                exit_codes::VERIFICATION_FAILED
            }
            RunVerdict::Stagnated => exit_codes::STAGNATED,
            RunVerdict::MaxIterations => exit_codes::MAX_ITERATIONS,
            RunVerdict::Interrupted => exit_codes::INTERRUPTED,
        }
    }
}

/// Progress notifications for the CLI.
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    Iteration(&'a IterationReport),
    Verified(&'a VerificationResult),
    Resuming { cycle: u32 },
}

/// Run the workspace until it passes verification or cannot go further.
///
/// `maxIterations` bounds the sessions of this whole call, resume cycles
/// included. Any error marks the workspace `error` before it is returned.
#[instrument(skip_all, fields(workspace = %ctx.paths.name))]
pub async fn run_workspace<R, F>(
    ctx: &LoopContext<'_, R>,
    metadata: &mut WorkspaceMetadata,
    mut on_event: F,
) -> Result<RunReport>
where
    R: SessionRunner,
    F: FnMut(RunEvent<'_>),
{
    match drive(ctx, metadata, &mut on_event).await {
        Ok(report) => Ok(report),
        Err(err) => {
            metadata.status = WorkspaceStatus::Error;
            if let Err(write_err) = write_metadata(&ctx.paths.metadata_path, metadata) {
                warn!(err = %write_err, "failed to record error status");
            }
            Err(err)
        }
    }
}

async fn drive<R, F>(
    ctx: &LoopContext<'_, R>,
    metadata: &mut WorkspaceMetadata,
    on_event: &mut F,
) -> Result<RunReport>
where
    R: SessionRunner,
    F: FnMut(RunEvent<'_>),
{
    let settings = ctx.settings;
    metadata.status = WorkspaceStatus::InProgress;
    write_metadata(&ctx.paths.metadata_path, metadata)?;

    let mut budget = settings.max_iterations;
    let mut report = RunReport {
        iterations_run: 0,
        remaining: None,
        verification: None,
        resumes: 0,
        verdict: RunVerdict::Interrupted,
    };

    loop {
        let outcome = run_loop(ctx, metadata, budget, |iteration| {
            on_event(RunEvent::Iteration(iteration));
        })
        .await?;
        budget = budget.saturating_sub(outcome.iterations_run);
        report.iterations_run += outcome.iterations_run;
        report.remaining = outcome.remaining;

        match outcome.stop {
            LoopStop::Complete => {}
            LoopStop::Stagnated { .. } => return Ok(finish(report, RunVerdict::Stagnated)),
            LoopStop::MaxIterations { .. } => {
                return Ok(finish(report, RunVerdict::MaxIterations));
            }
            LoopStop::Interrupted => return Ok(finish(report, RunVerdict::Interrupted)),
        }

        if !settings.verification.auto_verify {
            return Ok(finish(report, RunVerdict::Unverified));
        }

        let result = match verify(ctx, metadata, settings.verification.depth).await {
            Ok(result) => result,
            Err(VerifyError::Interrupted) => return Ok(finish(report, RunVerdict::Interrupted)),
            Err(err) => return Err(err.into()),
        };
        on_event(RunEvent::Verified(&result));

        let decision = decide(
            result.status,
            metadata.verification.verify_resume_cycles,
            &settings.verification,
        );
        info!(decision = ?decision, "verification decision");
        let verdict = match decision {
            ResumeDecision::Passed => Some(RunVerdict::Passed),
            ResumeDecision::NeedsReview => Some(RunVerdict::NeedsReview),
            ResumeDecision::Exhausted | ResumeDecision::ResumeDisabled => {
                Some(RunVerdict::VerificationFailed)
            }
            ResumeDecision::Resume { cycle } => {
                prepare_resume_instructions(ctx.paths, &result)?;
                apply_resume(ctx.paths, metadata, cycle)?;
                report.resumes += 1;
                on_event(RunEvent::Resuming { cycle });
                None
            }
        };
        report.verification = Some(result);
        if let Some(verdict) = verdict {
            return Ok(finish(report, verdict));
        }
    }
}

fn finish(mut report: RunReport, verdict: RunVerdict) -> RunReport {
    report.verdict = verdict;
    info!(verdict = ?verdict, iterations = report.iterations_run, resumes = report.resumes, "run finished");
    report
}
