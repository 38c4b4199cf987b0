//! Verification sessions and resume preparation.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::report::{VerificationResult, parse_report};
use crate::core::resume::augment_instructions;
use crate::core::types::{Depth, WorkspaceStatus};
use crate::io::metadata::{WorkspaceMetadata, write_metadata};
use crate::io::process::{KillReason, SessionRunner, SupervisorError, Termination};
use crate::io::prompt::VerifyPrompt;
use crate::io::session_log::{SessionKind, session_log_path, write_session_log};
use crate::io::status::clear_status;
use crate::io::workspace::{
    WorkspacePaths, preserve_original_instructions, read_original_instructions,
    write_instructions,
};
use crate::looping::{LoopContext, command_line, run_session};

const PERMISSION_HINT: &str = "The tool may have been blocked from writing files. \
Check that it runs with file-write permission in the workspace directory.";

/// Bytes of tool stdout kept on a missing-report error.
const TOOL_OUTPUT_EXCERPT: usize = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(
        "verification report not found at {}\n{hint}\nsession log: {}\ntool output:\n{tool_output}",
        expected.display(),
        log_path.display()
    )]
    MissingReport {
        expected: PathBuf,
        hint: &'static str,
        log_path: PathBuf,
        /// Tail of the verification session's stdout.
        tool_output: String,
    },
    #[error("verification interrupted by shutdown")]
    Interrupted,
    #[error(transparent)]
    Session(#[from] SupervisorError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run one verification session for the workspace and parse its report.
///
/// The reviewer sees the original instructions, not resume findings.
#[instrument(skip_all, fields(workspace = %ctx.paths.name, depth = %depth.as_str()))]
pub async fn verify<R: SessionRunner>(
    ctx: &LoopContext<'_, R>,
    metadata: &mut WorkspaceMetadata,
    depth: Depth,
) -> Result<VerificationResult, VerifyError> {
    let settings = ctx.settings;
    let report_path = ctx
        .paths
        .report_path(&settings.verification.report_filename);
    match fs::remove_file(&report_path) {
        Ok(()) => info!(path = %report_path.display(), "removed stale verification report"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("remove stale report {}", report_path.display()))
                .into());
        }
    }

    let instructions = read_original_instructions(ctx.paths)?;
    let prompt = ctx.prompts.render_verify(&VerifyPrompt {
        workspace: &ctx.paths.name,
        depth,
        instructions: &instructions,
        todo_path: &ctx.paths.todo_path,
        report_path: &report_path,
    })?;

    let attempt = metadata.verification.verification_attempts + 1;
    let log_path = session_log_path(&ctx.paths.logs_dir, SessionKind::Verification, attempt);
    let started_at = Utc::now();
    info!(attempt, "starting verification");
    let result = match run_session(ctx, prompt, Some(log_path.clone())).await {
        Ok(result) => result,
        Err(SupervisorError::ShuttingDown) => return Err(VerifyError::Interrupted),
        Err(err) => return Err(err.into()),
    };
    write_session_log(&log_path, started_at, &command_line(settings), &result)?;

    metadata.verification.verification_attempts = attempt;
    write_metadata(&ctx.paths.metadata_path, metadata)?;

    if matches!(
        result.termination,
        Termination::Killed {
            reason: KillReason::Shutdown,
            ..
        }
    ) {
        return Err(VerifyError::Interrupted);
    }

    let markdown = match fs::read_to_string(&report_path) {
        Ok(markdown) => markdown,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %report_path.display(), "verification session wrote no report");
            return Err(VerifyError::MissingReport {
                expected: report_path,
                hint: PERMISSION_HINT,
                log_path,
                tool_output: tail(&result.stdout_lossy(), TOOL_OUTPUT_EXCERPT),
            });
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("read verification report {}", report_path.display()))
                .into());
        }
    };

    let parsed = parse_report(&markdown, &report_path);
    let record = &mut metadata.verification;
    record.last_verification_status = Some(parsed.status);
    record.last_verification_report = Some(report_path.display().to_string());
    record.last_verified_at = Some(Utc::now());
    write_metadata(&ctx.paths.metadata_path, metadata)?;

    info!(
        status = parsed.status.as_str(),
        issues = parsed.issues.len(),
        "verification finished"
    );
    Ok(parsed)
}

/// Rewrite `INSTRUCTIONS.md` with the report findings ahead of the original
/// instructions. The original is saved once, before the first rewrite.
/// The status snapshot of the verified pass is removed.
pub fn prepare_resume_instructions(
    paths: &WorkspacePaths,
    result: &VerificationResult,
) -> anyhow::Result<String> {
    let original = preserve_original_instructions(paths)?;
    let augmented = augment_instructions(&original, result);
    write_instructions(paths, &augmented).context("write resume instructions")?;
    clear_status(&paths.status_path)?;
    Ok(augmented)
}

/// Put the workspace back in progress for resume cycle `cycle`.
pub fn apply_resume(
    paths: &WorkspacePaths,
    metadata: &mut WorkspaceMetadata,
    cycle: u32,
) -> anyhow::Result<()> {
    metadata.status = WorkspaceStatus::InProgress;
    metadata.verification.verify_resume_cycles = cycle;
    write_metadata(&paths.metadata_path, metadata)
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
