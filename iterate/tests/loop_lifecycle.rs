//! End-to-end runs with a scripted tool: stagnation, verification, resume.

use iterate::core::settings::Settings;
use iterate::core::types::{Mode, VerificationStatus, WorkspaceStatus};
use iterate::exit_codes;
use iterate::io::prompt::PromptEngine;
use iterate::run::{RunVerdict, run_workspace};
use iterate::test_support::{ScriptedRunner, ScriptedSession, TEST_INSTRUCTIONS, TestWorkspace};

const REPORT: &str = "verification-report.md";

const FAILING_REPORT: &str = "\
# Verification Report

**Status**: ❌ INCOMPLETE

## Summary
Two requirements are still open.

## Incomplete Requirements
1. **Header row**: the CSV has no header
2. **Quoting**: fields with commas are not quoted

**Confidence Level**: High
**Recommended Action**: Finish the writer before declaring completion.
";

const PASSING_REPORT: &str = "**Status**: ✅ VERIFIED COMPLETE\n\n## Summary\nAll done.\n";

fn settings() -> Settings {
    Settings {
        delay: 0,
        ..Settings::default()
    }
}

#[tokio::test]
async fn unchanged_remaining_count_stops_with_stagnation() {
    let ws = TestWorkspace::new(Mode::Loop);
    let runner = ScriptedRunner::repeating(ScriptedSession::writes("TODO.md", "**Remaining**: 5\n"));
    let mut settings = settings();
    settings.stagnation_threshold = 2;
    let prompts = PromptEngine::new().expect("prompts");
    let ctx = ws.context(&runner, &settings, &prompts);
    let mut metadata = ws.metadata();

    let report = run_workspace(&ctx, &mut metadata, |_| {}).await.expect("run");
    assert_eq!(report.verdict, RunVerdict::Stagnated);
    assert_eq!(report.exit_code(), exit_codes::STAGNATED);
    assert_eq!(report.iterations_run, 3);
    assert_eq!(report.remaining, Some(5));
    assert_eq!(ws.load_metadata().iterations, 3);
}

#[tokio::test]
async fn failed_verification_resumes_with_findings_then_passes() {
    let ws = TestWorkspace::new(Mode::Loop);
    let runner = ScriptedRunner::new(vec![
        ScriptedSession::writes("TODO.md", "Remaining: 0"),
        ScriptedSession::writes(REPORT, FAILING_REPORT),
        ScriptedSession::writes("TODO.md", "Remaining: 0"),
        ScriptedSession::writes(REPORT, PASSING_REPORT),
    ]);
    let settings = settings();
    let prompts = PromptEngine::new().expect("prompts");
    let ctx = ws.context(&runner, &settings, &prompts);
    let mut metadata = ws.metadata();

    let report = run_workspace(&ctx, &mut metadata, |_| {}).await.expect("run");
    assert_eq!(report.verdict, RunVerdict::Passed);
    assert_eq!(report.resumes, 1);

    let instructions = ws.read("INSTRUCTIONS.md");
    assert!(instructions.contains("Header row"));
    assert!(instructions.contains("Quoting"));
    assert!(instructions.contains("Finish the writer before declaring completion."));
    assert!(instructions.ends_with(TEST_INSTRUCTIONS));
    assert_eq!(ws.read(".instructions.original.md"), TEST_INSTRUCTIONS);

    let prompts = runner.prompts();
    assert_eq!(prompts.len(), 4);
    assert!(prompts[2].contains("Header row"));
    assert!(!prompts[3].contains("Header row"));

    let stored = ws.load_metadata();
    assert_eq!(stored.verification.verify_resume_cycles, 1);
    assert_eq!(stored.verification.verification_attempts, 2);
    assert_eq!(
        stored.verification.last_verification_status,
        Some(VerificationStatus::Pass)
    );
    assert_eq!(stored.status, WorkspaceStatus::Completed);
}

#[tokio::test]
async fn resumed_loop_ignores_completed_snapshot_from_verified_pass() {
    let ws = TestWorkspace::new(Mode::Loop);
    let runner = ScriptedRunner::new(vec![
        ScriptedSession::writes("TODO.md", "Remaining: 0")
            .and_writes(".status.json", r#"{"complete": true}"#),
        ScriptedSession::writes(REPORT, FAILING_REPORT),
        ScriptedSession::writes("TODO.md", "Remaining: 2"),
        ScriptedSession::writes("TODO.md", "Remaining: 0"),
        ScriptedSession::writes(REPORT, PASSING_REPORT),
    ]);
    let settings = settings();
    let prompts = PromptEngine::new().expect("prompts");
    let ctx = ws.context(&runner, &settings, &prompts);
    let mut metadata = ws.metadata();

    let report = run_workspace(&ctx, &mut metadata, |_| {}).await.expect("run");
    assert_eq!(report.verdict, RunVerdict::Passed);
    assert_eq!(report.resumes, 1);
    assert_eq!(report.iterations_run, 3);
    assert_eq!(runner.requests().len(), 5);
}

#[tokio::test]
async fn resume_shares_the_iteration_budget() {
    let ws = TestWorkspace::new(Mode::Loop);
    let runner = ScriptedRunner::new(vec![
        ScriptedSession::writes("TODO.md", "Remaining: 0"),
        ScriptedSession::writes(REPORT, FAILING_REPORT),
    ]);
    let mut settings = settings();
    settings.max_iterations = 1;
    let prompts = PromptEngine::new().expect("prompts");
    let ctx = ws.context(&runner, &settings, &prompts);
    let mut metadata = ws.metadata();

    let report = run_workspace(&ctx, &mut metadata, |_| {}).await.expect("run");
    assert_eq!(report.verdict, RunVerdict::MaxIterations);
    assert_eq!(report.exit_code(), exit_codes::MAX_ITERATIONS);
    assert_eq!(runner.requests().len(), 2);

    let stored = ws.load_metadata();
    assert_eq!(stored.verification.verify_resume_cycles, 1);
    assert_eq!(stored.status, WorkspaceStatus::InProgress);
    assert!(ws.read("INSTRUCTIONS.md").contains("Outstanding issues"));
}

#[tokio::test]
async fn resume_disabled_reports_failure_without_rewriting_instructions() {
    let ws = TestWorkspace::new(Mode::Loop);
    let runner = ScriptedRunner::new(vec![
        ScriptedSession::writes("TODO.md", "Remaining: 0"),
        ScriptedSession::writes(REPORT, FAILING_REPORT),
    ]);
    let mut settings = settings();
    settings.verification.resume_on_fail = false;
    let prompts = PromptEngine::new().expect("prompts");
    let ctx = ws.context(&runner, &settings, &prompts);
    let mut metadata = ws.metadata();

    let report = run_workspace(&ctx, &mut metadata, |_| {}).await.expect("run");
    assert_eq!(report.verdict, RunVerdict::VerificationFailed);
    assert_eq!(report.exit_code(), exit_codes::VERIFICATION_FAILED);
    assert_eq!(ws.read("INSTRUCTIONS.md"), TEST_INSTRUCTIONS);
    assert_eq!(ws.load_metadata().status, WorkspaceStatus::Completed);
}

#[tokio::test]
async fn interrupted_runner_stops_the_run() {
    let ws = TestWorkspace::new(Mode::Iterative);
    let runner = ScriptedRunner::new(Vec::new());
    runner.begin_shutdown();
    let settings = settings();
    let prompts = PromptEngine::new().expect("prompts");
    let ctx = ws.context(&runner, &settings, &prompts);
    let mut metadata = ws.metadata();

    let report = run_workspace(&ctx, &mut metadata, |_| {}).await.expect("run");
    assert_eq!(report.verdict, RunVerdict::Interrupted);
    assert_eq!(report.exit_code(), exit_codes::INTERRUPTED);
    assert!(runner.requests().is_empty());
}
