//! `iterate` command line.
//!
//! Runs an external coding tool against a workspace in short sessions until
//! the work is complete and verified.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use iterate::core::report::VerificationResult;
use iterate::core::resolve::{CliOverrides, ConfigLayers, ResolvedConfig, resolve};
use iterate::core::settings::Settings;
use iterate::core::types::{Depth, Mode, OutputLevel, VerificationStatus, WorkspaceStatus};
use iterate::exit_codes;
use iterate::io::config::{LayerSources, resolve_layers, with_workspace};
use iterate::io::metadata::WorkspaceMetadata;
use iterate::io::process::{KillReason, Supervisor, Termination};
use iterate::io::prompt::PromptEngine;
use iterate::io::status::try_read_status;
use iterate::io::watcher::{StatusChangedEvent, StatusWatcher, WatchOptions};
use iterate::io::workspace::{InitOptions, WorkspacePaths, init_workspace, open_workspace};
use iterate::logging;
use iterate::looping::{IterationReport, LoopContext, assess_workspace};
use iterate::run::{RunEvent, RunReport, RunVerdict, run_workspace};
use iterate::verify::{VerifyError, verify};

#[derive(Parser)]
#[command(
    name = "iterate",
    version,
    about = "Drive an autonomous coding tool in iterations until the work is verified"
)]
struct Cli {
    /// Project directory holding `.iterate.toml` and the workspaces.
    #[arg(long, global = true, value_name = "DIR")]
    project_dir: Option<PathBuf>,
    /// User config file (default: `<config dir>/iterate/config.toml`).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Show debug diagnostics and live tool output.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Only print errors and the final result.
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Output level: quiet, progress, or verbose. Overrides -v/-q.
    #[arg(long, global = true, value_name = "LEVEL")]
    output: Option<OutputLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a workspace.
    Init {
        name: String,
        /// Progress tracking mode: loop or iterative.
        #[arg(long)]
        mode: Option<Mode>,
        /// File whose contents become INSTRUCTIONS.md.
        #[arg(long, value_name = "FILE")]
        instructions: Option<PathBuf>,
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        max_iterations: Option<u32>,
        #[arg(long)]
        delay: Option<u64>,
        #[arg(long)]
        stagnation_threshold: Option<u32>,
    },
    /// Iterate on a workspace until it is complete and verified.
    Run {
        name: String,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Verify a workspace once without iterating.
    Verify {
        name: String,
        #[arg(long)]
        depth: Option<Depth>,
    },
    /// Print every effective setting and the layer it came from.
    Config {
        workspace: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print status snapshot changes as the tool writes them.
    Watch {
        name: String,
        /// One JSON event per line.
        #[arg(long)]
        json: bool,
    },
    /// Show workspace metadata and current progress.
    Status { name: String },
}

#[derive(Args, Debug, Default)]
struct RunFlags {
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: Option<u32>,
    /// Seconds between iterations.
    #[arg(long)]
    delay: Option<u64>,
    #[arg(long)]
    stagnation_threshold: Option<u32>,
    /// Skip verification after completion.
    #[arg(long)]
    no_verify: bool,
    /// Do not resume the loop after a failed verification.
    #[arg(long)]
    no_resume: bool,
    #[arg(long)]
    verify_depth: Option<Depth>,
    #[arg(long)]
    max_verify_attempts: Option<u32>,
    /// Tool executable.
    #[arg(long)]
    command: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("determine current directory")?,
    };
    let overrides = cli_overrides(&cli);
    let sources = LayerSources::new(&project_dir, cli.config.clone());
    let layers = sources.load(overrides.into_layer())?;

    // Resolve once without a workspace so logging follows outputLevel.
    let base = resolve(&layers);
    logging::init(base.settings.output_level);

    let workspace_paths = |name: &str| {
        WorkspacePaths::new(&project_dir, &base.settings.workspaces_dir, name)
    };

    match cli.command {
        Command::Init {
            name,
            mode,
            instructions,
            max_iterations,
            delay,
            stagnation_threshold,
        } => {
            let paths = workspace_paths(&name)?;
            let instructions = instructions
                .map(|path| {
                    fs::read_to_string(&path)
                        .with_context(|| format!("read instructions {}", path.display()))
                })
                .transpose()?;
            let options = InitOptions {
                mode: mode.unwrap_or(base.settings.default_mode),
                instructions,
                max_iterations,
                delay,
                stagnation_threshold,
            };
            let metadata = init_workspace(&paths, &options, Utc::now())?;
            println!(
                "Created {} workspace '{}' at {}",
                metadata.mode,
                metadata.name,
                paths.dir.display()
            );
            Ok(exit_codes::OK)
        }
        Command::Run { name, .. } => {
            let paths = workspace_paths(&name)?;
            let (metadata, resolved) = open_resolved(&paths, layers)?;
            block_on(cmd_run(paths, metadata, resolved.settings))
        }
        Command::Verify { name, depth } => {
            let paths = workspace_paths(&name)?;
            let (metadata, resolved) = open_resolved(&paths, layers)?;
            let depth = depth.unwrap_or(resolved.settings.verification.depth);
            block_on(cmd_verify(paths, metadata, resolved.settings, depth))
        }
        Command::Config { workspace, json } => {
            let resolved = match workspace {
                Some(name) => open_resolved(&workspace_paths(&name)?, layers)?.1,
                None => resolve_layers(&layers),
            };
            print_config(&resolved, json)?;
            Ok(exit_codes::OK)
        }
        Command::Watch { name, json } => {
            let paths = workspace_paths(&name)?;
            let (_, resolved) = open_resolved(&paths, layers)?;
            block_on(cmd_watch(paths, resolved.settings, json))
        }
        Command::Status { name } => {
            let paths = workspace_paths(&name)?;
            let (metadata, resolved) = open_resolved(&paths, layers)?;
            print_status(&paths, &metadata, &resolved.settings);
            Ok(exit_codes::OK)
        }
    }
}

fn cli_overrides(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        verbose: cli.verbose,
        quiet: cli.quiet,
        output: cli.output,
        ..CliOverrides::default()
    };
    if let Command::Run { flags, .. } = &cli.command {
        overrides.max_iterations = flags.max_iterations;
        overrides.delay = flags.delay;
        overrides.stagnation_threshold = flags.stagnation_threshold;
        overrides.no_verify = flags.no_verify;
        overrides.no_resume = flags.no_resume;
        overrides.verify_depth = flags.verify_depth;
        overrides.max_verify_attempts = flags.max_verify_attempts;
        overrides.command = flags.command.clone();
        overrides.model = flags.model.clone();
    }
    overrides
}

fn open_resolved(
    paths: &WorkspacePaths,
    layers: ConfigLayers,
) -> Result<(WorkspaceMetadata, ResolvedConfig)> {
    let metadata = open_workspace(paths)?;
    let layers = with_workspace(layers, &metadata)?;
    Ok((metadata, resolve_layers(&layers)))
}

fn block_on<F: Future<Output = Result<i32>>>(future: F) -> Result<i32> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?
        .block_on(future)
}

/// Forward Ctrl-C and SIGTERM to a graceful supervisor shutdown.
fn install_shutdown_handler(supervisor: &Supervisor, settings: &Settings) {
    let supervisor = supervisor.clone();
    let grace = Duration::from_millis(settings.shutdown.grace_ms);
    tokio::spawn(async move {
        wait_for_interrupt().await;
        warn!("interrupt received, stopping the running session");
        let outcome = supervisor.shutdown(grace).await;
        info!(outcome = ?outcome, "shutdown finished");
    });
}

async fn wait_for_interrupt() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(err = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Print tool stdout lines as they arrive.
fn live_output(level: OutputLevel) -> Option<mpsc::UnboundedSender<String>> {
    if level != OutputLevel::Verbose {
        return None;
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            eprintln!("  | {line}");
        }
    });
    Some(tx)
}

async fn cmd_run(
    paths: WorkspacePaths,
    mut metadata: WorkspaceMetadata,
    settings: Settings,
) -> Result<i32> {
    let supervisor = Supervisor::new(&settings.shutdown);
    install_shutdown_handler(&supervisor, &settings);
    let prompts = PromptEngine::new()?;
    let ctx = LoopContext {
        runner: &supervisor,
        paths: &paths,
        settings: &settings,
        prompts: &prompts,
        line_tap: live_output(settings.output_level),
    };

    let level = settings.output_level;
    let report = run_workspace(&ctx, &mut metadata, |event| {
        if level != OutputLevel::Quiet {
            print_event(event);
        }
    })
    .await?;
    print_run_report(&paths, &report);
    Ok(report.exit_code())
}

async fn cmd_verify(
    paths: WorkspacePaths,
    mut metadata: WorkspaceMetadata,
    settings: Settings,
    depth: Depth,
) -> Result<i32> {
    let supervisor = Supervisor::new(&settings.shutdown);
    install_shutdown_handler(&supervisor, &settings);
    let prompts = PromptEngine::new()?;
    let ctx = LoopContext {
        runner: &supervisor,
        paths: &paths,
        settings: &settings,
        prompts: &prompts,
        line_tap: live_output(settings.output_level),
    };

    match verify(&ctx, &mut metadata, depth).await {
        Ok(result) => {
            print_verification(&result);
            Ok(match result.status {
                VerificationStatus::Pass => exit_codes::OK,
                VerificationStatus::Fail | VerificationStatus::NeedsReview => {
                    exit_codes::VERIFICATION_FAILED
                }
            })
        }
        Err(VerifyError::Interrupted) => {
            eprintln!("verification interrupted");
            Ok(exit_codes::INTERRUPTED)
        }
        Err(err) => Err(err.into()),
    }
}

async fn cmd_watch(paths: WorkspacePaths, settings: Settings, json: bool) -> Result<i32> {
    let mut watcher = StatusWatcher::new(&paths.status_path, WatchOptions::from(&settings.watch));
    let mut events = watcher.start()?;
    eprintln!("Watching {} (Ctrl-C to stop)", paths.status_path.display());

    let interrupt = wait_for_interrupt();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            () = &mut interrupt => break,
            event = events.recv() => match event {
                Some(event) => print_status_event(&event, json)?,
                None => break,
            },
        }
    }
    watcher.stop().await;
    Ok(exit_codes::OK)
}

fn print_event(event: RunEvent<'_>) {
    match event {
        RunEvent::Iteration(report) => println!("{}", iteration_line(report)),
        RunEvent::Verified(result) => print_verification(result),
        RunEvent::Resuming { cycle } => {
            println!("Resuming with verification findings (cycle {cycle})");
        }
    }
}

fn iteration_line(report: &IterationReport) -> String {
    let outcome = match report.termination {
        Termination::Normal => "ok".to_string(),
        Termination::ErrorExit => format!(
            "exit {}",
            report.exit_code.map_or_else(|| "?".to_string(), |c| c.to_string())
        ),
        Termination::Killed {
            reason: KillReason::Timeout,
            ..
        } => "timed out".to_string(),
        Termination::Killed { .. } => "killed".to_string(),
    };
    let remaining = match (report.assessment.complete, report.assessment.remaining) {
        (true, _) => "complete".to_string(),
        (false, Some(n)) => format!("{n} remaining"),
        (false, None) => "remaining unknown".to_string(),
    };
    format!(
        "Iteration {}: {outcome} in {:.1}s, {remaining}",
        report.iteration,
        report.duration.as_secs_f64()
    )
}

fn print_verification(result: &VerificationResult) {
    println!("Verification: {}", result.status.as_str());
    println!("  {}", result.summary);
    for (idx, issue) in result.issues.iter().enumerate() {
        println!("  {}. {issue}", idx + 1);
    }
    if let Some(action) = &result.recommended_action {
        println!("  Recommended action: {action}");
    }
    println!("  Report: {}", result.report_path.display());
}

fn print_run_report(paths: &WorkspacePaths, report: &RunReport) {
    let verdict = match report.verdict {
        RunVerdict::Passed => "complete and verified",
        RunVerdict::Unverified => "complete (verification skipped)",
        RunVerdict::VerificationFailed => "verification failed",
        RunVerdict::NeedsReview => "verification needs human review",
        RunVerdict::Stagnated => "stopped: no progress",
        RunVerdict::MaxIterations => "stopped: iteration limit reached",
        RunVerdict::Interrupted => "interrupted",
    };
    println!(
        "Workspace '{}': {verdict} after {} iteration(s)",
        paths.name, report.iterations_run
    );
    if report.resumes > 0 {
        println!("  Resume cycles this run: {}", report.resumes);
    }
}

fn print_config(resolved: &ResolvedConfig, json: bool) -> Result<()> {
    if json {
        let payload =
            serde_json::to_string_pretty(resolved.effective()).context("serialize config")?;
        println!("{payload}");
        return Ok(());
    }
    let width = resolved
        .effective()
        .keys()
        .map(String::len)
        .max()
        .unwrap_or_default();
    for entry in resolved.effective().values() {
        println!("{:width$}  {}  ({})", entry.key, entry.value, entry.source);
    }
    Ok(())
}

fn print_status_event(event: &StatusChangedEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event).context("serialize status event")?);
        return Ok(());
    }
    let current = &event.current;
    let mut line = format!(
        "[{}] {}/{} done",
        event.timestamp.format("%H:%M:%S"),
        current.progress.completed,
        current.progress.total
    );
    if event.delta.completed_delta != 0 {
        line.push_str(&format!(" ({:+})", event.delta.completed_delta));
    }
    if current.complete {
        line.push_str(", complete");
    }
    if let Some(summary) = &current.summary {
        line.push_str(&format!(": {summary}"));
    }
    println!("{line}");
    Ok(())
}

fn print_status(paths: &WorkspacePaths, metadata: &WorkspaceMetadata, settings: &Settings) {
    let assessment = assess_workspace(paths, metadata.mode, &settings.completion_markers);
    let verification = &metadata.verification;
    println!("Workspace:  {} ({})", metadata.name, paths.dir.display());
    println!("Mode:       {}", metadata.mode);
    println!("Status:     {}", workspace_status(metadata));
    println!(
        "Iterations: {} (limit per run {})",
        metadata.iterations, settings.max_iterations
    );
    if let Some(last_run) = metadata.last_run {
        println!("Last run:   {}", last_run.to_rfc3339());
    }
    match assessment.remaining {
        Some(remaining) => println!("Remaining:  {remaining}"),
        None => println!("Remaining:  unknown"),
    }
    if let Some(summary) = try_read_status(&paths.status_path).and_then(|s| s.summary) {
        println!("Summary:    {summary}");
    }
    if let Some(status) = verification.last_verification_status {
        println!(
            "Verified:   {} ({} attempt(s), {} resume cycle(s))",
            status.as_str(),
            verification.verification_attempts,
            verification.verify_resume_cycles
        );
    }
    if let Some(report) = &verification.last_verification_report {
        println!("Report:     {}", display_relative(Path::new(report), &paths.dir));
    }
}

fn workspace_status(metadata: &WorkspaceMetadata) -> &'static str {
    match metadata.status {
        WorkspaceStatus::InProgress => "in progress",
        WorkspaceStatus::Completed => "completed",
        WorkspaceStatus::Error => "error",
    }
}

fn display_relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "iterate",
            "run",
            "exporter",
            "--max-iterations",
            "5",
            "--no-verify",
            "--verify-depth",
            "deep",
            "--model",
            "opus",
        ]);
        let Command::Run { name, flags } = &cli.command else {
            panic!("expected run");
        };
        assert_eq!(name, "exporter");
        assert_eq!(flags.max_iterations, Some(5));
        assert!(flags.no_verify);
        assert_eq!(flags.verify_depth, Some(Depth::Deep));
        assert_eq!(flags.model.as_deref(), Some("opus"));
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() {
        let cli = Cli::parse_from(["iterate", "status", "exporter", "--quiet", "--output", "verbose"]);
        assert!(cli.quiet);
        assert_eq!(cli.output, Some(OutputLevel::Verbose));
    }

    #[test]
    fn run_flags_become_cli_layer() {
        let cli = Cli::parse_from(["iterate", "-v", "run", "exporter", "--no-resume", "--delay", "0"]);
        let layer = cli_overrides(&cli).into_layer();
        assert_eq!(layer["outputLevel"], "verbose");
        assert_eq!(layer["delay"], 0);
        assert_eq!(layer["verification"]["resumeOnFail"], false);
        assert!(layer.get("maxIterations").is_none());
    }

    #[test]
    fn init_rejects_unknown_mode() {
        let result = Cli::try_parse_from(["iterate", "init", "exporter", "--mode", "sideways"]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_max_iterations_is_rejected() {
        for command in ["init", "run"] {
            let result =
                Cli::try_parse_from(["iterate", command, "exporter", "--max-iterations", "0"]);
            assert!(result.is_err(), "{command}");
        }
        assert!(Cli::try_parse_from(["iterate", "init", "exporter", "--max-iterations", "1"]).is_ok());
    }

    #[test]
    fn iteration_line_reports_timeout_and_remaining() {
        let report = IterationReport {
            iteration: 4,
            termination: Termination::Killed {
                reason: KillReason::Timeout,
                signal: Some(15),
            },
            exit_code: None,
            duration: Duration::from_millis(1_500),
            assessment: iterate::core::oracle::Assessment {
                complete: false,
                remaining: Some(3),
            },
        };
        assert_eq!(
            iteration_line(&report),
            "Iteration 4: timed out in 1.5s, 3 remaining"
        );
    }
}
