//! Typed settings produced by the configuration resolver.
//!
//! Keys are camelCase so that the dotted paths shown by `iterate config`
//! match what users write in layer files (`verification.depth`,
//! `claude.args`, ...).

use serde::{Deserialize, Serialize};

use crate::core::types::{Depth, Mode, OutputLevel};

/// Fully populated settings for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Upper bound on iterations per `run` invocation.
    pub max_iterations: u32,
    /// Pause between iterations, in seconds.
    pub delay: u64,
    /// Wall-clock budget for one session, in seconds.
    pub iteration_timeout: u64,
    /// Consecutive unchanged remaining-counts tolerated before stopping. `0` disables.
    pub stagnation_threshold: u32,
    /// Literal strings that mark a loop-mode progress document as finished.
    pub completion_markers: Vec<String>,
    pub output_level: OutputLevel,
    /// Mode given to workspaces created without `--mode`.
    pub default_mode: Mode,
    /// Workspace root, relative to the project directory unless absolute.
    pub workspaces_dir: String,
    /// Per-stream cap on captured session output.
    pub output_limit_bytes: usize,
    pub claude: ClaudeSettings,
    pub verification: VerificationSettings,
    pub shutdown: ShutdownSettings,
    pub watch: WatchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            delay: 2,
            iteration_timeout: 30 * 60,
            stagnation_threshold: 2,
            completion_markers: vec!["TASK COMPLETE".to_string()],
            output_level: OutputLevel::Progress,
            default_mode: Mode::Loop,
            workspaces_dir: "iterate/workspaces".to_string(),
            output_limit_bytes: 100_000,
            claude: ClaudeSettings::default(),
            verification: VerificationSettings::default(),
            shutdown: ShutdownSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}

/// External tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClaudeSettings {
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            model: None,
        }
    }
}

impl ClaudeSettings {
    /// Full argument vector for one session.
    pub fn session_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationSettings {
    /// Verify automatically when the loop reports completion.
    pub auto_verify: bool,
    /// Re-enter the loop when verification fails.
    pub resume_on_fail: bool,
    /// Maximum resume cycles per workspace.
    pub max_attempts: u32,
    pub depth: Depth,
    pub report_filename: String,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            auto_verify: true,
            resume_on_fail: true,
            max_attempts: 2,
            depth: Depth::Standard,
            report_filename: "verification-report.md".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShutdownSettings {
    /// Time between SIGTERM and SIGKILL.
    pub grace_ms: u64,
    /// Backstop wait after SIGKILL.
    pub kill_timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_ms: 5_000,
            kill_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchSettings {
    pub debounce_ms: u64,
    /// Drop rewrites that change nothing but bookkeeping fields.
    pub meaningful_only: bool,
    /// Whether a summary-only edit counts as meaningful.
    pub summary_is_meaningful: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            meaningful_only: true,
            summary_is_meaningful: true,
        }
    }
}
