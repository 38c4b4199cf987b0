//! Shared deterministic types for the iterate core.
//!
//! These types define stable contracts between core components and the
//! persisted workspace files. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a workspace tracks progress in its progress document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Progress tracked via a numeric `Remaining: N` marker.
    #[default]
    Loop,
    /// Progress tracked via markdown checkboxes.
    Iterative,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Loop => "loop",
            Mode::Iterative => "iterative",
        }
    }
}

/// Lifecycle status persisted in workspace metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    InProgress,
    Completed,
    Error,
}

/// Outcome of parsing a verification report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pass,
    Fail,
    NeedsReview,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Pass => "pass",
            VerificationStatus::Fail => "fail",
            VerificationStatus::NeedsReview => "needs_review",
        }
    }
}

/// Reviewer confidence stated in a verification report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Review breadth requested from the external tool. Parsing is identical for
/// every depth; only the prompt differs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl Depth {
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Quick => "quick",
            Depth::Standard => "standard",
            Depth::Deep => "deep",
        }
    }
}

/// Console verbosity for the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Quiet,
    #[default]
    Progress,
    Verbose,
}

impl OutputLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputLevel::Quiet => "quiet",
            OutputLevel::Progress => "progress",
            OutputLevel::Verbose => "verbose",
        }
    }
}

macro_rules! impl_from_str_display {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                let wanted = raw.trim().to_ascii_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|candidate| candidate.as_str() == wanted)
                    .ok_or_else(|| {
                        let allowed: Vec<&str> = [$($variant),+].iter().map(|v| v.as_str()).collect();
                        format!("invalid value '{raw}' (expected one of: {})", allowed.join(", "))
                    })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_from_str_display!(Mode, [Mode::Loop, Mode::Iterative]);
impl_from_str_display!(Depth, [Depth::Quick, Depth::Standard, Depth::Deep]);
impl_from_str_display!(
    OutputLevel,
    [OutputLevel::Quiet, OutputLevel::Progress, OutputLevel::Verbose]
);
