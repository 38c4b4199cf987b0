//! Auto-resume decision after a verification attempt.
//!
//! Pure logic: the caller supplies the verification outcome and the persisted
//! counters, and receives what to do next plus the augmented instructions text.

use std::path::Path;

use crate::core::report::VerificationResult;
use crate::core::settings::VerificationSettings;
use crate::core::types::VerificationStatus;

/// Next step after a verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Passed,
    /// Re-enter the loop; `cycle` is the new value of `verifyResumeCycles`.
    Resume { cycle: u32 },
    /// Failed, and every resume cycle has been used.
    Exhausted,
    /// Failed, and resuming is switched off.
    ResumeDisabled,
    /// The reviewer could not decide; a human should look.
    NeedsReview,
}

impl ResumeDecision {
    pub fn is_resume(self) -> bool {
        matches!(self, ResumeDecision::Resume { .. })
    }
}

/// Decide whether a failed verification should re-enter the loop.
///
/// `cycles` is the number of resume cycles already spent on the workspace.
pub fn decide(
    status: VerificationStatus,
    cycles: u32,
    settings: &VerificationSettings,
) -> ResumeDecision {
    match status {
        VerificationStatus::Pass => ResumeDecision::Passed,
        VerificationStatus::NeedsReview => ResumeDecision::NeedsReview,
        VerificationStatus::Fail if !settings.resume_on_fail => ResumeDecision::ResumeDisabled,
        VerificationStatus::Fail if cycles >= settings.max_attempts => ResumeDecision::Exhausted,
        VerificationStatus::Fail => ResumeDecision::Resume { cycle: cycles + 1 },
    }
}

/// Build resume instructions: verification findings first, then the original
/// instructions verbatim.
pub fn augment_instructions(original: &str, result: &VerificationResult) -> String {
    let mut out = String::new();
    out.push_str("# Resume: verification found incomplete work\n\n");
    out.push_str(&format!(
        "A verification review marked this task as {}. \
         Address the findings below before declaring completion again.\n\n",
        result.status.as_str()
    ));

    out.push_str("## Outstanding issues\n\n");
    if result.issues.is_empty() {
        out.push_str("- No individual issues were listed; see the full report.\n");
    } else {
        for (idx, issue) in result.issues.iter().enumerate() {
            out.push_str(&format!("{}. {issue}\n", idx + 1));
        }
    }
    out.push('\n');

    if let Some(action) = &result.recommended_action {
        out.push_str(&format!("Recommended action: {action}\n\n"));
    }
    out.push_str(&format!(
        "Full report: {}\n\n",
        display_path(&result.report_path)
    ));
    out.push_str(
        "Do not rework items the report already verified. \
         Fix only the issues above, then update the progress document.\n\n",
    );
    out.push_str("---\n\n# Original instructions\n\n");
    out.push_str(original);
    out
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::parse_report;

    fn settings(max_attempts: u32, resume_on_fail: bool) -> VerificationSettings {
        VerificationSettings {
            max_attempts,
            resume_on_fail,
            ..VerificationSettings::default()
        }
    }

    #[test]
    fn fail_with_budget_resumes_and_counts_cycle() {
        let decision = decide(VerificationStatus::Fail, 0, &settings(2, true));
        assert_eq!(decision, ResumeDecision::Resume { cycle: 1 });
        assert!(decision.is_resume());
    }

    #[test]
    fn fail_without_budget_is_exhausted() {
        assert_eq!(
            decide(VerificationStatus::Fail, 2, &settings(2, true)),
            ResumeDecision::Exhausted
        );
        assert_eq!(
            decide(VerificationStatus::Fail, 0, &settings(0, true)),
            ResumeDecision::Exhausted
        );
    }

    #[test]
    fn resume_switch_off_wins_over_budget() {
        assert_eq!(
            decide(VerificationStatus::Fail, 0, &settings(5, false)),
            ResumeDecision::ResumeDisabled
        );
    }

    #[test]
    fn pass_and_needs_review_never_resume() {
        assert_eq!(
            decide(VerificationStatus::Pass, 0, &settings(2, true)),
            ResumeDecision::Passed
        );
        assert_eq!(
            decide(VerificationStatus::NeedsReview, 0, &settings(2, true)),
            ResumeDecision::NeedsReview
        );
    }

    #[test]
    fn augmented_instructions_list_issues_and_end_with_original() {
        let report = "❌ INCOMPLETE\n\n## Incomplete Requirements\n\n1. **Export**\n2. **Docs**\n";
        let result = parse_report(report, Path::new("/ws/verification-report.md"));
        let original = "# Task\n\nBuild the exporter.\n";

        let text = augment_instructions(original, &result);
        assert!(text.contains("1. Export"));
        assert!(text.contains("2. Docs"));
        assert!(text.contains("/ws/verification-report.md"));
        assert!(text.contains("Do not rework items"));
        assert!(text.ends_with(original));
    }
}
