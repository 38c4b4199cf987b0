//! Verification report parsing.
//!
//! The report is markdown written by the external tool. Parsing never fails:
//! anything unrecognised degrades to `needs_review` with empty fields.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::{Confidence, VerificationStatus};

pub const FALLBACK_SUMMARY: &str = "No summary provided in the verification report.";

/// Status markers, matched as literal substrings. The earliest occurrence in
/// the document decides the status.
const STATUS_MARKERS: &[(&str, VerificationStatus)] = &[
    ("✅ VERIFIED COMPLETE", VerificationStatus::Pass),
    ("✅ VERIFIED", VerificationStatus::Pass),
    ("❌ INCOMPLETE", VerificationStatus::Fail),
    ("⚠️ NEEDS REVIEW", VerificationStatus::NeedsReview),
    ("⚠ NEEDS REVIEW", VerificationStatus::NeedsReview),
];

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$").expect("heading pattern is valid"));

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}\d+[.)]\s+(.+)$").expect("numbered pattern is valid"));

static BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold pattern is valid"));

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\*\*Confidence(?:\s+Level)?(?::\*\*|\*\*\s*:)\s*\**\s*([a-z]+)")
        .expect("confidence pattern is valid")
});

static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\*\*Recommended\s+Action(?::\*\*|\*\*\s*:)\s*(.+)$")
        .expect("action pattern is valid")
});

/// Parsed verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub summary: String,
    pub issues: Vec<String>,
    pub confidence: Option<Confidence>,
    pub recommended_action: Option<String>,
    pub report_path: PathBuf,
}

impl VerificationResult {
    /// Result used when a report exists but says nothing recognisable.
    pub fn needs_review(report_path: &Path) -> Self {
        Self {
            status: VerificationStatus::NeedsReview,
            summary: FALLBACK_SUMMARY.to_string(),
            issues: Vec::new(),
            confidence: None,
            recommended_action: None,
            report_path: report_path.to_path_buf(),
        }
    }
}

/// Parse report markdown into a [`VerificationResult`].
pub fn parse_report(markdown: &str, report_path: &Path) -> VerificationResult {
    let sections = Section::split(markdown);
    VerificationResult {
        status: parse_status(markdown),
        summary: parse_summary(&sections),
        issues: parse_issues(&sections),
        confidence: parse_confidence(markdown),
        recommended_action: parse_action(markdown),
        report_path: report_path.to_path_buf(),
    }
}

fn parse_status(markdown: &str) -> VerificationStatus {
    STATUS_MARKERS
        .iter()
        .filter_map(|(marker, status)| markdown.find(marker).map(|pos| (pos, *status)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, status)| status)
        .unwrap_or(VerificationStatus::NeedsReview)
}

/// A heading and the lines that follow it up to the next heading of the same
/// or higher level.
#[derive(Debug)]
struct Section<'a> {
    level: usize,
    title: &'a str,
    body: Vec<&'a str>,
}

impl<'a> Section<'a> {
    fn split(markdown: &'a str) -> Vec<Section<'a>> {
        let lines: Vec<&str> = markdown.lines().collect();
        let headings: Vec<(usize, usize, &str)> = lines
            .iter()
            .enumerate()
            .filter_map(|(idx, line)| {
                let caps = HEADING_RE.captures(line)?;
                let level = caps.get(1)?.as_str().len();
                let title = caps.get(2)?.as_str();
                Some((idx, level, title))
            })
            .collect();

        headings
            .iter()
            .enumerate()
            .map(|(pos, &(idx, level, title))| {
                let end = headings[pos + 1..]
                    .iter()
                    .find(|(_, next_level, _)| *next_level <= level)
                    .map_or(lines.len(), |(next_idx, _, _)| *next_idx);
                Section {
                    level,
                    title,
                    body: lines[idx + 1..end].to_vec(),
                }
            })
            .collect()
    }

    fn title_contains(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
    }
}

fn parse_summary(sections: &[Section<'_>]) -> String {
    sections
        .iter()
        .find(|section| section.level <= 2 && section.title.trim().eq_ignore_ascii_case("summary"))
        .map(|section| {
            let own: Vec<&str> = section
                .body
                .iter()
                .take_while(|line| !is_major_heading(line))
                .copied()
                .collect();
            own.join("\n").trim().to_string()
        })
        .filter(|summary| !summary.is_empty())
        .unwrap_or_else(|| FALLBACK_SUMMARY.to_string())
}

fn is_major_heading(line: &str) -> bool {
    HEADING_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .is_some_and(|hashes| hashes.as_str().len() <= 2)
}

fn parse_issues(sections: &[Section<'_>]) -> Vec<String> {
    let Some(section) = sections
        .iter()
        .find(|section| section.title_contains("incomplete requirements"))
    else {
        return Vec::new();
    };

    section
        .body
        .iter()
        .filter_map(|line| NUMBERED_RE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| issue_text(m.as_str())))
        .filter(|issue| !issue.is_empty())
        .collect()
}

fn issue_text(item: &str) -> String {
    match BOLD_RE.captures(item).and_then(|caps| caps.get(1)) {
        Some(bold) => bold.as_str().trim().trim_end_matches(':').trim().to_string(),
        None => item.trim().to_string(),
    }
}

fn parse_confidence(markdown: &str) -> Option<Confidence> {
    let raw = CONFIDENCE_RE.captures(markdown)?.get(1)?.as_str().to_lowercase();
    match raw.as_str() {
        "high" => Some(Confidence::High),
        "medium" => Some(Confidence::Medium),
        "low" => Some(Confidence::Low),
        _ => None,
    }
}

fn parse_action(markdown: &str) -> Option<String> {
    let raw = ACTION_RE.captures(markdown)?.get(1)?.as_str();
    let cleaned = raw.trim().trim_matches('*').trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAILING: &str = "\
# Verification Report

**Status**: ❌ INCOMPLETE

## Summary

Core features exist but the export path is missing.
Tests cover only the parser.

## Findings

### ✅ Verified Requirements

1. **Parser** handles all inputs

### ❌ Incomplete Requirements

1. **CSV export**: no implementation found
   - expected `export.rs`
2. **Error messages** are generic
3. Documentation for the CLI flags

### Notes

4. not an issue

**Confidence Level**: High
**Recommended Action**: Resume work on export and errors
";

    fn path() -> PathBuf {
        PathBuf::from("/ws/verification-report.md")
    }

    #[test]
    fn failing_report_yields_fail_with_three_issues() {
        let result = parse_report(FAILING, &path());
        assert_eq!(result.status, VerificationStatus::Fail);
        assert_eq!(
            result.issues,
            vec![
                "CSV export",
                "Error messages",
                "Documentation for the CLI flags"
            ]
        );
        assert_eq!(result.confidence, Some(Confidence::High));
        assert_eq!(
            result.recommended_action.as_deref(),
            Some("Resume work on export and errors")
        );
        assert_eq!(result.report_path, path());
    }

    #[test]
    fn summary_stops_at_next_heading() {
        let result = parse_report(FAILING, &path());
        assert_eq!(
            result.summary,
            "Core features exist but the export path is missing.\nTests cover only the parser."
        );
    }

    #[test]
    fn summary_keeps_its_subsections() {
        let text = "✅ VERIFIED\n\n## Summary\nAll good.\n\n### Details\nExport verified.\n\n## Findings\nx\n";
        let result = parse_report(text, &path());
        assert_eq!(result.summary, "All good.\n\n### Details\nExport verified.");
    }

    #[test]
    fn level_one_summary_ends_at_level_two_heading() {
        let text = "# Summary\nShort.\n## Findings\nx\n";
        assert_eq!(parse_report(text, &path()).summary, "Short.");
    }

    #[test]
    fn report_without_markers_needs_review_with_fallback_summary() {
        let result = parse_report("# Notes\n\nLooked around, unsure.\n", &path());
        assert_eq!(result.status, VerificationStatus::NeedsReview);
        assert_eq!(result.summary, FALLBACK_SUMMARY);
        assert!(result.issues.is_empty());
        assert_eq!(result.confidence, None);
        assert_eq!(result.recommended_action, None);
    }

    #[test]
    fn first_marker_in_document_order_wins() {
        let pass_first = "✅ VERIFIED COMPLETE\n\nearlier draft said ❌ INCOMPLETE";
        assert_eq!(
            parse_report(pass_first, &path()).status,
            VerificationStatus::Pass
        );
        let fail_first = "❌ INCOMPLETE\n\nwas ✅ VERIFIED before";
        assert_eq!(
            parse_report(fail_first, &path()).status,
            VerificationStatus::Fail
        );
    }

    #[test]
    fn colon_inside_bold_is_accepted() {
        let text = "✅ VERIFIED\n\n**Confidence Level:** medium\n**Recommended Action:** **Ship it**\n";
        let result = parse_report(text, &path());
        assert_eq!(result.status, VerificationStatus::Pass);
        assert_eq!(result.confidence, Some(Confidence::Medium));
        assert_eq!(result.recommended_action.as_deref(), Some("Ship it"));
    }

    #[test]
    fn unknown_confidence_is_none() {
        let result = parse_report("**Confidence Level**: unsure", &path());
        assert_eq!(result.confidence, None);
    }
}
