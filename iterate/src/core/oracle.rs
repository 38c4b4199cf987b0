//! Completion and stagnation detection over workspace artifacts.
//!
//! Each [`Mode`] has its own scanner; both report through [`Assessment`] so
//! callers share one remaining-count contract. A parseable status snapshot
//! overrides whatever the progress document says.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::snapshot::StatusSnapshot;
use crate::core::types::Mode;

static REMAINING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)remaining(?:\s+(?:items?|tasks?))?[\s*_]*:[\s*_]*(\d+)")
        .expect("remaining pattern is valid")
});

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*[-*+]\s+\[([ xX])\]").expect("checkbox pattern is valid")
});

/// What the oracle concluded about one workspace state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub complete: bool,
    /// `None` when nothing trackable was found.
    pub remaining: Option<u32>,
}

/// Inputs gathered from the workspace by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Artifacts<'a> {
    /// Progress document text; `None` when the file does not exist.
    pub document: Option<&'a str>,
    /// Status snapshot, only when present and parseable.
    pub snapshot: Option<&'a StatusSnapshot>,
}

/// Assess completion for `mode`. `markers` are literal completion markers
/// honoured in loop mode.
pub fn assess(mode: Mode, artifacts: Artifacts<'_>, markers: &[String]) -> Assessment {
    let from_document = match (mode, artifacts.document) {
        (_, None) => Assessment {
            complete: false,
            remaining: None,
        },
        (Mode::Loop, Some(doc)) => assess_loop(doc, markers),
        (Mode::Iterative, Some(doc)) => assess_iterative(doc),
    };

    match artifacts.snapshot {
        Some(snapshot) => Assessment {
            complete: snapshot.complete,
            remaining: snapshot.remaining().or(if snapshot.complete {
                Some(0)
            } else {
                from_document.remaining
            }),
        },
        None => from_document,
    }
}

pub fn is_complete(mode: Mode, artifacts: Artifacts<'_>, markers: &[String]) -> bool {
    assess(mode, artifacts, markers).complete
}

pub fn remaining_count(mode: Mode, artifacts: Artifacts<'_>, markers: &[String]) -> Option<u32> {
    assess(mode, artifacts, markers).remaining
}

fn assess_loop(doc: &str, markers: &[String]) -> Assessment {
    let remaining = REMAINING_RE
        .captures(doc)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());
    let marker_hit = markers
        .iter()
        .filter(|marker| !marker.trim().is_empty())
        .any(|marker| doc.contains(marker.as_str()));
    Assessment {
        complete: remaining == Some(0) || marker_hit,
        remaining: if marker_hit { Some(0) } else { remaining },
    }
}

fn assess_iterative(doc: &str) -> Assessment {
    let mut total = 0u32;
    let mut unchecked = 0u32;
    for caps in CHECKBOX_RE.captures_iter(doc) {
        total += 1;
        if caps.get(1).is_some_and(|m| m.as_str() == " ") {
            unchecked += 1;
        }
    }
    Assessment {
        complete: total > 0 && unchecked == 0,
        remaining: (total > 0).then_some(unchecked),
    }
}

/// Counts consecutive iterations whose remaining count did not move.
#[derive(Debug, Clone)]
pub struct StagnationTracker {
    threshold: u32,
    last: Option<u32>,
    unchanged: u32,
}

impl StagnationTracker {
    /// `threshold == 0` disables detection.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last: None,
            unchanged: 0,
        }
    }

    /// Record the remaining count after an iteration. Returns true once the
    /// count has been the same non-zero value for `threshold` comparisons.
    pub fn observe(&mut self, remaining: Option<u32>) -> bool {
        match (self.last, remaining) {
            (Some(prev), Some(cur)) if prev == cur && cur > 0 => self.unchanged += 1,
            _ => self.unchanged = 0,
        }
        self.last = remaining;
        self.is_stagnant()
    }

    pub fn is_stagnant(&self) -> bool {
        self.threshold > 0 && self.unchanged >= self.threshold
    }

    pub fn unchanged(&self) -> u32 {
        self.unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Progress;

    fn markers() -> Vec<String> {
        vec!["TASK COMPLETE".to_string()]
    }

    fn doc(text: &str) -> Artifacts<'_> {
        Artifacts {
            document: Some(text),
            snapshot: None,
        }
    }

    #[test]
    fn loop_mode_reads_remaining_with_emphasis() {
        for text in [
            "Remaining: 4",
            "**Remaining**: 4",
            "**Remaining:** 4",
            "_remaining_: 4",
            "REMAINING ITEMS: 4",
        ] {
            assert_eq!(remaining_count(Mode::Loop, doc(text), &markers()), Some(4), "{text}");
        }
    }

    #[test]
    fn loop_mode_complete_on_zero_or_marker() {
        assert!(is_complete(Mode::Loop, doc("## Status\n**Remaining**: 0\n"), &markers()));
        assert!(is_complete(Mode::Loop, doc("Remaining: 2\n\nTASK COMPLETE"), &markers()));
        assert!(!is_complete(Mode::Loop, doc("Remaining: 10"), &markers()));
        assert!(!is_complete(Mode::Loop, doc("no markers here"), &markers()));
    }

    #[test]
    fn missing_document_is_not_complete() {
        let artifacts = Artifacts::default();
        assert!(!is_complete(Mode::Loop, artifacts, &markers()));
        assert_eq!(remaining_count(Mode::Iterative, artifacts, &markers()), None);
    }

    #[test]
    fn iterative_mode_counts_checkboxes() {
        let text = "- [x] one\n- [ ] two\n* [X] three\n  + [ ] four\n";
        let assessment = assess(Mode::Iterative, doc(text), &markers());
        assert_eq!(
            assessment,
            Assessment {
                complete: false,
                remaining: Some(2)
            }
        );

        let done = "- [x] one\n- [X] two\n";
        assert!(is_complete(Mode::Iterative, doc(done), &markers()));
    }

    #[test]
    fn iterative_mode_needs_at_least_one_checkbox() {
        let assessment = assess(Mode::Iterative, doc("Remaining: 0"), &markers());
        assert!(!assessment.complete);
        assert_eq!(assessment.remaining, None);
    }

    #[test]
    fn snapshot_overrides_document() {
        let complete = StatusSnapshot {
            complete: true,
            ..StatusSnapshot::default()
        };
        let artifacts = Artifacts {
            document: Some("Remaining: 9"),
            snapshot: Some(&complete),
        };
        assert!(is_complete(Mode::Loop, artifacts, &markers()));

        let partial = StatusSnapshot {
            progress: Progress {
                completed: 3,
                total: 5,
            },
            ..StatusSnapshot::default()
        };
        let artifacts = Artifacts {
            document: Some("Remaining: 0"),
            snapshot: Some(&partial),
        };
        let assessment = assess(Mode::Loop, artifacts, &markers());
        assert!(!assessment.complete);
        assert_eq!(assessment.remaining, Some(2));
    }

    #[test]
    fn snapshot_without_total_keeps_document_count() {
        let empty = StatusSnapshot::default();
        let artifacts = Artifacts {
            document: Some("Remaining: 6"),
            snapshot: Some(&empty),
        };
        assert_eq!(remaining_count(Mode::Loop, artifacts, &markers()), Some(6));
    }

    #[test]
    fn stagnation_after_threshold_unchanged_observations() {
        let mut tracker = StagnationTracker::new(2);
        assert!(!tracker.observe(Some(5)));
        assert!(!tracker.observe(Some(5)));
        assert!(tracker.observe(Some(5)));
    }

    #[test]
    fn stagnation_resets_on_progress_or_unknown() {
        let mut tracker = StagnationTracker::new(2);
        tracker.observe(Some(5));
        tracker.observe(Some(5));
        assert!(!tracker.observe(Some(4)));
        assert_eq!(tracker.unchanged(), 0);
        tracker.observe(Some(4));
        assert!(!tracker.observe(None));
        assert!(!tracker.observe(Some(4)));
    }

    #[test]
    fn zero_threshold_never_stagnates() {
        let mut tracker = StagnationTracker::new(0);
        for _ in 0..10 {
            assert!(!tracker.observe(Some(3)));
        }
    }

    #[test]
    fn zero_remaining_is_not_stagnation() {
        let mut tracker = StagnationTracker::new(1);
        tracker.observe(Some(0));
        assert!(!tracker.observe(Some(0)));
    }
}
