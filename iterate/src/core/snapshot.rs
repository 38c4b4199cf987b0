//! Status snapshot written by the external tool, and deltas between snapshots.

use serde::{Deserialize, Serialize};

/// Structured progress artifact (`.status.json`). Read-only to iterate.
///
/// Every field is optional on disk; missing fields take the zero default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub complete: bool,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

impl StatusSnapshot {
    /// Items left according to the snapshot, when it reports any total.
    pub fn remaining(&self) -> Option<u32> {
        (self.progress.total > 0).then(|| self.progress.total.saturating_sub(self.progress.completed))
    }
}

/// Difference between two consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDelta {
    pub completed_delta: i64,
    pub total_delta: i64,
    pub progress_changed: bool,
    pub completion_status_changed: bool,
    pub summary_changed: bool,
}

impl StatusDelta {
    /// Compare `current` against `previous`; a missing previous snapshot is
    /// compared against the zero default.
    pub fn between(previous: Option<&StatusSnapshot>, current: &StatusSnapshot) -> Self {
        let baseline = StatusSnapshot::default();
        let prev = previous.unwrap_or(&baseline);
        let completed_delta = i64::from(current.progress.completed) - i64::from(prev.progress.completed);
        let total_delta = i64::from(current.progress.total) - i64::from(prev.progress.total);
        Self {
            completed_delta,
            total_delta,
            progress_changed: completed_delta != 0 || total_delta != 0,
            completion_status_changed: prev.complete != current.complete,
            summary_changed: prev.summary != current.summary,
        }
    }
}

/// Which deltas count as worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFilter {
    /// When false every parsed rewrite is reported.
    pub meaningful_only: bool,
    /// Whether a summary-only edit is reported under `meaningful_only`.
    pub summary_is_meaningful: bool,
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self {
            meaningful_only: true,
            summary_is_meaningful: true,
        }
    }
}

impl ChangeFilter {
    /// The first observed snapshot is always reported.
    pub fn accepts(&self, first: bool, delta: &StatusDelta) -> bool {
        if first || !self.meaningful_only {
            return true;
        }
        delta.progress_changed
            || delta.completion_status_changed
            || (self.summary_is_meaningful && delta.summary_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(completed: u32, total: u32) -> StatusSnapshot {
        StatusSnapshot {
            progress: Progress { completed, total },
            ..StatusSnapshot::default()
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let parsed: StatusSnapshot =
            serde_json::from_str(r#"{"progress":{"completed":2}}"#).expect("parse");
        assert_eq!(parsed.progress, Progress { completed: 2, total: 0 });
        assert!(!parsed.complete);
        assert_eq!(parsed.remaining(), None);
    }

    #[test]
    fn remaining_saturates() {
        assert_eq!(snapshot(3, 5).remaining(), Some(2));
        assert_eq!(snapshot(7, 5).remaining(), Some(0));
    }

    #[test]
    fn delta_against_previous() {
        let prev = snapshot(1, 4);
        let mut cur = snapshot(3, 5);
        cur.summary = Some("halfway".to_string());

        let delta = StatusDelta::between(Some(&prev), &cur);
        assert_eq!(delta.completed_delta, 2);
        assert_eq!(delta.total_delta, 1);
        assert!(delta.progress_changed);
        assert!(!delta.completion_status_changed);
        assert!(delta.summary_changed);
    }

    #[test]
    fn timestamp_only_rewrite_is_not_meaningful() {
        let prev = snapshot(2, 4);
        let mut cur = prev.clone();
        cur.last_updated = Some("2026-01-01T00:00:00Z".to_string());

        let delta = StatusDelta::between(Some(&prev), &cur);
        assert!(!ChangeFilter::default().accepts(false, &delta));
        let everything = ChangeFilter {
            meaningful_only: false,
            ..ChangeFilter::default()
        };
        assert!(everything.accepts(false, &delta));
    }

    #[test]
    fn summary_edit_meaningfulness_is_configurable() {
        let prev = snapshot(2, 4);
        let mut cur = prev.clone();
        cur.summary = Some("refined wording".to_string());
        let delta = StatusDelta::between(Some(&prev), &cur);

        assert!(ChangeFilter::default().accepts(false, &delta));
        let strict = ChangeFilter {
            meaningful_only: true,
            summary_is_meaningful: false,
        };
        assert!(!strict.accepts(false, &delta));
        assert!(strict.accepts(true, &delta));
    }
}
