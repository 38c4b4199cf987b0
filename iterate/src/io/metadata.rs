//! Workspace metadata storage (`.metadata.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::write_atomic;
use crate::core::types::{Mode, VerificationStatus, WorkspaceStatus};

/// Persisted workspace bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub status: WorkspaceStatus,
    /// Total iterations ever run in this workspace.
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub setup_iterations: u32,
    #[serde(default)]
    pub execution_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// `Some(0)` disables stagnation detection for this workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagnation_threshold: Option<u32>,
    /// Sparse workspace configuration layer.
    #[serde(default = "empty_object", skip_serializing_if = "is_empty_object")]
    pub config: Value,
    #[serde(default)]
    pub verification: VerificationRecord,
}

/// Verification bookkeeping kept across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationRecord {
    pub last_verification_status: Option<VerificationStatus>,
    pub verification_attempts: u32,
    pub verify_resume_cycles: u32,
    pub last_verification_report: Option<String>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

impl WorkspaceMetadata {
    pub fn new(name: impl Into<String>, mode: Mode, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created,
            last_run: None,
            mode,
            status: WorkspaceStatus::InProgress,
            iterations: 0,
            setup_iterations: 0,
            execution_iterations: 0,
            max_iterations: None,
            delay: None,
            stagnation_threshold: None,
            config: empty_object(),
            verification: VerificationRecord::default(),
        }
    }

    /// The workspace configuration layer: the sparse `config` object with the
    /// top-level overrides merged on top.
    pub fn config_layer(&self) -> Value {
        let mut layer = match &self.config {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        if let Some(max) = self.max_iterations {
            layer.insert("maxIterations".to_string(), Value::from(max));
        }
        if let Some(delay) = self.delay {
            layer.insert("delay".to_string(), Value::from(delay));
        }
        if let Some(threshold) = self.stagnation_threshold {
            layer.insert("stagnationThreshold".to_string(), Value::from(threshold));
        }
        Value::Object(layer)
    }

    /// Record one finished iteration.
    pub fn record_iteration(&mut self, now: DateTime<Utc>) {
        self.iterations += 1;
        self.execution_iterations += 1;
        self.last_run = Some(now);
    }
}

/// Load workspace metadata from disk.
pub fn load_metadata(path: &Path) -> Result<WorkspaceMetadata> {
    debug!(path = %path.display(), "loading workspace metadata");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read metadata {}", path.display()))?;
    let metadata: WorkspaceMetadata = serde_json::from_str(&contents)
        .with_context(|| format!("parse metadata {}", path.display()))?;
    debug!(
        name = %metadata.name,
        iterations = metadata.iterations,
        status = ?metadata.status,
        "workspace metadata loaded"
    );
    Ok(metadata)
}

/// Atomically write workspace metadata to disk (temp file + rename).
pub fn write_metadata(path: &Path, metadata: &WorkspaceMetadata) -> Result<()> {
    debug!(
        path = %path.display(),
        iterations = metadata.iterations,
        status = ?metadata.status,
        "writing workspace metadata"
    );
    let mut buf = serde_json::to_string_pretty(metadata).context("serialize metadata")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
