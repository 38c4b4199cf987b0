//! Status snapshot reads. Missing or malformed files never raise.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::snapshot::StatusSnapshot;

/// Parse the snapshot when it exists and is valid JSON.
pub fn try_read_status(path: &Path) -> Option<StatusSnapshot> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!(path = %path.display(), err = %err, "status snapshot unavailable");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            debug!(path = %path.display(), err = %err, "status snapshot unparseable");
            None
        }
    }
}

/// Read the snapshot, degrading to the zero-progress default.
pub fn read_status(path: &Path) -> StatusSnapshot {
    try_read_status(path).unwrap_or_default()
}

/// Remove a snapshot left over from a finished pass so it cannot mark the
/// next pass complete.
pub fn clear_status(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "cleared status snapshot");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("remove status snapshot {}", path.display()))
        }
    }
}
