//! Workspace directory layout and initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::config::validate_layer;
use super::metadata::{WorkspaceMetadata, load_metadata, write_metadata};
use super::write_atomic;
use crate::core::types::Mode;

/// All canonical paths within one workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub name: String,
    pub dir: PathBuf,
    pub metadata_path: PathBuf,
    pub instructions_path: PathBuf,
    pub original_instructions_path: PathBuf,
    pub todo_path: PathBuf,
    pub status_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl WorkspacePaths {
    /// `workspaces_dir` is resolved against `project_dir` unless absolute.
    pub fn new(project_dir: &Path, workspaces_dir: &str, name: &str) -> Result<Self> {
        validate_name(name)?;
        let dir = project_dir.join(workspaces_dir).join(name);
        Ok(Self {
            name: name.to_string(),
            metadata_path: dir.join(".metadata.json"),
            instructions_path: dir.join("INSTRUCTIONS.md"),
            original_instructions_path: dir.join(".instructions.original.md"),
            todo_path: dir.join("TODO.md"),
            status_path: dir.join(".status.json"),
            logs_dir: dir.join("logs"),
            dir,
        })
    }

    /// Verification report location; the file name is configurable.
    pub fn report_path(&self, report_filename: &str) -> PathBuf {
        self.dir.join(report_filename)
    }

    pub fn exists(&self) -> bool {
        self.metadata_path.is_file()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("workspace name must not be empty");
    }
    if trimmed != name || name == "." || name == ".." || name.contains(['/', '\\']) {
        bail!("invalid workspace name '{name}' (use a plain directory name)");
    }
    Ok(())
}

/// Options for `init_workspace`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub mode: Mode,
    /// Initial instructions; a placeholder is written when absent.
    pub instructions: Option<String>,
    pub max_iterations: Option<u32>,
    pub delay: Option<u64>,
    pub stagnation_threshold: Option<u32>,
}

/// Create a workspace directory with metadata and instructions.
///
/// Fails if the workspace already exists.
pub fn init_workspace(
    paths: &WorkspacePaths,
    options: &InitOptions,
    now: DateTime<Utc>,
) -> Result<WorkspaceMetadata> {
    if paths.exists() {
        return Err(anyhow!(
            "workspace '{}' already exists at {}",
            paths.name,
            paths.dir.display()
        ));
    }
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "workspace path {} exists but is not a directory",
            paths.dir.display()
        ));
    }

    let mut metadata = WorkspaceMetadata::new(&paths.name, options.mode, now);
    metadata.max_iterations = options.max_iterations;
    metadata.delay = options.delay;
    metadata.stagnation_threshold = options.stagnation_threshold;
    validate_layer(
        &metadata.config_layer(),
        &format!("options for workspace '{}'", paths.name),
    )?;

    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("create directory {}", paths.logs_dir.display()))?;
    write_metadata(&paths.metadata_path, &metadata)?;

    let instructions = options
        .instructions
        .clone()
        .unwrap_or_else(|| INSTRUCTIONS_PLACEHOLDER.to_string());
    write_atomic(&paths.instructions_path, &instructions)?;

    debug!(workspace = %paths.name, dir = %paths.dir.display(), mode = %options.mode, "workspace initialized");
    Ok(metadata)
}

/// Load metadata for an existing workspace.
pub fn open_workspace(paths: &WorkspacePaths) -> Result<WorkspaceMetadata> {
    if !paths.exists() {
        bail!(
            "workspace '{}' not found at {} (run `iterate init {}` first)",
            paths.name,
            paths.dir.display(),
            paths.name
        );
    }
    load_metadata(&paths.metadata_path)
}

pub fn read_instructions(paths: &WorkspacePaths) -> Result<String> {
    fs::read_to_string(&paths.instructions_path)
        .with_context(|| format!("read instructions {}", paths.instructions_path.display()))
}

/// Instructions as the user wrote them, before any resume rewrote them.
pub fn read_original_instructions(paths: &WorkspacePaths) -> Result<String> {
    if paths.original_instructions_path.is_file() {
        return fs::read_to_string(&paths.original_instructions_path).with_context(|| {
            format!(
                "read original instructions {}",
                paths.original_instructions_path.display()
            )
        });
    }
    read_instructions(paths)
}

/// Save the pristine instructions once. Later calls leave the saved copy alone.
pub fn preserve_original_instructions(paths: &WorkspacePaths) -> Result<String> {
    if paths.original_instructions_path.is_file() {
        return read_original_instructions(paths);
    }
    let original = read_instructions(paths)?;
    write_atomic(&paths.original_instructions_path, &original)?;
    debug!(path = %paths.original_instructions_path.display(), "saved original instructions");
    Ok(original)
}

pub fn write_instructions(paths: &WorkspacePaths, contents: &str) -> Result<()> {
    write_atomic(&paths.instructions_path, contents)
}

const INSTRUCTIONS_PLACEHOLDER: &str =
    "# Instructions\n\nDescribe the task for this workspace here.\n";
