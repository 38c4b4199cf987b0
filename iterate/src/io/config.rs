//! Configuration layer files.
//!
//! User and project layers are TOML files; the workspace layer lives in the
//! workspace metadata. Every layer is checked against the embedded JSON Schema
//! before it reaches the resolver.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use super::metadata::WorkspaceMetadata;
use crate::core::resolve::{ConfigLayers, ResolvedConfig, resolve};

const CONFIG_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/config.schema.json"
));

/// Project-level layer file name, looked up in the project directory.
pub const PROJECT_CONFIG_FILE: &str = ".iterate.toml";

/// Where the user and project layers come from for one invocation.
#[derive(Debug, Clone)]
pub struct LayerSources {
    /// Explicit `--config` path. Must exist when given.
    pub explicit_user: Option<PathBuf>,
    pub project_dir: PathBuf,
}

impl LayerSources {
    pub fn new(project_dir: impl Into<PathBuf>, explicit_user: Option<PathBuf>) -> Self {
        Self {
            explicit_user,
            project_dir: project_dir.into(),
        }
    }

    /// `--config` when given, else `<config dir>/iterate/config.toml`.
    pub fn user_path(&self) -> Option<PathBuf> {
        self.explicit_user
            .clone()
            .or_else(|| dirs::config_dir().map(|dir| dir.join("iterate").join("config.toml")))
    }

    pub fn project_path(&self) -> PathBuf {
        self.project_dir.join(PROJECT_CONFIG_FILE)
    }

    /// Load the user, project, and CLI layers. The workspace layer is added
    /// separately once the workspace location is known.
    pub fn load(&self, cli: Value) -> Result<ConfigLayers> {
        let user = match self.user_path() {
            Some(path) => load_toml_layer(&path, self.explicit_user.is_some())?,
            None => None,
        };
        let project = load_toml_layer(&self.project_path(), false)?;
        validate_layer(&cli, "command line flags")?;
        Ok(ConfigLayers {
            user,
            project,
            workspace: None,
            cli: Some(cli),
        })
    }
}

/// Attach the workspace layer taken from `metadata`.
pub fn with_workspace(mut layers: ConfigLayers, metadata: &WorkspaceMetadata) -> Result<ConfigLayers> {
    let layer = metadata.config_layer();
    validate_layer(&layer, &format!("workspace '{}' metadata", metadata.name))?;
    layers.workspace = Some(layer);
    Ok(layers)
}

/// Resolve layers, logging where each overridden key came from.
pub fn resolve_layers(layers: &ConfigLayers) -> ResolvedConfig {
    let resolved = resolve(layers);
    for entry in resolved.effective().values() {
        debug!(key = %entry.key, source = %entry.source, value = %entry.value, "effective setting");
    }
    resolved
}

/// Load one TOML layer file.
///
/// A missing file yields `None` unless `required` is set.
pub fn load_toml_layer(path: &Path, required: bool) -> Result<Option<Value>> {
    if !path.exists() {
        if required {
            bail!("config file {} does not exist", path.display());
        }
        debug!(path = %path.display(), "config layer not present");
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_layer(&value, &path.display().to_string())?;
    debug!(path = %path.display(), "config layer loaded");
    Ok(Some(value))
}

/// Validate a sparse layer against the config schema (Draft 2020-12).
pub fn validate_layer(layer: &Value, label: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(CONFIG_SCHEMA).context("parse config schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile config schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(layer)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("invalid configuration in {label}:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
