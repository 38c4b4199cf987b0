//! Provenance-tracked merge of the five configuration layers.
//!
//! Layers are flattened into dotted key paths independently, the union of
//! keys across all layers is collected, and for each key the highest
//! precedence defined value wins. Precedence is key-by-key: a workspace layer
//! that sets one key never hides a CLI value for another.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::settings::Settings;
use crate::core::types::{Depth, OutputLevel};

/// Configuration layer names, ordered from lowest to highest precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerName {
    Default,
    User,
    Project,
    Workspace,
    Cli,
}

impl LayerName {
    /// All layers, lowest precedence first.
    pub const ALL: [LayerName; 5] = [
        LayerName::Default,
        LayerName::User,
        LayerName::Project,
        LayerName::Workspace,
        LayerName::Cli,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LayerName::Default => "default",
            LayerName::User => "user",
            LayerName::Project => "project",
            LayerName::Workspace => "workspace",
            LayerName::Cli => "cli",
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four optional layers. The default layer is always built in.
///
/// An absent layer behaves exactly like an empty object.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    pub user: Option<Value>,
    pub project: Option<Value>,
    pub workspace: Option<Value>,
    pub cli: Option<Value>,
}

impl ConfigLayers {
    fn get(&self, name: LayerName) -> Option<&Value> {
        match name {
            LayerName::Default => None,
            LayerName::User => self.user.as_ref(),
            LayerName::Project => self.project.as_ref(),
            LayerName::Workspace => self.workspace.as_ref(),
            LayerName::Cli => self.cli.as_ref(),
        }
    }
}

/// One resolved key with the layer that supplied it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveValue {
    pub key: String,
    pub value: Value,
    pub source: LayerName,
}

/// Resolver output: typed settings plus per-key provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub settings: Settings,
    effective: BTreeMap<String, EffectiveValue>,
}

impl ResolvedConfig {
    /// Every key seen in any layer, sorted by key path.
    pub fn effective(&self) -> &BTreeMap<String, EffectiveValue> {
        &self.effective
    }

    pub fn get(&self, key: &str) -> Option<&EffectiveValue> {
        self.effective.get(key)
    }

    pub fn source_of(&self, key: &str) -> Option<LayerName> {
        self.effective.get(key).map(|entry| entry.source)
    }
}

/// Values supplied on the command line. `None` means "flag not given" and
/// contributes nothing to the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbose: bool,
    pub quiet: bool,
    pub output: Option<OutputLevel>,
    pub max_iterations: Option<u32>,
    pub delay: Option<u64>,
    pub stagnation_threshold: Option<u32>,
    pub command: Option<String>,
    pub model: Option<String>,
    pub no_verify: bool,
    pub no_resume: bool,
    pub verify_depth: Option<Depth>,
    pub max_verify_attempts: Option<u32>,
}

impl CliOverrides {
    /// Build the sparse CLI layer. Boolean negation flags only appear when set.
    pub fn into_layer(self) -> Value {
        let mut root = Map::new();
        if let Some(level) = collapse_output_level(self.verbose, self.quiet, self.output) {
            root.insert("outputLevel".into(), Value::from(level.as_str()));
        }
        if let Some(max) = self.max_iterations {
            root.insert("maxIterations".into(), Value::from(max));
        }
        if let Some(delay) = self.delay {
            root.insert("delay".into(), Value::from(delay));
        }
        if let Some(threshold) = self.stagnation_threshold {
            root.insert("stagnationThreshold".into(), Value::from(threshold));
        }

        let mut claude = Map::new();
        if let Some(command) = self.command {
            claude.insert("command".into(), Value::from(command));
        }
        if let Some(model) = self.model {
            claude.insert("model".into(), Value::from(model));
        }
        if !claude.is_empty() {
            root.insert("claude".into(), Value::Object(claude));
        }

        let mut verification = Map::new();
        if self.no_verify {
            verification.insert("autoVerify".into(), Value::Bool(false));
        }
        if self.no_resume {
            verification.insert("resumeOnFail".into(), Value::Bool(false));
        }
        if let Some(depth) = self.verify_depth {
            verification.insert("depth".into(), Value::from(depth.as_str()));
        }
        if let Some(attempts) = self.max_verify_attempts {
            verification.insert("maxAttempts".into(), Value::from(attempts));
        }
        if !verification.is_empty() {
            root.insert("verification".into(), Value::Object(verification));
        }

        Value::Object(root)
    }
}

/// Collapse `--verbose` / `--quiet` / `--output` into one level.
///
/// The explicit level wins; otherwise verbose beats quiet; otherwise unset.
pub fn collapse_output_level(
    verbose: bool,
    quiet: bool,
    explicit: Option<OutputLevel>,
) -> Option<OutputLevel> {
    explicit
        .or(verbose.then_some(OutputLevel::Verbose))
        .or(quiet.then_some(OutputLevel::Quiet))
}

/// Flatten a layer into dotted key paths.
///
/// Arrays and nulls are leaves. A non-object layer contributes no keys.
pub fn flatten(layer: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Value::Object(map) = layer {
        flatten_into(map, "", &mut out);
    }
    out
}

fn flatten_into(map: &Map<String, Value>, prefix: &str, out: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(child) => flatten_into(child, &path, out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

/// Merge the built-in defaults with the supplied layers. Never fails.
pub fn resolve(layers: &ConfigLayers) -> ResolvedConfig {
    let defaults = serde_json::to_value(Settings::default()).unwrap_or(Value::Null);

    let flattened: Vec<(LayerName, BTreeMap<String, Value>)> = LayerName::ALL
        .iter()
        .map(|&name| {
            let flat = match name {
                LayerName::Default => flatten(&defaults),
                other => layers.get(other).map(flatten).unwrap_or_default(),
            };
            (name, flat)
        })
        .collect();

    let keys: BTreeSet<&String> = flattened.iter().flat_map(|(_, flat)| flat.keys()).collect();

    let mut effective = BTreeMap::new();
    let mut typed = defaults.clone();
    for key in keys {
        let Some((entry, applied)) = pick(key, &flattened, &defaults) else {
            continue;
        };
        if applied && !entry.value.is_null() {
            set_path(&mut typed, key, entry.value.clone());
        }
        effective.insert(key.clone(), entry);
    }

    let settings = serde_json::from_value(typed).unwrap_or_else(|err| {
        warn!(err = %err, "resolved settings did not decode, using defaults");
        Settings::default()
    });

    ResolvedConfig {
        settings,
        effective,
    }
}

/// Choose the winning value for one key. Returns the entry and whether it
/// may be applied to the typed settings.
fn pick(
    key: &str,
    flattened: &[(LayerName, BTreeMap<String, Value>)],
    defaults: &Value,
) -> Option<(EffectiveValue, bool)> {
    let mut first_rejected: Option<EffectiveValue> = None;
    for (name, flat) in flattened.iter().rev() {
        let Some(value) = flat.get(key) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let entry = EffectiveValue {
            key: key.to_string(),
            value: value.clone(),
            source: *name,
        };
        if fits(defaults, key, value) {
            return Some((entry, true));
        }
        warn!(key, layer = %name, value = %value, "config value has the wrong type, ignoring");
        first_rejected.get_or_insert(entry);
    }

    if let Some(rejected) = first_rejected {
        return Some((rejected, false));
    }

    // Every occurrence is null: report it from the lowest layer that names it.
    flattened
        .iter()
        .find(|(_, flat)| flat.contains_key(key))
        .map(|(name, _)| {
            (
                EffectiveValue {
                    key: key.to_string(),
                    value: Value::Null,
                    source: *name,
                },
                false,
            )
        })
}

/// Whether `value` can occupy `key` in the typed settings. Keys the typed
/// settings do not know about always fit.
fn fits(defaults: &Value, key: &str, value: &Value) -> bool {
    let mut candidate = defaults.clone();
    set_path(&mut candidate, key, value.clone());
    serde_json::from_value::<Settings>(candidate).is_ok()
}

fn set_path(root: &mut Value, key: &str, value: Value) {
    let mut segments = key.split('.').peekable();
    let mut cursor = root;
    while let Some(segment) = segments.next() {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
