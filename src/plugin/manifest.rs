//! Plugin manifest parsing and validation
//!
//! A plugin directory carries its metadata either in `plugin.json` or under the
//! `NOCOM_AType_Metadata` key of its `package.json`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::plugin::ipc::transport::TransportKind;
use crate::plugin::traits::PluginError;

/// Only manifest format version understood by this handler
pub const SUPPORTED_FORMAT_VERSION: i64 = 0;

/// Standalone manifest file name
pub const MANIFEST_FILE: &str = "plugin.json";

/// Package file carrying an embedded manifest
pub const PACKAGE_FILE: &str = "package.json";

/// Key of the embedded manifest inside [`PACKAGE_FILE`]
pub const PACKAGE_METADATA_KEY: &str = "NOCOM_AType_Metadata";

/// How a plugin entry point is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Subclass {
    /// Entry point runs directly under the script runner
    DirectScript,
    /// Entry point is source that must go through the source launcher
    SourceNeedsTranspile,
}

impl Subclass {
    /// Transport used to talk to a plugin of this subclass
    pub fn transport(&self) -> TransportKind {
        match self {
            Subclass::DirectScript => TransportKind::Native,
            Subclass::SourceNeedsTranspile => TransportKind::Framed,
        }
    }
}

impl TryFrom<u8> for Subclass {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Subclass::DirectScript),
            1 => Ok(Subclass::SourceNeedsTranspile),
            other => Err(format!("Unsupported subclass: {}", other)),
        }
    }
}

impl From<Subclass> for u8 {
    fn from(subclass: Subclass) -> Self {
        match subclass {
            Subclass::DirectScript => 0,
            Subclass::SourceNeedsTranspile => 1,
        }
    }
}

impl fmt::Display for Subclass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Parsed plugin metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub format_version: i64,
    pub plugin_name: String,
    /// Unique across loaded plugins
    pub plugin_namespace: String,
    pub plugin_version: String,
    /// Path of the entry script, relative to the plugin directory
    pub entry_point: String,
    pub author: String,
    pub subclass: Subclass,
}

impl PluginManifest {
    /// Load the manifest from a plugin directory
    pub fn load<P: AsRef<Path>>(plugin_dir: P) -> Result<Self, PluginError> {
        let value = read_manifest_value(plugin_dir.as_ref())?;
        Self::from_value(value)
    }

    /// Validate and parse a manifest document
    pub fn from_value(value: Value) -> Result<Self, PluginError> {
        match ManifestValidator::new().validate(&value) {
            ValidationResult::Valid => {}
            ValidationResult::Invalid(errors) => {
                return Err(PluginError::InvalidManifest(errors.join("; ")));
            }
        }
        serde_json::from_value(value).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Absolute path of the entry point
    pub fn entry_path(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join(&self.entry_point)
    }

    /// Report returned by `check_plugin` for a compliant plugin
    pub fn compliance_report(&self) -> Value {
        json!({
            "compliant": true,
            "pluginName": self.plugin_name,
            "namespace": self.plugin_namespace,
            "version": self.plugin_version,
            "author": self.author,
        })
    }
}

/// Read the raw manifest document from `plugin_dir`
///
/// Prefers `plugin.json`, falling back to the metadata embedded in `package.json`.
pub fn read_manifest_value(plugin_dir: &Path) -> Result<Value, PluginError> {
    let standalone = plugin_dir.join(MANIFEST_FILE);
    if standalone.is_file() {
        debug!("Reading manifest from {:?}", standalone);
        return read_json(&standalone)
            .map_err(|e| PluginError::InvalidManifest(format!("Invalid {}: {}", MANIFEST_FILE, e)));
    }

    let package = plugin_dir.join(PACKAGE_FILE);
    debug!("Reading embedded manifest from {:?}", package);
    let mut package_json = read_json(&package).map_err(|e| {
        PluginError::InvalidManifest(format!("Invalid metadata: {}", e))
    })?;
    match package_json.get_mut(PACKAGE_METADATA_KEY).map(Value::take) {
        Some(metadata) if metadata.is_object() => Ok(metadata),
        _ => Err(PluginError::InvalidManifest(format!(
            "Invalid metadata: {} has no {} object",
            PACKAGE_FILE, PACKAGE_METADATA_KEY
        ))),
    }
}

fn read_json(path: &Path) -> Result<Value, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| e.to_string())
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<String>),
}

/// Manifest compliance checks
pub struct ManifestValidator {
    /// Required string fields and the message reported when one is missing
    required_strings: Vec<(&'static str, &'static str)>,
}

impl ManifestValidator {
    pub fn new() -> Self {
        Self {
            required_strings: vec![
                ("author", "Plugin must have author"),
                ("pluginVersion", "Plugin must have version"),
                ("pluginName", "Plugin must have name"),
                ("pluginNamespace", "Plugin must have namespace"),
                ("entryPoint", "Plugin must have entry point"),
            ],
        }
    }

    /// Check a raw manifest document
    pub fn validate(&self, manifest: &Value) -> ValidationResult {
        let mut errors = Vec::new();

        if manifest.get("formatVersion").and_then(Value::as_i64) != Some(SUPPORTED_FORMAT_VERSION) {
            errors.push("Invalid format version".to_string());
        }

        for (field, message) in &self.required_strings {
            if manifest.get(*field).and_then(Value::as_str).is_none() {
                errors.push(message.to_string());
            }
        }

        if let Some(entry) = manifest.get("entryPoint").and_then(Value::as_str) {
            if entry.trim().is_empty() {
                errors.push("Entry point cannot be empty".to_string());
            }
        }
        if let Some(namespace) = manifest.get("pluginNamespace").and_then(Value::as_str) {
            if namespace.trim().is_empty() {
                errors.push("Plugin namespace cannot be empty".to_string());
            }
        }

        let entry = manifest.get("entryPoint").and_then(Value::as_str).unwrap_or("");
        match manifest.get("subclass").and_then(Value::as_u64) {
            Some(0) => {
                if entry.ends_with(".cjs") {
                    errors.push(
                        "CommonJS is not supported. Use an ESM entry point that bootstraps into CommonJS."
                            .to_string(),
                    );
                } else if !entry.ends_with(".js") && !entry.ends_with(".mjs") {
                    errors.push("Entry point must be an (ESM module) JavaScript file".to_string());
                }
            }
            Some(1) => {
                if !entry.ends_with(".ts") {
                    errors.push("Entry point must be a TypeScript file".to_string());
                }
            }
            Some(other) => errors.push(format!("Unsupported subclass: {}", other)),
            None => errors.push("Plugin must have subclass".to_string()),
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            let namespace = manifest
                .get("pluginNamespace")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            warn!("Manifest validation failed for {}: {:?}", namespace, errors);
            ValidationResult::Invalid(errors)
        }
    }
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new()
    }
}
