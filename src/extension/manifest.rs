//! Extension manifest parsing.
//!
//! Parses `manifest.json` files that define extension metadata, keyword
//! triggers, preference defaults and the required host API version.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::preferences::ExtensionPreferences;
use crate::config::VERSION;

/// Errors raised while loading or checking an extension manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("Failed to read manifest: {0}")]
    Read(#[from] io::Error),

    /// The manifest file is not valid JSON.
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    /// The manifest is structurally invalid.
    #[error("{0}")]
    Validation(String),

    /// The manifest declares an API version range the host does not satisfy.
    #[error("{0}")]
    Incompatible(String),
}

/// A keyword trigger declared by an extension.
#[derive(Debug, Clone, Deserialize)]
pub struct Trigger {
    /// Human-readable trigger name.
    #[serde(default)]
    pub name: String,
    /// Keyword that activates the trigger. May be empty for triggers that
    /// are launched from the result list rather than typed.
    #[serde(default)]
    pub keyword: String,
    /// Trigger description.
    #[serde(default)]
    pub description: String,
}

/// A user preference declared by an extension.
#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceItem {
    /// Preference identifier, unique within the extension.
    pub id: String,
    /// Preference type ("input", "text", "number", "checkbox", "keyword", "select").
    #[serde(rename = "type", default)]
    pub pref_type: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Default value used when the user has not set one.
    #[serde(default)]
    pub default_value: Value,
}

impl PreferenceItem {
    /// Returns the default value, falling back to a type-appropriate zero
    /// value when the manifest omits one.
    #[must_use]
    pub fn default_or_fallback(&self) -> Value {
        if !self.default_value.is_null() {
            return self.default_value.clone();
        }
        match self.pref_type.as_str() {
            "number" => Value::from(0),
            "checkbox" => Value::from(false),
            _ => Value::from(""),
        }
    }
}

/// Extension manifest from manifest.json.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionManifest {
    /// Extension name.
    #[serde(default)]
    pub name: String,
    /// Extension version.
    #[serde(default)]
    pub version: String,
    /// Required host API version range (e.g. `"^2.0"`).
    #[serde(default)]
    pub api_version: String,
    /// Extension description.
    #[serde(default)]
    pub description: String,
    /// Author name or handle.
    #[serde(default)]
    pub authors: String,
    /// Keyword triggers by trigger id.
    #[serde(default)]
    pub triggers: HashMap<String, Trigger>,
    /// User preference declarations.
    #[serde(default)]
    pub preferences: Vec<PreferenceItem>,
}

impl ExtensionManifest {
    /// Loads the manifest from an extension directory.
    pub fn load(ext_path: &Path) -> Result<Self, ManifestError> {
        let manifest_path = ext_path.join("manifest.json");
        let content = fs::read_to_string(&manifest_path)?;
        let manifest: ExtensionManifest = serde_json::from_str(&content)?;
        Ok(manifest)
    }

    /// Validates the manifest for required fields and consistency.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError::Validation(
                "Extension name is required".to_string(),
            ));
        }

        if self.version.is_empty() {
            return Err(ManifestError::Validation(
                "Extension version is required".to_string(),
            ));
        }

        if self.api_version.is_empty() {
            return Err(ManifestError::Validation(
                "Extension api_version is required".to_string(),
            ));
        }

        for (id, trigger) in &self.triggers {
            if id.is_empty() {
                return Err(ManifestError::Validation(
                    "Trigger ids must not be empty".to_string(),
                ));
            }
            if trigger.name.is_empty() {
                return Err(ManifestError::Validation(format!(
                    "Trigger \"{}\" requires a name",
                    id
                )));
            }
        }

        for pref in &self.preferences {
            if pref.id.is_empty() {
                return Err(ManifestError::Validation(
                    "Preference ids must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Checks that the host satisfies the manifest's required API version.
    pub fn check_compatibility(&self, verbose: bool) -> Result<(), ManifestError> {
        if verbose {
            tracing::debug!(
                "Checking extension \"{}\" against host version {}",
                self.name,
                VERSION
            );
        }

        if !version_satisfies(&self.api_version, VERSION) {
            return Err(ManifestError::Incompatible(format!(
                "Extension \"{}\" requires API version {} but the host provides {}",
                self.name, self.api_version, VERSION
            )));
        }

        Ok(())
    }

    /// Returns the keyword for each trigger that declares one, keyed by
    /// trigger id.
    #[must_use]
    pub fn trigger_keywords(&self) -> HashMap<String, String> {
        self.triggers
            .iter()
            .filter(|(_, t)| !t.keyword.is_empty())
            .map(|(id, t)| (id.clone(), t.keyword.clone()))
            .collect()
    }

    /// Produces the merged key-value preference snapshot for an extension:
    /// manifest defaults overridden by stored user values.
    #[must_use]
    pub fn key_value_preferences(&self, ext_id: &str, prefs_dir: &Path) -> HashMap<String, Value> {
        let prefs = ExtensionPreferences::load(prefs_dir, ext_id);
        self.preferences
            .iter()
            .map(|item| {
                let value = prefs
                    .get(&item.id)
                    .cloned()
                    .unwrap_or_else(|| item.default_or_fallback());
                (item.id.clone(), value)
            })
            .collect()
    }

    /// Returns the active keyword values (preferences of type "keyword"
    /// with a non-empty merged value).
    #[must_use]
    pub fn active_keywords(&self, ext_id: &str, prefs_dir: &Path) -> Vec<String> {
        let merged = self.key_value_preferences(ext_id, prefs_dir);
        self.preferences
            .iter()
            .filter(|p| p.pref_type == "keyword")
            .filter_map(|p| merged.get(&p.id))
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Checks a version against a required range.
///
/// Supports the range forms extensions actually use: `*`, exact (`2.0`),
/// wildcard minor (`2.x`), caret (`^2.0`) and minimum (`>=2.0`).
#[must_use]
pub fn version_satisfies(range: &str, version: &str) -> bool {
    let range = range.trim();
    let current = parse_version(version);

    if range == "*" {
        return true;
    }

    if let Some(base) = range.strip_prefix('^') {
        let required = parse_version(base);
        return current[0] == required[0] && current >= required;
    }

    if let Some(base) = range.strip_prefix(">=") {
        return current >= parse_version(base);
    }

    if let Some(major) = range.strip_suffix(".x").or_else(|| range.strip_suffix(".*")) {
        return current[..1] == parse_version(major)[..1];
    }

    // Exact match on the components the range provides.
    range
        .split('.')
        .map(|part| part.trim().parse().unwrap_or(0))
        .zip(current.iter())
        .all(|(req, cur)| req == *cur)
}

/// Parses a dotted version string into (major, minor, patch); missing or
/// malformed components become zero.
fn parse_version(version: &str) -> [u64; 3] {
    let mut parts = [0u64; 3];
    for (i, part) in version.trim().split('.').take(3).enumerate() {
        parts[i] = part.trim().parse().unwrap_or(0);
    }
    parts
}
