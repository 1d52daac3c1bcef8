//! Per-extension user preference storage.
//!
//! Stores preference values as one JSON file per extension in the
//! preferences directory. Defaults come from the extension manifest; this
//! module only holds the values the user has actually set.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Key-value preference store for one extension.
#[derive(Debug)]
pub struct ExtensionPreferences {
    /// Path to the extension's preferences file.
    path: PathBuf,
    /// Stored values by preference id.
    values: HashMap<String, Value>,
}

impl ExtensionPreferences {
    /// Loads preferences for an extension from `<prefs_dir>/<ext_id>.json`.
    ///
    /// A missing or unreadable file yields an empty store; a corrupt file is
    /// logged and treated as empty rather than failing the extension.
    #[must_use]
    pub fn load(prefs_dir: &Path, ext_id: &str) -> Self {
        let path = prefs_dir.join(format!("{}.json", ext_id));

        let values = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!("Ignoring corrupt preferences file {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self { path, values }
    }

    /// Returns the stored value for a preference id, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }

    /// Sets a preference value and writes the store through to disk.
    pub fn set(&mut self, id: &str, value: Value) -> io::Result<()> {
        self.values.insert(id.to_string(), value);
        self.commit()
    }

    /// Persists all values to disk.
    pub fn commit(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.values).map_err(io::Error::other)?;
        fs::write(&self.path, content)
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no values are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
