//! Durable extension error store.
//!
//! Persists the last-known error classification for each extension to a JSON
//! file. The store is the single source of truth for why an extension is not
//! running; the process runner writes through on every terminal event.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of why an extension is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorType {
    /// No error recorded.
    #[default]
    None,
    /// The process was killed by a signal, or crashed instantly.
    Terminated,
    /// The process ran for at least a second and then exited.
    Exited,
    /// The process crashed instantly due to an unresolved third-party import.
    MissingModule,
    /// The manifest requires an unsupported API version, or the process
    /// crashed instantly while importing host internals.
    Incompatible,
    /// The manifest failed structural validation.
    Invalid,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorType::None => write!(f, "None"),
            ErrorType::Terminated => write!(f, "Terminated"),
            ErrorType::Exited => write!(f, "Exited"),
            ErrorType::MissingModule => write!(f, "MissingModule"),
            ErrorType::Incompatible => write!(f, "Incompatible"),
            ErrorType::Invalid => write!(f, "Invalid"),
        }
    }
}

/// Persisted error state for one extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error classification.
    #[serde(default)]
    pub error_type: ErrorType,
    /// Human-readable error message.
    #[serde(default)]
    pub error_message: String,
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing or serialization error.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Durable map from extension id to its last error record.
#[derive(Debug)]
pub struct ExtensionStore {
    /// Path to the storage file.
    path: PathBuf,
    /// In-memory records by extension id.
    records: HashMap<String, ErrorRecord>,
}

impl ExtensionStore {
    /// Loads the store from a file, starting empty if the file is missing.
    pub fn load(path: PathBuf) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self {
                path,
                records: HashMap::new(),
            });
        }

        let content = fs::read_to_string(&path)?;
        let records: HashMap<String, ErrorRecord> = serde_json::from_str(&content)?;
        Ok(Self { path, records })
    }

    /// Returns the record for an extension, or an empty record if none is
    /// stored.
    #[must_use]
    pub fn get_record(&self, ext_id: &str) -> ErrorRecord {
        self.records.get(ext_id).cloned().unwrap_or_default()
    }

    /// Records an error classification for an extension, replacing any
    /// previous diagnosis.
    pub fn set_error(&mut self, ext_id: &str, error_type: ErrorType, message: &str) {
        self.records.insert(
            ext_id.to_string(),
            ErrorRecord {
                error_type,
                error_message: message.to_string(),
            },
        );
    }

    /// Clears the recorded error for an extension.
    pub fn clear_error(&mut self, ext_id: &str) {
        self.records.insert(ext_id.to_string(), ErrorRecord::default());
    }

    /// Persists all records to disk synchronously.
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    /// Returns the storage file path.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
