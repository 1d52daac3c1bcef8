//! Extension system for Beacon.
//!
//! Extensions are untrusted subprocesses: each one is a directory containing
//! a `manifest.json` and a `main.py` entry point, run by an interpreter in an
//! isolated child process. This module provides:
//! - Manifest loading, validation and compatibility checking
//! - Per-extension user preference storage
//! - The durable per-extension error store
//! - The process runner that supervises extension subprocesses

pub mod manifest;
pub mod preferences;
pub mod process;
pub mod store;

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use manifest::{ExtensionManifest, ManifestError};
pub use preferences::ExtensionPreferences;
pub use process::{ExtensionRunner, INSTANT_CRASH_THRESHOLD};
pub use store::{ErrorRecord, ErrorType, ExtensionStore, StoreError};

/// Errors that can occur in the extension system.
///
/// These are host-side faults. Extension-caused failures (crashes, invalid
/// manifests, missing dependencies) are not errors here; they are diagnoses
/// written to the [`ExtensionStore`].
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Manifest loading or validation error.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error store persistence error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The extension process could not be spawned.
    #[error("Failed to spawn extension process: {0}")]
    Spawn(String),

    /// The spawned process has no captured stderr stream. This indicates a
    /// misconfigured spawn, not an extension fault.
    #[error("Extension process was spawned without a piped stderr stream")]
    StderrPipe,
}

/// Returns the path to the beacon data directory.
#[must_use]
pub fn beacon_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".beacon"))
}

/// Returns the path to the extensions directory.
#[must_use]
pub fn extensions_dir() -> Option<PathBuf> {
    beacon_dir().map(|d| d.join("extensions"))
}

/// Returns the path to the per-extension preferences directory.
#[must_use]
pub fn ext_preferences_dir() -> Option<PathBuf> {
    beacon_dir().map(|d| d.join("ext_preferences"))
}

/// Returns the path to the extension error store file.
#[must_use]
pub fn store_path() -> Option<PathBuf> {
    beacon_dir().map(|d| d.join("extensions.json"))
}

/// Ensures all extension directories exist.
pub fn ensure_directories() -> io::Result<()> {
    if let Some(ext_dir) = extensions_dir() {
        fs::create_dir_all(&ext_dir)?;
    }
    if let Some(prefs_dir) = ext_preferences_dir() {
        fs::create_dir_all(&prefs_dir)?;
    }
    Ok(())
}
