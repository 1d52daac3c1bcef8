//! Beacon
//!
//! A keyboard-driven application launcher whose extensions run as isolated
//! interpreter subprocesses. This crate contains the extension subsystem:
//!
//! - **Manifest Module**: manifest.json parsing, validation and API
//!   compatibility checking
//! - **Preferences Module**: per-extension key-value preference storage
//! - **Store Module**: durable per-extension error records
//! - **Process Module**: the subprocess runner that supervises extension
//!   processes, classifies failures and handles termination
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//! use beacon::config::RunnerOptions;
//! use beacon::extension::{ExtensionRunner, ExtensionStore};
//!
//! # async fn start() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ExtensionStore::load("extensions.json".into())?;
//! let runner = ExtensionRunner::new(
//!     RunnerOptions::default(),
//!     Arc::new(Mutex::new(store)),
//!     "ext_preferences".into(),
//! );
//! runner.run("timer", "extensions/timer".as_ref()).await?;
//! # Ok(())
//! # }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod extension;
pub mod logging;

// Re-export main types
pub use config::RunnerOptions;
pub use extension::{
    ErrorRecord, ErrorType, ExtensionError, ExtensionManifest, ExtensionPreferences,
    ExtensionRunner, ExtensionStore,
};
