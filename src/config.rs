//! Runtime configuration for the extension runner.
//!
//! Holds the options that vary per installation: verbosity, the interpreter
//! used to execute extensions, and the module search path handed to every
//! extension process.

use std::path::PathBuf;

/// Host application version, exposed to extension compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default interpreter used to run extension entry points.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Default location of the beacon Python API package that extensions import.
pub const DEFAULT_MODULE_PATH: &str = "/usr/share/beacon";

/// Options controlling how extension processes are launched.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Whether extensions run with verbose diagnostics enabled.
    pub verbose: bool,
    /// Interpreter executable used to run each extension's entry point.
    pub interpreter: String,
    /// Directory added to the module search path of every extension process.
    pub module_path: PathBuf,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            module_path: PathBuf::from(DEFAULT_MODULE_PATH),
        }
    }
}
