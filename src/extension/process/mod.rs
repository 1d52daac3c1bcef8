//! Extension process supervision.
//!
//! Spawns each extension as an isolated child process, monitors its exit and
//! stderr, classifies failures and performs graceful-then-forced termination.

pub mod classifier;
pub mod runner;

pub use classifier::{INSTANT_CRASH_THRESHOLD, classify_exit, missing_module_name};
pub use runner::ExtensionRunner;
