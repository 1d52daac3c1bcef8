//! Beacon - Main entry point.
//!
//! Starts every installed extension under the process runner, then waits for
//! ctrl-c and shuts them down.
//!
//! Usage: beacon [OPTIONS]
//!
//! Options:
//!   --version, -v    Show version
//!   --verbose        Run extensions with verbose diagnostics

use std::env;
use std::fs;
use std::sync::Arc;

use tokio::sync::Mutex;

use beacon::config::{RunnerOptions, VERSION};
use beacon::extension::{self, ExtensionRunner, ExtensionStore};
use beacon::logging::{self, LogConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("beacon v{}", VERSION);
        return Ok(());
    }

    let verbose = args.iter().any(|a| a == "--verbose");

    logging::init(&LogConfig::default())?;
    extension::ensure_directories()?;

    let store_path = extension::store_path()
        .ok_or("Could not determine the beacon data directory")?;
    let prefs_dir = extension::ext_preferences_dir()
        .ok_or("Could not determine the beacon data directory")?;

    let store = ExtensionStore::load(store_path)?;
    let options = RunnerOptions {
        verbose,
        ..RunnerOptions::default()
    };
    let runner = ExtensionRunner::new(options, Arc::new(Mutex::new(store)), prefs_dir);

    // Start every extension found in the extensions directory.
    if let Some(ext_dir) = extension::extensions_dir() {
        for entry in fs::read_dir(&ext_dir)?.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(ext_id) = path.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };

            if let Err(e) = runner.run(&ext_id, &path).await {
                tracing::error!("Failed to start extension {}: {}", ext_id, e);
                eprintln!("Failed to start extension {}: {}", ext_id, e);
            }
        }
    }

    let running = runner.running_extensions().await;
    tracing::info!("Running {} extension(s): {:?}", running.len(), running);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down extensions");
    runner.stop_all().await;

    Ok(())
}
