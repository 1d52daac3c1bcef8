//! Extension process runner.
//!
//! Owns the table of running extension processes. `run` validates the
//! manifest, spawns the interpreter with the extension environment, and
//! attaches two independent listeners: one awaiting process exit, one pumping
//! stderr lines. Terminal events are classified and written through to the
//! [`ExtensionStore`] before the handler finishes.
//!
//! The exit listener, the stderr pump and `stop` all race on the same table
//! entry; every completion path re-checks record presence and generation and
//! becomes a no-op when the record is gone or belongs to a newer process.
//! `run` claims the table entry before any slow work, so two concurrent
//! `run` calls for the same id can never both spawn.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::classifier;
use crate::config::RunnerOptions;
use crate::extension::ExtensionError;
use crate::extension::manifest::{ExtensionManifest, ManifestError};
use crate::extension::store::{ErrorType, ExtensionStore};

/// Delay between the polite SIGTERM and the forceful SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_millis(500);

/// In-memory record of one running extension process.
#[derive(Debug)]
struct ExtensionProc {
    /// OS process id, used for signal delivery.
    pid: u32,
    /// Monotonic counter distinguishing this process from any earlier or
    /// later process started for the same extension id.
    generation: u64,
    /// Spawn time, used to distinguish instant crashes from normal exits.
    start_time: Instant,
    /// Single most recent stderr line. Only the last line before a crash is
    /// retained; diagnosis extraction assumes exactly one line.
    recent_error: Option<String>,
    /// Set by the exit listener once the process has been reaped; read by
    /// the termination protocol's delayed check.
    exited: Arc<AtomicBool>,
}

/// One table slot per extension id.
///
/// A slot exists for as long as the extension counts as running, which
/// includes the window between the `run` call claiming the id and the
/// process actually being spawned.
#[derive(Debug)]
enum ProcSlot {
    /// Claimed by an in-flight `run`; carries that attempt's generation.
    Starting(u64),
    /// A live spawned process.
    Running(ExtensionProc),
}

type ProcTable = Arc<Mutex<HashMap<String, ProcSlot>>>;

/// Supervisor for extension processes.
///
/// Constructed explicitly and shared by handle; presence of an id in the
/// process table is the sole definition of "running".
pub struct ExtensionRunner {
    /// Running processes by extension id.
    procs: ProcTable,
    /// Durable error store, written through on every terminal event.
    store: Arc<Mutex<ExtensionStore>>,
    /// Launch options.
    options: RunnerOptions,
    /// Directory holding per-extension preference files.
    prefs_dir: PathBuf,
    /// Source of process generation numbers.
    next_generation: AtomicU64,
}

impl ExtensionRunner {
    /// Creates a new runner.
    #[must_use]
    pub fn new(
        options: RunnerOptions,
        store: Arc<Mutex<ExtensionStore>>,
        prefs_dir: PathBuf,
    ) -> Self {
        Self {
            procs: Arc::new(Mutex::new(HashMap::new())),
            store,
            options,
            prefs_dir,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Starts an extension if it is not already running.
    ///
    /// Validates the manifest, spawns the interpreter and attaches the exit
    /// and stderr listeners. Extension-caused failures (invalid manifest,
    /// incompatible API version) are recorded in the store and reported as
    /// `Ok`; `Err` is reserved for host-side faults such as a failed spawn.
    pub async fn run(&self, ext_id: &str, ext_path: &Path) -> Result<(), ExtensionError> {
        // Claim the id in the same lock acquisition that checks it, so
        // concurrent callers cannot both pass the guard and double-spawn.
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.procs.lock().await;
            if table.contains_key(ext_id) {
                return Ok(());
            }
            table.insert(ext_id.to_string(), ProcSlot::Starting(generation));
        }

        // Any path that does not promote the claim to a running record must
        // release it, or the id stays "running" forever.
        let result = self.run_claimed(ext_id, ext_path, generation).await;
        if !matches!(result, Ok(true)) {
            self.release_claim(ext_id, generation).await;
        }
        result.map(|_| ())
    }

    /// The slow part of `run`, executed while holding the table claim.
    ///
    /// Returns `Ok(true)` once the claim has been promoted to a running
    /// record and the listeners attached; `Ok(false)` when the extension was
    /// diagnosed (or stopped mid-start) and no record remains to promote.
    async fn run_claimed(
        &self,
        ext_id: &str,
        ext_path: &Path,
        generation: u64,
    ) -> Result<bool, ExtensionError> {
        {
            let mut store = self.store.lock().await;
            store.clear_error(ext_id);
            store.save()?;
        }

        let manifest = match ExtensionManifest::load(ext_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                self.set_error(ext_id, ErrorType::Invalid, &e.to_string()).await?;
                return Ok(false);
            }
        };

        if let Err(e) = manifest.validate() {
            self.set_error(ext_id, ErrorType::Invalid, &e.to_string()).await?;
            return Ok(false);
        }

        if let Err(e) = manifest.check_compatibility(self.options.verbose) {
            let error_type = match e {
                ManifestError::Incompatible(_) => ErrorType::Incompatible,
                _ => ErrorType::Invalid,
            };
            self.set_error(ext_id, error_type, &e.to_string()).await?;
            return Ok(false);
        }

        // Preferences used to also carry trigger keywords; keep feeding them
        // through the preferences channel so v2 extensions that read keywords
        // from there keep working. Stored preference values win on id clash.
        let mut merged: HashMap<String, Value> = manifest
            .trigger_keywords()
            .into_iter()
            .map(|(id, keyword)| (id, Value::from(keyword)))
            .collect();
        merged.extend(manifest.key_value_preferences(ext_id, &self.prefs_dir));
        let prefs_blob = serde_json::to_string(&merged)
            .map_err(|e| ExtensionError::Spawn(format!("Failed to encode preferences: {}", e)))?;

        let start_time = Instant::now();
        let mut child = Command::new(&self.options.interpreter)
            .arg(ext_path.join("main.py"))
            .env("VERBOSE", if self.options.verbose { "1" } else { "0" })
            .env("PYTHONPATH", &self.options.module_path)
            .env("EXTENSION_PREFERENCES", &prefs_blob)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtensionError::Spawn(e.to_string()))?;

        // A spawn configured with a piped stderr must hand one back; its
        // absence is a transport misconfiguration, not an extension fault.
        let stderr = child.stderr.take().ok_or(ExtensionError::StderrPipe)?;
        let pid = child
            .id()
            .ok_or_else(|| ExtensionError::Spawn("No pid for spawned process".to_string()))?;

        let exited = Arc::new(AtomicBool::new(false));

        {
            let mut table = self.procs.lock().await;
            let claimed = matches!(
                table.get(ext_id),
                Some(ProcSlot::Starting(claim)) if *claim == generation
            );
            // stop() releases the claim while the spawn is in flight; the
            // just-spawned child is then ours to clean up.
            if !claimed {
                tracing::info!("Extension {} was stopped during startup", ext_id);
                let _ = child.start_kill();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                return Ok(false);
            }
            table.insert(
                ext_id.to_string(),
                ProcSlot::Running(ExtensionProc {
                    pid,
                    generation,
                    start_time,
                    recent_error: None,
                    exited: Arc::clone(&exited),
                }),
            );
        }
        tracing::debug!("Launched extension {} as pid {}", ext_id, pid);

        tokio::spawn(stderr_pump(
            Arc::clone(&self.procs),
            ext_id.to_string(),
            generation,
            stderr,
        ));
        tokio::spawn(exit_listener(
            child,
            Arc::clone(&self.procs),
            Arc::clone(&self.store),
            ext_id.to_string(),
            generation,
            exited,
        ));

        Ok(true)
    }

    /// Removes the table claim if it is still this attempt's; a no-op when
    /// the slot was already released or promoted.
    async fn release_claim(&self, ext_id: &str, generation: u64) {
        let mut table = self.procs.lock().await;
        if matches!(table.get(ext_id), Some(ProcSlot::Starting(claim)) if *claim == generation) {
            table.remove(ext_id);
        }
    }

    /// Initiates termination of a running extension; no-op otherwise.
    ///
    /// The record is removed before any signal is sent, so `is_running`
    /// reflects intent immediately. The process gets SIGTERM, then SIGKILL
    /// after a grace period if it has not exited.
    pub async fn stop(&self, ext_id: &str) {
        let Some(slot) = self.procs.lock().await.remove(ext_id) else {
            return;
        };
        let proc = match slot {
            // The in-flight run notices the released claim after spawning
            // and kills its own child.
            ProcSlot::Starting(_) => {
                tracing::info!("Extension \"{}\" stopped before startup finished", ext_id);
                return;
            }
            ProcSlot::Running(proc) => proc,
        };
        tracing::info!("Terminating extension \"{}\"", ext_id);

        let pid = Pid::from_raw(proc.pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            if e != Errno::ESRCH {
                tracing::warn!("Failed to signal extension {}: {}", ext_id, e);
            }
        }

        let ext_id = ext_id.to_string();
        let exited = proc.exited;
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATION_GRACE).await;
            if !exited.load(Ordering::Relaxed) {
                tracing::info!("Extension {} still running, sending SIGKILL", ext_id);
                // The process may exit between the check above and this
                // signal; delivery to a reaped pid fails with ESRCH, which
                // is safe to ignore.
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
        });
    }

    /// Stops all running extensions and waits out the termination grace
    /// period, so SIGTERM-resistant processes are gone by the time this
    /// returns. Intended for host shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.procs.lock().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.stop(&id).await;
        }
        // Returning earlier would let the host exit before the delayed
        // SIGKILL tasks have fired.
        tokio::time::sleep(TERMINATION_GRACE + Duration::from_millis(100)).await;
    }

    /// Returns whether an extension is currently running.
    pub async fn is_running(&self, ext_id: &str) -> bool {
        self.procs.lock().await.contains_key(ext_id)
    }

    /// Returns the ids of all running extensions.
    pub async fn running_extensions(&self) -> Vec<String> {
        self.procs.lock().await.keys().cloned().collect()
    }

    /// Records an error classification and persists the store.
    async fn set_error(
        &self,
        ext_id: &str,
        error_type: ErrorType,
        message: &str,
    ) -> Result<(), ExtensionError> {
        let mut store = self.store.lock().await;
        store.set_error(ext_id, error_type, message);
        store.save()?;
        Ok(())
    }
}

/// Reads stderr lines until end-of-stream or record removal.
///
/// Each line is echoed to the host's own stderr so it lands in aggregate
/// logs, then stored as the record's single retained recent-error line.
async fn stderr_pump(procs: ProcTable, ext_id: String, generation: u64, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                eprintln!("{}", line);
                let mut table = procs.lock().await;
                match table.get_mut(&ext_id) {
                    Some(ProcSlot::Running(proc)) if proc.generation == generation => {
                        proc.recent_error = Some(line);
                    }
                    _ => {
                        tracing::debug!(
                            "Extension process record for {} no longer present",
                            ext_id
                        );
                        return;
                    }
                }
            }
            // End-of-stream is not an error signal; exit classification owns
            // error reporting.
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("Stderr stream for {} closed: {}", ext_id, e);
                return;
            }
        }
    }
}

/// Awaits process exit, classifies the outcome and updates the store.
async fn exit_listener(
    mut child: Child,
    procs: ProcTable,
    store: Arc<Mutex<ExtensionStore>>,
    ext_id: String,
    generation: u64,
    exited: Arc<AtomicBool>,
) {
    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("Failed waiting on extension {}: {}", ext_id, e);
            return;
        }
    };
    exited.store(true, Ordering::Relaxed);

    let mut table = procs.lock().await;

    // An uncaught signal with the record still present is an out-of-band
    // kill; a deliberate stop() removes the record before signaling.
    if let Some(sig) = status.signal() {
        if matches!(table.get(&ext_id), Some(ProcSlot::Running(_))) {
            let message = classifier::signal_message(&ext_id, sig);
            tracing::error!("{}", message);
            persist_error(&store, &ext_id, ErrorType::Terminated, &message).await;
            table.remove(&ext_id);
            return;
        }
    }

    let Some(ProcSlot::Running(proc)) = table.get(&ext_id) else {
        tracing::info!("Exited process for {} has already been removed", ext_id);
        return;
    };
    if proc.generation != generation {
        tracing::info!("Stale exit notification for {}, ignoring", ext_id);
        return;
    }

    let uptime = proc.start_time.elapsed();
    let code = status.code().unwrap_or(-1);
    let last_line = proc.recent_error.clone();

    if uptime < classifier::INSTANT_CRASH_THRESHOLD {
        if let Some(line) = &last_line {
            tracing::error!("Extension \"{}\" failed with an error: {}", ext_id, line);
        }
    }

    let (error_type, message) =
        classifier::classify_exit(&ext_id, code, uptime, last_line.as_deref());
    if error_type == ErrorType::Exited {
        tracing::error!("{}", message);
    }
    persist_error(&store, &ext_id, error_type, &message).await;
    table.remove(&ext_id);
}

/// Writes a classification through to the store; persistence failures are
/// logged because listener tasks have no caller to report to.
async fn persist_error(
    store: &Arc<Mutex<ExtensionStore>>,
    ext_id: &str,
    error_type: ErrorType,
    message: &str,
) {
    let mut store = store.lock().await;
    store.set_error(ext_id, error_type, message);
    if let Err(e) = store.save() {
        tracing::error!("Failed to persist error record for {}: {}", ext_id, e);
    }
}
