//! Exit classification for extension processes.
//!
//! Pure decision logic mapping (exit code, uptime, captured stderr tail) to
//! the persisted error taxonomy. Keeping this free of process state lets the
//! rules be tested without spawning anything.

use std::time::Duration;

use crate::extension::store::ErrorType;

/// Exits faster than this are treated as crashes rather than normal exits.
///
/// Legitimately fast-failing extensions are misclassified by this heuristic;
/// the threshold matches long-standing behavior that downstream messaging
/// depends on.
pub const INSTANT_CRASH_THRESHOLD: Duration = Duration::from_secs(1);

/// Marker the interpreter prints when an import cannot be resolved.
const MODULE_NOT_FOUND_MARKER: &str = "ModuleNotFoundError";

/// The host's own module namespace. Extensions importing it depend on
/// internals outside the stable extension API.
const HOST_MODULE: &str = "beacon";

/// Classifies a non-signaled process exit.
///
/// `last_stderr` is the single most recent stderr line captured before the
/// exit, used to distinguish missing third-party modules from other instant
/// crashes.
#[must_use]
pub fn classify_exit(
    ext_id: &str,
    code: i32,
    uptime: Duration,
    last_stderr: Option<&str>,
) -> (ErrorType, String) {
    if uptime < INSTANT_CRASH_THRESHOLD {
        let default_msg = format!("Extension \"{}\" exited instantly with code {}", ext_id, code);

        if let Some(line) = last_stderr {
            if line.contains(MODULE_NOT_FOUND_MARKER) {
                if let Some(module) = missing_module_name(line) {
                    if module == HOST_MODULE {
                        return (ErrorType::Incompatible, default_msg);
                    }
                    return (ErrorType::MissingModule, module.to_string());
                }
            }
        }

        return (ErrorType::Terminated, default_msg);
    }

    let message = format!(
        "Extension \"{}\" exited with code {} after {:.1} seconds.",
        ext_id,
        code,
        uptime.as_secs_f64()
    );
    (ErrorType::Exited, message)
}

/// Formats the message for a process killed by an out-of-band signal.
#[must_use]
pub fn signal_message(ext_id: &str, signal: i32) -> String {
    format!(
        "Extension \"{}\" was terminated with signal {}",
        ext_id, signal
    )
}

/// Extracts the quoted module name from an interpreter import error line
/// (`ModuleNotFoundError: No module named 'requests'`).
#[must_use]
pub fn missing_module_name(line: &str) -> Option<&str> {
    let mut quoted = line.split('\'');
    quoted.next()?;
    quoted.next().filter(|name| !name.is_empty())
}
