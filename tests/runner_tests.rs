//! End-to-end tests for the extension process runner.
//!
//! Extensions are faked with shell scripts: the runner's interpreter is
//! pointed at `sh`, and each extension's `main.py` is a small script that
//! crashes, sleeps or inspects its environment.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::sleep;

use beacon::config::RunnerOptions;
use beacon::extension::{
    ErrorRecord, ErrorType, ExtensionPreferences, ExtensionRunner, ExtensionStore,
};

const VALID_MANIFEST: &str = r#"{
    "name": "Demo",
    "version": "1.0.0",
    "api_version": "^2.0",
    "triggers": {
        "de": {"name": "Demo", "keyword": "de"}
    },
    "preferences": [
        {"id": "city", "type": "input", "default_value": "Berlin"}
    ]
}"#;

fn write_extension(root: &Path, ext_id: &str, manifest: &str, script: &str) -> PathBuf {
    let dir = root.join(ext_id);
    fs::create_dir_all(&dir).expect("create extension dir");
    fs::write(dir.join("manifest.json"), manifest).expect("write manifest");
    fs::write(dir.join("main.py"), script).expect("write entry point");
    dir
}

fn make_runner(root: &Path) -> (ExtensionRunner, Arc<Mutex<ExtensionStore>>) {
    let store = ExtensionStore::load(root.join("extensions.json")).expect("load store");
    let store = Arc::new(Mutex::new(store));
    let options = RunnerOptions {
        verbose: false,
        interpreter: "sh".to_string(),
        module_path: root.join("api"),
    };
    let runner = ExtensionRunner::new(options, Arc::clone(&store), root.join("prefs"));
    (runner, store)
}

async fn wait_for_error(
    store: &Arc<Mutex<ExtensionStore>>,
    ext_id: &str,
    timeout: Duration,
) -> ErrorRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = store.lock().await.get_record(ext_id);
        if record.error_type != ErrorType::None || tokio::time::Instant::now() >= deadline {
            return record;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_missing_module_instant_crash() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(
        tmp.path(),
        "timer",
        VALID_MANIFEST,
        "echo \"ModuleNotFoundError: No module named 'requests'\" >&2\nexit 1\n",
    );
    let (runner, store) = make_runner(tmp.path());

    runner.run("timer", &ext_path).await.expect("run");

    let record = wait_for_error(&store, "timer", Duration::from_secs(3)).await;
    assert_eq!(record.error_type, ErrorType::MissingModule);
    assert_eq!(record.error_message, "requests");
    assert!(!runner.is_running("timer").await);
}

#[tokio::test]
async fn test_host_internal_import_is_incompatible() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(
        tmp.path(),
        "timer",
        VALID_MANIFEST,
        "echo \"ModuleNotFoundError: No module named 'beacon'\" >&2\nexit 1\n",
    );
    let (runner, store) = make_runner(tmp.path());

    runner.run("timer", &ext_path).await.expect("run");

    let record = wait_for_error(&store, "timer", Duration::from_secs(3)).await;
    assert_eq!(record.error_type, ErrorType::Incompatible);
    assert!(record.error_message.contains("exited instantly"));
}

#[tokio::test]
async fn test_instant_crash_without_stderr_is_terminated() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(tmp.path(), "timer", VALID_MANIFEST, "exit 7\n");
    let (runner, store) = make_runner(tmp.path());

    runner.run("timer", &ext_path).await.expect("run");

    let record = wait_for_error(&store, "timer", Duration::from_secs(3)).await;
    assert_eq!(record.error_type, ErrorType::Terminated);
    assert!(record.error_message.contains("exited instantly with code 7"));
}

#[tokio::test]
async fn test_exit_after_uptime_is_exited() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(tmp.path(), "timer", VALID_MANIFEST, "sleep 1.2\nexit 0\n");
    let (runner, store) = make_runner(tmp.path());

    runner.run("timer", &ext_path).await.expect("run");
    assert!(runner.is_running("timer").await);

    let record = wait_for_error(&store, "timer", Duration::from_secs(5)).await;
    assert_eq!(record.error_type, ErrorType::Exited);
    assert!(record.error_message.contains("code 0"));
    assert!(record.error_message.contains("seconds"));
    assert!(!runner.is_running("timer").await);
}

#[tokio::test]
async fn test_invalid_manifest_never_spawns() {
    let tmp = TempDir::new().expect("temp dir");
    let manifest = r#"{"name": "", "version": "1.0", "api_version": "^2.0"}"#;
    let script = "touch \"$(dirname \"$0\")/ran\"\nsleep 5\n";
    let ext_path = write_extension(tmp.path(), "broken", manifest, script);
    let (runner, store) = make_runner(tmp.path());

    runner.run("broken", &ext_path).await.expect("run");

    // The diagnosis is persisted before run returns and nothing was spawned.
    let record = store.lock().await.get_record("broken");
    assert_eq!(record.error_type, ErrorType::Invalid);
    assert!(!runner.is_running("broken").await);

    sleep(Duration::from_millis(200)).await;
    assert!(!ext_path.join("ran").exists());
}

#[tokio::test]
async fn test_incompatible_api_version_never_spawns() {
    let tmp = TempDir::new().expect("temp dir");
    let manifest = r#"{"name": "Future", "version": "1.0", "api_version": "^9.0"}"#;
    let ext_path = write_extension(tmp.path(), "future", manifest, "sleep 5\n");
    let (runner, store) = make_runner(tmp.path());

    runner.run("future", &ext_path).await.expect("run");

    let record = store.lock().await.get_record("future");
    assert_eq!(record.error_type, ErrorType::Incompatible);
    assert!(!runner.is_running("future").await);
}

#[tokio::test]
async fn test_run_clears_previous_error() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(tmp.path(), "timer", VALID_MANIFEST, "sleep 30\n");
    let (runner, store) = make_runner(tmp.path());

    store
        .lock()
        .await
        .set_error("timer", ErrorType::Exited, "old diagnosis");

    runner.run("timer", &ext_path).await.expect("run");

    // Running extension, no persisted error: exactly one of the two holds.
    assert!(runner.is_running("timer").await);
    let record = store.lock().await.get_record("timer");
    assert_eq!(record.error_type, ErrorType::None);
    assert!(record.error_message.is_empty());

    runner.stop("timer").await;
}

#[tokio::test]
async fn test_run_is_idempotent_while_running() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(tmp.path(), "timer", VALID_MANIFEST, "sleep 30\n");
    let (runner, store) = make_runner(tmp.path());

    runner.run("timer", &ext_path).await.expect("first run");
    runner.run("timer", &ext_path).await.expect("second run");

    assert_eq!(runner.running_extensions().await, vec!["timer".to_string()]);
    let record = store.lock().await.get_record("timer");
    assert_eq!(record.error_type, ErrorType::None);

    runner.stop("timer").await;
}

#[tokio::test]
async fn test_stop_reflects_immediately() {
    let tmp = TempDir::new().expect("temp dir");
    let ext_path = write_extension(tmp.path(), "timer", VALID_MANIFEST, "sleep 30\n");
    let (runner, store) = make_runner(tmp.path());

    runner.run("timer", &ext_path).await.expect("run");
    assert!(runner.is_running("timer").await);

    runner.stop("timer").await;
    assert!(!runner.is_running("timer").await);

    // A deliberate stop is not a diagnosis; the store stays clean.
    sleep(Duration::from_secs(1)).await;
    let record = store.lock().await.get_record("timer");
    assert_eq!(record.error_type, ErrorType::None);
}

#[tokio::test]
async fn test_stop_non_running_leaves_store_unmodified() {
    let tmp = TempDir::new().expect("temp dir");
    let (runner, store) = make_runner(tmp.path());

    store
        .lock()
        .await
        .set_error("ghost", ErrorType::Exited, "previous run");

    runner.stop("ghost").await;

    let record = store.lock().await.get_record("ghost");
    assert_eq!(record.error_type, ErrorType::Exited);
    assert_eq!(record.error_message, "previous run");
}

#[tokio::test]
async fn test_sigterm_resistant_process_is_killed() {
    let tmp = TempDir::new().expect("temp dir");
    let script = "trap '' TERM\nn=0\nwhile [ $n -lt 60 ]; do sleep 1; n=$((n+1)); done\n";
    let ext_path = write_extension(tmp.path(), "stubborn", VALID_MANIFEST, script);
    let (runner, store) = make_runner(tmp.path());

    runner.run("stubborn", &ext_path).await.expect("run");
    sleep(Duration::from_millis(300)).await;

    runner.stop("stubborn").await;
    assert!(!runner.is_running("stubborn").await);

    // After the grace period the SIGKILL escalation fires; the stop itself
    // still records no error.
    sleep(Duration::from_millis(1200)).await;
    let record = store.lock().await.get_record("stubborn");
    assert_eq!(record.error_type, ErrorType::None);
}

#[tokio::test]
async fn test_environment_contract() {
    let tmp = TempDir::new().expect("temp dir");
    let script = concat!(
        "printf '%s' \"$EXTENSION_PREFERENCES\" > \"$(dirname \"$0\")/env.json\"\n",
        "printf '%s' \"$VERBOSE\" > \"$(dirname \"$0\")/verbose.txt\"\n",
        "sleep 5\n",
    );
    let ext_path = write_extension(tmp.path(), "demo", VALID_MANIFEST, script);
    let (runner, _store) = make_runner(tmp.path());

    // Stored preference values must win over manifest defaults.
    let mut prefs = ExtensionPreferences::load(&tmp.path().join("prefs"), "demo");
    prefs
        .set("city", serde_json::Value::from("Oslo"))
        .expect("set preference");

    runner.run("demo", &ext_path).await.expect("run");
    sleep(Duration::from_millis(500)).await;

    let blob = fs::read_to_string(ext_path.join("env.json")).expect("read env blob");
    let merged: serde_json::Value = serde_json::from_str(&blob).expect("parse env blob");

    // Trigger keywords ride along in the preferences blob.
    assert_eq!(merged["de"], serde_json::Value::from("de"));
    assert_eq!(merged["city"], serde_json::Value::from("Oslo"));

    let verbose = fs::read_to_string(ext_path.join("verbose.txt")).expect("read verbose flag");
    assert_eq!(verbose, "0");

    runner.stop("demo").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_spawn_once() {
    let tmp = TempDir::new().expect("temp dir");
    let script = "echo started >> \"$(dirname \"$0\")/spawns.log\"\nsleep 30\n";
    let ext_path = write_extension(tmp.path(), "timer", VALID_MANIFEST, script);
    let (runner, _store) = make_runner(tmp.path());
    let runner = Arc::new(runner);

    let first = tokio::spawn({
        let runner = Arc::clone(&runner);
        let path = ext_path.clone();
        async move { runner.run("timer", &path).await }
    });
    let second = tokio::spawn({
        let runner = Arc::clone(&runner);
        let path = ext_path.clone();
        async move { runner.run("timer", &path).await }
    });
    first.await.expect("join").expect("run");
    second.await.expect("join").expect("run");

    // Exactly one process came up no matter how the two calls interleaved.
    sleep(Duration::from_millis(500)).await;
    let log = fs::read_to_string(ext_path.join("spawns.log")).expect("read spawn log");
    assert_eq!(log.lines().count(), 1);
    assert_eq!(runner.running_extensions().await, vec!["timer".to_string()]);

    runner.stop("timer").await;
}

#[tokio::test]
async fn test_stored_preference_wins_over_trigger_keyword() {
    let tmp = TempDir::new().expect("temp dir");
    let manifest = r#"{
        "name": "Demo",
        "version": "1.0.0",
        "api_version": "^2.0",
        "triggers": {
            "de": {"name": "Demo", "keyword": "de"}
        },
        "preferences": [
            {"id": "de", "type": "keyword", "default_value": "de"}
        ]
    }"#;
    let script = "printf '%s' \"$EXTENSION_PREFERENCES\" > \"$(dirname \"$0\")/env.json\"\nsleep 5\n";
    let ext_path = write_extension(tmp.path(), "demo", manifest, script);
    let (runner, _store) = make_runner(tmp.path());

    let mut prefs = ExtensionPreferences::load(&tmp.path().join("prefs"), "demo");
    prefs
        .set("de", serde_json::Value::from("dm"))
        .expect("set preference");

    runner.run("demo", &ext_path).await.expect("run");
    sleep(Duration::from_millis(500)).await;

    let blob = fs::read_to_string(ext_path.join("env.json")).expect("read env blob");
    let merged: serde_json::Value = serde_json::from_str(&blob).expect("parse env blob");

    // When a preference id collides with a trigger id, the user's stored
    // value replaces the trigger keyword in the merged blob.
    assert_eq!(merged["de"], serde_json::Value::from("dm"));

    runner.stop("demo").await;
}

#[tokio::test]
async fn test_stop_all_kills_sigterm_resistant_process_before_returning() {
    let tmp = TempDir::new().expect("temp dir");
    let script = concat!(
        "trap '' TERM\n",
        "while true; do echo tick >> \"$(dirname \"$0\")/ticks.log\"; sleep 0.1; done\n",
    );
    let ext_path = write_extension(tmp.path(), "stubborn", VALID_MANIFEST, script);
    let (runner, _store) = make_runner(tmp.path());

    runner.run("stubborn", &ext_path).await.expect("run");
    sleep(Duration::from_millis(300)).await;

    runner.stop_all().await;

    // stop_all only returns after the SIGKILL escalation has fired, so the
    // process produces no further output.
    let after_stop = fs::read_to_string(ext_path.join("ticks.log")).expect("read tick log");
    sleep(Duration::from_millis(400)).await;
    let later = fs::read_to_string(ext_path.join("ticks.log")).expect("read tick log");
    assert_eq!(after_stop, later);
}

#[tokio::test]
async fn test_stop_all() {
    let tmp = TempDir::new().expect("temp dir");
    let first = write_extension(tmp.path(), "one", VALID_MANIFEST, "sleep 30\n");
    let second = write_extension(tmp.path(), "two", VALID_MANIFEST, "sleep 30\n");
    let (runner, _store) = make_runner(tmp.path());

    runner.run("one", &first).await.expect("run one");
    runner.run("two", &second).await.expect("run two");
    assert_eq!(runner.running_extensions().await.len(), 2);

    runner.stop_all().await;
    assert!(runner.running_extensions().await.is_empty());
}
