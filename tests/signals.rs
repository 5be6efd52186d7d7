//! End-to-end: real signals delivered to this test process.

#![cfg(target_os = "linux")]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sigdump::{ConfigError, ProfileKind, Profiler, Settings, WatcherState};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

async fn wait_for_dump(path: &Path, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heap_dump_on_sigusr1_and_nothing_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let dir_str = dir.path().to_str().unwrap().to_string();
    let settings = Settings::from_lookup(lookup(&[("PROFILE_DIRECTORY", &dir_str)])).unwrap();
    let path = dir.path().join("heap.profile");
    assert_eq!(settings.output_path(ProfileKind::Heap), path);

    let mut profiler = Profiler::new(settings);
    let handle = profiler.run(ProfileKind::Heap).unwrap();
    assert_eq!(handle.state(), WatcherState::Listening);

    kill(Pid::this(), Signal::SIGUSR1).unwrap();
    assert!(wait_for_dump(&path, Duration::from_secs(2)).await);
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("heap profile:"));

    profiler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), profiler.wait())
        .await
        .unwrap();
    assert_eq!(handle.state(), WatcherState::Stopped);

    // Pin the mtime in the past so any rewrite is visible
    let pinned = filetime::FileTime::from_unix_time(1_000_000_000, 0);
    filetime::set_file_mtime(&path, pinned).unwrap();

    kill(Pid::this(), Signal::SIGUSR1).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let meta = std::fs::metadata(&path).unwrap();
    assert_eq!(filetime::FileTime::from_last_modification_time(&meta), pinned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trace_window_cut_short_by_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let dir_str = dir.path().to_str().unwrap().to_string();
    let settings = Settings::from_lookup(lookup(&[
        ("PROFILE_DIRECTORY", &dir_str),
        ("TRACE_PROFILER_SIGNAL", "SIGUSR2"),
        ("TRACE_PROFILE_DURATION", "1m"),
        ("TRACE_PROFILE_NAME", "window.trace"),
    ]))
    .unwrap();
    let path = dir.path().join("window.trace");

    let mut profiler = Profiler::new(settings);
    profiler.run(ProfileKind::Trace).unwrap();

    kill(Pid::this(), Signal::SIGUSR2).unwrap();
    // The file exists, still empty, once collection has started
    let deadline = Instant::now() + Duration::from_secs(2);
    while !path.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(path.exists());

    let started = Instant::now();
    profiler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), profiler.wait())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let text = std::fs::read_to_string(&path).unwrap();
    let last = text.lines().last().unwrap();
    let trailer: serde_json::Value = serde_json::from_str(last).unwrap();
    assert_eq!(trailer["type"], "trailer");
}

#[test]
fn test_invalid_signal_name_fails_configuration() {
    let err = Settings::from_lookup(lookup(&[("HEAP_PROFILER_SIGNAL", "owl")])).unwrap_err();
    match err {
        ConfigError::InvalidSignal { key, source } => {
            assert_eq!(key, "HEAP_PROFILER_SIGNAL");
            assert_eq!(source.value, "owl");
        }
        other => panic!("expected InvalidSignal, got {other}"),
    }
}

#[test]
fn test_out_of_range_signal_number_fails_configuration() {
    let err = Settings::from_lookup(lookup(&[("CPU_PROFILER_SIGNAL", "9")])).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidSignal { .. }));
}
