use super::{CollectError, SnapshotProfile};
use std::io::Write;

/// Whether this platform exposes the per-thread data the profile needs.
pub fn supported() -> bool {
    cfg!(target_os = "linux")
}

/// OS threads of the process, read from `/proc/self/task`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadProfile;

impl SnapshotProfile for ThreadProfile {
    fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError> {
        let threads = list_threads()?;
        writeln!(out, "threadcreate profile: total {}", threads.len())?;
        for (tid, name) in &threads {
            writeln!(out, "{tid} {name}")?;
        }
        Ok(())
    }
}

fn list_threads() -> std::io::Result<Vec<(u32, String)>> {
    let mut threads = Vec::new();
    for entry in std::fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Threads can exit between read_dir and here
        let name = std::fs::read_to_string(entry.path().join("comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| "?".to_string());
        threads.push((tid, name));
    }
    threads.sort();
    Ok(threads)
}
