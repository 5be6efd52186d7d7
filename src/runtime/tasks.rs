use super::{CollectError, SnapshotProfile};
use std::io::Write;

/// Snapshot of the tokio runtime the dump runs on: flavor, workers, live tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskProfile;

impl SnapshotProfile for TaskProfile {
    fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| CollectError::Failed(format!("no async runtime: {e}")))?;
        let metrics = handle.metrics();
        writeln!(out, "goroutine profile: total {}", metrics.num_alive_tasks())?;
        writeln!(out, "# runtime_flavor: {:?}", handle.runtime_flavor())?;
        writeln!(out, "# workers: {}", metrics.num_workers())?;
        writeln!(out, "# alive_tasks: {}", metrics.num_alive_tasks())?;
        writeln!(out, "# captured_at: {}", chrono::Utc::now().to_rfc3339())?;
        Ok(())
    }
}
