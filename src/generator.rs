/// Profile generation: write one profile kind to one path.
///
/// Snapshot kinds are written immediately. Windowed kinds collect until the
/// window elapses or the scope is cancelled, whichever comes first, and always
/// finalize the file before returning.
use crate::error::ProfileError;
use crate::profile::ProfileKind;
use crate::runtime::{CollectError, ProfileRegistry, ProfileSource};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of a successful dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dump {
    /// Size of the file that was written.
    pub bytes: u64,
    /// Wall-clock time spent generating.
    pub elapsed: Duration,
    /// A windowed collection ended early because the scope was cancelled.
    pub cut_short: bool,
}

#[derive(Debug, Clone)]
pub struct Generator {
    registry: ProfileRegistry,
}

impl Generator {
    pub fn new(registry: ProfileRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Write `kind` to `path`, truncating any previous dump.
    ///
    /// `window` is only used by windowed kinds. Collection, file I/O and
    /// encoding run on the blocking pool; only the window wait stays on the
    /// calling task.
    pub async fn generate(
        &self,
        kind: ProfileKind,
        path: &Path,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Dump, ProfileError> {
        let started = Instant::now();
        let source = self
            .registry
            .get(kind)
            .cloned()
            .ok_or(ProfileError::Unavailable { kind })?;

        let cut_short = match source {
            ProfileSource::Snapshot(profile) => {
                let target = path.to_path_buf();
                blocking(kind, move || {
                    if kind == ProfileKind::Heap {
                        profile.prepare();
                    }
                    let mut out = create(&target)?;
                    profile
                        .write_to(&mut out)
                        .map_err(|e| profile_error(kind, &target, e))?;
                    finish_file(out, &target)
                })
                .await?;
                false
            }
            ProfileSource::Windowed(profile) => {
                let target = path.to_path_buf();
                let (active, out) = blocking(kind, move || {
                    let active = profile
                        .start()
                        .map_err(|e| profile_error(kind, &target, e))?;
                    // If the file can't be created the window is dropped, which stops collection
                    let out = create(&target)?;
                    Ok((active, out))
                })
                .await?;
                tracing::debug!(kind = %kind, window_ms = window.as_millis() as u64, "collection started");

                let cut_short = tokio::select! {
                    _ = tokio::time::sleep(window) => false,
                    _ = cancel.cancelled() => true,
                };
                if cut_short {
                    tracing::debug!(kind = %kind, "collection cut short by shutdown");
                }

                let target = path.to_path_buf();
                blocking(kind, move || {
                    let mut out = out;
                    active
                        .finish(&mut out)
                        .map_err(|e| profile_error(kind, &target, e))?;
                    finish_file(out, &target)
                })
                .await?;
                cut_short
            }
        };

        let bytes = tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(Dump {
            bytes,
            elapsed: started.elapsed(),
            cut_short,
        })
    }
}

/// Run a writer step on the blocking pool.
async fn blocking<T, F>(kind: ProfileKind, step: F) -> Result<T, ProfileError>
where
    F: FnOnce() -> Result<T, ProfileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(step)
        .await
        .map_err(|e| ProfileError::collect(kind, format!("profile writer panicked: {e}")))?
}

fn create(path: &Path) -> Result<BufWriter<File>, ProfileError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| ProfileError::io(path, e))
}

/// Flush buffered output and surface the final write error, if any.
fn finish_file(out: BufWriter<File>, path: &Path) -> Result<(), ProfileError> {
    let file = out
        .into_inner()
        .map_err(|e| ProfileError::io(path, e.into_error()))?;
    file.sync_data().map_err(|e| ProfileError::io(path, e))
}

fn profile_error(kind: ProfileKind, path: &Path, e: CollectError) -> ProfileError {
    match e {
        CollectError::Io(source) => ProfileError::io(path, source),
        CollectError::AlreadyActive => ProfileError::AlreadyActive { kind },
        CollectError::Failed(message) => ProfileError::collect(kind, message),
    }
}
