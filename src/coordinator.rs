//! Lifecycle coordinator: starts watchers under one cancellation scope and
//! stops them all together.
//!
//! ```ignore
//! let settings = sigdump::Settings::from_env()?;
//! let mut profiler = sigdump::Profiler::new(settings);
//! profiler.run_all(&sigdump::ProfileKind::ALL)?;
//! profiler.shutdown_on_signals()?;
//! profiler.wait().await;
//! ```

use crate::config::Settings;
use crate::error::WatchError;
use crate::generator::Generator;
use crate::profile::ProfileKind;
use crate::runtime::ProfileRegistry;
use crate::watcher::{Watcher, WatcherHandle};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the shared cancellation scope and every watcher started through it.
#[derive(Debug)]
pub struct Profiler {
    settings: Arc<Settings>,
    generator: Arc<Generator>,
    scope: CancellationToken,
    tracker: TaskTracker,
    watchers: Vec<WatcherHandle>,
}

impl Profiler {
    /// A profiler using the built-in writers.
    pub fn new(settings: Settings) -> Self {
        let registry = ProfileRegistry::builtin(&settings);
        Self::with_registry(settings, registry)
    }

    pub fn with_registry(settings: Settings, registry: ProfileRegistry) -> Self {
        if !settings.directory.is_dir() {
            tracing::warn!(
                directory = %settings.directory.display(),
                "profile directory does not exist, dumps will fail until it is created"
            );
        }
        Self {
            settings: Arc::new(settings),
            generator: Arc::new(Generator::new(registry)),
            scope: CancellationToken::new(),
            tracker: TaskTracker::new(),
            watchers: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start a watcher for `kind`. Returns once it is subscribed.
    pub fn run(&mut self, kind: ProfileKind) -> Result<WatcherHandle, WatchError> {
        if self.watchers.iter().any(|w| w.kind() == kind) {
            return Err(WatchError::AlreadyWatching { kind });
        }
        let handle = Watcher::new(
            kind,
            &self.settings,
            Arc::clone(&self.generator),
            self.scope.child_token(),
        )
        .spawn(&self.tracker)?;
        self.watchers.push(handle.clone());
        Ok(handle)
    }

    /// Start watchers for each of `kinds`, stopping at the first failure.
    ///
    /// Watchers started before a failure keep running until shutdown.
    pub fn run_all(&mut self, kinds: &[ProfileKind]) -> Result<Vec<WatcherHandle>, WatchError> {
        for (signal, shared) in self.settings.shared_signals(kinds) {
            let names: Vec<&str> = shared.iter().map(|k| k.name()).collect();
            tracing::warn!(
                signal = %signal,
                kinds = %names.join(","),
                "several profile kinds share one signal, each delivery dumps all of them"
            );
        }
        kinds.iter().map(|&kind| self.run(kind)).collect()
    }

    pub fn watchers(&self) -> &[WatcherHandle] {
        &self.watchers
    }

    /// Token cancelled on shutdown. Application tasks may share it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.scope.clone()
    }

    /// Stop every watcher. Idempotent.
    pub fn shutdown(&self) {
        if !self.scope.is_cancelled() {
            tracing::info!(watchers = self.watchers.len(), "stopping profile watchers");
        }
        self.scope.cancel();
    }

    /// Shut down on the first SIGINT, SIGHUP, or SIGTERM.
    ///
    /// Those signals no longer terminate the process once this returns; call
    /// [`wait`](Self::wait) and exit when it resolves.
    pub fn shutdown_on_signals(&self) -> std::io::Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let scope = self.scope.clone();

        self.tracker.spawn(async move {
            let received = tokio::select! {
                _ = scope.cancelled() => return,
                _ = interrupt.recv() => "SIGINT",
                _ = hangup.recv() => "SIGHUP",
                _ = terminate.recv() => "SIGTERM",
            };
            tracing::info!(signal = received, "shutdown signal received");
            scope.cancel();
        });
        Ok(())
    }

    /// Wait until shutdown and every watcher has stopped.
    ///
    /// A windowed dump in progress at shutdown is finalized before this resolves.
    pub async fn wait(&self) {
        self.scope.cancelled().await;
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Watch `kind` under an externally owned `scope`, without a [`Profiler`].
///
/// The watcher runs on the current tokio runtime and stops when `scope` is
/// cancelled; await [`WatcherHandle::stopped`] to know when it is done.
pub fn watch(
    kind: ProfileKind,
    settings: Arc<Settings>,
    scope: CancellationToken,
) -> Result<WatcherHandle, WatchError> {
    let generator = Arc::new(Generator::new(ProfileRegistry::builtin(&settings)));
    let tracker = TaskTracker::new();
    let handle = Watcher::new(kind, &settings, generator, scope).spawn(&tracker)?;
    tracker.close();
    Ok(handle)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::runtime::{CollectError, SnapshotProfile};
    use crate::signals::{self, SIGRTMIN};
    use crate::watcher::WatcherState;
    use crate::TriggerSignal;
    use std::io::Write;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn rt(offset: i32) -> TriggerSignal {
        signals::validate(SIGRTMIN + offset).unwrap()
    }

    fn raise(signal: TriggerSignal) {
        unsafe {
            libc::kill(libc::getpid(), signal.number());
        }
    }

    async fn wait_for_file(path: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    struct Fixed(&'static str);

    impl SnapshotProfile for Fixed {
        fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError> {
            out.write_all(self.0.as_bytes())?;
            Ok(())
        }
    }

    fn registry() -> ProfileRegistry {
        ProfileRegistry::empty()
            .with_snapshot(ProfileKind::Heap, Fixed("heap"))
            .with_snapshot(ProfileKind::Block, Fixed("block"))
            .with_snapshot(ProfileKind::Mutex, Fixed("mutex"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_signal_dumps_every_kind() {
        let dir = tempfile::tempdir().unwrap();
        let signal = rt(6);
        let mut settings = Settings::new(dir.path());
        settings.profile_mut(ProfileKind::Block).signal = signal;
        settings.profile_mut(ProfileKind::Mutex).signal = signal;

        let mut profiler = Profiler::with_registry(settings, registry());
        let handles = profiler
            .run_all(&[ProfileKind::Block, ProfileKind::Mutex])
            .unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(profiler.watchers().len(), 2);

        raise(signal);
        assert!(wait_for_file(&dir.path().join("block.profile")).await);
        assert!(wait_for_file(&dir.path().join("mutex.profile")).await);

        profiler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), profiler.wait())
            .await
            .unwrap();
        for handle in &handles {
            assert_eq!(handle.state(), WatcherState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_second_watcher_for_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::new(dir.path());
        settings.profile_mut(ProfileKind::Heap).signal = rt(7);

        let mut profiler = Profiler::with_registry(settings, registry());
        profiler.run(ProfileKind::Heap).unwrap();
        assert!(matches!(
            profiler.run(ProfileKind::Heap),
            Err(WatchError::AlreadyWatching {
                kind: ProfileKind::Heap
            })
        ));
        assert_eq!(profiler.watchers().len(), 1);

        profiler.shutdown();
        profiler.wait().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::new(dir.path());
        settings.profile_mut(ProfileKind::Heap).signal = rt(8);

        let mut profiler = Profiler::with_registry(settings, registry());
        let handle = profiler.run(ProfileKind::Heap).unwrap();
        let token = profiler.cancellation_token();
        assert!(!token.is_cancelled());

        profiler.shutdown();
        profiler.shutdown();
        assert!(token.is_cancelled());
        profiler.wait().await;
        handle.stopped().await;
        assert_eq!(handle.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_with_no_watchers_returns_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = Profiler::with_registry(Settings::new(dir.path()), registry());
        profiler.shutdown_on_signals().unwrap();
        profiler.shutdown();
        tokio::time::timeout(Duration::from_secs(5), profiler.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_under_external_scope() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::new(dir.path());
        settings.profile_mut(ProfileKind::Goroutine).signal = rt(9);
        let scope = CancellationToken::new();

        let handle = watch(ProfileKind::Goroutine, Arc::new(settings), scope.clone()).unwrap();
        assert_eq!(handle.kind(), ProfileKind::Goroutine);
        assert_eq!(handle.state(), WatcherState::Listening);

        scope.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
    }
}
