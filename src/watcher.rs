/// Signal watcher: one OS signal subscription driving dumps of one profile kind.
///
/// Runs alongside the application as its own task. Each delivery of the
/// trigger signal runs the generator inline, so dumps of one kind never
/// overlap. Cancelling the shared scope drops the subscription and stops the
/// watcher for good.
use crate::config::Settings;
use crate::error::WatchError;
use crate::generator::Generator;
use crate::profile::ProfileKind;
use crate::signals::TriggerSignal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::Signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lifecycle of a watcher. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Listening,
    Stopped,
}

/// Live registration for one signal number.
///
/// Deliveries that arrive while a dump is running collapse into a single
/// pending wake-up; they are never queued. Dropping the subscription stops
/// delivery to this watcher.
#[derive(Debug)]
pub struct SignalSubscription {
    signal: TriggerSignal,
    stream: Signal,
}

impl SignalSubscription {
    /// Must be called from inside a tokio runtime.
    pub fn subscribe(signal: TriggerSignal) -> std::io::Result<Self> {
        let stream = tokio::signal::unix::signal(signal.kind())?;
        Ok(Self { signal, stream })
    }

    pub fn signal(&self) -> TriggerSignal {
        self.signal
    }

    /// Wait for the next delivery. `None` means the stream can no longer
    /// receive signals.
    pub async fn recv(&mut self) -> Option<()> {
        self.stream.recv().await
    }
}

/// A watcher that has not been started yet.
#[derive(Debug)]
pub struct Watcher {
    kind: ProfileKind,
    signal: TriggerSignal,
    path: PathBuf,
    window: Duration,
    generator: Arc<Generator>,
    scope: CancellationToken,
    state: watch::Sender<WatcherState>,
}

impl Watcher {
    pub fn new(
        kind: ProfileKind,
        settings: &Settings,
        generator: Arc<Generator>,
        scope: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Idle);
        Self {
            kind,
            signal: settings.profile(kind).signal,
            path: settings.output_path(kind),
            window: settings.window(kind),
            generator,
            scope,
            state,
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Subscribe to the trigger signal and start listening on `tracker`.
    ///
    /// The subscription is in place when this returns, so a signal sent right
    /// afterwards is not missed. On error nothing has been spawned.
    pub fn spawn(self, tracker: &TaskTracker) -> Result<WatcherHandle, WatchError> {
        let subscription =
            SignalSubscription::subscribe(self.signal).map_err(|e| WatchError::Subscribe {
                signal: self.signal,
                source: e,
            })?;
        self.state.send_replace(WatcherState::Listening);

        let handle = WatcherHandle {
            kind: self.kind,
            signal: self.signal,
            path: self.path.clone(),
            state: self.state.subscribe(),
        };
        tracker.spawn(self.listen(subscription));
        Ok(handle)
    }

    async fn listen(self, mut subscription: SignalSubscription) {
        tracing::info!(
            kind = %self.kind,
            signal = %self.signal,
            path = %self.path.display(),
            "watching for profile signal"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                delivered = subscription.recv() => {
                    if delivered.is_none() {
                        tracing::warn!(kind = %self.kind, "signal stream closed, stopping watcher");
                        break;
                    }
                    self.dump().await;
                }
            }
        }

        drop(subscription);
        self.state.send_replace(WatcherState::Stopped);
        tracing::debug!(kind = %self.kind, "watcher stopped");
    }

    async fn dump(&self) {
        tracing::debug!(kind = %self.kind, signal = %self.signal, "profile signal received");
        match self
            .generator
            .generate(self.kind, &self.path, self.window, &self.scope)
            .await
        {
            Ok(dump) => tracing::info!(
                kind = %self.kind,
                path = %self.path.display(),
                bytes = dump.bytes,
                elapsed_ms = dump.elapsed.as_millis() as u64,
                cut_short = dump.cut_short,
                "profile written"
            ),
            Err(e) => tracing::warn!(
                kind = %self.kind,
                error = %e,
                "profile failed"
            ),
        }
    }
}

/// Observer for a running watcher.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    kind: ProfileKind,
    signal: TriggerSignal,
    path: PathBuf,
    state: watch::Receiver<WatcherState>,
}

impl WatcherHandle {
    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn signal(&self) -> TriggerSignal {
        self.signal
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Resolves once the watcher has reached `Stopped`.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // Err means the watcher task is gone, which is also terminal
        let _ = state.wait_for(|s| *s == WatcherState::Stopped).await;
    }
}
