//! Runtime profile writers: the capability that produces profile bytes for a
//! kind into a sink.
//!
//! Writers come in two shapes. A [`SnapshotProfile`] writes the current state
//! immediately. A [`WindowedProfile`] starts collecting, and the returned
//! [`ActiveWindow`] writes everything gathered once the window is finished.
//! The [`ProfileRegistry`] maps each [`ProfileKind`] to its writer; a kind with
//! no entry is reported as unavailable.

pub mod alloc;
pub mod contention;
pub mod cpu;
pub mod stacks;
pub mod tasks;
pub mod threads;
pub mod trace;

use crate::config::Settings;
use crate::profile::ProfileKind;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Failure inside a writer. The generator attaches kind and path.
#[derive(Debug)]
pub enum CollectError {
    Io(std::io::Error),
    /// Another collection of the same kind is running in this process.
    AlreadyActive,
    Failed(String),
}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        CollectError::Io(e)
    }
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Io(e) => write!(f, "{e}"),
            CollectError::AlreadyActive => f.write_str("collection already active"),
            CollectError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for CollectError {}

/// A profile that reflects runtime state at the instant it is written.
pub trait SnapshotProfile: Send + Sync {
    /// Settle runtime state before the snapshot is taken.
    fn prepare(&self) {}

    fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError>;
}

/// A profile accumulated over a time window.
pub trait WindowedProfile: Send + Sync {
    /// Begin collecting. Fails with [`CollectError::AlreadyActive`] when a
    /// collection of this kind is already running.
    fn start(&self) -> Result<Box<dyn ActiveWindow>, CollectError>;
}

/// A running windowed collection. Dropping it stops collection without output.
pub trait ActiveWindow: Send {
    /// Stop collecting and write the finished profile to `out`.
    fn finish(self: Box<Self>, out: &mut dyn Write) -> Result<(), CollectError>;
}

#[derive(Clone)]
pub enum ProfileSource {
    Snapshot(Arc<dyn SnapshotProfile>),
    Windowed(Arc<dyn WindowedProfile>),
}

/// Explicit mapping from profile kind to writer.
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    sources: HashMap<ProfileKind, ProfileSource>,
}

impl ProfileRegistry {
    /// A registry with no writers; every kind is unavailable.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The writers shipped with this crate.
    ///
    /// `threadcreate` is only registered where the OS exposes per-thread data.
    /// Also applies the configured allocation sample rate.
    pub fn builtin(settings: &Settings) -> Self {
        stacks::set_sample_rate(settings.memory_profile_rate);
        let registry = Self::empty()
            .with_snapshot(ProfileKind::Heap, alloc::HeapProfile)
            .with_snapshot(ProfileKind::Allocs, alloc::AllocsProfile)
            .with_snapshot(ProfileKind::Goroutine, tasks::TaskProfile)
            .with_snapshot(
                ProfileKind::Block,
                contention::ContentionProfile::block(),
            )
            .with_snapshot(
                ProfileKind::Mutex,
                contention::ContentionProfile::mutex(),
            )
            .with_windowed(
                ProfileKind::Cpu,
                cpu::CpuProfile::new(settings.cpu_frequency),
            )
            .with_windowed(ProfileKind::Trace, trace::TraceRecorder::global().clone());

        if threads::supported() {
            registry.with_snapshot(ProfileKind::ThreadCreate, threads::ThreadProfile)
        } else {
            registry
        }
    }

    pub fn with_snapshot(
        mut self,
        kind: ProfileKind,
        profile: impl SnapshotProfile + 'static,
    ) -> Self {
        self.sources
            .insert(kind, ProfileSource::Snapshot(Arc::new(profile)));
        self
    }

    pub fn with_windowed(
        mut self,
        kind: ProfileKind,
        profile: impl WindowedProfile + 'static,
    ) -> Self {
        self.sources
            .insert(kind, ProfileSource::Windowed(Arc::new(profile)));
        self
    }

    pub fn get(&self, kind: ProfileKind) -> Option<&ProfileSource> {
        self.sources.get(&kind)
    }

    pub fn contains(&self, kind: ProfileKind) -> bool {
        self.sources.contains_key(&kind)
    }
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.sources.keys().collect();
        kinds.sort();
        f.debug_struct("ProfileRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_has_nothing() {
        let registry = ProfileRegistry::empty();
        for kind in ProfileKind::ALL {
            assert!(registry.get(kind).is_none());
        }
    }

    #[test]
    fn test_builtin_registry_shapes() {
        let registry = ProfileRegistry::builtin(&Settings::new("/tmp"));
        for kind in ProfileKind::ALL {
            match registry.get(kind) {
                Some(ProfileSource::Windowed(_)) => assert!(kind.is_windowed(), "{kind}"),
                Some(ProfileSource::Snapshot(_)) => assert!(!kind.is_windowed(), "{kind}"),
                None => assert_eq!(kind, ProfileKind::ThreadCreate),
            }
        }
        assert_eq!(
            registry.contains(ProfileKind::ThreadCreate),
            threads::supported()
        );
    }

    #[test]
    fn test_debug_lists_kinds_in_order() {
        let registry = ProfileRegistry::empty()
            .with_snapshot(ProfileKind::Mutex, contention::ContentionProfile::mutex())
            .with_snapshot(ProfileKind::Heap, alloc::HeapProfile);
        assert_eq!(
            format!("{registry:?}"),
            "ProfileRegistry { kinds: [Heap, Mutex] }"
        );
    }
}
