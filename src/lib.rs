//! Signal-triggered runtime profile dumps.
//!
//! A long-running process registers one watcher per profile kind. Sending the
//! kind's trigger signal writes a fresh dump to a fixed file in the configured
//! directory, overwriting the previous one. Snapshot kinds (heap, goroutine,
//! allocs, threadcreate, block, mutex) are written immediately; cpu and trace
//! collect over a window first. Everything is configured through environment
//! variables, see [`config`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod generator;
pub mod profile;
pub mod runtime;
pub mod signals;
pub mod watcher;

pub use config::{ProfileSettings, Settings};
pub use coordinator::{watch, Profiler};
pub use error::{ConfigError, ProfileError, WatchError};
pub use generator::{Dump, Generator};
pub use profile::ProfileKind;
pub use runtime::alloc::TrackingAllocator;
pub use runtime::contention::{lock_mutex, record_block, record_mutex, BlockTimer};
pub use runtime::trace::TraceRecorder;
pub use runtime::ProfileRegistry;
pub use signals::{InvalidSignal, TriggerSignal};
pub use watcher::{WatcherHandle, WatcherState};
