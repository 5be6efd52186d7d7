/// Error types for configuration, profile generation, and watcher startup.
use crate::profile::ProfileKind;
use crate::signals::{InvalidSignal, TriggerSignal};
use std::path::PathBuf;

/// Errors raised while resolving [`Settings`](crate::config::Settings).
///
/// All of these abort startup: no watcher subscribes with a bad configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A `*_PROFILER_SIGNAL` value is unparseable or outside the platform range.
    InvalidSignal { key: String, source: InvalidSignal },
    /// A `*_PROFILE_DURATION` value is not a duration.
    InvalidDuration { key: String, value: String },
    /// A numeric setting is not a positive integer.
    InvalidNumber { key: String, value: String },
    /// The working directory could not be determined.
    CurrentDir { source: std::io::Error },
    /// The configuration file could not be read.
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML.
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidSignal { key, source } => write!(f, "{key}: {source}"),
            ConfigError::InvalidDuration { key, value } => {
                write!(f, "{key}: invalid duration {value:?}")
            }
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "{key}: invalid number {value:?}")
            }
            ConfigError::CurrentDir { source } => {
                write!(f, "unable to determine working directory: {source}")
            }
            ConfigError::ReadFile { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::ParseFile { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidSignal { source, .. } => Some(source),
            ConfigError::CurrentDir { source } => Some(source),
            ConfigError::ReadFile { source, .. } => Some(source),
            ConfigError::ParseFile { source, .. } => Some(source),
            ConfigError::InvalidDuration { .. } | ConfigError::InvalidNumber { .. } => None,
        }
    }
}

/// Errors from a single profile dump. The watcher logs these and keeps listening.
#[derive(Debug)]
pub enum ProfileError {
    /// No writer is registered for this kind.
    Unavailable { kind: ProfileKind },
    /// The output file could not be created, written, or flushed.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A windowed collection of this kind is already running in the process.
    AlreadyActive { kind: ProfileKind },
    /// The writer failed to collect or encode its data.
    Collect { kind: ProfileKind, message: String },
}

impl ProfileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProfileError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn collect(kind: ProfileKind, message: impl std::fmt::Display) -> Self {
        ProfileError::Collect {
            kind,
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileError::Unavailable { kind } => {
                write!(f, "could not create {kind:?} profile, no such profiler exists")
            }
            ProfileError::Io { path, source } => {
                write!(f, "failed to write profile {}: {}", path.display(), source)
            }
            ProfileError::AlreadyActive { kind } => {
                write!(f, "{kind} profiling is already active")
            }
            ProfileError::Collect { kind, message } => {
                write!(f, "failed to collect {kind} profile: {message}")
            }
        }
    }
}

impl std::error::Error for ProfileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProfileError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors from starting a watcher.
#[derive(Debug)]
pub enum WatchError {
    /// The OS refused the signal subscription.
    Subscribe {
        signal: TriggerSignal,
        source: std::io::Error,
    },
    /// A watcher for this kind is already running under the same coordinator.
    AlreadyWatching { kind: ProfileKind },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Subscribe { signal, source } => {
                write!(f, "failed to subscribe to {signal}: {source}")
            }
            WatchError::AlreadyWatching { kind } => {
                write!(f, "a {kind} watcher is already running")
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Subscribe { source, .. } => Some(source),
            WatchError::AlreadyWatching { .. } => None,
        }
    }
}
