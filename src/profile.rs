use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The fixed set of runtime profiles that can be dumped on signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Live heap: bytes and objects still allocated.
    Heap,
    /// Tasks of the async runtime. Keeps the `goroutine` name for config compatibility.
    Goroutine,
    /// Cumulative allocations since start.
    Allocs,
    /// OS threads created by the process.
    #[serde(rename = "threadcreate")]
    ThreadCreate,
    /// Sites that blocked waiting on synchronization.
    Block,
    /// Sites that waited on contended mutexes.
    Mutex,
    /// Sampled CPU stacks over a window.
    Cpu,
    /// Execution trace (spans and events) over a window.
    Trace,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 8] = [
        ProfileKind::Heap,
        ProfileKind::Goroutine,
        ProfileKind::Allocs,
        ProfileKind::ThreadCreate,
        ProfileKind::Block,
        ProfileKind::Mutex,
        ProfileKind::Cpu,
        ProfileKind::Trace,
    ];

    /// Canonical lower-case name, as used in file names and logs.
    pub fn name(self) -> &'static str {
        match self {
            ProfileKind::Heap => "heap",
            ProfileKind::Goroutine => "goroutine",
            ProfileKind::Allocs => "allocs",
            ProfileKind::ThreadCreate => "threadcreate",
            ProfileKind::Block => "block",
            ProfileKind::Mutex => "mutex",
            ProfileKind::Cpu => "cpu",
            ProfileKind::Trace => "trace",
        }
    }

    /// Prefix of this kind's environment variables (`HEAP_PROFILE_NAME`, ...).
    pub fn env_prefix(self) -> &'static str {
        match self {
            ProfileKind::Heap => "HEAP",
            ProfileKind::Goroutine => "GOROUTINE",
            ProfileKind::Allocs => "ALLOCS",
            ProfileKind::ThreadCreate => "THREADCREATE",
            ProfileKind::Block => "BLOCK",
            ProfileKind::Mutex => "MUTEX",
            ProfileKind::Cpu => "CPU",
            ProfileKind::Trace => "TRACE",
        }
    }

    pub fn default_file_name(self) -> String {
        format!("{}.profile", self.name())
    }

    /// Windowed kinds collect continuously for a duration instead of taking a snapshot.
    pub fn is_windowed(self) -> bool {
        matches!(self, ProfileKind::Cpu | ProfileKind::Trace)
    }

    /// Default collection window for windowed kinds.
    pub fn default_window(self) -> Option<Duration> {
        match self {
            ProfileKind::Cpu => Some(Duration::from_secs(30)),
            ProfileKind::Trace => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string names no profile kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProfileKind(pub String);

impl fmt::Display for UnknownProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown profile kind {:?}", self.0)
    }
}

impl std::error::Error for UnknownProfileKind {}

impl FromStr for ProfileKind {
    type Err = UnknownProfileKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        // "allocations" and "thread-create" are accepted spellings too
        let wanted = match wanted.as_str() {
            "allocations" => "allocs",
            "thread-create" | "thread_create" | "threads" => "threadcreate",
            "tasks" => "goroutine",
            other => other,
        };
        ProfileKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| UnknownProfileKind(s.to_string()))
    }
}
