use crate::error::ConfigError;
use crate::profile::ProfileKind;
use crate::signals::{self, TriggerSignal};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Output directory for every profile file.
pub const PROFILE_DIRECTORY: &str = "PROFILE_DIRECTORY";
/// Sampling frequency of the CPU profiler, in Hz.
pub const CPU_PROFILE_FREQUENCY: &str = "CPU_PROFILE_FREQUENCY";
pub const DEFAULT_CPU_FREQUENCY: i32 = 99;
/// Average bytes between sampled allocations; `0` turns sampling off.
pub const MEMORY_PROFILE_RATE: &str = "MEMORY_PROFILE_RATE";

static DURATION_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:\d+(?:\.\d*)?|\.\d+)(?:ns|us|µs|ms|s|m|h))+$").unwrap()
});
static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").unwrap());

/// Resolved settings for one profile kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSettings {
    pub kind: ProfileKind,
    /// File name inside [`Settings::directory`].
    pub file_name: String,
    /// Signal that triggers a dump of this kind.
    pub signal: TriggerSignal,
    /// Collection window; only set for windowed kinds.
    #[serde(serialize_with = "serialize_window")]
    pub window: Option<Duration>,
}

impl ProfileSettings {
    fn defaults(kind: ProfileKind) -> Self {
        Self {
            kind,
            file_name: kind.default_file_name(),
            signal: signals::user_signal_1(),
            window: kind.default_window(),
        }
    }
}

/// Resolved profiler configuration.
///
/// Built once at startup and shared read-only (behind an `Arc`) by every watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Absolute output directory.
    pub directory: PathBuf,
    pub cpu_frequency: i32,
    pub memory_profile_rate: usize,
    profiles: [ProfileSettings; 8],
}

impl Settings {
    /// Default settings writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cpu_frequency: DEFAULT_CPU_FREQUENCY,
            memory_profile_rate: crate::runtime::stacks::DEFAULT_SAMPLE_RATE,
            profiles: ProfileKind::ALL.map(ProfileSettings::defaults),
        }
    }

    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings with an optional TOML file underneath the environment.
    ///
    /// The file's top-level keys use the environment variable names. Values
    /// from the environment win over the file; both win over the defaults.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file_values = match config_file {
            Some(path) => read_config_file(path)?,
            None => BTreeMap::new(),
        };
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_values.get(key).cloned())
        })
    }

    /// Resolve settings from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cwd = std::env::current_dir().map_err(|e| ConfigError::CurrentDir { source: e })?;
        let directory = match get(PROFILE_DIRECTORY) {
            Some(dir) => cwd.join(dir.trim()),
            None => cwd,
        };
        let mut settings = Settings::new(directory);

        if let Some(value) = get(CPU_PROFILE_FREQUENCY) {
            settings.cpu_frequency = value
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|hz| *hz > 0)
                .ok_or_else(|| ConfigError::InvalidNumber {
                    key: CPU_PROFILE_FREQUENCY.to_string(),
                    value: value.clone(),
                })?;
        }

        if let Some(value) = get(MEMORY_PROFILE_RATE) {
            settings.memory_profile_rate =
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidNumber {
                        key: MEMORY_PROFILE_RATE.to_string(),
                        value: value.clone(),
                    })?;
        }

        for kind in ProfileKind::ALL {
            let prefix = kind.env_prefix();
            let profile = settings.profile_mut(kind);

            if let Some(name) = get(&format!("{prefix}_PROFILE_NAME")) {
                profile.file_name = name.trim().to_string();
            }

            let key = format!("{prefix}_PROFILER_SIGNAL");
            if let Some(value) = get(&key) {
                profile.signal =
                    signals::decode(&value).map_err(|e| ConfigError::InvalidSignal {
                        key: key.clone(),
                        source: e,
                    })?;
            }

            if kind.is_windowed() {
                let key = format!("{prefix}_PROFILE_DURATION");
                if let Some(value) = get(&key) {
                    let window = parse_duration(&value)
                        .ok_or_else(|| ConfigError::InvalidDuration { key, value })?;
                    profile.window = Some(window);
                }
            }
        }

        Ok(settings)
    }

    pub fn profile(&self, kind: ProfileKind) -> &ProfileSettings {
        &self.profiles[kind.index()]
    }

    pub fn profile_mut(&mut self, kind: ProfileKind) -> &mut ProfileSettings {
        &mut self.profiles[kind.index()]
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ProfileSettings> {
        self.profiles.iter()
    }

    /// Full path of `kind`'s output file: `{directory}/{file_name}`.
    pub fn output_path(&self, kind: ProfileKind) -> PathBuf {
        self.directory.join(&self.profile(kind).file_name)
    }

    /// Collection window for `kind`, falling back to the kind's default.
    pub fn window(&self, kind: ProfileKind) -> Duration {
        self.profile(kind)
            .window
            .or(kind.default_window())
            .unwrap_or_default()
    }

    /// Kinds grouped by trigger signal, for every signal shared by more than one kind.
    pub fn shared_signals(&self, kinds: &[ProfileKind]) -> Vec<(TriggerSignal, Vec<ProfileKind>)> {
        let mut by_signal: BTreeMap<TriggerSignal, Vec<ProfileKind>> = BTreeMap::new();
        for &kind in kinds {
            by_signal
                .entry(self.profile(kind).signal)
                .or_default()
                .push(kind);
        }
        by_signal
            .into_iter()
            .filter(|(_, kinds)| kinds.len() > 1)
            .collect()
    }
}

fn read_config_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let table: toml::Table = toml::from_str(&text).map_err(|e| ConfigError::ParseFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Parse durations like `30s`, `250ms`, `1m30s` or `1.5h`. A bare `0` is allowed.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value == "0" {
        return Some(Duration::ZERO);
    }
    if !DURATION_FORMAT.is_match(value) {
        return None;
    }
    let mut nanos = 0f64;
    for caps in DURATION_PART.captures_iter(value) {
        let amount: f64 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        nanos += amount * unit;
    }
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

/// Render a duration the way [`parse_duration`] reads it back.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

fn serialize_window<S: Serializer>(window: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match window {
        Some(d) => s.serialize_some(&format_duration(*d)),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.directory, std::env::current_dir().unwrap());
        assert!(settings.directory.is_absolute());
        assert_eq!(settings.cpu_frequency, 99);
        for kind in ProfileKind::ALL {
            let profile = settings.profile(kind);
            assert_eq!(profile.kind, kind);
            assert_eq!(profile.file_name, format!("{}.profile", kind.name()));
            assert_eq!(profile.signal, signals::user_signal_1());
        }
        assert_eq!(settings.window(ProfileKind::Cpu), Duration::from_secs(30));
        assert_eq!(settings.window(ProfileKind::Trace), Duration::from_secs(1));
        assert_eq!(settings.profile(ProfileKind::Heap).window, None);
    }

    #[test]
    fn test_nonnumeric_signal_fails() {
        let err = Settings::from_lookup(lookup(&[("HEAP_PROFILER_SIGNAL", "fifty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSignal { ref key, .. } if key == "HEAP_PROFILER_SIGNAL"));
    }

    #[test]
    fn test_unknown_symbolic_signal_fails() {
        let err = Settings::from_lookup(lookup(&[("HEAP_PROFILER_SIGNAL", "owl")])).unwrap_err();
        match err {
            ConfigError::InvalidSignal { key, source } => {
                assert_eq!(key, "HEAP_PROFILER_SIGNAL");
                assert_eq!(source.value, "owl");
            }
            other => panic!("expected InvalidSignal, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_string_signal() {
        let settings =
            Settings::from_lookup(lookup(&[("HEAP_PROFILER_SIGNAL", "SIGUSR2")])).unwrap();
        assert_eq!(
            settings.profile(ProfileKind::Heap).signal.number(),
            signals::SIGUSR2
        );
        // other kinds keep the default
        assert_eq!(
            settings.profile(ProfileKind::Goroutine).signal,
            signals::user_signal_1()
        );
    }

    #[test]
    fn test_valid_numeric_signal() {
        let value = signals::SIGUSR2.to_string();
        let settings =
            Settings::from_lookup(lookup(&[("MUTEX_PROFILER_SIGNAL", value.as_str())])).unwrap();
        assert_eq!(
            settings.profile(ProfileKind::Mutex).signal.number(),
            signals::SIGUSR2
        );
    }

    #[test]
    fn test_out_of_range_signal_fails() {
        let err = Settings::from_lookup(lookup(&[("CPU_PROFILER_SIGNAL", "90")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSignal { .. }));
    }

    #[test]
    fn test_directory_and_names() {
        let settings = Settings::from_lookup(lookup(&[
            ("PROFILE_DIRECTORY", "/tmp/t"),
            ("HEAP_PROFILE_NAME", "live.heap"),
            ("THREADCREATE_PROFILE_NAME", "threads.txt"),
        ]))
        .unwrap();
        assert_eq!(settings.directory, PathBuf::from("/tmp/t"));
        assert_eq!(
            settings.output_path(ProfileKind::Heap),
            PathBuf::from("/tmp/t/live.heap")
        );
        assert_eq!(
            settings.output_path(ProfileKind::ThreadCreate),
            PathBuf::from("/tmp/t/threads.txt")
        );
        assert_eq!(
            settings.output_path(ProfileKind::Block),
            PathBuf::from("/tmp/t/block.profile")
        );
    }

    #[test]
    fn test_relative_directory_resolved_against_cwd() {
        let settings = Settings::from_lookup(lookup(&[("PROFILE_DIRECTORY", "out")])).unwrap();
        assert_eq!(
            settings.directory,
            std::env::current_dir().unwrap().join("out")
        );
    }

    #[test]
    fn test_empty_values_are_unset() {
        let settings = Settings::from_lookup(lookup(&[
            ("PROFILE_DIRECTORY", ""),
            ("HEAP_PROFILER_SIGNAL", "  "),
        ]))
        .unwrap();
        assert_eq!(settings.directory, std::env::current_dir().unwrap());
        assert_eq!(
            settings.profile(ProfileKind::Heap).signal,
            signals::user_signal_1()
        );
    }

    #[test]
    fn test_durations() {
        let settings = Settings::from_lookup(lookup(&[
            ("CPU_PROFILE_DURATION", "1m30s"),
            ("TRACE_PROFILE_DURATION", "250ms"),
        ]))
        .unwrap();
        assert_eq!(settings.window(ProfileKind::Cpu), Duration::from_secs(90));
        assert_eq!(
            settings.window(ProfileKind::Trace),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_invalid_duration_fails() {
        let err =
            Settings::from_lookup(lookup(&[("TRACE_PROFILE_DURATION", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
    }

    #[test]
    fn test_duration_ignored_for_snapshot_kinds() {
        let settings =
            Settings::from_lookup(lookup(&[("HEAP_PROFILE_DURATION", "nonsense")])).unwrap();
        assert_eq!(settings.profile(ProfileKind::Heap).window, None);
    }

    #[test]
    fn test_cpu_frequency() {
        let settings = Settings::from_lookup(lookup(&[("CPU_PROFILE_FREQUENCY", "250")])).unwrap();
        assert_eq!(settings.cpu_frequency, 250);
        for bad in ["0", "-5", "fast"] {
            let err =
                Settings::from_lookup(lookup(&[("CPU_PROFILE_FREQUENCY", bad)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidNumber { .. }), "{bad}");
        }
    }

    #[test]
    fn test_memory_profile_rate() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.memory_profile_rate, 512 * 1024);
        let settings = Settings::from_lookup(lookup(&[("MEMORY_PROFILE_RATE", "0")])).unwrap();
        assert_eq!(settings.memory_profile_rate, 0);
        let err = Settings::from_lookup(lookup(&[("MEMORY_PROFILE_RATE", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("10us"), Some(Duration::from_micros(10)));
        assert_eq!(parse_duration("10µs"), Some(Duration::from_micros(10)));
        assert_eq!(parse_duration("7ns"), Some(Duration::from_nanos(7)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_format_duration_round_trips_defaults() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(
            parse_duration(&format_duration(Duration::from_nanos(1_500))),
            Some(Duration::from_nanos(1_500))
        );
    }

    #[test]
    fn test_shared_signals_groups_default_kinds() {
        let mut settings = Settings::new("/tmp");
        settings.profile_mut(ProfileKind::Cpu).signal = signals::validate(signals::SIGUSR2).unwrap();
        let shared = settings.shared_signals(&[
            ProfileKind::Heap,
            ProfileKind::Mutex,
            ProfileKind::Cpu,
        ]);
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].0, signals::user_signal_1());
        assert_eq!(shared[0].1, vec![ProfileKind::Heap, ProfileKind::Mutex]);
    }

    #[test]
    fn test_load_file_under_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        std::fs::write(
            &path,
            "PROFILE_DIRECTORY = \"/var/tmp/profiles\"\n\
             SIGDUMP_TEST_ONLY_KEY = 1\n\
             TRACE_PROFILE_DURATION = \"5s\"\n\
             CPU_PROFILE_FREQUENCY = 500\n",
        )
        .unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.window(ProfileKind::Trace), Duration::from_secs(5));
        assert_eq!(settings.cpu_frequency, 500);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load(Some(Path::new("/nonexistent/profiles.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "PROFILE_DIRECTORY = ").unwrap();
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFile { .. }));
    }

    #[test]
    fn test_settings_serialize_for_dry_run() {
        let settings = Settings::new("/tmp/t");
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["directory"], "/tmp/t");
        assert_eq!(json["profiles"][6]["kind"], "cpu");
        assert_eq!(json["profiles"][6]["window"], "30s");
        assert!(json["profiles"][0]["window"].is_null());
    }
}
