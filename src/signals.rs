/// Trigger-signal registry: decode and validate the signals that request a dump.
///
/// Accepts either a number or a symbolic name (`SIGUSR1`, `usr2`, and on Linux
/// `SIGRTMIN+3`). Only the user signals (plus the real-time band on Linux) are
/// legal, so a misconfigured trigger can never collide with SIGTERM and friends.
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tokio::signal::unix::SignalKind;

pub const SIGUSR1: i32 = libc::SIGUSR1;
pub const SIGUSR2: i32 = libc::SIGUSR2;

/// First usable real-time signal. glibc keeps 32 and 33 for itself.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SIGRTMIN: i32 = 34;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SIGRTMAX: i32 = 64;

static REALTIME_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:SIG)?RTM(IN|AX)(?:([+-])(\d{1,2}))?$").expect("valid realtime regex")
});

/// Why a signal value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSignal {
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal value {:?} not supported: {}", self.value, self.reason)
    }
}

impl std::error::Error for InvalidSignal {}

/// A validated trigger signal number for this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerSignal(i32);

impl TriggerSignal {
    pub fn number(self) -> i32 {
        self.0
    }

    pub fn kind(self) -> SignalKind {
        SignalKind::from_raw(self.0)
    }

    fn name(self) -> Option<String> {
        match self.0 {
            SIGUSR1 => return Some("SIGUSR1".to_string()),
            SIGUSR2 => return Some("SIGUSR2".to_string()),
            _ => {}
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if (SIGRTMIN..=SIGRTMAX).contains(&self.0) {
            return Some(match self.0 - SIGRTMIN {
                0 => "SIGRTMIN".to_string(),
                offset => format!("SIGRTMIN+{offset}"),
            });
        }
        None
    }
}

impl fmt::Display for TriggerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "signal {}", self.0),
        }
    }
}

impl FromStr for TriggerSignal {
    type Err = InvalidSignal;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

impl Serialize for TriggerSignal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.0)
    }
}

/// The platform's first user-defined signal; the default trigger for every kind.
pub fn user_signal_1() -> TriggerSignal {
    TriggerSignal(SIGUSR1)
}

/// Decode a configured signal. Numbers are range-checked; anything that does
/// not parse as a number is looked up by name.
pub fn decode(raw: &str) -> Result<TriggerSignal, InvalidSignal> {
    let raw = raw.trim();
    match raw.parse::<i32>() {
        Ok(number) => validate(number).map_err(|e| InvalidSignal {
            value: raw.to_string(),
            ..e
        }),
        Err(_) => lookup(raw),
    }
}

/// Check that `number` is a legal trigger on this platform.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn validate(number: i32) -> Result<TriggerSignal, InvalidSignal> {
    match number {
        SIGUSR1 | SIGUSR2 => Ok(TriggerSignal(number)),
        n if (SIGRTMIN..=SIGRTMAX).contains(&n) => Ok(TriggerSignal(n)),
        _ => Err(InvalidSignal {
            value: number.to_string(),
            reason: "only SIGUSR1, SIGUSR2 and SIGRTMIN..SIGRTMAX are usable on linux",
        }),
    }
}

/// Check that `number` is a legal trigger on this platform.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn validate(number: i32) -> Result<TriggerSignal, InvalidSignal> {
    match number {
        SIGUSR1 | SIGUSR2 => Ok(TriggerSignal(number)),
        _ => Err(InvalidSignal {
            value: number.to_string(),
            reason: "only SIGUSR1 and SIGUSR2 are usable on this platform",
        }),
    }
}

fn lookup(name: &str) -> Result<TriggerSignal, InvalidSignal> {
    let unknown = || InvalidSignal {
        value: name.to_string(),
        reason: "unknown signal name",
    };
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "USR1" => return Ok(TriggerSignal(SIGUSR1)),
        "USR2" => return Ok(TriggerSignal(SIGUSR2)),
        _ => {}
    }

    let caps = REALTIME_NAME.captures(name).ok_or_else(unknown)?;
    let number = realtime_number(&caps).ok_or_else(unknown)?;
    validate(number).map_err(|e| InvalidSignal {
        value: name.to_string(),
        ..e
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn realtime_number(caps: &regex::Captures<'_>) -> Option<i32> {
    let base = if caps[1].eq_ignore_ascii_case("IN") {
        SIGRTMIN
    } else {
        SIGRTMAX
    };
    let offset: i32 = match caps.get(3) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    match caps.get(2).map(|m| m.as_str()) {
        Some("-") => Some(base - offset),
        _ => Some(base + offset),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn realtime_number(_caps: &regex::Captures<'_>) -> Option<i32> {
    None
}
