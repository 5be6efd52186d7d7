//! Block and mutex contention tables.
//!
//! Application code reports waits by site name, either directly with
//! [`record_block`] / [`record_mutex`], or by going through [`lock_mutex`]
//! and [`BlockTimer`]. The profiles list sites by total time waited.

use super::{CollectError, SnapshotProfile};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{LockResult, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

static BLOCK: ContentionTable = ContentionTable::new();
static MUTEX: ContentionTable = ContentionTable::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

/// Wait statistics keyed by call site.
#[derive(Debug)]
pub struct ContentionTable {
    sites: Mutex<BTreeMap<&'static str, SiteStats>>,
}

impl ContentionTable {
    pub const fn new() -> Self {
        Self {
            sites: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, site: &'static str, wait: Duration) {
        let mut sites = self.sites.lock().unwrap_or_else(|e| e.into_inner());
        let stats = sites.entry(site).or_default();
        stats.count += 1;
        stats.total += wait;
        stats.max = stats.max.max(wait);
    }

    /// Sites ordered by total wait, longest first.
    pub fn snapshot(&self) -> Vec<(&'static str, SiteStats)> {
        let sites = self.sites.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<_> = sites.iter().map(|(site, s)| (*site, *s)).collect();
        rows.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(b.0)));
        rows
    }
}

impl Default for ContentionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Record time spent blocked on a synchronization primitive.
pub fn record_block(site: &'static str, wait: Duration) {
    BLOCK.record(site, wait);
}

/// Record time spent waiting for a contended mutex.
pub fn record_mutex(site: &'static str, wait: Duration) {
    MUTEX.record(site, wait);
}

/// Lock `mutex`, recording the wait under `site` when the lock was contended.
pub fn lock_mutex<'a, T>(site: &'static str, mutex: &'a Mutex<T>) -> LockResult<MutexGuard<'a, T>> {
    match mutex.try_lock() {
        Ok(guard) => return Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => return Err(poisoned),
        Err(TryLockError::WouldBlock) => {}
    }
    let started = Instant::now();
    let result = mutex.lock();
    record_mutex(site, started.elapsed());
    result
}

/// Records the time between creation and drop as a block event.
#[derive(Debug)]
pub struct BlockTimer {
    site: &'static str,
    started: Instant,
}

impl BlockTimer {
    pub fn start(site: &'static str) -> Self {
        Self {
            site,
            started: Instant::now(),
        }
    }
}

impl Drop for BlockTimer {
    fn drop(&mut self) {
        record_block(self.site, self.started.elapsed());
    }
}

/// Snapshot writer over one contention table.
#[derive(Debug, Clone, Copy)]
pub struct ContentionProfile {
    name: &'static str,
    table: &'static ContentionTable,
}

impl ContentionProfile {
    pub fn block() -> Self {
        Self {
            name: "block",
            table: &BLOCK,
        }
    }

    pub fn mutex() -> Self {
        Self {
            name: "mutex",
            table: &MUTEX,
        }
    }

    pub fn new(name: &'static str, table: &'static ContentionTable) -> Self {
        Self { name, table }
    }
}

impl SnapshotProfile for ContentionProfile {
    fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError> {
        let rows = self.table.snapshot();
        let events: u64 = rows.iter().map(|(_, s)| s.count).sum();
        let total: Duration = rows.iter().map(|(_, s)| s.total).sum();
        writeln!(
            out,
            "{} profile: {} sites, {} events, {} ns",
            self.name,
            rows.len(),
            events,
            total.as_nanos()
        )?;
        writeln!(out, "# total_ns count max_ns @ site")?;
        for (site, stats) in rows {
            writeln!(
                out,
                "{} {} {} @ {}",
                stats.total.as_nanos(),
                stats.count,
                stats.max.as_nanos(),
                site
            )?;
        }
        Ok(())
    }
}
