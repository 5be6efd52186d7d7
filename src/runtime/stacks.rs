//! Sampled allocation sites for the heap and allocs profiles.
//!
//! [`TrackingAllocator`](super::alloc::TrackingAllocator) reports every
//! allocation here. Roughly one allocation per [`sample_rate`] bytes has its
//! call stack captured; sampled blocks are tracked until freed, so each stack
//! carries both cumulative and live totals. Frames are stored as raw
//! instruction pointers and only symbolized when a profile is written.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Average bytes between samples, matching Go's `runtime.MemProfileRate`.
pub const DEFAULT_SAMPLE_RATE: usize = 512 * 1024;
const MAX_FRAMES: usize = 32;

static SAMPLE_RATE: AtomicUsize = AtomicUsize::new(DEFAULT_SAMPLE_RATE);
static LIVE_SAMPLES: AtomicUsize = AtomicUsize::new(0);
static SITES: Mutex<StackTable> = Mutex::new(StackTable::new());

thread_local! {
    // Set while this thread is inside the sampler; allocations made by the
    // sampler itself are counted but never sampled.
    static IN_SAMPLER: Cell<bool> = const { Cell::new(false) };
    static UNTIL_SAMPLE: Cell<usize> = const { Cell::new(0) };
}

/// Set the average number of allocated bytes between samples. `0` disables sampling.
pub fn set_sample_rate(bytes: usize) {
    SAMPLE_RATE.store(bytes, Ordering::Relaxed);
}

pub fn sample_rate() -> usize {
    SAMPLE_RATE.load(Ordering::Relaxed)
}

/// Allocation totals for one call stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSite {
    /// Instruction pointers, innermost first.
    pub frames: Box<[usize]>,
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    pub free_objects: u64,
    pub free_bytes: u64,
}

impl StackSite {
    pub fn live_objects(&self) -> u64 {
        self.alloc_objects.saturating_sub(self.free_objects)
    }

    pub fn live_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }
}

struct StackTable {
    ids: BTreeMap<Box<[usize]>, usize>,
    sites: Vec<StackSite>,
    /// Sampled blocks still allocated: address to (site index, size).
    live: BTreeMap<usize, (usize, u64)>,
}

impl StackTable {
    const fn new() -> Self {
        Self {
            ids: BTreeMap::new(),
            sites: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    fn record_alloc(&mut self, addr: usize, size: u64, frames: Box<[usize]>) {
        let id = match self.ids.get(&frames) {
            Some(&id) => id,
            None => {
                let id = self.sites.len();
                self.sites.push(StackSite {
                    frames: frames.clone(),
                    ..StackSite::default()
                });
                self.ids.insert(frames, id);
                id
            }
        };
        let site = &mut self.sites[id];
        site.alloc_objects += 1;
        site.alloc_bytes += size;
        if self.live.insert(addr, (id, size)).is_none() {
            LIVE_SAMPLES.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_free(&mut self, addr: usize) {
        if let Some((id, size)) = self.live.remove(&addr) {
            let site = &mut self.sites[id];
            site.free_objects += 1;
            site.free_bytes += size;
            LIVE_SAMPLES.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn lock() -> MutexGuard<'static, StackTable> {
    SITES.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `f` with sampling suspended on this thread. `None` if the thread is
/// already inside the sampler.
fn suspended<R>(f: impl FnOnce() -> R) -> Option<R> {
    IN_SAMPLER
        .try_with(|busy| {
            if busy.replace(true) {
                return None;
            }
            let result = f();
            busy.set(false);
            Some(result)
        })
        .ok()
        .flatten()
}

fn sample_due(size: usize, rate: usize) -> bool {
    UNTIL_SAMPLE
        .try_with(|until| {
            let left = match until.get() {
                0 => rate,
                n => n,
            };
            if size < left {
                until.set(left - size);
                false
            } else {
                until.set(rate);
                true
            }
        })
        .unwrap_or(false)
}

fn capture() -> Box<[usize]> {
    let mut frames = [0usize; MAX_FRAMES];
    let mut len = 0;
    backtrace::trace(|frame| {
        frames[len] = frame.ip() as usize;
        len += 1;
        len < MAX_FRAMES
    });
    frames[..len].into()
}

/// Called by the allocator after a successful allocation.
pub(crate) fn on_alloc(addr: usize, size: usize) {
    let rate = SAMPLE_RATE.load(Ordering::Relaxed);
    if rate == 0 {
        return;
    }
    suspended(|| {
        if sample_due(size, rate) {
            let frames = capture();
            lock().record_alloc(addr, size as u64, frames);
        }
    });
}

/// Called by the allocator before a block is released.
pub(crate) fn on_free(addr: usize) {
    if LIVE_SAMPLES.load(Ordering::Relaxed) == 0 {
        return;
    }
    suspended(|| lock().record_free(addr));
}

/// Copy of every sampled site.
pub fn snapshot() -> Vec<StackSite> {
    suspended(|| lock().sites.clone()).unwrap_or_default()
}

struct ResolvedFrame {
    ip: usize,
    name: Option<String>,
    location: Option<String>,
}

/// Frames of the allocator and the sampler itself sit on top of every stack.
fn is_internal(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "backtrace::",
        "sigdump::runtime::stacks::",
        "<sigdump::runtime::alloc::",
        "__rust_alloc",
        "__rust_realloc",
        "__rg_alloc",
        "__rg_realloc",
        "alloc::alloc::",
        "std::thread::local::",
        "core::ops::function::",
    ];
    PREFIXES.iter().any(|p| name.starts_with(p))
}

fn resolve(frames: &[usize]) -> Vec<ResolvedFrame> {
    let resolved: Vec<ResolvedFrame> = frames
        .iter()
        .map(|&ip| {
            let mut frame = ResolvedFrame {
                ip,
                name: None,
                location: None,
            };
            backtrace::resolve(ip as *mut c_void, |symbol| {
                if frame.name.is_some() {
                    return;
                }
                frame.name = symbol.name().map(|n| format!("{n:#}"));
                frame.location = match (symbol.filename(), symbol.lineno()) {
                    (Some(file), Some(line)) => Some(format!("{}:{}", file.display(), line)),
                    (Some(file), None) => Some(file.display().to_string()),
                    _ => None,
                };
            });
            frame
        })
        .collect();
    let skip = resolved
        .iter()
        .take_while(|f| f.name.as_deref().map_or(false, is_internal))
        .count();
    resolved.into_iter().skip(skip).collect()
}

/// Write one row per site in the legacy text pprof layout:
/// `live_objects: live_bytes [alloc_objects: alloc_bytes] @ ip ip ...`
/// followed by one `#` line per symbolized frame.
pub(crate) fn write_sites(out: &mut dyn Write, sites: &[StackSite]) -> std::io::Result<()> {
    for site in sites {
        let frames = resolve(&site.frames);
        let addrs: Vec<String> = frames.iter().map(|f| format!("{:#x}", f.ip)).collect();
        writeln!(
            out,
            "{}: {} [{}: {}] @ {}",
            site.live_objects(),
            site.live_bytes(),
            site.alloc_objects,
            site.alloc_bytes,
            addrs.join(" ")
        )?;
        for frame in &frames {
            writeln!(
                out,
                "#\t{:#x}\t{}\t{}",
                frame.ip,
                frame.name.as_deref().unwrap_or("?"),
                frame.location.as_deref().unwrap_or("?")
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}
