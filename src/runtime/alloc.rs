//! Heap and allocation profiles backed by an opt-in counting allocator.
//!
//! Install [`TrackingAllocator`] as the global allocator to get object and
//! byte counts:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: sigdump::TrackingAllocator = sigdump::TrackingAllocator::system();
//! ```
//!
//! Without it the profiles still carry process memory figures, and say that
//! allocation tracking is off. With it, sampled allocations are attributed to
//! their call stacks (see [`stacks`](super::stacks)).

use super::stacks::{self, StackSite};
use super::{CollectError, SnapshotProfile};
use std::alloc::{GlobalAlloc, Layout, System};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);
static ALLOC_OBJECTS: AtomicU64 = AtomicU64::new(0);
static ALLOC_BYTES: AtomicU64 = AtomicU64::new(0);
static FREE_OBJECTS: AtomicU64 = AtomicU64::new(0);
static FREE_BYTES: AtomicU64 = AtomicU64::new(0);

/// Global allocator wrapper that counts allocations and frees.
#[derive(Debug, Default)]
pub struct TrackingAllocator<A = System> {
    inner: A,
}

impl TrackingAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

fn record_alloc(size: usize) {
    if !INSTALLED.load(Ordering::Relaxed) {
        INSTALLED.store(true, Ordering::Relaxed);
    }
    ALLOC_OBJECTS.fetch_add(1, Ordering::Relaxed);
    ALLOC_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

fn record_free(size: usize) {
    FREE_OBJECTS.fetch_add(1, Ordering::Relaxed);
    FREE_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            record_alloc(layout.size());
            stacks::on_alloc(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            record_alloc(layout.size());
            stacks::on_alloc(ptr as usize, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        record_free(layout.size());
        stacks::on_free(ptr as usize);
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // The old block may be released by the call; forget it first
        stacks::on_free(ptr as usize);
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if new_ptr.is_null() {
            return new_ptr;
        }
        record_free(layout.size());
        record_alloc(new_size);
        stacks::on_alloc(new_ptr as usize, new_size);
        new_ptr
    }
}

/// Point-in-time allocation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocStats {
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    pub free_objects: u64,
    pub free_bytes: u64,
}

impl AllocStats {
    /// Current counters, or `None` if [`TrackingAllocator`] has never run.
    pub fn current() -> Option<AllocStats> {
        if !INSTALLED.load(Ordering::Relaxed) {
            return None;
        }
        Some(AllocStats {
            alloc_objects: ALLOC_OBJECTS.load(Ordering::Relaxed),
            alloc_bytes: ALLOC_BYTES.load(Ordering::Relaxed),
            free_objects: FREE_OBJECTS.load(Ordering::Relaxed),
            free_bytes: FREE_BYTES.load(Ordering::Relaxed),
        })
    }

    pub fn live_objects(&self) -> u64 {
        self.alloc_objects.saturating_sub(self.free_objects)
    }

    pub fn live_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }
}

/// Resident and virtual memory of the process, in bytes.
#[cfg(target_os = "linux")]
fn process_memory() -> Option<(u64, u64)> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut fields = statm.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return None;
    }
    let page = page as u64;
    Some((resident * page, size * page))
}

#[cfg(not(target_os = "linux"))]
fn process_memory() -> Option<(u64, u64)> {
    None
}

fn write_footer(out: &mut dyn Write, stats: Option<AllocStats>) -> std::io::Result<()> {
    writeln!(out, "# captured_at: {}", chrono::Utc::now().to_rfc3339())?;
    writeln!(out, "# pid: {}", std::process::id())?;
    writeln!(
        out,
        "# tracking_allocator: {}",
        if stats.is_some() { "installed" } else { "not installed" }
    )?;
    if let Some((rss, vsz)) = process_memory() {
        writeln!(out, "# rss_bytes: {rss}")?;
        writeln!(out, "# vsz_bytes: {vsz}")?;
    }
    Ok(())
}

/// Live heap: what is still allocated right now.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapProfile;

impl SnapshotProfile for HeapProfile {
    /// Hand freed pages back to the OS so resident memory reflects the live set.
    fn prepare(&self) {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        unsafe {
            libc::malloc_trim(0);
        }
    }

    fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError> {
        let stats = AllocStats::current();
        let s = stats.unwrap_or_default();
        writeln!(
            out,
            "heap profile: {}: {} [{}: {}] @ heap/{}",
            s.live_objects(),
            s.live_bytes(),
            s.alloc_objects,
            s.alloc_bytes,
            stacks::sample_rate()
        )?;
        let mut sites: Vec<StackSite> = stacks::snapshot()
            .into_iter()
            .filter(|site| site.live_bytes() > 0)
            .collect();
        sites.sort_by(|a, b| b.live_bytes().cmp(&a.live_bytes()));
        stacks::write_sites(out, &sites)?;
        writeln!(out, "# live_objects: {}", s.live_objects())?;
        writeln!(out, "# live_bytes: {}", s.live_bytes())?;
        write_footer(out, stats)?;
        Ok(())
    }
}

/// Cumulative allocations since the process started.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocsProfile;

impl SnapshotProfile for AllocsProfile {
    fn write_to(&self, out: &mut dyn Write) -> Result<(), CollectError> {
        let stats = AllocStats::current();
        let s = stats.unwrap_or_default();
        writeln!(
            out,
            "allocs profile: {}: {} [{}: {}] @ heap/{}",
            s.alloc_objects,
            s.alloc_bytes,
            s.free_objects,
            s.free_bytes,
            stacks::sample_rate()
        )?;
        let mut sites = stacks::snapshot();
        sites.sort_by(|a, b| b.alloc_bytes.cmp(&a.alloc_bytes));
        stacks::write_sites(out, &sites)?;
        writeln!(out, "# alloc_objects: {}", s.alloc_objects)?;
        writeln!(out, "# alloc_bytes: {}", s.alloc_bytes)?;
        writeln!(out, "# free_objects: {}", s.free_objects)?;
        writeln!(out, "# free_bytes: {}", s.free_bytes)?;
        write_footer(out, stats)?;
        Ok(())
    }
}
