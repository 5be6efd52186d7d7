//! CPU profile: sampled stacks collected by `pprof`, encoded as pprof protobuf.
//!
//! The sampler lives on its own thread for the length of the window so the
//! profiler guard never crosses an await point.

use super::{ActiveWindow, CollectError, WindowedProfile};
use pprof::protos::Message;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

/// Frames from these libraries are dropped from samples.
const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// The sampler is process-wide; at most one CPU window may run.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Holds the process-wide CPU slot until dropped.
struct Claim;

impl Claim {
    fn acquire() -> Option<Claim> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Claim)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CpuProfile {
    frequency: i32,
}

impl CpuProfile {
    pub fn new(frequency: i32) -> Self {
        Self { frequency }
    }
}

impl WindowedProfile for CpuProfile {
    fn start(&self) -> Result<Box<dyn ActiveWindow>, CollectError> {
        let claim = Claim::acquire().ok_or(CollectError::AlreadyActive)?;
        let frequency = self.frequency;
        let (started_tx, started_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name("sigdump-cpu".to_string())
            .spawn(move || -> Result<Vec<u8>, CollectError> {
                let _claim = claim;
                let guard = match pprof::ProfilerGuardBuilder::default()
                    .frequency(frequency)
                    .blocklist(BLOCKLIST)
                    .build()
                {
                    Ok(guard) => {
                        let _ = started_tx.send(Ok(()));
                        guard
                    }
                    Err(e) => {
                        let _ = started_tx.send(Err(e.to_string()));
                        return Ok(Vec::new());
                    }
                };

                // Err means the window was dropped: skip the report
                if stop_rx.recv().is_err() {
                    return Ok(Vec::new());
                }

                let report = guard
                    .report()
                    .build()
                    .map_err(|e| CollectError::Failed(e.to_string()))?;
                drop(guard);
                let profile = report
                    .pprof()
                    .map_err(|e| CollectError::Failed(e.to_string()))?;
                let mut encoded = Vec::new();
                profile
                    .encode(&mut encoded)
                    .map_err(|e| CollectError::Failed(e.to_string()))?;
                Ok(encoded)
            })?;

        match started_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpuWindow {
                stop: Some(stop_tx),
                worker: Some(worker),
            })),
            Ok(Err(message)) => {
                let _ = worker.join();
                Err(CollectError::Failed(message))
            }
            Err(_) => {
                let _ = worker.join();
                Err(CollectError::Failed(
                    "cpu sampler thread exited before starting".to_string(),
                ))
            }
        }
    }
}

struct CpuWindow {
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<Result<Vec<u8>, CollectError>>>,
}

impl ActiveWindow for CpuWindow {
    fn finish(mut self: Box<Self>, out: &mut dyn Write) -> Result<(), CollectError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let worker = self
            .worker
            .take()
            .ok_or_else(|| CollectError::Failed("cpu window already finished".to_string()))?;
        let encoded = worker
            .join()
            .map_err(|_| CollectError::Failed("cpu sampler thread panicked".to_string()))??;
        out.write_all(&encoded)?;
        Ok(())
    }
}

impl Drop for CpuWindow {
    /// An abandoned window stops sampling and frees the slot before returning.
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
