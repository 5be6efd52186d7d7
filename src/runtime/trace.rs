//! Execution trace: spans and events seen through `tracing` during a window.
//!
//! Install the recorder's layer next to the application's other layers:
//!
//! ```ignore
//! use tracing_subscriber::prelude::*;
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(sigdump::TraceRecorder::global().layer())
//!     .init();
//! ```
//!
//! The output is JSON lines: a header, one line per span open/close or event,
//! and a trailer with counts.

use super::{ActiveWindow, CollectError, WindowedProfile};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Records kept per window; later records are counted as dropped.
pub const MAX_RECORDS: usize = 200_000;

static GLOBAL: LazyLock<TraceRecorder> = LazyLock::new(TraceRecorder::new);

struct Capture {
    started: Instant,
    started_at: chrono::DateTime<chrono::Utc>,
    records: Vec<Value>,
    dropped: u64,
}

#[derive(Default)]
struct Recorder {
    active: AtomicBool,
    capture: Mutex<Option<Capture>>,
}

impl Recorder {
    fn lock(&self) -> MutexGuard<'_, Option<Capture>> {
        self.capture.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, build: impl FnOnce(u128) -> Value) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.lock();
        let Some(capture) = guard.as_mut() else {
            return;
        };
        if capture.records.len() >= MAX_RECORDS {
            capture.dropped += 1;
            return;
        }
        let record = build(capture.started.elapsed().as_micros());
        capture.records.push(record);
    }

    fn end(&self) -> Option<Capture> {
        self.active.store(false, Ordering::Release);
        self.lock().take()
    }
}

/// Shared handle to a trace recorder. Clones observe the same windows.
#[derive(Clone, Default)]
pub struct TraceRecorder {
    inner: Arc<Recorder>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorder used by the built-in registry.
    pub fn global() -> &'static TraceRecorder {
        &GLOBAL
    }

    /// A `tracing` layer feeding this recorder.
    pub fn layer(&self) -> TraceLayer {
        TraceLayer {
            recorder: Arc::clone(&self.inner),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder")
            .field("recording", &self.is_recording())
            .finish()
    }
}

impl WindowedProfile for TraceRecorder {
    fn start(&self) -> Result<Box<dyn ActiveWindow>, CollectError> {
        let mut capture = self.inner.lock();
        if capture.is_some() {
            return Err(CollectError::AlreadyActive);
        }
        *capture = Some(Capture {
            started: Instant::now(),
            started_at: chrono::Utc::now(),
            records: Vec::new(),
            dropped: 0,
        });
        self.inner.active.store(true, Ordering::Release);
        Ok(Box::new(TraceWindow {
            recorder: Some(Arc::clone(&self.inner)),
        }))
    }
}

struct TraceWindow {
    /// Taken by `finish`; still set only for an abandoned window.
    recorder: Option<Arc<Recorder>>,
}

impl ActiveWindow for TraceWindow {
    fn finish(mut self: Box<Self>, out: &mut dyn Write) -> Result<(), CollectError> {
        let capture = self
            .recorder
            .take()
            .and_then(|recorder| recorder.end())
            .ok_or_else(|| CollectError::Failed("trace window already ended".to_string()))?;

        let header = json!({
            "type": "header",
            "format": "sigdump-trace",
            "version": 1,
            "pid": std::process::id(),
            "started_at": capture.started_at.to_rfc3339(),
        });
        writeln!(out, "{header}")?;
        for record in &capture.records {
            writeln!(out, "{record}")?;
        }
        let trailer = json!({
            "type": "trailer",
            "duration_us": capture.started.elapsed().as_micros() as u64,
            "records": capture.records.len(),
            "dropped": capture.dropped,
        });
        writeln!(out, "{trailer}")?;
        Ok(())
    }
}

impl Drop for TraceWindow {
    fn drop(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.end();
        }
    }
}

/// `tracing` layer that copies spans and events into an active trace window.
pub struct TraceLayer {
    recorder: Arc<Recorder>,
}

struct JsonFields(Map<String, Value>);

impl Visit for JsonFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
}

fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

impl<S> Layer<S> for TraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        if !self.recorder.active.load(Ordering::Acquire) {
            return;
        }
        let mut fields = JsonFields(Map::new());
        attrs.record(&mut fields);
        let meta = attrs.metadata();
        self.recorder.record(|ts_us| {
            json!({
                "type": "span_open",
                "ts_us": ts_us as u64,
                "id": id.into_u64(),
                "name": meta.name(),
                "target": meta.target(),
                "level": meta.level().as_str(),
                "thread": thread_label(),
                "fields": Value::Object(fields.0),
            })
        });
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !self.recorder.active.load(Ordering::Acquire) {
            return;
        }
        let mut fields = JsonFields(Map::new());
        event.record(&mut fields);
        let meta = event.metadata();
        let span = ctx.event_span(event).map(|s| s.id().into_u64());
        self.recorder.record(|ts_us| {
            json!({
                "type": "event",
                "ts_us": ts_us as u64,
                "span": span,
                "target": meta.target(),
                "level": meta.level().as_str(),
                "thread": thread_label(),
                "fields": Value::Object(fields.0),
            })
        });
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        if !self.recorder.active.load(Ordering::Acquire) {
            return;
        }
        let name = ctx.span(&id).map(|s| s.name());
        self.recorder.record(|ts_us| {
            json!({
                "type": "span_close",
                "ts_us": ts_us as u64,
                "id": id.into_u64(),
                "name": name,
                "thread": thread_label(),
            })
        });
    }
}
