//! Structured logging: `tracing` to stderr plus a bounded in-memory
//! ring buffer backing `GET /logs`, mirroring
//! `InMemoryLogHandler`/`structured_log_record` in
//! `original_source/jarvis_core/JarvisCore.py`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const MAX_LOG_RECORDS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Shared handle to the bounded log buffer, cloned into route handlers.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<LogRecord>>>,
}

impl LogBuffer {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_LOG_RECORDS))),
        }
    }

    fn push(&self, record: LogRecord) {
        let mut guard = self.inner.lock().expect("log buffer mutex poisoned");
        if guard.len() == MAX_LOG_RECORDS {
            guard.pop_front();
        }
        guard.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.inner.lock().expect("log buffer mutex poisoned").iter().cloned().collect()
    }
}

struct InMemoryLayer {
    buffer: LogBuffer,
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for InMemoryLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.buffer.push(LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

/// Install the global tracing subscriber (stderr formatter + env filter +
/// in-memory ring buffer) and return a handle to the buffer for `/logs`.
pub fn init() -> LogBuffer {
    let buffer = LogBuffer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let memory_layer = InMemoryLayer { buffer: buffer.clone() };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(memory_layer)
        .init();

    buffer
}
