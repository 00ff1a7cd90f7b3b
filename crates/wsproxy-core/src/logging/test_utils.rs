//! In-memory capture of tracing events for assertions in tests.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::level_filters::LevelFilter;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// A captured tracing event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Event target, e.g. `wsproxy_server::relay`.
    pub target: String,
    /// The formatted message.
    pub message: String,
    /// Field key-value pairs (excluding `message`).
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    /// Value of the named field, if recorded.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Events captured on one thread, oldest first.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    /// Events whose target starts with `target_prefix`.
    pub fn events_for_target(&self, target_prefix: &str) -> Vec<CapturedEvent> {
        self.lock()
            .iter()
            .filter(|e| e.target.starts_with(target_prefix))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CapturedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        if field.name() == "message" {
            self.message = val;
        } else {
            self.fields.push((field.name().to_owned(), val));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.fields.push((field.name().to_owned(), value.to_owned()));
        }
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.push((field.name().to_owned(), value.to_string()));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.push((field.name().to_owned(), value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.push((field.name().to_owned(), value.to_string()));
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor {
            message: String::new(),
            fields: Vec::new(),
        };
        event.record(&mut visitor);

        self.logs.lock().push(CapturedEvent {
            target: metadata.target().to_owned(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

/// Install a capturing subscriber on the current thread.
///
/// Uses `set_default`, so it only sees events emitted on this thread; pair it
/// with a current-thread tokio runtime (the `#[tokio::test]` default). Keep the
/// returned guard alive for the duration of the test.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let layer = CaptureLayer { logs: logs.clone() };

    let subscriber = tracing_subscriber::registry()
        .with(layer)
        .with(LevelFilter::TRACE);

    let guard = subscriber.set_default();
    (logs, guard)
}
