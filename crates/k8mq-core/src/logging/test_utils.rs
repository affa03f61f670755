//! In-memory capture of tracing events for assertions.
//!
//! Used to verify the paths that drop work and only log it, such as a
//! broadcast that finds a full mailbox or a reply nobody is waiting for.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Event level.
    pub level: Level,
    /// Emitting module path.
    pub target: String,
    /// Rendered `message` field.
    pub message: String,
    /// Remaining fields, rendered.
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

/// Shared handle to the events recorded by [`capture_logs`].
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    /// Snapshot of every event so far.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Whether any event's message contains `needle`.
    pub fn has_message(&self, needle: &str) -> bool {
        self.events.lock().iter().any(|e| e.message.contains(needle))
    }

    /// Whether any event at `level` has a message containing `needle`.
    pub fn has_event(&self, level: Level, needle: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }

    /// Number of events recorded at `level`.
    pub fn count_at_level(&self, level: Level) -> usize {
        self.events.lock().iter().filter(|e| e.level == level).count()
    }

    /// Events whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .cloned()
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

#[derive(Default)]
struct Recorder {
    message: String,
    fields: Vec<(String, String)>,
}

impl Recorder {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_owned(), value));
        }
    }
}

impl Visit for Recorder {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut recorder = Recorder::default();
        event.record(&mut recorder);
        let metadata = event.metadata();
        self.logs.events.lock().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: recorder.message,
            fields: recorder.fields,
        });
    }
}

/// Install a thread-local subscriber that records every event.
///
/// Keep the returned guard alive for as long as events should be captured.
/// Only events emitted on the current thread are seen, so tests that rely on
/// it should use the current-thread tokio runtime.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry()
        .with(CaptureLayer { logs: logs.clone() })
        .with(LevelFilter::TRACE);
    (logs, subscriber.set_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_levels() {
        let (logs, _guard) = capture_logs();
        tracing::info!("started");
        tracing::warn!("mailbox full");
        tracing::warn!("mailbox full again");
        assert!(logs.has_event(Level::INFO, "started"));
        assert!(logs.has_event(Level::WARN, "mailbox full"));
        assert_eq!(logs.count_at_level(Level::WARN), 2);
        assert_eq!(logs.count_at_level(Level::ERROR), 0);
    }

    #[test]
    fn records_fields() {
        let (logs, _guard) = capture_logs();
        tracing::info!(conn_id = "c1", retries = 2, dropped = true, "requeue");
        let events = logs.matching("requeue");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field("conn_id"), Some("c1"));
        assert_eq!(events[0].field("retries"), Some("2"));
        assert_eq!(events[0].field("dropped"), Some("true"));
        assert_eq!(events[0].field("missing"), None);
    }

    #[test]
    fn clear_forgets_events() {
        let (logs, _guard) = capture_logs();
        tracing::error!("boom");
        assert!(logs.has_message("boom"));
        logs.clear();
        assert!(logs.events().is_empty());
    }

    #[test]
    fn other_threads_are_not_captured() {
        let (logs, _guard) = capture_logs();
        std::thread::spawn(|| tracing::info!("elsewhere"))
            .join()
            .unwrap();
        assert!(!logs.has_message("elsewhere"));
    }
}
