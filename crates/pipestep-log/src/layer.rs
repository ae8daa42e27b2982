//! The tracing layer that feeds the log sink.

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::{LogEntry, LogLevel, LogSink};

/// Tracing layer turning events into [`LogEntry`] values for a [`LogSink`].
pub struct StepLogLayer {
    sink: LogSink,
}

impl StepLogLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for StepLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let level = LogLevel::from_tracing(event.metadata().level(), visitor.fatal);
        if level == LogLevel::Debug && !self.sink.is_verbose() {
            return;
        }

        let mut entry = LogEntry::new(level, visitor.message);
        entry.fields = visitor.fields;
        entry.error = visitor.error;
        self.sink.emit(entry);
    }
}

/// Splits event fields into message, error, fatal marker and the rest.
#[derive(Default)]
struct EntryVisitor {
    message: String,
    error: Option<String>,
    fatal: bool,
    fields: Vec<(String, String)>,
}

impl EntryVisitor {
    fn record_value(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "error" => self.error = Some(value),
            "fatal" => self.fatal = value == "true",
            name => self.fields.push((name.to_string(), value)),
        }
    }
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record_value(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, value.to_string());
    }
}
