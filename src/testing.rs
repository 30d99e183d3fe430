//! Tracing helpers shared by unit tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Fields of one captured event, rendered as strings.
pub(crate) type Fields = BTreeMap<String, String>;

/// Layer keeping every event that carries an `event` field.
#[derive(Clone, Default)]
pub(crate) struct EventRecorder {
    events: Arc<Mutex<Vec<(String, Fields)>>>,
}

impl EventRecorder {
    /// Fields of every recorded `name` event, in emission order.
    pub(crate) fn events(&self, name: &str) -> Vec<Fields> {
        self.events
            .lock()
            .iter()
            .filter(|(event, _)| event == name)
            .map(|(_, fields)| fields.clone())
            .collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.events(name).len()
    }
}

struct FieldVisitor(Fields);

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for EventRecorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor(Fields::new());
        event.record(&mut visitor);
        if let Some(name) = visitor.0.remove("event") {
            self.events.lock().push((name, visitor.0));
        }
    }
}
