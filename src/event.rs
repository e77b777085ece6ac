use std::fmt;

use serde_json::Value;
use tracing::Level;

use crate::store::ResponseId;

/// One structured log event of a trace: a level, the response id it belongs
/// to, and an ordered list of fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub level: Level,
    pub response_id: ResponseId,
    pub message: &'static str,
    pub fields: Vec<(&'static str, Value)>,
}

impl TraceEvent {
    pub fn new(level: Level, response_id: ResponseId, message: &'static str) -> Self {
        TraceEvent {
            level,
            response_id,
            message,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((name, value.into()));
        self
    }

    /// First field with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    /// The fields rendered as `name=value` pairs, in insertion order.
    pub fn display_fields(&self) -> DisplayFields<'_> {
        DisplayFields(&self.fields)
    }
}

pub struct DisplayFields<'a>(&'a [(&'static str, Value)]);

impl fmt::Display for DisplayFields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// Receiver of trace events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Forwards trace events to the installed `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TraceEvent) {
        let id = event.response_id;
        let fields = event.display_fields();
        match event.level {
            Level::ERROR => {
                tracing::error!(target: "request_trace", response_id = %id, %fields, "{}", event.message)
            }
            Level::WARN => {
                tracing::warn!(target: "request_trace", response_id = %id, %fields, "{}", event.message)
            }
            Level::INFO => {
                tracing::info!(target: "request_trace", response_id = %id, %fields, "{}", event.message)
            }
            Level::DEBUG => {
                tracing::debug!(target: "request_trace", response_id = %id, %fields, "{}", event.message)
            }
            _ => {
                tracing::trace!(target: "request_trace", response_id = %id, %fields, "{}", event.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fields_keep_insertion_order() {
        let event = TraceEvent::new(Level::DEBUG, ResponseId::from_raw(1), "entry")
            .field("step", 1)
            .field("duration", "0.5 ms")
            .field("header", json!({"accept": ["*/*"]}));

        assert_eq!(
            event.display_fields().to_string(),
            r#"step=1 duration="0.5 ms" header={"accept":["*/*"]}"#
        );
        assert_eq!(event.get("step"), Some(&json!(1)));
        assert_eq!(event.get("missing"), None);
    }
}
