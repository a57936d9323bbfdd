//! Lifecycle events from the execution engine's event stream.
//!
//! The engine writes one JSON object per line. Only `type` and `runID` are
//! interpreted here (tolerant reader): every other field is carried through
//! untouched so the client sees exactly what the engine produced.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Kind of the event the engine emits when it pauses for an out-of-band
/// decision before continuing.
pub const CALL_CONFIRM: &str = "callConfirm";

/// A single lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Correlates events belonging to one run. Empty when the engine omits it
    /// or sends `null`; non-string ids are kept in their JSON text form.
    #[serde(rename = "runID", default, deserialize_with = "run_id_text")]
    pub run_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event with an empty payload.
    pub fn new(kind: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            run_id: run_id.into(),
            payload: Map::new(),
        }
    }

    /// Attach a payload field.
    #[cfg(test)]
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn is_confirm(&self) -> bool {
        self.kind == CALL_CONFIRM
    }
}

fn run_id_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(id) => id,
        other => other.to_string(),
    })
}

/// Parse a single NDJSON line from the engine's event stream.
pub fn parse_line(line: &str) -> Result<Event> {
    serde_json::from_str(line).map_err(|e| Error::MalformedEvent(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kind_run_and_payload() {
        let event =
            parse_line(r#"{"type":"callStart","runID":"r1","time":"now","tool":{"name":"x"}}"#)
                .unwrap();
        assert_eq!(event.kind, "callStart");
        assert_eq!(event.run_id, "r1");
        assert_eq!(event.payload["time"], json!("now"));
        assert_eq!(event.payload["tool"]["name"], json!("x"));
        assert!(!event.is_confirm());
    }

    #[test]
    fn missing_run_id_defaults_to_empty() {
        let event = parse_line(r#"{"type":"callConfirm"}"#).unwrap();
        assert!(event.is_confirm());
        assert_eq!(event.run_id, "");
    }

    #[test]
    fn non_object_line_is_malformed() {
        assert!(matches!(parse_line("42"), Err(Error::MalformedEvent(_))));
        assert!(matches!(parse_line("{not json"), Err(Error::MalformedEvent(_))));
    }

    #[test]
    fn serializes_flat_with_wire_names() {
        let event = Event::new("callFinish", "r2").with("output", "done");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "callFinish", "runID": "r2", "output": "done"})
        );
    }

    #[test]
    fn null_and_numeric_run_ids_are_accepted() {
        let event = parse_line(r#"{"type":"callProgress","runID":null}"#).unwrap();
        assert_eq!(event.run_id, "");

        let event = parse_line(r#"{"type":"callConfirm","runID":17}"#).unwrap();
        assert!(event.is_confirm());
        assert_eq!(event.run_id, "17");
    }
}
