// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single telemetry record flowing through a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    data: Map<String, Value>,
}

impl Event {
    pub fn new(data: Map<String, Value>) -> Self {
        Event { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Returns the value of `key` as routing text. Strings are used verbatim so that a
    /// trace id routes the same whether or not it was quoted on the wire.
    pub fn identification_value(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl From<Map<String, Value>> for Event {
    fn from(data: Map<String, Value>) -> Self {
        Event::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> Event {
        match value {
            Value::Object(map) => Event::new(map),
            _ => panic!("test events must be objects"),
        }
    }

    #[test]
    fn test_identification_value_uses_raw_strings() {
        let event = event(json!({"traceId": "abc", "status": 200, "parent": null}));
        assert_eq!(event.identification_value("traceId"), Some("abc".to_string()));
        assert_eq!(event.identification_value("status"), Some("200".to_string()));
        assert_eq!(event.identification_value("parent"), None);
        assert_eq!(event.identification_value("missing"), None);
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut event = Event::default();
        event.insert("message", "hello");
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"message":"hello"}"#
        );
    }
}
