// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON wire format for batches forwarded between peers.
//!
//! ```json
//! {
//!     "events": [ {...}, {...} ],
//!     "destinationPluginId": "service-map",
//!     "destinationPipelineName": "traces"
//! }
//! ```
//!
//! Unknown fields are ignored so newer peers can add metadata.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope<E = Event> {
    pub events: Vec<E>,
    pub destination_plugin_id: String,
    pub destination_pipeline_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelopeRef<'a, E> {
    events: &'a [E],
    destination_plugin_id: &'a str,
    destination_pipeline_name: &'a str,
}

pub fn encode<E: Serialize>(
    events: &[E],
    destination_plugin_id: &str,
    destination_pipeline_name: &str,
) -> Result<Bytes, CodecError> {
    if events.is_empty() {
        return Err(CodecError::Encoding("no events to encode".to_string()));
    }
    if destination_plugin_id.is_empty() || destination_pipeline_name.is_empty() {
        return Err(CodecError::Encoding(
            "destination plugin id and pipeline name are required".to_string(),
        ));
    }
    let envelope = WireEnvelopeRef {
        events,
        destination_plugin_id,
        destination_pipeline_name,
    };
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|e| CodecError::Encoding(e.to_string()))
}

pub fn decode<E: DeserializeOwned>(bytes: &[u8]) -> Result<WireEnvelope<E>, CodecError> {
    let envelope: WireEnvelope<E> =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decoding(e.to_string()))?;
    if envelope.events.is_empty() {
        return Err(CodecError::Decoding("envelope has no events".to_string()));
    }
    if envelope.destination_plugin_id.is_empty() || envelope.destination_pipeline_name.is_empty()
    {
        return Err(CodecError::Decoding(
            "destination plugin id and pipeline name are required".to_string(),
        ));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serializer;
    use serde_json::json;

    fn events(count: usize) -> Vec<Event> {
        (0..count)
            .map(|i| {
                let mut event = Event::default();
                event.insert("traceId", format!("trace-{i}"));
                event
            })
            .collect()
    }

    #[test]
    fn test_encode_then_decode_preserves_envelope() {
        let sent = events(3);
        let bytes = encode(&sent, "service-map", "traces").unwrap();
        let envelope: WireEnvelope = decode(&bytes).unwrap();

        assert_eq!(envelope.events, sent);
        assert_eq!(envelope.destination_plugin_id, "service-map");
        assert_eq!(envelope.destination_pipeline_name, "traces");
    }

    #[test]
    fn test_wire_field_names() {
        let bytes = encode(&events(1), "plugin", "pipeline").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({
                "events": [{"traceId": "trace-0"}],
                "destinationPluginId": "plugin",
                "destinationPipelineName": "pipeline"
            })
        );
    }

    #[test]
    fn test_encode_rejects_empty_batch() {
        let result = encode::<Event>(&[], "plugin", "pipeline");
        assert!(matches!(result, Err(CodecError::Encoding(_))));
    }

    #[test]
    fn test_encode_surfaces_serializer_failure() {
        struct Unserializable;
        impl Serialize for Unserializable {
            fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("cannot serialize"))
            }
        }

        let result = encode(&[Unserializable], "plugin", "pipeline");
        match result {
            Err(CodecError::Encoding(message)) => assert!(message.contains("cannot serialize")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let body = br#"{
            "events": [{"a": 1}],
            "destinationPluginId": "plugin",
            "destinationPipelineName": "pipeline",
            "compression": "none"
        }"#;
        let envelope: WireEnvelope = decode(body).unwrap();
        assert_eq!(envelope.events.len(), 1);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        let cases: [&[u8]; 6] = [
            b"",
            br#"{"events": [{"a": 1}], "destinationPluginId": "p""#,
            br#"{"events": [{"a": 1}], "destinationPipelineName": "p"}"#,
            br#"{"events": [{"a": 1}], "destinationPluginId": "p"}"#,
            br#"{"events": [], "destinationPluginId": "p", "destinationPipelineName": "q"}"#,
            br#"{"events": [1, 2], "destinationPluginId": "p", "destinationPipelineName": "q"}"#,
        ];
        for case in cases {
            let result = decode::<Event>(case);
            assert!(
                matches!(result, Err(CodecError::Decoding(_))),
                "expected decoding error for {}",
                String::from_utf8_lossy(case)
            );
        }
    }
}
