//! MQTT message envelopes used by the publish pipeline and the spool.
//!
//! [`QueuedPublish`] is the in-memory MQTT 5 publish envelope. It round-trips
//! through [`SpoolRecord`], a self-describing JSON document with base64
//! wrapping for the binary fields, stored one record per spool file.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MQTT 5 publish envelope queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPublish {
    pub topic_name: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub content_type: Option<String>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

impl QueuedPublish {
    /// Minimal QoS-0 envelope.
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic_name: topic_name.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            content_type: None,
            payload_format_indicator: None,
            message_expiry_interval: None,
            response_topic: None,
            correlation_data: None,
            user_properties: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_expiry(mut self, seconds: u32) -> Self {
        self.message_expiry_interval = Some(seconds);
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub fn with_user_properties(mut self, props: &[(&str, &str)]) -> Self {
        for (key, value) in props {
            self.user_properties.push(((*key).to_string(), (*value).to_string()));
        }
        self
    }

    /// Serialize to the on-disk spool record.
    pub fn to_record(&self) -> Result<Vec<u8>> {
        let record = SpoolRecord {
            topic_name: self.topic_name.clone(),
            payload: BASE64.encode(&self.payload),
            qos: self.qos,
            retain: self.retain,
            content_type: self.content_type.clone(),
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.as_ref().map(|data| BASE64.encode(data)),
            user_properties: self.user_properties.clone(),
        };
        serde_json::to_vec(&record).context("spool record serialization failed")
    }

    /// Parse an on-disk spool record.
    pub fn from_record(raw: &[u8]) -> Result<Self> {
        let record: SpoolRecord =
            serde_json::from_slice(raw).context("spool record format invalid")?;
        let payload = BASE64
            .decode(&record.payload)
            .context("spool record payload is not valid base64")?;
        let correlation_data = record
            .correlation_data
            .map(|data| BASE64.decode(data))
            .transpose()
            .context("spool record correlation data is not valid base64")?;
        Ok(Self {
            topic_name: record.topic_name,
            payload,
            qos: record.qos,
            retain: record.retain,
            content_type: record.content_type,
            payload_format_indicator: record.payload_format_indicator,
            message_expiry_interval: record.message_expiry_interval,
            response_topic: record.response_topic,
            correlation_data,
            user_properties: record.user_properties,
        })
    }
}

/// On-disk encoding of a [`QueuedPublish`]; binary fields base64-wrapped.
#[derive(Debug, Serialize, Deserialize)]
struct SpoolRecord {
    topic_name: String,
    payload: String,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    retain: bool,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    payload_format_indicator: Option<u8>,
    #[serde(default)]
    message_expiry_interval: Option<u32>,
    #[serde(default)]
    response_topic: Option<String>,
    #[serde(default)]
    correlation_data: Option<String>,
    #[serde(default)]
    user_properties: Vec<(String, String)>,
}

/// Inbound MQTT message as seen by the dispatcher and components.
///
/// Carries only the fields the daemon acts on: topic, payload and the MQTT 5
/// request/response plumbing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            response_topic: None,
            correlation_data: None,
        }
    }

    /// Payload interpreted as UTF-8, lossily.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn full_envelope() -> QueuedPublish {
        QueuedPublish {
            topic_name: "br/system/status".into(),
            payload: vec![0x00, 0xFF, 0x7F],
            qos: 0,
            retain: true,
            content_type: Some("application/json".into()),
            payload_format_indicator: Some(1),
            message_expiry_interval: Some(30),
            response_topic: Some("client/reply".into()),
            correlation_data: Some(vec![1, 2, 3]),
            user_properties: vec![("bridge-event".into(), "handshake".into())],
        }
    }

    #[test]
    fn record_round_trip_preserves_all_fields() {
        let original = full_envelope();
        let raw = original.to_record().unwrap();
        let restored = QueuedPublish::from_record(&raw).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn minimal_envelope_round_trips() {
        let original = QueuedPublish::new("br/console/out", b"hello".to_vec());
        let raw = original.to_record().unwrap();
        let restored = QueuedPublish::from_record(&raw).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn record_is_self_describing_json() {
        let raw = full_envelope().to_record().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["topic_name"], "br/system/status");
        assert!(value["payload"].is_string());
    }

    #[test]
    fn corrupt_record_rejected() {
        assert!(QueuedPublish::from_record(b"not json").is_err());
        assert!(QueuedPublish::from_record(b"{\"topic_name\":\"t\",\"payload\":\"@@@\"}").is_err());
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = br#"{"topic_name":"t","payload":"aGk="}"#;
        let restored = QueuedPublish::from_record(raw).unwrap();
        assert_eq!(restored.payload, b"hi");
        assert_eq!(restored.qos, 0);
        assert!(restored.user_properties.is_empty());
    }

    #[test]
    fn builders_compose() {
        let msg = QueuedPublish::new("t", b"p".to_vec())
            .with_content_type("text/plain")
            .with_expiry(10)
            .with_user_property("bridge-pin", "5");
        assert_eq!(msg.content_type.as_deref(), Some("text/plain"));
        assert_eq!(msg.message_expiry_interval, Some(10));
        assert_eq!(msg.user_properties, vec![("bridge-pin".into(), "5".into())]);
    }

    #[test]
    fn inbound_payload_str_is_lossy() {
        let inbound = InboundMessage::new("br/console/in", Bytes::from_static(b"ok"));
        assert_eq!(inbound.payload_str(), "ok");
    }
}
