//! RAM key-value store mirrored over MQTT `datastore/{put,get}/<key>`.
//!
//! Keys and values are capped at 255 bytes (the wire uses single length
//! bytes). Every mutation or MCU-side read echoes the value to
//! `datastore/get/<key>` so MQTT observers stay current.

use anyhow::Result;

use super::{BridgeContext, EXPIRY_DATASTORE};
use crate::mqtt::messages::{InboundMessage, QueuedPublish};
use crate::protocol::{topics, Command, Status};

/// Upper bound for keys and values on the wire.
const MAX_ENTRY_BYTES: usize = 255;

pub struct DatastoreComponent {
    ctx: BridgeContext,
}

impl DatastoreComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// `CMD_DATASTORE_PUT` payload: `key_len:u8 ‖ key ‖ value_len:u8 ‖ value`.
    pub async fn handle_put(&self, payload: &[u8]) -> Result<bool> {
        let Some((key, value)) = parse_put_payload(payload) else {
            log::warn!("Malformed DATASTORE_PUT payload ({} bytes)", payload.len());
            return Ok(false);
        };

        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.datastore.insert(key.clone(), String::from_utf8_lossy(&value).into_owned());
        }
        self.publish_value(&key, &value, None, None).await;
        Ok(true)
    }

    /// `CMD_DATASTORE_GET` payload: `key_len:u8 ‖ key`. Replies with a
    /// length-prefixed value frame (empty on miss).
    pub async fn handle_get_request(&self, payload: &[u8]) -> Result<bool> {
        let Some(key) = parse_get_payload(payload) else {
            log::warn!("Malformed DATASTORE_GET payload ({} bytes)", payload.len());
            self.ctx
                .send_frame(Status::Malformed.value(), b"data_get_malformed".to_vec())
                .await;
            return Ok(false);
        };

        let value = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.datastore.get(&key).cloned().unwrap_or_default()
        };
        let mut value_bytes = value.into_bytes();
        if value_bytes.len() > MAX_ENTRY_BYTES {
            log::warn!("Datastore value truncated for key {key} ({} bytes)", value_bytes.len());
            value_bytes.truncate(MAX_ENTRY_BYTES);
        }

        let mut response = Vec::with_capacity(1 + value_bytes.len());
        response.push(value_bytes.len() as u8);
        response.extend_from_slice(&value_bytes);

        let sent = self
            .ctx
            .send_frame(Command::DatastoreGetResp.value(), response)
            .await;
        if sent {
            self.publish_value(&key, &value_bytes, None, None).await;
        }
        Ok(sent)
    }

    /// MQTT `datastore/{put,get}/<key>[/request]`.
    pub async fn handle_mqtt(
        &self,
        identifier: &str,
        remainder: &[String],
        payload_str: &str,
        inbound: &InboundMessage,
    ) {
        let mut parts: Vec<&str> = remainder.iter().map(String::as_str).collect();
        let mut is_request = false;
        if identifier == "get" && parts.last() == Some(&"request") {
            parts.pop();
            is_request = true;
        }
        let key = parts.join("/");

        match identifier {
            "put" => {
                if key.is_empty() {
                    log::debug!("Ignoring datastore put without key");
                    return;
                }
                self.handle_mqtt_put(&key, payload_str, inbound).await;
            }
            "get" => {
                if key.is_empty() {
                    log::debug!("Ignoring datastore get without key");
                    return;
                }
                self.handle_mqtt_get(&key, is_request, inbound).await;
            }
            other => log::debug!("Unknown datastore action '{other}'"),
        }
    }

    async fn handle_mqtt_put(&self, key: &str, value: &str, inbound: &InboundMessage) {
        if key.len() > MAX_ENTRY_BYTES || value.len() > MAX_ENTRY_BYTES {
            log::warn!("Datastore payload too large. key={} value={}", key.len(), value.len());
            return;
        }
        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.datastore.insert(key.to_string(), value.to_string());
        }
        self.publish_value(key, value.as_bytes(), Some(inbound), None).await;
    }

    async fn handle_mqtt_get(&self, key: &str, is_request: bool, inbound: &InboundMessage) {
        if key.len() > MAX_ENTRY_BYTES {
            log::warn!("Datastore key too large for GET request ({} bytes)", key.len());
            return;
        }

        let cached = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.datastore.get(key).cloned()
        };
        match cached {
            Some(value) => {
                self.publish_value(key, value.as_bytes(), Some(inbound), None).await;
            }
            None if is_request => {
                self.publish_value(key, b"", Some(inbound), Some("datastore-miss")).await;
            }
            None => log::debug!("Datastore GET for '{key}' has no cached value"),
        }
    }

    async fn publish_value(
        &self,
        key: &str,
        value: &[u8],
        reply: Option<&InboundMessage>,
        error_reason: Option<&str>,
    ) {
        let key_segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = vec!["get"];
        segments.extend(key_segments);
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Datastore,
            &segments,
        );

        let mut message = QueuedPublish::new(topic, value.to_vec())
            .with_content_type("text/plain; charset=utf-8")
            .with_expiry(EXPIRY_DATASTORE)
            .with_user_property("bridge-datastore-key", key);
        if let Some(reason) = error_reason {
            message = message.with_user_property("bridge-error", reason);
        }
        self.ctx.enqueue_mqtt(message, reply).await;
    }
}

/// Parse `key_len:u8 ‖ key ‖ value_len:u8 ‖ value`.
fn parse_put_payload(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let key_len = *payload.first()? as usize;
    let key_end = 1 + key_len;
    let key = payload.get(1..key_end)?;
    let value_len = *payload.get(key_end)? as usize;
    let value_start = key_end + 1;
    let value = payload.get(value_start..value_start + value_len)?;
    let key = std::str::from_utf8(key).ok()?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_vec()))
}

/// Parse `key_len:u8 ‖ key`.
fn parse_get_payload(payload: &[u8]) -> Option<String> {
    let key_len = *payload.first()? as usize;
    let key = payload.get(1..1 + key_len)?;
    let key = std::str::from_utf8(key).ok()?;
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_payload_round_trip() {
        let mut payload = vec![3u8];
        payload.extend_from_slice(b"key");
        payload.push(5);
        payload.extend_from_slice(b"value");
        let (key, value) = parse_put_payload(&payload).unwrap();
        assert_eq!(key, "key");
        assert_eq!(value, b"value");
    }

    #[test]
    fn put_payload_rejects_truncation() {
        assert!(parse_put_payload(&[]).is_none());
        assert!(parse_put_payload(&[3, b'a', b'b']).is_none());
        let mut payload = vec![3u8];
        payload.extend_from_slice(b"key");
        payload.push(9);
        payload.extend_from_slice(b"short");
        assert!(parse_put_payload(&payload).is_none());
    }

    #[test]
    fn put_payload_allows_empty_value() {
        let mut payload = vec![1u8, b'k'];
        payload.push(0);
        let (key, value) = parse_put_payload(&payload).unwrap();
        assert_eq!(key, "k");
        assert!(value.is_empty());
    }

    #[test]
    fn get_payload_parses_key() {
        assert_eq!(parse_get_payload(&[2, b'a', b'b']).unwrap(), "ab");
        assert!(parse_get_payload(&[0]).is_none());
        assert!(parse_get_payload(&[5, b'a']).is_none());
    }
}
