//! GPIO component: digital/analog writes, reads and pin modes.
//!
//! Reads are asynchronous on the wire: the pending request is enqueued FIFO
//! **before** the read frame is sent (the response may arrive before the
//! send call returns), bounded by `pending_pin_request_limit`. A read
//! response binds to the oldest pending request of the same kind and is
//! published on `<prefix>/<topic>/<pin>/value`.

use anyhow::Result;

use super::{BridgeContext, EXPIRY_PIN};
use crate::mqtt::messages::InboundMessage;
use crate::protocol::{encode_status_reason, topics, Command, Status};
use crate::state::PendingPinRequest;

/// Pin mode values accepted on `d/<pin>/mode`.
const MODE_INPUT: u8 = 0;
const MODE_OUTPUT: u8 = 1;
const MODE_INPUT_PULLUP: u8 = 2;

pub struct PinComponent {
    ctx: BridgeContext,
}

impl PinComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    // ── MCU handlers ──────────────────────────────────────────────────────

    /// `CMD_DIGITAL_READ_RESP` payload: `value:u8`.
    pub async fn handle_digital_read_resp(&self, payload: &[u8]) -> Result<bool> {
        self.handle_pin_read_resp(payload, 1, "DIGITAL_READ_RESP", topics::Topic::Digital)
            .await
    }

    /// `CMD_ANALOG_READ_RESP` payload: `value:u16` big-endian.
    pub async fn handle_analog_read_resp(&self, payload: &[u8]) -> Result<bool> {
        self.handle_pin_read_resp(payload, 2, "ANALOG_READ_RESP", topics::Topic::Analog)
            .await
    }

    async fn handle_pin_read_resp(
        &self,
        payload: &[u8],
        expected_size: usize,
        resp_name: &str,
        topic_type: topics::Topic,
    ) -> Result<bool> {
        if payload.len() != expected_size {
            log::warn!(
                "Malformed {resp_name} payload: expected {expected_size} byte(s), got {}",
                payload.len()
            );
            return Ok(false);
        }
        let value: u16 = if expected_size == 1 {
            u16::from(payload[0])
        } else {
            u16::from_be_bytes([payload[0], payload[1]])
        };

        let request = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            let queue = match topic_type {
                topics::Topic::Digital => &mut state.pending_digital_reads,
                _ => &mut state.pending_analog_reads,
            };
            queue.pop_front()
        };
        if request.is_none() {
            log::warn!("Received {resp_name} without pending request.");
        }

        let pin_label = request
            .as_ref()
            .map(|req| req.pin.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let topic = self.value_topic(topic_type, request.as_ref().map(|req| req.pin));
        self.ctx
            .publish(
                topic,
                value.to_string().into_bytes(),
                Some(EXPIRY_PIN),
                &[("bridge-pin", &pin_label)],
                request.as_ref().and_then(|req| req.reply.as_ref()),
            )
            .await;
        Ok(true)
    }

    /// Reject MCU-initiated Linux pin reads: not a capability of this side.
    pub async fn handle_unexpected_mcu_request(&self, command: Command) -> Result<bool> {
        let detail = match command {
            Command::DigitalRead => "linux_gpio_read_not_available",
            Command::AnalogRead => "linux_adc_read_not_available",
            _ => "pin_request_not_supported",
        };
        let reason = format!("pin-read-origin-mcu:{detail}");
        log::warn!("MCU requested unsupported pin command {command:?}");
        self.ctx
            .send_frame(Status::NotImplemented.value(), encode_status_reason(&reason))
            .await;
        Ok(false)
    }

    // ── MQTT handler ──────────────────────────────────────────────────────

    /// MQTT `d/<pin>[/read|/mode]` and `a/<pin>[/read]`.
    pub async fn handle_mqtt(
        &self,
        route: &topics::TopicRoute,
        payload_str: &str,
        inbound: &InboundMessage,
    ) {
        let Some(pin) = parse_pin_identifier(route.identifier()) else {
            return;
        };

        let subtopic = route.remainder().first().map(String::as_str);
        let is_analog_read =
            route.topic == topics::Topic::Analog && subtopic == Some("read");
        if !self.validate_pin_access(pin, is_analog_read) {
            return;
        }

        match subtopic {
            None => self.handle_write_command(route.topic, pin, payload_str).await,
            Some("read") => self.handle_read_command(route.topic, pin, inbound).await,
            Some("mode") if route.topic == topics::Topic::Digital => {
                self.handle_mode_command(pin, payload_str).await;
            }
            Some(other) => {
                log::debug!("Unknown pin subtopic for {pin}: {other}");
            }
        }
    }

    async fn handle_mode_command(&self, pin: u8, payload_str: &str) {
        let Ok(mode) = payload_str.trim().parse::<u8>() else {
            log::warn!("Invalid mode payload for pin {pin}");
            return;
        };
        if !matches!(mode, MODE_INPUT | MODE_OUTPUT | MODE_INPUT_PULLUP) {
            log::warn!("Invalid digital mode {mode}");
            return;
        }
        self.ctx
            .send_frame(Command::SetPinMode.value(), vec![pin, mode])
            .await;
    }

    async fn handle_read_command(
        &self,
        topic_type: topics::Topic,
        pin: u8,
        inbound: &InboundMessage,
    ) {
        let command = if topic_type == topics::Topic::Digital {
            Command::DigitalRead
        } else {
            Command::AnalogRead
        };

        // Register the pending request before sending: the response can
        // overtake the send call's return.
        let accepted = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            let limit = state.pending_pin_request_limit;
            let queue = match topic_type {
                topics::Topic::Digital => &mut state.pending_digital_reads,
                _ => &mut state.pending_analog_reads,
            };
            if queue.len() >= limit {
                false
            } else {
                queue.push_back(PendingPinRequest { pin, reply: Some(inbound.clone()) });
                true
            }
        };

        if !accepted {
            log::warn!(
                "Pending {} read queue saturated (limit={}); dropping pin {pin}",
                topic_type.as_str(),
                self.ctx.config.pending_pin_request_limit
            );
            let topic = self.value_topic(topic_type, Some(pin));
            self.ctx
                .publish(
                    topic,
                    Vec::new(),
                    Some(EXPIRY_PIN),
                    &[
                        ("bridge-pin", &pin.to_string()),
                        ("bridge-error", "pending-pin-overflow"),
                    ],
                    Some(inbound),
                )
                .await;
            return;
        }

        let sent = self.ctx.send_frame(command.value(), vec![pin]).await;
        if !sent {
            // Remove the request unless the response already consumed it.
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            let queue = match topic_type {
                topics::Topic::Digital => &mut state.pending_digital_reads,
                _ => &mut state.pending_analog_reads,
            };
            if let Some(idx) = queue.iter().position(|req| req.pin == pin) {
                queue.remove(idx);
            }
        }
    }

    async fn handle_write_command(&self, topic_type: topics::Topic, pin: u8, payload_str: &str) {
        let Some(value) = parse_pin_value(topic_type, payload_str) else {
            log::warn!(
                "Invalid pin value topic={}/{pin} payload={payload_str}",
                topic_type.as_str()
            );
            return;
        };

        let command = if topic_type == topics::Topic::Digital {
            Command::DigitalWrite
        } else {
            Command::AnalogWrite
        };
        self.ctx.send_frame(command.value(), vec![pin, value]).await;
    }

    fn value_topic(&self, topic_type: topics::Topic, pin: Option<u8>) -> String {
        let pin_segment = pin.map(|p| p.to_string());
        let mut segments: Vec<&str> = Vec::new();
        if let Some(segment) = &pin_segment {
            segments.push(segment);
        }
        segments.push("value");
        topics::topic_path(&self.ctx.config.mqtt_topic, topic_type, &segments)
    }

    /// Bound pin numbers by the reported capabilities when known.
    fn validate_pin_access(&self, pin: u8, is_analog_input: bool) -> bool {
        let caps = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.mcu_capabilities
        };
        let Some(caps) = caps else { return true };

        let limit = if is_analog_input { caps.num_analog_inputs } else { caps.num_digital_pins };
        if pin >= limit {
            log::warn!("Security block: pin {pin} exceeds hardware limit ({limit}).");
            return false;
        }
        true
    }
}

/// Parse `5` or `A3` into a pin number.
fn parse_pin_identifier(pin_str: &str) -> Option<u8> {
    let digits = pin_str
        .strip_prefix('A')
        .or_else(|| pin_str.strip_prefix('a'))
        .unwrap_or(pin_str);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Validate a write value: digital 0/1, analog 0..=255. Empty means 0.
fn parse_pin_value(topic_type: topics::Topic, payload_str: &str) -> Option<u8> {
    let trimmed = payload_str.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    let value: u16 = trimmed.parse().ok()?;
    match topic_type {
        topics::Topic::Digital if value <= 1 => Some(value as u8),
        topics::Topic::Analog if value <= 255 => Some(value as u8),
        _ => None,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_identifier_forms() {
        assert_eq!(parse_pin_identifier("5"), Some(5));
        assert_eq!(parse_pin_identifier("13"), Some(13));
        assert_eq!(parse_pin_identifier("A3"), Some(3));
        assert_eq!(parse_pin_identifier("a0"), Some(0));
        assert_eq!(parse_pin_identifier("x"), None);
        assert_eq!(parse_pin_identifier(""), None);
        assert_eq!(parse_pin_identifier("-1"), None);
        assert_eq!(parse_pin_identifier("999"), None);
    }

    #[test]
    fn digital_values_are_binary() {
        assert_eq!(parse_pin_value(topics::Topic::Digital, "0"), Some(0));
        assert_eq!(parse_pin_value(topics::Topic::Digital, "1"), Some(1));
        assert_eq!(parse_pin_value(topics::Topic::Digital, "2"), None);
        assert_eq!(parse_pin_value(topics::Topic::Digital, ""), Some(0));
        assert_eq!(parse_pin_value(topics::Topic::Digital, "on"), None);
    }

    #[test]
    fn analog_values_are_byte_range() {
        assert_eq!(parse_pin_value(topics::Topic::Analog, "0"), Some(0));
        assert_eq!(parse_pin_value(topics::Topic::Analog, "255"), Some(255));
        assert_eq!(parse_pin_value(topics::Topic::Analog, "256"), None);
        assert_eq!(parse_pin_value(topics::Topic::Analog, "127"), Some(127));
    }
}
