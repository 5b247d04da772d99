//! Mailbox message passing between MCU and MQTT clients.
//!
//! Two bounded queues: **incoming** (MCU→Linux, filled by `MAILBOX_PUSH`)
//! and **outgoing** (Linux→MCU, filled by MQTT `mailbox/write`, drained by
//! `MAILBOX_READ`). Depth changes are announced on the
//! `{incoming,outgoing}_available` topics.

use anyhow::Result;

use super::BridgeContext;
use crate::mqtt::messages::{InboundMessage, QueuedPublish};
use crate::protocol::{
    encode_status_reason, topics, Command, Status, MAX_PAYLOAD_SIZE,
    STATUS_REASON_MAILBOX_INCOMING_OVERFLOW,
};

pub struct MailboxComponent {
    ctx: BridgeContext,
}

impl MailboxComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// `CMD_MAILBOX_PUSH` payload: `len:u16 ‖ message`.
    pub async fn handle_push(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() < 2 {
            log::warn!("Malformed MAILBOX_PUSH payload ({} bytes)", payload.len());
            return Ok(false);
        }
        let msg_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let Some(data) = payload.get(2..2 + msg_len) else {
            log::warn!(
                "MAILBOX_PUSH length mismatch. Expected {msg_len} bytes, got {}.",
                payload.len() - 2
            );
            return Ok(false);
        };

        let stored = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.enqueue_mailbox_incoming(data)
        };
        if !stored {
            log::error!(
                "Dropping incoming mailbox message ({} bytes) due to queue limits.",
                data.len()
            );
            self.ctx
                .send_frame(
                    Status::Error.value(),
                    encode_status_reason(STATUS_REASON_MAILBOX_INCOMING_OVERFLOW),
                )
                .await;
            return Ok(false);
        }

        let incoming_topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Mailbox,
            &["incoming"],
        );
        self.ctx
            .enqueue_mqtt(QueuedPublish::new(incoming_topic, data.to_vec()), None)
            .await;
        self.publish_incoming_available().await;
        Ok(true)
    }

    /// `CMD_MAILBOX_AVAILABLE`: reply with the outgoing queue depth.
    pub async fn handle_available(&self, _payload: &[u8]) -> Result<bool> {
        let depth = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.mailbox_queue.len().min(255) as u8
        };
        self.ctx
            .send_frame(Command::MailboxAvailableResp.value(), vec![depth])
            .await;
        Ok(true)
    }

    /// `CMD_MAILBOX_READ`: pop one outgoing message for the MCU.
    pub async fn handle_read(&self, _payload: &[u8]) -> Result<bool> {
        let original = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.pop_mailbox_message()
        };
        let mut message = original.clone().unwrap_or_default();

        if message.len() > MAX_PAYLOAD_SIZE - 2 {
            log::warn!("Mailbox message too long ({} bytes), truncating.", message.len());
            message.truncate(MAX_PAYLOAD_SIZE - 2);
        }

        let mut response = (message.len() as u16).to_be_bytes().to_vec();
        response.extend_from_slice(&message);
        let sent = self.ctx.send_frame(Command::MailboxReadResp.value(), response).await;

        if !sent {
            if let Some(original) = original {
                let mut state = self.ctx.state.lock().expect("state lock poisoned");
                state.requeue_mailbox_message_front(&original);
            }
            return Ok(false);
        }

        self.publish_outgoing_available().await;
        Ok(true)
    }

    /// `CMD_MAILBOX_PROCESSED` payload: optional `message_id:u16`.
    pub async fn handle_processed(&self, payload: &[u8]) -> Result<bool> {
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Mailbox,
            &["processed"],
        );
        let body = if payload.len() >= 2 {
            let message_id = u16::from_be_bytes([payload[0], payload[1]]);
            serde_json::to_vec(&serde_json::json!({ "message_id": message_id }))
                .unwrap_or_default()
        } else {
            payload.to_vec()
        };
        self.ctx.enqueue_mqtt(QueuedPublish::new(topic, body), None).await;
        Ok(true)
    }

    /// MQTT `mailbox/{write,read}`.
    pub async fn handle_mqtt(&self, identifier: &str, payload: &[u8], inbound: &InboundMessage) {
        match identifier {
            "write" => self.handle_mqtt_write(payload).await,
            "read" => self.handle_mqtt_read(inbound).await,
            other => log::debug!("Unknown mailbox action '{other}'"),
        }
    }

    async fn handle_mqtt_write(&self, payload: &[u8]) {
        let (stored, depth) = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            let stored = state.enqueue_mailbox_message(payload);
            (stored, state.mailbox_queue.len())
        };
        if !stored {
            log::error!(
                "Failed to enqueue MQTT mailbox payload ({} bytes); queue full.",
                payload.len()
            );
            return;
        }
        log::info!("Added message to mailbox queue. Size={depth}");
        self.publish_outgoing_available().await;
    }

    /// MQTT `mailbox/read`: pop incoming if any, else outgoing.
    async fn handle_mqtt_read(&self, inbound: &InboundMessage) {
        let incoming_topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Mailbox,
            &["incoming"],
        );

        let from_incoming = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.pop_mailbox_incoming()
        };
        if let Some(message) = from_incoming {
            self.ctx
                .enqueue_mqtt(QueuedPublish::new(incoming_topic, message), Some(inbound))
                .await;
            self.publish_incoming_available().await;
            return;
        }

        let from_outgoing = {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.pop_mailbox_message()
        };
        let Some(message) = from_outgoing else { return };
        self.ctx
            .enqueue_mqtt(QueuedPublish::new(incoming_topic, message), Some(inbound))
            .await;
        self.publish_outgoing_available().await;
    }

    async fn publish_incoming_available(&self) {
        let depth = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.mailbox_incoming_queue.len()
        };
        let topic = topics::mailbox_incoming_available_topic(&self.ctx.config.mqtt_topic);
        self.ctx
            .enqueue_mqtt(QueuedPublish::new(topic, depth.to_string().into_bytes()), None)
            .await;
    }

    async fn publish_outgoing_available(&self) {
        let depth = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.mailbox_queue.len()
        };
        let topic = topics::mailbox_outgoing_available_topic(&self.ctx.config.mqtt_topic);
        self.ctx
            .enqueue_mqtt(QueuedPublish::new(topic, depth.to_string().into_bytes()), None)
            .await;
    }
}
