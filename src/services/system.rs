//! System component: MCU version, free memory and baudrate replies.
//!
//! MQTT `system/{version,free_memory}/get` forwards the request to the MCU;
//! the response serves both the original requester (via reply plumbing) and
//! the broadcast `…/value` topic.

use anyhow::Result;

use super::{BridgeContext, EXPIRY_STATUS};
use crate::mqtt::messages::InboundMessage;
use crate::protocol::{topics, Command};

pub struct SystemComponent {
    ctx: BridgeContext,
}

impl SystemComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// Ask the MCU for its firmware version.
    pub async fn request_mcu_version(&self) -> bool {
        self.ctx.send_frame(Command::GetVersion.value(), Vec::new()).await
    }

    /// `CMD_GET_VERSION_RESP` payload: `major:u8 ‖ minor:u8`.
    pub async fn handle_get_version_resp(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() < 2 {
            log::warn!("Malformed GET_VERSION_RESP payload ({} bytes)", payload.len());
            return Ok(false);
        }
        let version = (payload[0], payload[1]);
        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.mcu_version = Some(version);
        }
        log::info!("MCU firmware version {}.{}", version.0, version.1);
        self.publish_version_value(version, None).await;
        Ok(true)
    }

    /// `CMD_GET_FREE_MEMORY_RESP` payload: `bytes:u32` big-endian.
    pub async fn handle_get_free_memory_resp(&self, payload: &[u8]) -> Result<bool> {
        if payload.len() < 4 {
            log::warn!("Malformed GET_FREE_MEMORY_RESP payload ({} bytes)", payload.len());
            return Ok(false);
        }
        let free = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        log::debug!("MCU free memory: {free} bytes");
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::System,
            &["free_memory", "value"],
        );
        self.ctx
            .publish(topic, free.to_string().into_bytes(), Some(EXPIRY_STATUS), &[], None)
            .await;
        Ok(true)
    }

    /// `CMD_SET_BAUDRATE_RESP`: informational only.
    pub async fn handle_set_baudrate_resp(&self, payload: &[u8]) -> Result<bool> {
        log::info!("MCU acknowledged baudrate change ({} payload bytes)", payload.len());
        Ok(true)
    }

    /// MQTT `system/{version,free_memory}/get`.
    pub async fn handle_mqtt(
        &self,
        identifier: &str,
        remainder: &[String],
        inbound: &InboundMessage,
    ) -> bool {
        let action = remainder.first().map(String::as_str).unwrap_or("");
        match (identifier, action) {
            ("version", "get") => {
                // A cached version answers immediately; the MCU round-trip
                // refreshes the broadcast either way.
                let cached = {
                    let state = self.ctx.state.lock().expect("state lock poisoned");
                    state.mcu_version
                };
                if let Some(version) = cached {
                    self.publish_version_value(version, Some(inbound)).await;
                }
                self.ctx.send_frame(Command::GetVersion.value(), Vec::new()).await;
                true
            }
            ("free_memory", "get") => {
                self.ctx.send_frame(Command::GetFreeMemory.value(), Vec::new()).await;
                true
            }
            _ => false,
        }
    }

    async fn publish_version_value(&self, version: (u8, u8), inbound: Option<&InboundMessage>) {
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::System,
            &["version", "value"],
        );
        let value = format!("{}.{}", version.0, version.1);
        self.ctx
            .publish(topic, value.into_bytes(), Some(EXPIRY_STATUS), &[], inbound)
            .await;
    }
}
