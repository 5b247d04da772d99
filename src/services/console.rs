//! Console bridging: MCU serial console ↔ MQTT `console/{in,out}`.
//!
//! XOFF/XON from the MCU pause and resume the Linux→MCU direction; paused
//! input accumulates in the bounded console queue and is flushed in 64-byte
//! chunks on resume.

use anyhow::Result;

use super::{BridgeContext, EXPIRY_CONSOLE};
use crate::protocol::{topics, Command, MAX_PAYLOAD_SIZE};

pub struct ConsoleComponent {
    ctx: BridgeContext,
}

impl ConsoleComponent {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx }
    }

    /// `CMD_CONSOLE_WRITE`: publish MCU console output.
    pub async fn handle_write(&self, payload: &[u8]) -> Result<bool> {
        let topic = topics::topic_path(
            &self.ctx.config.mqtt_topic,
            topics::Topic::Console,
            &["out"],
        );
        self.ctx
            .publish(topic, payload.to_vec(), Some(EXPIRY_CONSOLE), &[], None)
            .await;
        Ok(true)
    }

    /// `CMD_XOFF`: MCU buffer pressure, stop sending console data.
    pub async fn handle_xoff(&self) -> Result<bool> {
        log::warn!("MCU > XOFF received, pausing serial output.");
        let mut state = self.ctx.state.lock().expect("state lock poisoned");
        state.mcu_is_paused = true;
        Ok(true)
    }

    /// `CMD_XON`: resume and flush the backlog.
    ///
    /// The flush runs as its own task: it sends tracked frames whose ACKs
    /// arrive through the reader loop this handler is called from.
    pub async fn handle_xon(&self) -> Result<bool> {
        log::info!("MCU > XON received, resuming serial output.");
        {
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            state.mcu_is_paused = false;
        }
        let ctx = self.ctx.clone();
        tokio::spawn(async move { flush_console_queue(&ctx).await });
        Ok(true)
    }

    /// MQTT `console/in`: forward to the MCU in 64-byte frames.
    pub async fn handle_mqtt_input(&self, payload: &[u8]) {
        let chunks: Vec<&[u8]> = payload.chunks(MAX_PAYLOAD_SIZE).collect();

        let paused = {
            let state = self.ctx.state.lock().expect("state lock poisoned");
            state.mcu_is_paused
        };
        if paused {
            log::warn!(
                "MCU paused, queueing {} console chunk(s) ({} bytes)",
                chunks.len(),
                payload.len()
            );
            let mut state = self.ctx.state.lock().expect("state lock poisoned");
            for chunk in chunks {
                state.enqueue_console_chunk(chunk);
            }
            return;
        }

        for (index, chunk) in chunks.iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            let sent = self
                .ctx
                .send_frame(Command::ConsoleWrite.value(), chunk.to_vec())
                .await;
            if !sent {
                let remaining: Vec<u8> = chunks[index..].concat();
                if !remaining.is_empty() {
                    let mut state = self.ctx.state.lock().expect("state lock poisoned");
                    state.enqueue_console_chunk(&remaining);
                }
                log::warn!("Serial send failed for console input; payload queued for retry");
                break;
            }
        }
    }

    /// Drain the console backlog while the MCU accepts data.
    pub async fn flush_queue(&self) {
        flush_console_queue(&self.ctx).await;
    }
}

async fn flush_console_queue(ctx: &BridgeContext) {
    loop {
        let buffered = {
            let mut state = ctx.state.lock().expect("state lock poisoned");
            if state.mcu_is_paused {
                return;
            }
            match state.pop_console_chunk() {
                Some(chunk) => chunk,
                None => return,
            }
        };

        let chunks: Vec<&[u8]> = buffered.chunks(MAX_PAYLOAD_SIZE).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            let sent = ctx.send_frame(Command::ConsoleWrite.value(), chunk.to_vec()).await;
            if !sent {
                let unsent: Vec<u8> = chunks[index..].concat();
                if !unsent.is_empty() {
                    let mut state = ctx.state.lock().expect("state lock poisoned");
                    state.requeue_console_chunk_front(&unsent);
                }
                log::warn!("Serial send failed while flushing console; chunk requeued");
                return;
            }
        }
    }
}
