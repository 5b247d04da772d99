//! Frame and topic dispatch.
//!
//! MCU → Linux: frames pass a pre-sync firewall (only status frames and the
//! link bring-up responses before synchronization), then route by command id
//! to the owning component. Unknown request ids are answered with
//! `NOT_IMPLEMENTED`; handler errors are contained, logged and answered with
//! `ERROR` when the id was a request. Successful handling of a non-status id
//! is acknowledged with `STATUS_ACK` echoing the id.
//!
//! MQTT → Linux: the topic is parsed against the configured prefix, the
//! first segment selects a component, and the per-(topic, action)
//! authorization table gates every side effect before dispatch.

use anyhow::Result;

use super::BridgeService;
use crate::mqtt::messages::InboundMessage;
use crate::protocol::{self, topics, Command, Status};

/// Route one MCU frame to its handler.
pub async fn dispatch_mcu_frame(service: &BridgeService, command_id: u16, payload: &[u8]) {
    if !service.is_link_synchronized() && !super::is_frame_allowed_pre_sync(command_id) {
        // Do not reply while unsynchronized: a response here can create a
        // feedback loop that floods the link and corrupts frames.
        log::warn!("Security: rejecting MCU frame 0x{command_id:02X} (link not synchronized)");
        return;
    }

    let command_name = protocol::command_name(command_id);

    if let Some(status) = Status::from_value(command_id) {
        if status == Status::Ack {
            // Correlation already happened in the flow controller.
            if payload.len() >= 2 {
                let target = u16::from_be_bytes([payload[0], payload[1]]);
                log::debug!("MCU > ACK received for 0x{target:02X}");
            } else {
                log::debug!("MCU > ACK received");
            }
            return;
        }
        service.handle_status(status, payload).await;
        return;
    }

    let Some(command) = Command::from_value(command_id) else {
        log::warn!("Protocol: unhandled MCU command {command_name} (no handler registered)");
        if protocol::response_to_request(command_id).is_none() {
            service.context().raw_send(Status::NotImplemented.value(), Vec::new()).await;
        }
        return;
    };

    log::debug!("MCU > {command_name} [{} bytes]", payload.len());

    let outcome = run_handler(service, command, payload).await;
    let handled = match outcome {
        Ok(handled) => handled,
        Err(err) => {
            log::error!("Critical: exception in handler for command {command_name}: {err:#}");
            if protocol::response_to_request(command_id).is_none() {
                service
                    .context()
                    .raw_send(Status::Error.value(), b"Internal Error".to_vec())
                    .await;
            }
            false
        }
    };

    if handled {
        service.context().acknowledge_frame(command_id, Status::Ack, &[]).await;
    }
}

/// Execute the component handler for `command`.
///
/// Returns `Ok(true)` when the frame deserves the implicit `STATUS_ACK`.
async fn run_handler(service: &BridgeService, command: Command, payload: &[u8]) -> Result<bool> {
    match command {
        // Console
        Command::ConsoleWrite => service.console.handle_write(payload).await,
        Command::Xoff => service.console.handle_xoff().await,
        Command::Xon => service.console.handle_xon().await,

        // Datastore
        Command::DatastorePut => service.datastore.handle_put(payload).await,
        Command::DatastoreGet => service.datastore.handle_get_request(payload).await,

        // Mailbox
        Command::MailboxPush => service.mailbox.handle_push(payload).await,
        Command::MailboxAvailable => service.mailbox.handle_available(payload).await,
        Command::MailboxRead => service.mailbox.handle_read(payload).await,
        Command::MailboxProcessed => service.mailbox.handle_processed(payload).await,

        // File
        Command::FileWrite => service.file.handle_write(payload).await,
        Command::FileRead => service.file.handle_read(payload).await,
        Command::FileRemove => service.file.handle_remove(payload).await,

        // Process
        Command::ProcessRun => service.process.handle_run(payload).await,
        Command::ProcessRunAsync => service.process.handle_run_async(payload).await,
        Command::ProcessPoll => service.process.handle_poll(payload).await,
        Command::ProcessKill => service.process.handle_kill(payload).await,

        // Pins: responses bind to pending requests; MCU-initiated reads of
        // Linux pins are not a capability this bridge offers.
        Command::DigitalReadResp => service.pin.handle_digital_read_resp(payload).await,
        Command::AnalogReadResp => service.pin.handle_analog_read_resp(payload).await,
        Command::DigitalRead => {
            service.pin.handle_unexpected_mcu_request(Command::DigitalRead).await
        }
        Command::AnalogRead => {
            service.pin.handle_unexpected_mcu_request(Command::AnalogRead).await
        }

        // System
        Command::GetVersionResp => service.system.handle_get_version_resp(payload).await,
        Command::GetFreeMemoryResp => service.system.handle_get_free_memory_resp(payload).await,
        Command::SetBaudrateResp => service.system.handle_set_baudrate_resp(payload).await,

        // Handshake
        Command::LinkSyncResp => {
            let handled = service.handshake.handle_link_sync_resp(payload).await;
            Ok(handled)
        }
        Command::LinkResetResp => {
            service.handshake.handle_link_reset_resp(payload);
            Ok(true)
        }
        Command::GetCapabilitiesResp => {
            service.handshake.handle_capabilities_resp(payload);
            Ok(true)
        }

        // Requests the Linux side never receives (it is the one sending
        // them); ignore orphaned responses, refuse the rest.
        Command::GetVersion
        | Command::GetFreeMemory
        | Command::GetCapabilities
        | Command::LinkSync
        | Command::LinkReset
        | Command::SetBaudrate
        | Command::SetPinMode
        | Command::DigitalWrite
        | Command::AnalogWrite => {
            log::warn!(
                "Protocol: unhandled MCU command {} (no handler registered)",
                protocol::command_name(command.value())
            );
            service.context().raw_send(Status::NotImplemented.value(), Vec::new()).await;
            Ok(false)
        }
        Command::DatastoreGetResp
        | Command::MailboxReadResp
        | Command::MailboxAvailableResp
        | Command::FileReadResp
        | Command::ProcessRunResp
        | Command::ProcessRunAsyncResp
        | Command::ProcessPollResp => {
            log::debug!(
                "Protocol: ignoring orphaned MCU response {}",
                protocol::command_name(command.value())
            );
            Ok(false)
        }
    }
}

/// Route one inbound MQTT message.
pub async fn dispatch_mqtt_message(service: &BridgeService, inbound: &InboundMessage) {
    let Some(route) = topics::parse_topic(&service.config.mqtt_topic, &inbound.topic) else {
        log::debug!("Ignoring MQTT message with unexpected prefix: {}", inbound.topic);
        return;
    };
    if route.segments.is_empty() {
        log::debug!("MQTT topic missing identifier: {}", inbound.topic);
        return;
    }

    let handled = match route.topic {
        topics::Topic::Console => handle_console_topic(service, &route, inbound).await,
        topics::Topic::Datastore => handle_datastore_topic(service, &route, inbound).await,
        topics::Topic::Mailbox => handle_mailbox_topic(service, &route, inbound).await,
        topics::Topic::Shell => handle_shell_topic(service, &route, inbound).await,
        topics::Topic::Digital | topics::Topic::Analog => {
            handle_pin_topic(service, &route, inbound).await
        }
        topics::Topic::File => handle_file_topic(service, &route, inbound).await,
        topics::Topic::System => handle_system_topic(service, &route, inbound).await,
    };

    match handled {
        Err(err) => log::error!("Error processing MQTT topic {}: {err:#}", inbound.topic),
        Ok(false) => log::debug!("Unhandled MQTT topic {}", inbound.topic),
        Ok(true) => {}
    }
}

async fn handle_console_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    if route.identifier() != "in" {
        return Ok(false);
    }
    let action = route.identifier();
    if !service.is_topic_action_allowed(topics::Topic::Console, action) {
        service.reject_topic_action(inbound, topics::Topic::Console, action).await;
        return Ok(true);
    }
    service.console.handle_mqtt_input(&inbound.payload).await;
    Ok(true)
}

async fn handle_datastore_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    let identifier = route.identifier().to_string();
    if identifier.is_empty() {
        return Ok(false);
    }
    if !service.is_topic_action_allowed(topics::Topic::Datastore, &identifier) {
        service.reject_topic_action(inbound, topics::Topic::Datastore, &identifier).await;
        return Ok(true);
    }
    service
        .datastore
        .handle_mqtt(&identifier, route.remainder(), &inbound.payload_str(), inbound)
        .await;
    Ok(true)
}

async fn handle_mailbox_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    let identifier = route.identifier().to_string();
    if !identifier.is_empty()
        && !service.is_topic_action_allowed(topics::Topic::Mailbox, &identifier)
    {
        service.reject_topic_action(inbound, topics::Topic::Mailbox, &identifier).await;
        return Ok(true);
    }
    service.mailbox.handle_mqtt(&identifier, &inbound.payload, inbound).await;
    Ok(true)
}

async fn handle_shell_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    let identifier = route.identifier().to_string();
    if !identifier.is_empty()
        && !service.is_topic_action_allowed(topics::Topic::Shell, &identifier)
    {
        service.reject_topic_action(inbound, topics::Topic::Shell, &identifier).await;
        return Ok(true);
    }
    service.shell.handle_mqtt(&identifier, route.remainder(), &inbound.payload, inbound).await;
    Ok(true)
}

async fn handle_pin_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    let action = pin_action_for_route(route);
    if let Some(action) = &action {
        if !service.is_topic_action_allowed(route.topic, action) {
            service.reject_topic_action(inbound, route.topic, action).await;
            return Ok(true);
        }
    }
    service.pin.handle_mqtt(route, &inbound.payload_str(), inbound).await;
    Ok(true)
}

/// Derive the authorization action from a pin topic shape.
///
/// `d/<pin>` is a write; `d/<pin>/<sub>` uses the subtopic.
fn pin_action_for_route(route: &topics::TopicRoute) -> Option<String> {
    match route.segments.len() {
        0 => None,
        1 => Some("write".to_string()),
        _ => {
            let sub = route.segments[1].trim().to_lowercase();
            if sub.is_empty() {
                None
            } else {
                Some(sub)
            }
        }
    }
}

async fn handle_file_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    if route.segments.len() < 2 {
        return Ok(false);
    }
    let identifier = route.identifier().to_string();
    if !service.is_topic_action_allowed(topics::Topic::File, &identifier) {
        service.reject_topic_action(inbound, topics::Topic::File, &identifier).await;
        return Ok(true);
    }
    service.file.handle_mqtt(&identifier, route.remainder(), &inbound.payload, inbound).await;
    Ok(true)
}

async fn handle_system_topic(
    service: &BridgeService,
    route: &topics::TopicRoute,
    inbound: &InboundMessage,
) -> Result<bool> {
    if route.identifier() == "bridge" {
        let remainder = route.remainder();
        let category = remainder.first().map(String::as_str).unwrap_or("");
        let action = remainder.get(1).map(String::as_str).unwrap_or("");
        match (category, action) {
            ("handshake", "get") => {
                service.publish_bridge_snapshot("handshake", Some(inbound)).await;
                return Ok(true);
            }
            ("summary" | "state", "get") => {
                service.publish_bridge_snapshot("summary", Some(inbound)).await;
                return Ok(true);
            }
            _ => {}
        }
    }
    let handled = service
        .system
        .handle_mqtt(route.identifier(), route.remainder(), inbound)
        .await;
    Ok(handled)
}
