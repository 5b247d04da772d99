// Library modules
pub mod config;
pub mod handshake;
pub mod mqtt;
pub mod policy;
pub mod protocol;
pub mod security;
pub mod serial;
pub mod services;
pub mod state;

// Re-export commonly used types
pub use config::Config;
pub use mqtt::messages::{InboundMessage, QueuedPublish};
pub use mqtt::queue::PublishQueue;
pub use mqtt::spool::MqttPublishSpool;
pub use protocol::{Command, Status};
pub use serial::flow::{FrameSink, SerialFlowController};
pub use services::{BridgeContext, BridgeService};
pub use state::{RuntimeState, SharedState};
