//! MQTT publish pipeline: envelope types, bounded queue, durable spool and
//! the broker client tasks.

pub mod client;
pub mod messages;
pub mod queue;
pub mod spool;
