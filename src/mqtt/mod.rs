//! MQTT module: client abstraction, topic formatting, and the rust-mqtt
//! session behind the `mqtt` feature.

pub mod client;
pub mod topics;

// Re-exports for cleaner imports from crate::mqtt
pub use client::{Connector, MqQos, MqttPublish, RemoteLink};
pub use topics::Topics;

#[cfg(feature = "mqtt")]
pub use client::{
    BrokerConnector, BrokerSession, BrokerSettings, EmbassyNetTransport, SessionBuffers,
    interpret_reason_code,
};
