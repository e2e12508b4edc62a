//! MQTT client wrapper and forwarder.

pub mod client;
pub mod forwarder;
pub mod telemetry;
pub mod topic;

pub use client::{ConnectionEvent, MqttClient};
