//! Home Assistant MQTT discovery: publishes retained discovery config
//! messages for the registers a [`HassDiscoveryConfig`] selects, re-emitted
//! on every broker reconnect.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::HassDiscoveryConfig;
use crate::device::SharedDevice;
use crate::mqtt::client::{qos_from_u8, ConnectionEvent, MqttClient};
use crate::value::Register;

/// Compiled form of a [`HassDiscoveryConfig`]; regexes are compiled once
/// at construction rather than per-register-match.
pub struct HassDiscovery {
    config: HassDiscoveryConfig,
    category_patterns: Vec<Regex>,
    register_patterns: Vec<Regex>,
}

impl HassDiscovery {
    pub fn new(config: HassDiscoveryConfig) -> anyhow::Result<Self> {
        let category_patterns = config
            .categories
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("invalid HassDiscovery category pattern: {e}"))?;
        let register_patterns = config
            .registers
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("invalid HassDiscovery register pattern: {e}"))?;
        Ok(Self {
            config,
            category_patterns,
            register_patterns,
        })
    }

    pub fn applies_to_client(&self, client_name: &str) -> bool {
        self.config.via_mqtt_clients.is_empty()
            || self.config.via_mqtt_clients.iter().any(|c| c == client_name)
    }

    fn matches_device(&self, device_name: &str) -> bool {
        self.config.devices.is_empty() || self.config.devices.iter().any(|d| d == device_name)
    }

    fn matches_register(&self, register: &Register) -> bool {
        let category_ok = self.category_patterns.is_empty()
            || self.category_patterns.iter().any(|p| p.is_match(register.category()));
        let register_ok = self.register_patterns.is_empty()
            || self.register_patterns.iter().any(|p| p.is_match(register.name()));
        category_ok && register_ok
    }

    /// Every `(device, register)` pair this config selects, given a
    /// device's current catalog.
    pub fn matching_registers(&self, device: &SharedDevice) -> Vec<Register> {
        if !self.matches_device(device.name()) {
            return Vec::new();
        }
        device
            .register_db()
            .all()
            .into_iter()
            .filter(|r| self.matches_register(r))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
struct DiscoveryDevice {
    identifiers: Vec<String>,
    name: String,
    model: String,
}

#[derive(Debug, Clone, Serialize)]
struct DiscoveryPayload {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>,
    device: DiscoveryDevice,
}

fn discovery_topic(topic_prefix: &str, device_name: &str, register_name: &str) -> String {
    format!("{topic_prefix}/sensor/{device_name}_{register_name}/config")
}

fn build_payload(device: &SharedDevice, register: &Register, state_topic: String) -> DiscoveryPayload {
    DiscoveryPayload {
        name: format!("{} {}", device.name(), register.name()),
        unique_id: format!("{}_{}", device.name(), register.name()),
        value_template: Some("{{ value_json.Value }}".to_string()),
        unit_of_measurement: if register.unit().is_empty() {
            None
        } else {
            Some(register.unit().to_string())
        },
        state_topic,
        device: DiscoveryDevice {
            identifiers: vec![device.name().to_string()],
            name: device.name().to_string(),
            model: device.model().to_string(),
        },
    }
}

/// Publishes discovery messages for every matching `(device, register)`
/// pair, retained, on `client`'s discovery topic. Re-emits on every
/// reconnect.
pub async fn run(
    discovery: Arc<HassDiscovery>,
    client: Arc<MqttClient>,
    devices: Vec<SharedDevice>,
    state_topic_template: String,
    qos: u8,
    cancel: CancellationToken,
) {
    let publish_all = |client: Arc<MqttClient>, devices: &[SharedDevice]| {
        let discovery = discovery.clone();
        let state_topic_template = state_topic_template.clone();
        let devices: Vec<SharedDevice> = devices.to_vec();
        async move {
            for device in &devices {
                for register in discovery.matching_registers(device) {
                    let state_topic = crate::mqtt::topic::TopicContext {
                        prefix: &client.topic_prefix,
                        client_id: &client.client_id,
                        device_name: device.name(),
                        value_name: Some(register.name()),
                        category: Some(register.category()),
                    }
                    .render(&state_topic_template);

                    let payload = build_payload(device, &register, state_topic);
                    let topic = discovery_topic(&discovery.config.topic_prefix, device.name(), register.name());
                    match serde_json::to_vec(&payload) {
                        Ok(bytes) => {
                            if let Err(err) = client.client.publish(topic, qos_from_u8(qos), true, bytes).await {
                                warn!(device = device.name(), error = %err, "failed to publish hass discovery");
                            }
                        }
                        Err(err) => warn!(device = device.name(), error = %err, "failed to serialize hass discovery"),
                    }
                }
            }
        }
    };

    let mut events = client.subscribe_events();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::Connected) => publish_all(client.clone(), &devices).await,
                    Ok(ConnectionEvent::Disconnected) => {}
                    Err(_) => return,
                }
            }
        }
    }
}

/// Watches a device's availability transitions as a (weak) proxy for
/// catalog-change re-emission: in practice a device's register catalog is
/// settled before it first reports available, so re-running discovery on
/// every availability flip keeps discovery current without the store
/// needing a dedicated catalog-change event.
pub async fn rerun_on_availability_change(
    discovery: Arc<HassDiscovery>,
    client: Arc<MqttClient>,
    device: SharedDevice,
    state_topic_template: String,
    qos: u8,
    cancel: CancellationToken,
) {
    let mut avail = device.subscribe_available();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = avail.recv() => {
                if event.is_err() {
                    return;
                }
                for register in discovery.matching_registers(&device) {
                    let state_topic = crate::mqtt::topic::TopicContext {
                        prefix: &client.topic_prefix,
                        client_id: &client.client_id,
                        device_name: device.name(),
                        value_name: Some(register.name()),
                        category: Some(register.category()),
                    }
                    .render(&state_topic_template);
                    let payload = build_payload(&device, &register, state_topic);
                    let topic = discovery_topic(&discovery.config.topic_prefix, device.name(), register.name());
                    if let Ok(bytes) = serde_json::to_vec(&payload) {
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            client.client.publish(topic, qos_from_u8(qos), true, bytes),
                        )
                        .await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_db::RegisterDb;
    use crate::value::RegisterType;

    fn reg(category: &str, name: &str) -> Register {
        Register::new(category, name, "d", RegisterType::Number, "V", 0, false, 0, 1.0, false)
    }

    struct StubDevice {
        name: String,
        register_db: RegisterDb,
    }

    #[async_trait::async_trait]
    impl crate::device::Device for StubDevice {
        fn name(&self) -> &str {
            &self.name
        }
        fn model(&self) -> &str {
            "stub"
        }
        fn register_db(&self) -> &RegisterDb {
            &self.register_db
        }
        fn is_available(&self) -> bool {
            true
        }
        fn subscribe_available(&self) -> tokio::sync::broadcast::Receiver<bool> {
            tokio::sync::broadcast::channel(1).1
        }
        async fn run(&self, _cancel: CancellationToken) -> crate::device::RunOutcome {
            crate::device::RunOutcome::ok()
        }
    }

    fn device_with(registers: &[Register]) -> SharedDevice {
        let db = RegisterDb::new();
        db.add_all(registers.iter().cloned());
        Arc::new(StubDevice {
            name: "dev1".to_string(),
            register_db: db,
        })
    }

    #[test]
    fn empty_matchers_select_everything() {
        let discovery = HassDiscovery::new(HassDiscoveryConfig::default()).unwrap();
        let device = device_with(&[reg("battery", "Voltage")]);
        assert_eq!(discovery.matching_registers(&device).len(), 1);
    }

    #[test]
    fn device_list_restricts_selection() {
        let mut config = HassDiscoveryConfig::default();
        config.devices = vec!["other".to_string()];
        let discovery = HassDiscovery::new(config).unwrap();
        let device = device_with(&[reg("battery", "Voltage")]);
        assert!(discovery.matching_registers(&device).is_empty());
    }

    #[test]
    fn category_regex_restricts_selection() {
        let mut config = HassDiscoveryConfig::default();
        config.categories = vec!["^battery$".to_string()];
        let discovery = HassDiscovery::new(config).unwrap();
        let device = device_with(&[reg("battery", "Voltage"), reg("solar", "Power")]);
        let matched = discovery.matching_registers(&device);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].category(), "battery");
    }

    #[test]
    fn register_regex_and_category_regex_combine_with_and() {
        let mut config = HassDiscoveryConfig::default();
        config.categories = vec!["battery".to_string()];
        config.registers = vec!["^Volt".to_string()];
        let discovery = HassDiscovery::new(config).unwrap();
        let device = device_with(&[reg("battery", "Voltage"), reg("battery", "Current")]);
        let matched = discovery.matching_registers(&device);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "Voltage");
    }

    #[test]
    fn applies_to_client_empty_means_all() {
        let discovery = HassDiscovery::new(HassDiscoveryConfig::default()).unwrap();
        assert!(discovery.applies_to_client("anything"));
    }

    #[test]
    fn applies_to_client_restricts_by_name() {
        let mut config = HassDiscoveryConfig::default();
        config.via_mqtt_clients = vec!["primary".to_string()];
        let discovery = HassDiscovery::new(config).unwrap();
        assert!(discovery.applies_to_client("primary"));
        assert!(!discovery.applies_to_client("secondary"));
    }
}
