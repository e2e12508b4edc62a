//! The MQTT forwarder. Availability runs once per MQTT client;
//! realtime/telemetry/structure each run once per `(device, mqttClient)`
//! binding, as its own tokio task selecting on cancellation, connection
//! events, and its own ticker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AvailabilityConfig, MqttClientConfig};
use crate::device::SharedDevice;
use crate::filter::Filter;
use crate::mqtt::client::{qos_from_u8, ConnectionEvent, MqttClient};
use crate::mqtt::telemetry::{build_realtime_message, build_structure_message, build_telemetry_message};
use crate::mqtt::topic::TopicContext;
use crate::store::ValueStore;
use crate::value::Value;

fn device_filter(device: &SharedDevice, skip_fields: &HashSet<String>, skip_categories: &HashSet<String>) -> Filter {
    let mut filter = Filter::for_device(device.name());
    for field in skip_fields {
        filter.skip_registers.insert((device.name().to_string(), field.clone()));
    }
    for category in skip_categories {
        filter.skip_categories.insert((device.name().to_string(), category.clone()));
    }
    filter
}

/// Publishes retained `online` whenever the client (re)connects; the
/// connect-time will publishing `offline` is set up once at client
/// construction in [`MqttClient::connect`].
pub async fn run_availability(
    client: Arc<MqttClient>,
    config: AvailabilityConfig,
    qos: u8,
    cancel: CancellationToken,
) {
    if !config.enable {
        return;
    }
    let topic = TopicContext {
        prefix: &client.topic_prefix,
        client_id: &client.client_id,
        device_name: "",
        value_name: None,
        category: None,
    }
    .render(&config.topic);

    let mut events = client.subscribe_events();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::Connected) => {
                        if let Err(err) = client
                            .client
                            .publish(&topic, qos_from_u8(qos), config.retain, "online")
                            .await
                        {
                            warn!(client = %client.name, error = %err, "failed to publish availability online");
                        }
                    }
                    Ok(ConnectionEvent::Disconnected) => {}
                    Err(_) => return,
                }
            }
        }
    }
}

/// Realtime per-change publication, with optional interval coalescing.
pub async fn run_realtime(
    client: Arc<MqttClient>,
    store: ValueStore,
    device: SharedDevice,
    config: crate::config::RealtimeConfig,
    qos: u8,
    skip_fields: HashSet<String>,
    skip_categories: HashSet<String>,
    cancel: CancellationToken,
) {
    if !config.enable {
        return;
    }
    let filter = device_filter(&device, &skip_fields, &skip_categories);
    let mut sub = store.subscribe(filter).await;
    let interval = config.interval();

    let publish_one = |client: Arc<MqttClient>, topic_template: String, qos: u8, retain: bool, value: Value, prefix: String, client_id: String| async move {
        let ctx = TopicContext {
            prefix: &prefix,
            client_id: &client_id,
            device_name: value.device_name(),
            value_name: Some(value.register().name()),
            category: Some(value.register().category()),
        };
        let topic = ctx.render(&topic_template);
        let payload = build_realtime_message(&value, OffsetDateTime::now_utc());
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(err) = client.client.publish(topic, qos_from_u8(qos), retain, bytes).await {
                    warn!(error = %err, "failed to publish realtime value");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize realtime value"),
        }
    };

    if interval.is_zero() {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = sub.recv() => {
                    match received {
                        Some(value) => {
                            publish_one(
                                client.clone(),
                                config.topic.clone(),
                                qos,
                                config.retain,
                                value,
                                client.topic_prefix.clone(),
                                client.client_id.clone(),
                            ).await;
                        }
                        None => return,
                    }
                }
            }
        }
    } else {
        let mut pending: HashMap<String, Value> = HashMap::new();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = sub.recv() => {
                    match received {
                        Some(value) => {
                            pending.insert(value.register().name().to_string(), value);
                        }
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    let batch: Vec<Value> = pending.values().cloned().collect();
                    for value in batch {
                        publish_one(
                            client.clone(),
                            config.topic.clone(),
                            qos,
                            config.retain,
                            value,
                            client.topic_prefix.clone(),
                            client.client_id.clone(),
                        ).await;
                    }
                    if !config.repeat {
                        pending.clear();
                    }
                }
            }
        }
    }
}

/// Periodic telemetry aggregation, skipped while the device is
/// unavailable.
pub async fn run_telemetry(
    client: Arc<MqttClient>,
    store: ValueStore,
    device: SharedDevice,
    config: crate::config::TelemetryConfig,
    qos: u8,
    skip_fields: HashSet<String>,
    skip_categories: HashSet<String>,
    cancel: CancellationToken,
) {
    if !config.enable {
        return;
    }
    let filter = device_filter(&device, &skip_fields, &skip_categories);
    let interval = config.interval();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if !device.is_available() {
                    debug!(device = device.name(), "skipping telemetry tick: device unavailable");
                    continue;
                }
                let snapshot = store.get_slice(filter.clone()).await;
                let now = OffsetDateTime::now_utc();
                let message = build_telemetry_message(device.model(), &snapshot, now, now + interval, None);

                let ctx = TopicContext {
                    prefix: &client.topic_prefix,
                    client_id: &client.client_id,
                    device_name: device.name(),
                    value_name: None,
                    category: None,
                };
                let topic = ctx.render(&config.topic);
                match serde_json::to_vec(&message) {
                    Ok(bytes) => {
                        if let Err(err) = client.client.publish(topic, qos_from_u8(qos), config.retain, bytes).await {
                            warn!(device = device.name(), error = %err, "failed to publish telemetry");
                        }
                    }
                    Err(err) => warn!(device = device.name(), error = %err, "failed to serialize telemetry"),
                }
            }
        }
    }
}

/// Register-catalog publication: once on every broker reconnect, again
/// whenever the device's register catalog changes, and on the configured
/// interval if one is set.
pub async fn run_structure(
    client: Arc<MqttClient>,
    device: SharedDevice,
    config: crate::config::StructureConfig,
    qos: u8,
    cancel: CancellationToken,
) {
    if !config.enable {
        return;
    }

    let publish = |client: Arc<MqttClient>, device: SharedDevice, config: crate::config::StructureConfig, qos: u8| async move {
        let registers = device.register_db().all();
        let message = build_structure_message(device.model(), &registers);
        let ctx = TopicContext {
            prefix: &client.topic_prefix,
            client_id: &client.client_id,
            device_name: device.name(),
            value_name: None,
            category: None,
        };
        let topic = ctx.render(&config.topic);
        match serde_json::to_vec(&message) {
            Ok(bytes) => {
                if let Err(err) = client.client.publish(topic, qos_from_u8(qos), config.retain, bytes).await {
                    warn!(device = device.name(), error = %err, "failed to publish structure");
                }
            }
            Err(err) => warn!(device = device.name(), error = %err, "failed to serialize structure"),
        }
    };

    let mut events = client.subscribe_events();
    let mut changes = device.register_db().subscribe_changes();

    if config.interval_secs == 0 {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(ConnectionEvent::Connected) => publish(client.clone(), device.clone(), config.clone(), qos).await,
                        Ok(ConnectionEvent::Disconnected) => {}
                        Err(_) => return,
                    }
                }
                changed = changes.changed() => {
                    match changed {
                        Ok(()) => publish(client.clone(), device.clone(), config.clone(), qos).await,
                        Err(_) => return,
                    }
                }
            }
        }
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => publish(client.clone(), device.clone(), config.clone(), qos).await,
                changed = changes.changed() => {
                    match changed {
                        Ok(()) => publish(client.clone(), device.clone(), config.clone(), qos).await,
                        Err(_) => return,
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
    use crate::value::{Register, RegisterType};
    use std::collections::BTreeMap as Map;

    fn reg(name: &str) -> Register {
        Register::new("battery", name, "d", RegisterType::Number, "V", 0, false, 0, 1.0, false)
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

    #[test]
    fn device_filter_applies_skip_sets() {
        let db = RegisterDb::new();
        db.add(reg("Voltage"));
        let device: SharedDevice = Arc::new(StubDevice {
            name: "dev1".to_string(),
            register_db: db,
        });

        let mut skip_fields = HashSet::new();
        skip_fields.insert("Voltage".to_string());
        let filter = device_filter(&device, &skip_fields, &HashSet::new());

        let v = Value::numeric_value("dev1", reg("Voltage"), 1.0);
        assert!(!filter.matches(&v));

        let v2 = Value::numeric_value("dev1", reg("Current"), 1.0);
        assert!(filter.matches(&v2));

        let other_device = Value::numeric_value("dev2", reg("Voltage"), 1.0);
        assert!(!filter.matches(&other_device));
        let _ = Map::<i64, String>::new();
    }
}
