//! Startup wiring for the gateway: loads config, builds the value store,
//! runs devices under restart supervisors, connects MQTT clients, and
//! binds forwarders and Home Assistant discovery between them. Init
//! tracing, load config, build shared state, spawn long-lived tasks into
//! a join set, wait on the shutdown signal, then tear everything down in
//! order.

mod demo;

use std::sync::Arc;
use std::time::Duration;

use iotdevice_core::config::Config;
use iotdevice_core::device::SharedDevice;
use iotdevice_core::hass::HassDiscovery;
use iotdevice_core::mqtt::client::MqttClient;
use iotdevice_core::mqtt::forwarder;
use iotdevice_core::pool::Pool;
use iotdevice_core::supervisor::RestartSupervisor;
use iotdevice_core::ValueStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_demo_device(config: &iotdevice_core::config::DeviceConfig, store: ValueStore) -> SharedDevice {
    if config.name.to_ascii_lowercase().contains("solar") {
        Arc::new(demo::RandomSolarDevice::new(config.name.clone(), store, DEFAULT_POLL_INTERVAL))
    } else {
        Arc::new(demo::RandomBmvDevice::new(config.name.clone(), store, DEFAULT_POLL_INTERVAL))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = %config_path, error = %err, "no usable config file, running with an empty config");
            Config::parse("version = 1").expect("the empty fallback config is always valid")
        }
    };

    let store = ValueStore::spawn(1024);
    let root_cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let device_pool: Arc<Pool<dyn iotdevice_core::Device>> = Arc::new(Pool::new());
    for device_config in config.devices.clone() {
        let device = build_demo_device(&device_config, store.clone());
        let entry_cancel = device_pool.add(device_config.name.clone(), device.clone());
        let supervisor_config = device_config.supervisor_config();

        tasks.spawn(async move {
            let supervisor = RestartSupervisor::new(supervisor_config);
            supervisor.supervise(device.as_ref(), entry_cancel).await;
        });
    }

    let client_pool: Arc<Pool<MqttClient>> = Arc::new(Pool::new());
    for client_config in config.mqtt_clients.clone() {
        let (client, event_loop) = MqttClient::connect(&client_config);
        let client = Arc::new(client);
        let entry_cancel = client_pool.add(client_config.name.clone(), client.clone());

        let events_tx = client.events_sender();
        let retry_delay = client_config.connect_retry_delay();
        tasks.spawn(MqttClient::spawn_event_loop(
            client_config.name.clone(),
            event_loop,
            retry_delay,
            entry_cancel.clone(),
            events_tx,
        ));

        if client_config.availability.enable {
            tasks.spawn(forwarder::run_availability(
                client.clone(),
                client_config.availability.clone(),
                client_config.qos,
                entry_cancel.clone(),
            ));
        }

        for device_config in &config.devices {
            let Some(device) = device_pool.get(&device_config.name) else {
                continue;
            };

            if device_config.realtime_via_mqtt_clients.iter().any(|c| c == &client_config.name) {
                tasks.spawn(forwarder::run_realtime(
                    client.clone(),
                    store.clone(),
                    device.clone(),
                    client_config.realtime.clone(),
                    client_config.qos,
                    device_config.skip_fields.clone(),
                    device_config.skip_categories.clone(),
                    entry_cancel.clone(),
                ));
            }

            if device_config.telemetry_via_mqtt_clients.iter().any(|c| c == &client_config.name) {
                tasks.spawn(forwarder::run_telemetry(
                    client.clone(),
                    store.clone(),
                    device.clone(),
                    client_config.telemetry.clone(),
                    client_config.qos,
                    device_config.skip_fields.clone(),
                    device_config.skip_categories.clone(),
                    entry_cancel.clone(),
                ));
            }

            tasks.spawn(forwarder::run_structure(
                client.clone(),
                device.clone(),
                client_config.structure.clone(),
                client_config.qos,
                entry_cancel.clone(),
            ));
        }

        for hass_config in &config.hass_discovery {
            if !hass_config.via_mqtt_clients.is_empty()
                && !hass_config.via_mqtt_clients.iter().any(|c| c == &client_config.name)
            {
                continue;
            }
            let discovery = match HassDiscovery::new(hass_config.clone()) {
                Ok(d) => Arc::new(d),
                Err(err) => {
                    warn!(error = %err, "invalid HassDiscovery config, skipping");
                    continue;
                }
            };
            let devices: Vec<SharedDevice> = device_pool.iterate().into_iter().map(|(_, d)| d).collect();
            tasks.spawn(iotdevice_core::hass::run(
                discovery,
                client.clone(),
                devices,
                client_config.realtime.topic.clone(),
                client_config.qos,
                entry_cancel.clone(),
            ));
        }
    }

    info!(
        devices = device_pool.len(),
        mqtt_clients = client_pool.len(),
        "gateway started"
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    root_cancel.cancel();
    device_pool.shutdown();
    client_pool.shutdown();

    for (name, client) in client_pool.iterate() {
        let client_config = config.mqtt_clients.iter().find(|c| c.name == name);
        let availability_topic = client_config.filter(|c| c.availability.enable).map(|c| {
            iotdevice_core::mqtt::topic::TopicContext {
                prefix: &client.topic_prefix,
                client_id: &client.client_id,
                device_name: "",
                value_name: None,
                category: None,
            }
            .render(&c.availability.topic)
        });
        let qos = client_config.map(|c| c.qos).unwrap_or(1);
        let retain = client_config.map(|c| c.availability.retain).unwrap_or(true);
        client.shutdown(availability_topic.as_deref(), qos, retain).await;
    }

    store.shutdown().await;

    while tasks.join_next().await.is_some() {}

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
