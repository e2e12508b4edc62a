//! Validated configuration view presented to the core. This module only
//! defines the shape the core consumes, deserializable straight off TOML;
//! any outer file-format concerns belong to whatever loads a raw document
//! before handing it here.
//!
//! Concrete device protocol kinds (Victron/Modbus/HTTP-polled/MQTT-sourced)
//! are someone else's concern entirely — only the common fields every
//! device shares are represented here; a device's protocol-specific knobs
//! live with its own implementation, outside this crate.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

fn default_version() -> u32 {
    1
}

fn default_project_title() -> String {
    "go-iotdevice".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_retry_delay_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_max_backlog_size() -> u32 {
    256
}

fn default_telemetry_interval_secs() -> u64 {
    10
}

fn default_restart_interval_secs() -> u64 {
    10
}

fn default_restart_interval_max_backoff_secs() -> u64 {
    600
}

fn bool_true() -> bool {
    true
}

/// Top-level config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_project_title")]
    pub project_title: String,
    #[serde(default)]
    pub log_config: bool,
    #[serde(default)]
    pub log_worker_start: bool,
    #[serde(default)]
    pub log_storage_debug: bool,

    #[serde(default, rename = "MqttClient")]
    pub mqtt_clients: Vec<MqttClientConfig>,
    #[serde(default, rename = "Device")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, rename = "HassDiscovery")]
    pub hass_discovery: Vec<HassDiscoveryConfig>,
}

impl Config {
    /// Parses a TOML document into a `Config`, then validates it.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| anyhow::anyhow!("parsing config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML config file from disk.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {path}: {e}"))?;
        Self::parse(&contents)
    }

    /// Cross-field validation serde's defaults can't express (e.g. a
    /// `MqttClient` without a `broker` set). Config problems are fatal at
    /// startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.version != 1 {
            anyhow::bail!("unsupported config version {}", self.version);
        }
        for client in &self.mqtt_clients {
            if client.broker.is_empty() {
                anyhow::bail!("MqttClient {:?} is missing a broker", client.name);
            }
        }
        Ok(())
    }
}

/// Availability message-category sub-config shared by the forwarder.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_availability_topic")]
    pub topic: String,
    #[serde(default = "bool_true")]
    pub retain: bool,
}

fn default_availability_topic() -> String {
    "%Prefix%tele/%ClientId%/status".to_string()
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            enable: false,
            topic: default_availability_topic(),
            retain: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_structure_topic")]
    pub topic: String,
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default = "bool_true")]
    pub retain: bool,
}

fn default_structure_topic() -> String {
    "%Prefix%tele/go-iotdevice/%DeviceName%/structure".to_string()
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            enable: false,
            topic: default_structure_topic(),
            interval_secs: 0,
            retain: true,
        }
    }
}

impl StructureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_telemetry_topic")]
    pub topic: String,
    #[serde(default = "default_telemetry_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub retain: bool,
}

fn default_telemetry_topic() -> String {
    "%Prefix%tele/go-iotdevice/%DeviceName%/state".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            topic: default_telemetry_topic(),
            interval_secs: default_telemetry_interval_secs(),
            retain: false,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_realtime_topic")]
    pub topic: String,
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default = "bool_true")]
    pub retain: bool,
}

fn default_realtime_topic() -> String {
    "%Prefix%stat/go-iotdevice/%DeviceName%/%ValueName%".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enable: false,
            topic: default_realtime_topic(),
            interval_secs: 0,
            repeat: false,
            retain: true,
        }
    }
}

impl RealtimeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// One configured MQTT broker connection.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttClientConfig {
    pub name: String,
    pub broker: String,
    #[serde(default)]
    pub protocol_version: Option<u8>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_retry_delay_secs")]
    pub connect_retry_delay_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_max_backlog_size")]
    pub max_backlog_size: u32,
    #[serde(default)]
    pub availability: AvailabilityConfig,
    #[serde(default)]
    pub structure: StructureConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub log_debug: bool,
    #[serde(default)]
    pub log_messages: bool,
}

impl MqttClientConfig {
    /// The client id to actually connect with: the configured one, or a
    /// freshly generated v4 UUID.
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Common fields every device kind shares.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub skip_fields: HashSet<String>,
    #[serde(default)]
    pub skip_categories: HashSet<String>,
    #[serde(default)]
    pub telemetry_via_mqtt_clients: Vec<String>,
    #[serde(default)]
    pub realtime_via_mqtt_clients: Vec<String>,
    #[serde(default = "default_restart_interval_secs")]
    pub restart_interval_secs: u64,
    #[serde(default = "default_restart_interval_max_backoff_secs")]
    pub restart_interval_max_backoff_secs: u64,
    #[serde(default)]
    pub log_debug: bool,
    #[serde(default)]
    pub log_com_debug: bool,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skip_fields: HashSet::new(),
            skip_categories: HashSet::new(),
            telemetry_via_mqtt_clients: Vec::new(),
            realtime_via_mqtt_clients: Vec::new(),
            restart_interval_secs: default_restart_interval_secs(),
            restart_interval_max_backoff_secs: default_restart_interval_max_backoff_secs(),
            log_debug: false,
            log_com_debug: false,
        }
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn restart_interval_max_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_interval_max_backoff_secs)
    }

    /// Builds the restart supervisor config this device's restart fields
    /// describe: backoff resets after a run lasting at least one
    /// `restartInterval`.
    pub fn supervisor_config(&self) -> crate::supervisor::SupervisorConfig {
        crate::supervisor::SupervisorConfig {
            initial_backoff: self.restart_interval(),
            max_backoff: self.restart_interval_max_backoff(),
            reset_after: self.restart_interval(),
        }
    }
}

/// Home Assistant discovery matcher config.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HassDiscoveryConfig {
    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default)]
    pub via_mqtt_clients: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub registers: Vec<String>,
}
