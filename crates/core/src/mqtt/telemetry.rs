//! Wire-format payloads for the telemetry, realtime, and structure MQTT
//! message categories. Telemetry buckets values by kind
//! (`NumericValues`/`TextValues`/`EnumValues`), with
//! `SecondsSinceLastUpdate` included only when known.

use std::collections::HashMap;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::value::{Payload, Value};

/// Formats `t` as RFC3339 UTC truncated to millisecond precision.
pub fn format_timestamp(t: OffsetDateTime) -> String {
    let truncated = t.replace_nanosecond((t.nanosecond() / 1_000_000) * 1_000_000).unwrap_or(t);
    truncated.format(&Rfc3339).unwrap_or_else(|_| truncated.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct NumericTelemetryValue {
    #[serde(rename = "Cat")]
    pub category: String,
    #[serde(rename = "Desc")]
    pub description: String,
    #[serde(rename = "Val")]
    pub value: f64,
    #[serde(rename = "Unit", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextTelemetryValue {
    #[serde(rename = "Cat")]
    pub category: String,
    #[serde(rename = "Desc")]
    pub description: String,
    #[serde(rename = "Val")]
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumTelemetryValue {
    #[serde(rename = "Cat")]
    pub category: String,
    #[serde(rename = "Desc")]
    pub description: String,
    #[serde(rename = "Idx")]
    pub idx: i64,
    #[serde(rename = "Val")]
    pub value: String,
}

/// Periodic aggregated snapshot for one device.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMessage {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "NextTelemetry")]
    pub next_telemetry: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "SecondsSinceLastUpdate", skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_update: Option<f64>,
    #[serde(rename = "NumericValues")]
    pub numeric_values: HashMap<String, NumericTelemetryValue>,
    #[serde(rename = "TextValues")]
    pub text_values: HashMap<String, TextTelemetryValue>,
    #[serde(rename = "EnumValues")]
    pub enum_values: HashMap<String, EnumTelemetryValue>,
}

/// Builds a [`TelemetryMessage`] from a device's current filtered
/// snapshot.
pub fn build_telemetry_message(
    model: &str,
    values: &[Value],
    now: OffsetDateTime,
    next_telemetry: OffsetDateTime,
    seconds_since_last_update: Option<f64>,
) -> TelemetryMessage {
    let mut numeric_values = HashMap::new();
    let mut text_values = HashMap::new();
    let mut enum_values = HashMap::new();

    for value in values {
        let register = value.register();
        match value.payload() {
            Payload::Numeric(v) => {
                numeric_values.insert(
                    register.name().to_string(),
                    NumericTelemetryValue {
                        category: register.category().to_string(),
                        description: register.description().to_string(),
                        value: *v,
                        unit: if register.unit().is_empty() {
                            None
                        } else {
                            Some(register.unit().to_string())
                        },
                    },
                );
            }
            Payload::Text(v) => {
                text_values.insert(
                    register.name().to_string(),
                    TextTelemetryValue {
                        category: register.category().to_string(),
                        description: register.description().to_string(),
                        value: v.clone(),
                    },
                );
            }
            Payload::Enum { idx, label } => {
                enum_values.insert(
                    register.name().to_string(),
                    EnumTelemetryValue {
                        category: register.category().to_string(),
                        description: register.description().to_string(),
                        idx: *idx,
                        value: label.clone(),
                    },
                );
            }
            Payload::Null => {}
        }
    }

    TelemetryMessage {
        time: format_timestamp(now),
        next_telemetry: format_timestamp(next_telemetry),
        model: model.to_string(),
        seconds_since_last_update,
        numeric_values,
        text_values,
        enum_values,
    }
}

/// The typed payload of a realtime per-value publication.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RealtimeValue {
    Number(f64),
    Text(String),
    Enum { #[serde(rename = "Idx")] idx: i64, #[serde(rename = "Val")] val: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMessage {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Value")]
    pub value: RealtimeValue,
}

/// Builds the realtime message for a single value.
pub fn build_realtime_message(value: &Value, now: OffsetDateTime) -> RealtimeMessage {
    let rendered = match value.payload() {
        Payload::Numeric(v) => RealtimeValue::Number(*v),
        Payload::Text(v) => RealtimeValue::Text(v.clone()),
        Payload::Enum { idx, label } => RealtimeValue::Enum {
            idx: *idx,
            val: label.clone(),
        },
        Payload::Null => RealtimeValue::Text(String::new()),
    };
    RealtimeMessage {
        time: format_timestamp(now),
        value: rendered,
    }
}

/// One entry of a device's register catalog as published in the
/// structure message.
#[derive(Debug, Clone, Serialize)]
pub struct StructureRegister {
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "Writable")]
    pub writable: bool,
    #[serde(rename = "EnumMap", skip_serializing_if = "HashMap::is_empty")]
    pub enum_map: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructureMessage {
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "Registers")]
    pub registers: Vec<StructureRegister>,
}

pub fn build_structure_message(model: &str, registers: &[crate::value::Register]) -> StructureMessage {
    StructureMessage {
        model: model.to_string(),
        registers: registers
            .iter()
            .map(|r| StructureRegister {
                category: r.category().to_string(),
                name: r.name().to_string(),
                description: r.description().to_string(),
                unit: r.unit().to_string(),
                writable: r.writable(),
                enum_map: r
                    .enum_map()
                    .iter()
                    .map(|(idx, label)| (idx.to_string(), label.clone()))
                    .collect(),
            })
            .collect(),
    }
}
