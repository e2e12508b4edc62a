//! Per-broker connection manager: owns one `rumqttc` client + event loop
//! task, driven inside a `tokio::select!` alongside a cancellation token.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttClientConfig;

/// Emitted by the connection-manager task whenever the broker connection
/// transitions. Forwarder category tasks subscribe to this to redo
/// connect-time actions: publish retained `online`, re-emit structure,
/// re-run realtime/telemetry immediately on every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

pub(crate) fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// A named, running MQTT client: the `AsyncClient` handle publishers use,
/// plus a connection-event feed.
pub struct MqttClient {
    pub name: String,
    pub client: AsyncClient,
    pub client_id: String,
    pub topic_prefix: String,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl MqttClient {
    /// Builds the client and its event loop from config but does not yet
    /// poll it — call [`MqttClient::spawn_event_loop`] to start the
    /// connection-manager task.
    pub fn connect(config: &MqttClientConfig) -> (Self, EventLoop) {
        let client_id = config.effective_client_id();
        let mut options = parse_broker(&config.broker, &client_id);
        options.set_keep_alive(config.keep_alive());
        options.set_connection_timeout(config.connect_timeout().as_secs());

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options.set_credentials(user, password);
        }

        if config.availability.enable {
            let will_topic = crate::mqtt::topic::TopicContext {
                prefix: &config.topic_prefix,
                client_id: &client_id,
                device_name: "",
                value_name: None,
                category: None,
            }
            .render(&config.availability.topic);
            options.set_last_will(LastWill::new(
                will_topic,
                "offline",
                qos_from_u8(config.qos),
                config.availability.retain,
            ));
        }

        let (client, event_loop) = AsyncClient::new(options, config.max_backlog_size as usize);
        let (events_tx, _rx) = broadcast::channel(16);

        (
            Self {
                name: config.name.clone(),
                client,
                client_id,
                topic_prefix: config.topic_prefix.clone(),
                events_tx,
            },
            event_loop,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// A clone of the sending half, for handing to
    /// [`MqttClient::spawn_event_loop`] without borrowing `self` across
    /// the spawned task's lifetime.
    pub fn events_sender(&self) -> broadcast::Sender<ConnectionEvent> {
        self.events_tx.clone()
    }

    /// Drives `event_loop.poll()` until `cancel` fires, broadcasting
    /// connection transitions. Poll errors are logged and retried after
    /// `retry_delay` — `rumqttc` itself reconnects transparently on the
    /// next successful poll.
    pub async fn spawn_event_loop(
        name: String,
        mut event_loop: EventLoop,
        retry_delay: Duration,
        cancel: CancellationToken,
        events_tx: broadcast::Sender<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(client = %name, "mqtt event loop cancelled");
                    return;
                }
                polled = event_loop.poll() => {
                    match polled {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(client = %name, "mqtt connected");
                            let _ = events_tx.send(ConnectionEvent::Connected);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!(client = %name, "mqtt broker sent disconnect");
                            let _ = events_tx.send(ConnectionEvent::Disconnected);
                        }
                        Ok(Event::Incoming(packet)) => {
                            debug!(client = %name, ?packet, "mqtt incoming");
                        }
                        Ok(Event::Outgoing(_)) => {}
                        Err(err) => {
                            warn!(client = %name, error = %err, "mqtt event loop error, retrying");
                            let _ = events_tx.send(ConnectionEvent::Disconnected);
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(retry_delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Publishes `offline` to the availability topic with a bounded
    /// timeout, then disconnects.
    pub async fn shutdown(&self, availability_topic: Option<&str>, qos: u8, retain: bool) {
        if let Some(topic) = availability_topic {
            let publish = self.client.publish(topic, qos_from_u8(qos), retain, "offline");
            let _ = tokio::time::timeout(Duration::from_secs(1), publish).await;
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), self.client.disconnect()).await;
    }
}

fn parse_broker(broker: &str, client_id: &str) -> MqttOptions {
    let without_scheme = broker.splitn(2, "://").last().unwrap_or(broker);
    let mut parts = without_scheme.rsplitn(2, ':');
    let port = parts
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(1883);
    let host = parts.next().unwrap_or(without_scheme);
    MqttOptions::new(client_id, host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_splits_scheme_host_port() {
        let opts = parse_broker("tcp://localhost:1883", "client-1");
        assert_eq!(opts.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn parse_broker_defaults_port_when_missing() {
        let opts = parse_broker("localhost", "client-1");
        assert_eq!(opts.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn qos_from_u8_maps_known_values() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtLeastOnce);
    }
}
