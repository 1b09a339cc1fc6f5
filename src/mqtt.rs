use anyhow::{bail, Context, Result};
use canbms_lib::publisher::{Publish, Topics};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Requests the client buffers for the event loop before `try_publish` fails.
const REQUEST_CAPACITY: usize = 64;

#[derive(Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
    #[serde(default)]
    topics: Topics,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("qos", &self.qos)
            .field("client_id", &self.client_id)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distr::Alphanumeric;
        use rand::Rng;

        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("canbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.qos()?;
        if self.keep_alive_interval < Duration::from_secs(5) {
            bail!(
                "keep_alive_interval must be at least 5s, got {:?}",
                self.keep_alive_interval
            );
        }
        Ok(())
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    fn qos(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("Invalid MQTT QoS {other}, expected 0, 1 or 2"),
        })
    }

    fn create_client(&self) -> (Client, Connection) {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }

        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            self.host,
            self.port,
            self.client_id
        );
        Client::new(options, REQUEST_CAPACITY)
    }
}

/// Publishes through `rumqttc`. The connection is driven by a background thread
/// that keeps reconnecting until the publisher is closed.
///
/// Retained messages that do not fit into the client's request queue are held
/// back and handed over, in order, as the queue drains. Non-retained messages
/// are dropped with an error while such a backlog exists, so they never
/// overtake the discovery messages of their module.
pub struct MqttPublisher {
    client: Client,
    qos: QoS,
    backlog: VecDeque<(String, String)>,
    closing: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        let (client, mut connection) = config.create_client();
        let closing = Arc::new(AtomicBool::new(false));
        let reconnect_delay = config.reconnect_delay;

        let event_loop = {
            let closing = Arc::clone(&closing);
            std::thread::Builder::new()
                .name("mqtt-event-loop".into())
                .spawn(move || {
                    for notification in connection.iter() {
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                                log::info!("Connected to MQTT broker ({:?})", ack.code)
                            }
                            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                                log::debug!("Disconnect sent to MQTT broker");
                                break;
                            }
                            Ok(event) => log::trace!("MQTT event: {event:?}"),
                            Err(e) => {
                                if closing.load(Ordering::SeqCst) {
                                    break;
                                }
                                log::warn!(
                                    "MQTT connection error: {e}, retrying in {reconnect_delay:?}"
                                );
                                std::thread::sleep(reconnect_delay);
                            }
                        }
                    }
                    log::debug!("MQTT event loop stopped");
                })
                .with_context(|| "Cannot spawn MQTT event loop thread")?
        };

        Ok(Self {
            client,
            qos,
            backlog: VecDeque::new(),
            closing,
            event_loop: Some(event_loop),
        })
    }

    /// Hands queued retained messages to the client until its queue is full again.
    fn flush_backlog(&mut self) {
        while let Some((topic, payload)) = self.backlog.front() {
            if let Err(e) = self
                .client
                .try_publish(topic.as_str(), self.qos, true, payload.as_bytes())
            {
                log::trace!("{} retained messages still queued: {e}", self.backlog.len());
                return;
            }
            self.backlog.pop_front();
        }
    }
}

impl Publish for MqttPublisher {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), canbms_lib::Error> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}, retain={retain}",
            topic,
            self.qos
        );
        self.flush_backlog();
        if !self.backlog.is_empty() {
            if retain {
                self.backlog.push_back((topic.to_string(), payload.to_string()));
                return Ok(());
            }
            return Err(canbms_lib::Error::Publish(format!(
                "{topic}: {} retained messages still queued",
                self.backlog.len()
            )));
        }
        match self
            .client
            .try_publish(topic, self.qos, retain, payload.as_bytes())
        {
            Ok(()) => Ok(()),
            Err(e) if retain => {
                log::debug!("Request queue full, holding back {topic}: {e}");
                self.backlog.push_back((topic.to_string(), payload.to_string()));
                Ok(())
            }
            Err(e) => Err(canbms_lib::Error::Publish(format!("{topic}: {e}"))),
        }
    }

    fn close(&mut self) -> Result<(), canbms_lib::Error> {
        self.closing.store(true, Ordering::SeqCst);
        self.flush_backlog();
        if !self.backlog.is_empty() {
            log::warn!(
                "Discarding {} retained messages never handed to the MQTT client",
                self.backlog.len()
            );
            self.backlog.clear();
        }
        if let Err(e) = self.client.try_disconnect() {
            // No room for the disconnect request; the event loop ends on its next
            // connection error or with the process.
            self.event_loop.take();
            return Err(canbms_lib::Error::Publish(format!("disconnect: {e}")));
        }
        if let Some(event_loop) = self.event_loop.take() {
            if event_loop.join().is_err() {
                log::error!("MQTT event loop thread panicked");
            }
        }
        log::info!("Disconnected from MQTT broker.");
        Ok(())
    }
}
