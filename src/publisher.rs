//! Outbound side: the publish seam, topic layout and the state publisher.

use crate::discovery::Component;
use crate::store::ModuleAggregate;
use crate::Error;
use serde::Deserialize;

/// Something that can deliver a payload to a topic, typically an MQTT client.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), Error>;

    /// Flushes and closes the underlying connection.
    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<P: Publish + ?Sized> Publish for Box<P> {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), Error> {
        (**self).publish(topic, payload, retain)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

/// Topic prefixes for state and discovery messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub state_prefix: String,
    pub sensor_config_prefix: String,
    pub binary_sensor_config_prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            state_prefix: "homeassistant/sensor".into(),
            sensor_config_prefix: "homeassistant/sensor".into(),
            binary_sensor_config_prefix: "homeassistant/binary_sensor".into(),
        }
    }
}

impl Topics {
    pub fn state_topic(&self, module_id: u32) -> String {
        format!("{}/module{module_id}/state", self.state_prefix)
    }

    pub fn config_topic(&self, component: Component, unique_id: &str) -> String {
        let prefix = match component {
            Component::Sensor => &self.sensor_config_prefix,
            Component::BinarySensor => &self.binary_sensor_config_prefix,
        };
        format!("{prefix}/{unique_id}/config")
    }
}

/// Publishes the full record of a module after every accepted update.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    topics: Topics,
}

impl StatePublisher {
    pub fn new(topics: Topics) -> Self {
        Self { topics }
    }

    pub fn publish<P: Publish + ?Sized>(
        &self,
        publisher: &mut P,
        module_id: u32,
        aggregate: &ModuleAggregate,
    ) -> Result<(), Error> {
        let payload = serde_json::to_string(aggregate)?;
        let topic = self.topics.state_topic(module_id);
        log::trace!("Publishing state of module {module_id} to {topic}");
        publisher.publish(&topic, &payload, false)
    }
}
