//! Home Assistant MQTT discovery descriptors.
//!
//! Every module exposes the same set of sensors. The set is described by the
//! [`SENSORS`] table and expanded per module by [`Registrar::describe`].

use crate::publisher::{Publish, Topics};
use serde::Serialize;
use std::ops::Range;

const CELL_SENSORS: u8 = 32;
const ADC_SENSORS: u8 = 16;

const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";

/// Home Assistant entity platform of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
}

/// Which part of the module record a sensor reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Cells,
    Adc,
    Module,
}

impl Group {
    fn indices(self) -> Range<u8> {
        match self {
            Group::Cells => 0..CELL_SENSORS,
            Group::Adc => 0..ADC_SENSORS,
            // single, unindexed sensor
            Group::Module => 0..1,
        }
    }

    fn unique_id(self, module_id: u32, index: u8, key: &str) -> String {
        match self {
            Group::Cells => format!("module{module_id}_cell_{index}_{key}"),
            Group::Adc => format!("module{module_id}_adc_{index}"),
            Group::Module => format!("module{module_id}_{key}"),
        }
    }

    fn name(self, module_id: u32, index: u8, label: &str) -> String {
        match self {
            Group::Cells => format!("Module {module_id} Cell {index} {label}"),
            Group::Adc => format!("Module {module_id} ADC {index}"),
            Group::Module => format!("Module {module_id} {label}"),
        }
    }

    fn value_path(self, index: u8, field: &str) -> String {
        match self {
            Group::Cells => format!("value_json.cells['{index}'].{field}"),
            Group::Adc => format!("value_json.adc['{index}'].{field}"),
            Group::Module => format!("value_json.{field}"),
        }
    }
}

struct SensorSpec {
    group: Group,
    component: Component,
    key: &'static str,
    label: &'static str,
    field: &'static str,
    unit: Option<&'static str>,
    device_class: Option<&'static str>,
}

/// Sensors exposed by every module, in publish order.
const SENSORS: &[SensorSpec] = &[
    SensorSpec {
        group: Group::Cells,
        component: Component::Sensor,
        key: "voltage",
        label: "Voltage",
        field: "voltage",
        unit: Some("mV"),
        device_class: Some("voltage"),
    },
    SensorSpec {
        group: Group::Cells,
        component: Component::BinarySensor,
        key: "balancing",
        label: "Balancing",
        field: "balancing",
        unit: None,
        device_class: None,
    },
    SensorSpec {
        group: Group::Adc,
        component: Component::Sensor,
        key: "adc",
        label: "ADC",
        field: "rawValue",
        unit: Some("mV"),
        device_class: Some("voltage"),
    },
    SensorSpec {
        group: Group::Module,
        component: Component::Sensor,
        key: "m1_voltage",
        label: "M1 Voltage",
        field: "m1Voltage",
        unit: Some("V"),
        device_class: Some("voltage"),
    },
    SensorSpec {
        group: Group::Module,
        component: Component::Sensor,
        key: "m2_voltage",
        label: "M2 Voltage",
        field: "m2Voltage",
        unit: Some("V"),
        device_class: Some("voltage"),
    },
    SensorSpec {
        group: Group::Module,
        component: Component::Sensor,
        key: "cell_diff",
        label: "Cell Diff",
        field: "cellDiff",
        unit: Some("mV"),
        device_class: Some("voltage"),
    },
    SensorSpec {
        group: Group::Module,
        component: Component::Sensor,
        key: "current",
        label: "Current",
        field: "current",
        unit: Some("mA"),
        device_class: Some("current"),
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub name: String,
}

impl Device {
    fn for_module(module_id: u32) -> Self {
        Self {
            identifiers: vec![format!("module{module_id}")],
            name: format!("Module {module_id}"),
        }
    }
}

/// One discovery message. Serialises to the config payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorDescriptor {
    #[serde(skip)]
    pub component: Component,
    #[serde(skip)]
    pub config_topic: String,
    pub name: String,
    pub state_topic: String,
    pub value_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,
    pub unique_id: String,
    pub device: Device,
}

/// Builds and publishes the discovery descriptors of a module.
#[derive(Debug, Clone)]
pub struct Registrar {
    topics: Topics,
}

impl Registrar {
    pub fn new(topics: Topics) -> Self {
        Self { topics }
    }

    /// All descriptors of `module_id`: cell voltages, cell balancing, ADC channels,
    /// then the module level sensors.
    pub fn describe(&self, module_id: u32) -> Vec<SensorDescriptor> {
        let state_topic = self.topics.state_topic(module_id);
        let device = Device::for_module(module_id);

        SENSORS
            .iter()
            .flat_map(|spec| spec.group.indices().map(move |index| (spec, index)))
            .map(|(spec, index)| {
                let unique_id = spec.group.unique_id(module_id, index, spec.key);
                let path = spec.group.value_path(index, spec.field);
                let (value_template, payload_on, payload_off) = match spec.component {
                    Component::Sensor => (format!("{{{{ {path} }}}}"), None, None),
                    Component::BinarySensor => (
                        format!("{{{{ '{PAYLOAD_ON}' if {path} > 0 else '{PAYLOAD_OFF}' }}}}"),
                        Some(PAYLOAD_ON),
                        Some(PAYLOAD_OFF),
                    ),
                };
                SensorDescriptor {
                    component: spec.component,
                    config_topic: self.topics.config_topic(spec.component, &unique_id),
                    name: spec.group.name(module_id, index, spec.label),
                    state_topic: state_topic.clone(),
                    value_template,
                    unit_of_measurement: spec.unit,
                    device_class: spec.device_class,
                    payload_on,
                    payload_off,
                    unique_id,
                    device: device.clone(),
                }
            })
            .collect()
    }

    /// Publishes every descriptor of `module_id` retained. Individual failures are
    /// logged and skipped; returns the number of descriptors delivered.
    pub fn publish<P: Publish + ?Sized>(&self, publisher: &mut P, module_id: u32) -> usize {
        let mut delivered = 0;
        for descriptor in self.describe(module_id) {
            let payload = match serde_json::to_string(&descriptor) {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("Failed to serialize '{}': {e}", descriptor.unique_id);
                    continue;
                }
            };
            match publisher.publish(&descriptor.config_topic, &payload, true) {
                Ok(()) => delivered += 1,
                Err(e) => log::error!(
                    "Failed to publish discovery config to topic {}: {e}",
                    descriptor.config_topic
                ),
            }
        }
        log::info!("Published discovery config for module {module_id} ({delivered} sensors)");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn registrar() -> Registrar {
        Registrar::new(Topics::default())
    }

    #[test]
    fn test_descriptor_count_and_order() {
        let descriptors = registrar().describe(1);
        assert_eq!(descriptors.len(), 32 + 32 + 16 + 4);

        let ids: Vec<&str> = descriptors.iter().map(|d| d.unique_id.as_str()).collect();
        assert_eq!(ids[0], "module1_cell_0_voltage");
        assert_eq!(ids[31], "module1_cell_31_voltage");
        assert_eq!(ids[32], "module1_cell_0_balancing");
        assert_eq!(ids[63], "module1_cell_31_balancing");
        assert_eq!(ids[64], "module1_adc_0");
        assert_eq!(ids[79], "module1_adc_15");
        assert_eq!(
            &ids[80..],
            &[
                "module1_m1_voltage",
                "module1_m2_voltage",
                "module1_cell_diff",
                "module1_current"
            ]
        );
    }

    #[test]
    fn test_describe_is_idempotent() {
        let registrar = registrar();
        assert_eq!(registrar.describe(12), registrar.describe(12));
        assert_ne!(registrar.describe(12), registrar.describe(13));
    }

    #[test]
    fn test_unique_ids_are_unique() {
        let descriptors = registrar().describe(5);
        let mut ids: Vec<&String> = descriptors.iter().map(|d| &d.unique_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), descriptors.len());
    }

    #[test]
    fn test_cell_voltage_payload() {
        let descriptors = registrar().describe(2);
        let value = serde_json::to_value(&descriptors[7]).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "name": "Module 2 Cell 7 Voltage",
                "state_topic": "homeassistant/sensor/module2/state",
                "value_template": "{{ value_json.cells['7'].voltage }}",
                "unit_of_measurement": "mV",
                "device_class": "voltage",
                "unique_id": "module2_cell_7_voltage",
                "device": { "identifiers": ["module2"], "name": "Module 2" },
            })
        );
        assert_eq!(
            descriptors[7].config_topic,
            "homeassistant/sensor/module2_cell_7_voltage/config"
        );
    }

    #[test]
    fn test_balancing_payload() {
        let descriptors = registrar().describe(2);
        let balancing = &descriptors[32 + 3];
        assert_eq!(balancing.component, Component::BinarySensor);
        assert_eq!(
            balancing.config_topic,
            "homeassistant/binary_sensor/module2_cell_3_balancing/config"
        );
        let value = serde_json::to_value(balancing).unwrap();
        assert_eq!(
            value["value_template"],
            "{{ 'ON' if value_json.cells['3'].balancing > 0 else 'OFF' }}"
        );
        assert_eq!(value["payload_on"], "ON");
        assert_eq!(value["payload_off"], "OFF");
        assert!(value.get("unit_of_measurement").is_none());
    }

    #[test]
    fn test_adc_and_module_payloads() {
        let descriptors = registrar().describe(4);
        let adc = &descriptors[64 + 9];
        assert_eq!(adc.name, "Module 4 ADC 9");
        assert_eq!(adc.value_template, "{{ value_json.adc['9'].rawValue }}");
        assert_eq!(adc.unit_of_measurement, Some("mV"));

        let current = &descriptors[83];
        assert_eq!(current.value_template, "{{ value_json.current }}");
        assert_eq!(current.unit_of_measurement, Some("mA"));
        assert_eq!(current.device_class, Some("current"));
        assert_eq!(
            current.config_topic,
            "homeassistant/sensor/module4_current/config"
        );

        let m1 = &descriptors[80];
        assert_eq!(m1.value_template, "{{ value_json.m1Voltage }}");
        assert_eq!(m1.unit_of_measurement, Some("V"));
        assert_eq!(descriptors[82].value_template, "{{ value_json.cellDiff }}");
    }

    struct Flaky {
        calls: usize,
        retained: usize,
    }

    impl Publish for Flaky {
        fn publish(&mut self, _topic: &str, _payload: &str, retain: bool) -> Result<(), Error> {
            self.calls += 1;
            if retain {
                self.retained += 1;
            }
            if self.calls % 10 == 0 {
                return Err(Error::Publish("queue full".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_publish_is_retained_and_survives_failures() {
        let mut publisher = Flaky {
            calls: 0,
            retained: 0,
        };
        let delivered = registrar().publish(&mut publisher, 1);
        assert_eq!(publisher.calls, 84);
        assert_eq!(publisher.retained, 84);
        assert_eq!(delivered, 84 - 8);
    }
}
