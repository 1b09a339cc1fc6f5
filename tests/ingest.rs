use canbms_lib::ingest::{FrameSource, IngestLoop, LoopState};
use canbms_lib::protocol::CanFrame;
use canbms_lib::publisher::{Publish, Topics};
use canbms_lib::Error;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    payload: Value,
    retain: bool,
}

/// Records every publish; shared so the test can inspect it after the loop returns.
#[derive(Clone, Default)]
struct RecordingPublisher {
    messages: Arc<Mutex<Vec<Message>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingPublisher {
    fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    fn state_messages(&self, module_id: u32) -> Vec<Value> {
        let topic = format!("homeassistant/sensor/module{module_id}/state");
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload)
            .collect()
    }
}

impl Publish for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), Error> {
        let payload = serde_json::from_str(payload).map_err(Error::Serialize)?;
        self.messages.lock().unwrap().push(Message {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Plays back a fixed list of frames, then raises the stop flag.
struct ScriptedBus {
    frames: VecDeque<CanFrame>,
    stop: Arc<AtomicBool>,
}

impl FrameSource for ScriptedBus {
    fn recv(&mut self, _timeout: Duration) -> Result<CanFrame, Error> {
        match self.frames.pop_front() {
            Some(frame) => Ok(frame),
            None => {
                self.stop.store(true, Ordering::SeqCst);
                Err(Error::TransportTimeout)
            }
        }
    }
}

fn run(frames: &[(u32, &[u8])]) -> RecordingPublisher {
    let stop = Arc::new(AtomicBool::new(false));
    let bus = ScriptedBus {
        frames: frames
            .iter()
            .map(|(id, data)| CanFrame::new(*id, data).unwrap())
            .collect(),
        stop: Arc::clone(&stop),
    };
    let publisher = RecordingPublisher::default();
    let mut ingest = IngestLoop::new(bus, publisher.clone(), Topics::default())
        .with_recv_timeout(Duration::from_millis(10))
        .with_stop_flag(stop);

    let stats = ingest.run().unwrap();
    assert_eq!(stats.frames_received, frames.len() as u64);
    assert_eq!(ingest.state(), LoopState::Draining);
    assert!(publisher.closed.load(Ordering::SeqCst));
    publisher
}

#[test]
fn cell_frame_triggers_discovery_then_state() {
    let publisher = run(&[(0x1005, &[0x64, 0x00, 0x01])]);
    let messages = publisher.messages();
    assert_eq!(messages.len(), 85);

    let (discovery, state) = messages.split_at(84);
    assert!(discovery.iter().all(|m| m.retain));
    assert!(discovery
        .iter()
        .all(|m| m.topic.ends_with("/config") && m.payload["device"]["name"] == "Module 1"));
    assert_eq!(
        discovery[0].topic,
        "homeassistant/sensor/module1_cell_0_voltage/config"
    );

    assert_eq!(state[0].topic, "homeassistant/sensor/module1/state");
    assert!(!state[0].retain);
    assert_eq!(
        state[0].payload,
        json!({
            "cells": { "5": { "voltage": 10.0, "balancing": 1 } },
            "adc": {},
        })
    );
}

#[test]
fn adc_channel_seven_yields_current() {
    let publisher = run(&[(0x1107, &[0x88, 0x61])]);
    let states = publisher.state_messages(1);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0]["adc"]["7"]["rawValue"], json!(24968));
    let current = states[0]["current"].as_f64().unwrap();
    assert!((current - -57.6).abs() < 1e-9, "current={current}");
}

#[test]
fn module_frame_with_zero_payload() {
    let publisher = run(&[(0x1200, &[0; 8])]);
    let states = publisher.state_messages(1);
    assert_eq!(
        states,
        vec![json!({
            "cells": {},
            "adc": {},
            "m1Voltage": 0.0,
            "m2Voltage": 0.0,
            "cellDiff": 0.0,
            "reserved": 0,
        })]
    );
}

#[test]
fn unknown_offset_publishes_nothing() {
    let publisher = run(&[(0x1300, &[0; 8])]);
    assert!(publisher.messages().is_empty());

    // A later valid frame still gets discovery for that module.
    let publisher = run(&[(0x1300, &[0; 8]), (0x1000, &[0x10, 0x27, 0x00])]);
    let messages = publisher.messages();
    assert_eq!(messages.len(), 85);
    assert!(messages[..84].iter().all(|m| m.retain));
}

#[test]
fn discovery_once_per_module_and_state_per_frame() {
    let publisher = run(&[
        (0x1000, &[0x10, 0x27, 0x00]),
        (0x2000, &[0x20, 0x4E, 0x01]),
        (0x1001, &[0x11, 0x27, 0x00]),
        (0x1101, &[0x01, 0x00]),
        (0x2200, &[0x10, 0x27, 0x10, 0x27, 0x05, 0x00, 0x00, 0x00]),
        (0x1000, &[0x12, 0x27, 0x01]),
    ]);
    let messages = publisher.messages();
    let discovery: Vec<&Message> = messages.iter().filter(|m| m.retain).collect();
    assert_eq!(discovery.len(), 2 * 84);
    assert_eq!(messages.len(), 2 * 84 + 6);

    for module_id in [1u32, 2] {
        let state_topic = format!("homeassistant/sensor/module{module_id}/state");
        let first_state = messages
            .iter()
            .position(|m| m.topic == state_topic)
            .unwrap();
        let last_config = messages
            .iter()
            .rposition(|m| {
                m.retain && m.payload["device"]["identifiers"][0] == format!("module{module_id}")
            })
            .unwrap();
        assert!(last_config < first_state);
    }

    let states = publisher.state_messages(1);
    assert_eq!(states.len(), 4);
    // Overwrite, not merge: the last cell 0 frame wins.
    let last = states.last().unwrap();
    assert_eq!(last["cells"]["0"], json!({ "voltage": 1000.2, "balancing": 1 }));
    assert_eq!(last["cells"]["1"]["voltage"], json!(1000.1));
    assert_eq!(last["adc"]["1"], json!({ "rawValue": 1 }));
    assert!(last.get("current").is_none());

    let states = publisher.state_messages(2);
    assert_eq!(states.len(), 2);
    assert_eq!(states[1]["m1Voltage"], json!(100.0));
    assert_eq!(states[1]["cellDiff"], json!(0.5));
    assert_eq!(states[1]["cells"]["0"]["voltage"], json!(2000.0));
}
