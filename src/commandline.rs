use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Listen on the CAN bus and republish module state
    Listen {
        /// Output destination for state and discovery messages
        #[command(subcommand)]
        output: DaemonOutput,
    },
    /// Decode a single frame and print the resulting update and module state
    Decode {
        /// Arbitration identifier (e.g. 0x1005 or 4101)
        #[arg(value_parser = maybe_hex::<u32>)]
        identifier: u32,
        /// Payload bytes, at most 8 (e.g. 0x64 0x00 0x01)
        #[arg(value_parser = maybe_hex::<u8>)]
        payload: Vec<u8>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print every message to the standard output (console).
    Console,
    /// Publish every message to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

const fn about_text() -> &'static str {
    "battery module CAN to MQTT bridge"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// SocketCAN interface name (e.g., can0, vcan0)
    #[arg(short, long, default_value = "can0")]
    pub interface: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// How long a single receive waits for a frame before checking for shutdown (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,
}
