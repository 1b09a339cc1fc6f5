use anyhow::{Context, Result};
use canbms_lib::ingest::{FrameSource, IngestLoop, Statistics};
use canbms_lib::publisher::{Publish, Topics};
use canbms_lib::socketcan::SocketCanSource;
use log::{error, info};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::{commandline, mqtt};

/// Prints every message instead of sending it anywhere.
struct ConsolePublisher;

impl Publish for ConsolePublisher {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), canbms_lib::Error> {
        let retained = if retain { " (retained)" } else { "" };
        println!(
            "{} {topic}{retained}: {payload}",
            chrono::Local::now().to_rfc3339()
        );
        Ok(())
    }
}

fn create_publisher(
    output: &commandline::DaemonOutput,
) -> Result<(Box<dyn Publish + Send>, Topics)> {
    match output {
        commandline::DaemonOutput::Console => Ok((Box::new(ConsolePublisher), Topics::default())),
        commandline::DaemonOutput::Mqtt { config_file } => {
            let config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let topics = config.topics().clone();
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            Ok((Box::new(publisher), topics))
        }
    }
}

pub async fn run(
    interface: &str,
    timeout: Duration,
    output: commandline::DaemonOutput,
) -> Result<Statistics> {
    info!("Starting listener: interface={interface}, timeout={timeout:?}, output={output:?}");

    let source = SocketCanSource::open(interface)
        .with_context(|| format!("Cannot listen on CAN interface '{interface}'"))?;
    let (publisher, topics) = create_publisher(&output)?;
    info!("Listening on {}", source.interface());

    let ingest = IngestLoop::new(source, publisher, topics).with_recv_timeout(timeout);
    supervise(ingest, tokio::signal::ctrl_c()).await
}

/// Runs `ingest` on a blocking thread until it ends or `shutdown` resolves.
///
/// The loop is always stopped and awaited, so the publisher gets closed even
/// when waiting for the shutdown signal fails.
async fn supervise<S, P>(
    mut ingest: IngestLoop<S, P>,
    shutdown: impl Future<Output = std::io::Result<()>>,
) -> Result<Statistics>
where
    S: FrameSource + Send + 'static,
    P: Publish + Send + 'static,
{
    let stop = ingest.stop_flag();
    let mut worker = tokio::task::spawn_blocking(move || ingest.run());

    let (result, signal) = tokio::select! {
        result = &mut worker => (result, Ok(())),
        signal = shutdown => {
            match &signal {
                Ok(()) => info!("Interrupted by user, shutting down..."),
                Err(e) => error!("Cannot listen for shutdown signal, stopping listener: {e}"),
            }
            stop.store(true, Ordering::SeqCst);
            (worker.await, signal)
        }
    };

    let stats = result
        .with_context(|| "Ingest loop panicked")?
        .with_context(|| "Ingest loop failed")?;
    signal.with_context(|| "Cannot listen for shutdown signal")?;
    Ok(stats)
}
