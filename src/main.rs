mod commandline;
mod daemon;
mod mqtt;

use anyhow::{Context, Result};
use canbms_lib::protocol::{CanFrame, MAX_PAYLOAD_LENGTH};
use canbms_lib::store::ModuleStore;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn decode_frame(identifier: u32, payload: &[u8]) -> Result<()> {
    let frame = CanFrame::new(identifier, payload).with_context(|| {
        format!(
            "Payload has {} bytes, a CAN frame carries at most {MAX_PAYLOAD_LENGTH}",
            payload.len()
        )
    })?;
    let update = frame
        .decode()
        .with_context(|| format!("Cannot decode frame {frame:?}"))?;
    println!("Update: {}", serde_json::to_string_pretty(&update)?);

    let mut store = ModuleStore::new();
    let (aggregate, _) = store.apply(&update);
    println!(
        "Module {} state: {}",
        update.module_id(),
        serde_json::to_string_pretty(aggregate)?
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let CliArgs {
        verbose,
        interface,
        command,
        timeout,
    } = CliArgs::parse();

    let _log_handle = logging_init(verbose.log_level_filter());

    match command {
        CliCommands::Listen { output } => {
            let stats = daemon::run(&interface, timeout, output).await?;
            info!("Listener finished: {stats:?}");
        }
        CliCommands::Decode {
            identifier,
            payload,
        } => decode_frame(identifier, &payload)?,
    }

    Ok(())
}
