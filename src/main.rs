use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use modbus_bridge::config::Overrides;
use modbus_bridge::{ChannelHost, Conversion, HostEvents, RegisterKind, RegisterReader, Settings};

/// Read a Modbus register on every trigger and print it as a JSON message
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Modbus server address
    #[arg(long)]
    host: Option<String>,

    /// Modbus server port
    #[arg(long)]
    port: Option<u16>,

    /// Modbus unit identifier
    #[arg(long)]
    unit_id: Option<u8>,

    /// Register address to read
    #[arg(long)]
    address: Option<u16>,

    /// Register class: input or holding
    #[arg(long)]
    kind: Option<RegisterKind>,

    /// Conversion: numeric, high_word or word_pair
    #[arg(long)]
    conversion: Option<Conversion>,

    /// Connect and request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Trigger a read every N milliseconds instead of once per stdin line
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => Settings::default(),
    };
    settings
        .apply_args(Overrides {
            host: args.host,
            port: args.port,
            unit_id: args.unit_id,
            timeout_ms: args.timeout_ms,
            kind: args.kind,
            address: args.address,
            conversion: args.conversion,
        })
        .context("Invalid command line arguments")?;

    let (host, events) = ChannelHost::new();
    let HostEvents { mut readings, mut failures } = events;
    let reader = RegisterReader::connect(&settings, host).await.with_context(|| {
        format!(
            "Failed to connect to {}:{}",
            settings.endpoint.host, settings.endpoint.port
        )
    })?;

    let printer = tokio::spawn(async move {
        while let Some(reading) = readings.recv().await {
            match serde_json::to_string(&reading) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("failed to encode reading: {}", e),
            }
        }
    });
    let reporter = tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            error!("trigger {}: {}", failure.trigger, failure.error);
        }
    });

    tokio::select! {
        result = triggers(&reader, args.interval_ms) => {
            if let Err(e) = result {
                error!("stopping: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    reader.shutdown().await.context("Failed to close the connection")?;
    let _ = printer.await;
    let _ = reporter.await;
    Ok(())
}

// Feed triggers until stdin ends. With an interval, tick until interrupted.
async fn triggers(reader: &RegisterReader, interval_ms: Option<u64>) -> Result<()> {
    match interval_ms {
        Some(ms) => {
            let mut ticker = tokio::time::interval(Duration::from_millis(ms.max(1)));
            loop {
                ticker.tick().await;
                reader.trigger()?;
            }
        }
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(_)) => reader.trigger()?,
                    Ok(None) => {
                        info!("input closed");
                        return Ok(());
                    }
                    // unreadable input ends the flow the same way EOF does
                    Err(e) => {
                        error!("failed to read trigger input: {}", e);
                        return Ok(());
                    }
                };
            }
        }
    }
}
