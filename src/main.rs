mod aggregate;
mod config;
mod counters;
mod dispatch;
mod sinks;
mod source;
mod telegram;

use crate::config::{Config, LoggingConfig, MeterInput};
use crate::counters::CounterMapping;
use crate::dispatch::{Dispatcher, SystemClock};
use crate::sinks::{InfluxSink, SqliteSink};
use crate::source::{Backoff, FileSource, SerialOpener, SerialSource};
use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "p1-meterd",
    version,
    about = "Reads smart meter P1 telegrams and stores them in SQLite and InfluxDB"
)]
struct Cli {
    /// Configuration file (falls back to METERD_CONFIG, then /etc/p1-meterd/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Decode a captured telegram, print its fields and exit
    #[arg(long, value_name = "FILE")]
    dump: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.default_filter().into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let file_layer = match &logging.filelog {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn dump_telegram(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let telegram = telegram::decode(&source::normalize_lines(&contents), false)
        .with_context(|| format!("failed to decode telegram in {}", path.display()))?;
    if telegram.is_empty() {
        tracing::warn!(path = %path.display(), "telegram contains no known fields");
    }
    for (field, value) in telegram.iter() {
        println!("{} ({}): {}", field.name(), value.kind(), value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    if let Some(path) = &cli.dump {
        init_tracing(&LoggingConfig::default())?;
        return dump_telegram(path);
    }

    let path = config::config_path(cli.config.as_deref());
    let config = Config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    init_tracing(&config.logging)?;

    let meter = config.meter()?;
    let input = meter.input().context("invalid meter configuration")?;

    let mut dispatcher = Dispatcher::new(Box::new(SystemClock));
    dispatcher.register(Box::new(SqliteSink::from_config(
        config.legacy_database.as_ref(),
        CounterMapping::new(),
    )));
    dispatcher.register(Box::new(InfluxSink::from_config(config.influx.as_ref())));
    if !dispatcher.sinks().any(|sink| sink.is_active()) {
        tracing::warn!("no active sinks; telegrams will be read and discarded");
    }

    let ingest = async {
        match input {
            MeterInput::File(path) => FileSource::new(path).run(&mut dispatcher).await,
            MeterInput::Serial(settings) => {
                let backoff = Backoff::new(meter.reconnect_initial(), meter.reconnect_max());
                SerialSource::new(SerialOpener::new(settings), backoff)
                    .run(&mut dispatcher)
                    .await
            }
        }
    };

    tokio::select! {
        _ = ingest => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
    }

    dispatcher.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
