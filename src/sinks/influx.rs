use super::{Sink, SinkError};
use crate::config::InfluxConfig;
use crate::telegram::{FieldId, Telegram};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, MissedTickBehavior};
use url::Url;

type Tags = &'static [(&'static str, &'static str)];

const UNTAGGED: Tags = &[];
const TARIFF_1: Tags = &[("tariff", "1")];
const TARIFF_2: Tags = &[("tariff", "2")];
const TARIFF_3: Tags = &[("tariff", "3")];
const TARIFF_4: Tags = &[("tariff", "4")];
const PHASE_L1: Tags = &[("phase", "l1")];
const PHASE_L2: Tags = &[("phase", "l2")];
const PHASE_L3: Tags = &[("phase", "l3")];

fn influx_field(field: FieldId) -> Option<(&'static str, Tags)> {
    let mapped: (&'static str, Tags) = match field {
        FieldId::ElectricityUsedTariff1 => ("electricity_used", TARIFF_1),
        FieldId::ElectricityUsedTariff2 => ("electricity_used", TARIFF_2),
        FieldId::ElectricityUsedTariff3 => ("electricity_used", TARIFF_3),
        FieldId::ElectricityUsedTariff4 => ("electricity_used", TARIFF_4),
        FieldId::HourlyGasMeterReading => ("gas", UNTAGGED),
        FieldId::ElectricityDeliveredTariff1 => ("electricity_produced", TARIFF_1),
        FieldId::ElectricityDeliveredTariff2 => ("electricity_produced", TARIFF_2),
        FieldId::ElectricityDeliveredTariff3 => ("electricity_produced", TARIFF_3),
        FieldId::ElectricityDeliveredTariff4 => ("electricity_produced", TARIFF_4),
        FieldId::CurrentElectricityUsage => ("total_power_used", UNTAGGED),
        FieldId::CurrentElectricityDelivery => ("total_power_produced", UNTAGGED),
        FieldId::InstantaneousVoltageL1 => ("voltage", PHASE_L1),
        FieldId::InstantaneousVoltageL2 => ("voltage", PHASE_L2),
        FieldId::InstantaneousVoltageL3 => ("voltage", PHASE_L3),
        FieldId::InstantaneousCurrentL1 => ("current", PHASE_L1),
        FieldId::InstantaneousCurrentL2 => ("current", PHASE_L2),
        FieldId::InstantaneousCurrentL3 => ("current", PHASE_L3),
        FieldId::InstantaneousActivePowerL1Positive => ("power_pos", PHASE_L1),
        FieldId::InstantaneousActivePowerL2Positive => ("power_pos", PHASE_L2),
        FieldId::InstantaneousActivePowerL3Positive => ("power_pos", PHASE_L3),
        FieldId::InstantaneousActivePowerL1Negative => ("power_neg", PHASE_L1),
        FieldId::InstantaneousActivePowerL2Negative => ("power_neg", PHASE_L2),
        FieldId::InstantaneousActivePowerL3Negative => ("power_neg", PHASE_L3),
        _ => return None,
    };
    Some(mapped)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    field: &'static str,
    tags: Tags,
    value: f64,
    timestamp: i64,
}

impl Point {
    /// Renders the point as one line of InfluxDB line protocol.
    fn to_line(&self, measurement: &str) -> String {
        let mut line = String::with_capacity(measurement.len() + 48);
        // measurement names escape only commas and spaces
        for c in measurement.chars() {
            if matches!(c, ',' | ' ') {
                line.push('\\');
            }
            line.push(c);
        }
        for (key, value) in self.tags {
            line.push(',');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line.push_str(&format!(" {}={} {}", self.field, self.value, self.timestamp));
        line
    }
}

/// Forwards every mapped reading to an InfluxDB v2 bucket.
///
/// `process` only queues points; a background task batches them and performs
/// the HTTP writes so a slow database never stalls telegram ingestion.
pub struct InfluxSink {
    tx: Option<mpsc::Sender<Vec<Point>>>,
    writer: Option<JoinHandle<()>>,
}

impl InfluxSink {
    pub fn inactive() -> Self {
        Self {
            tx: None,
            writer: None,
        }
    }

    /// Validates the `influx` section and starts the writer task. Must be
    /// called from within a tokio runtime.
    pub fn from_config(config: Option<&InfluxConfig>) -> Self {
        tracing::info!("initialising InfluxDB sink");
        let Some(config) = config else {
            tracing::info!("no configuration for InfluxDB sink found; disabling it");
            return Self::inactive();
        };

        let mut missing = Vec::new();
        let url = required(&config.url, "url", &mut missing);
        let token = required(&config.token, "token", &mut missing);
        let org = required(&config.org, "org", &mut missing);
        let bucket = required(&config.bucket, "bucket", &mut missing);
        let (Some(url), Some(token), Some(org), Some(bucket)) = (url, token, org, bucket) else {
            tracing::error!(
                missing = ?missing,
                "missing mandatory fields in InfluxDB configuration section"
            );
            return Self::inactive();
        };

        let endpoint = match write_endpoint(url, org, bucket) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                tracing::error!(url, error = %err, "invalid InfluxDB url");
                return Self::inactive();
            }
        };
        let client = match Client::builder().timeout(config.timeout()).build() {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(error = %err, "failed to build InfluxDB HTTP client");
                return Self::inactive();
            }
        };

        let (tx, rx) = mpsc::channel(config.queue.max(1));
        let writer = Writer {
            client,
            endpoint,
            token: token.to_string(),
            measurement: config.measurement.clone(),
        };
        let batch_size = config.batch_size.max(1);
        let flush_interval = config.flush_interval();
        let writer = tokio::spawn(async move {
            run_writer(writer, rx, batch_size, flush_interval).await;
        });

        tracing::info!(url, org, bucket, "initialisation of InfluxDB sink complete");
        Self {
            tx: Some(tx),
            writer: Some(writer),
        }
    }

    #[cfg(test)]
    fn with_sender(tx: mpsc::Sender<Vec<Point>>) -> Self {
        Self {
            tx: Some(tx),
            writer: None,
        }
    }
}

fn required<'a>(
    value: &'a Option<String>,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> Option<&'a str> {
    let value = value.as_deref().map(str::trim).filter(|v| !v.is_empty());
    if value.is_none() {
        missing.push(name);
    }
    value
}

fn write_endpoint(url: &str, org: &str, bucket: &str) -> Result<Url, url::ParseError> {
    let base = format!("{}/api/v2/write", url.trim_end_matches('/'));
    Url::parse_with_params(
        &base,
        &[("org", org), ("bucket", bucket), ("precision", "s")],
    )
}

impl Sink for InfluxSink {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    fn process(&mut self, timestamp: i64, telegram: &Telegram) -> Result<(), SinkError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };

        let points: Vec<Point> = telegram
            .iter()
            .filter_map(|(field, value)| {
                let (name, tags) = influx_field(field)?;
                Some(Point {
                    field: name,
                    tags,
                    value: value.as_number()?,
                    timestamp,
                })
            })
            .collect();
        if points.is_empty() {
            return Ok(());
        }

        match tx.try_send(points) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(points)) => Err(SinkError::QueueFull(points.len())),
            Err(TrySendError::Closed(_)) => Err(SinkError::QueueClosed),
        }
    }

    /// Closes the queue; the writer flushes what is buffered and exits.
    fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        self.tx.take();
        self.writer.take()
    }
}

struct Writer {
    client: Client,
    endpoint: Url,
    token: String,
    measurement: String,
}

async fn run_writer(
    writer: Writer,
    mut rx: mpsc::Receiver<Vec<Point>>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer: Vec<String> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = writer.flush(&mut buffer).await {
                    tracing::warn!(error = %err, "InfluxDB flush failed");
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(points) => {
                        buffer.extend(points.iter().map(|point| point.to_line(&writer.measurement)));
                        if buffer.len() >= batch_size {
                            if let Err(err) = writer.flush(&mut buffer).await {
                                tracing::warn!(error = %err, "InfluxDB flush failed");
                            }
                        }
                    }
                    None => {
                        if let Err(err) = writer.flush(&mut buffer).await {
                            tracing::warn!(error = %err, "final InfluxDB flush failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

impl Writer {
    async fn flush(&self, buffer: &mut Vec<String>) -> Result<(), reqwest::Error> {
        if buffer.is_empty() {
            return Ok(());
        }

        let lines = buffer.len();
        let body = buffer.drain(..).collect::<Vec<_>>().join("\n");
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), lines, "InfluxDB write returned non-success");
        } else {
            tracing::debug!(lines, "flushed points to InfluxDB");
        }
        Ok(())
    }
}
