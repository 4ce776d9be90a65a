use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/p1-meterd/config.json";

/// Serial reads that produce no complete line within this window mark the
/// link as stale.
pub const READ_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: simd_json::Error,
    },
    #[error("configuration has no meter section")]
    MissingMeter,
    #[error("meter section needs either p1_file or port")]
    NoInput,
    #[error("meter setting {0} is required for serial mode")]
    MissingSetting(&'static str),
    #[error("unsupported byte size of {0} bits")]
    InvalidBits(u8),
    #[error("unsupported parity setting {0:?}")]
    InvalidParity(String),
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolves the config file: explicit path, then `METERD_CONFIG`, then the
/// system default.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    env_string("METERD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub meter: Option<MeterConfig>,
    #[serde(default)]
    pub legacy_database: Option<LegacyDatabaseConfig>,
    #[serde(default)]
    pub influx: Option<InfluxConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_slice(&mut bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_slice(bytes: &mut [u8]) -> Result<Self, simd_json::Error> {
        simd_json::serde::from_slice(bytes)
    }

    fn apply_env_overrides(&mut self) {
        let port = env_string("METERD_SERIAL_PORT");
        let p1_file = env_string("METERD_P1_FILE");
        if port.is_some() || p1_file.is_some() {
            let meter = self.meter.get_or_insert_with(MeterConfig::default);
            if let Some(port) = port {
                meter.port = Some(port);
            }
            if let Some(p1_file) = p1_file {
                meter.p1_file = Some(PathBuf::from(p1_file));
            }
        }
        if let Some(token) = env_string("METERD_INFLUX_TOKEN") {
            self.influx.get_or_insert_with(InfluxConfig::default).token = Some(token);
        }
    }

    pub fn meter(&self) -> Result<&MeterConfig, ConfigError> {
        self.meter.as_ref().ok_or(ConfigError::MissingMeter)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub loglevel: Option<u8>,
    #[serde(default)]
    pub filelog: Option<PathBuf>,
}

impl LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub fn default_filter(&self) -> &'static str {
        match self.loglevel.unwrap_or(3) {
            0 | 1 => "error",
            2 => "warn",
            3 => "info",
            _ => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterInput {
    File(PathBuf),
    Serial(SerialSettings),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub speed: Option<u32>,
    #[serde(default)]
    pub bits: Option<u8>,
    #[serde(default)]
    pub parity: Option<String>,
    #[serde(default)]
    pub rts_cts: bool,
    #[serde(default)]
    pub xon_xoff: bool,
    #[serde(default)]
    pub p1_file: Option<PathBuf>,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: None,
            speed: None,
            bits: None,
            parity: None,
            rts_cts: false,
            xon_xoff: false,
            p1_file: None,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl MeterConfig {
    /// A configured `p1_file` takes precedence over the serial port.
    pub fn input(&self) -> Result<MeterInput, ConfigError> {
        if let Some(path) = &self.p1_file {
            return Ok(MeterInput::File(path.clone()));
        }
        if self.port.is_none() {
            return Err(ConfigError::NoInput);
        }
        self.serial_settings().map(MeterInput::Serial)
    }

    pub fn serial_settings(&self) -> Result<SerialSettings, ConfigError> {
        let port = self
            .port
            .as_deref()
            .map(str::trim)
            .filter(|port| !port.is_empty())
            .ok_or(ConfigError::MissingSetting("port"))?;
        let baud_rate = self.speed.ok_or(ConfigError::MissingSetting("speed"))?;
        let data_bits = match self.bits.ok_or(ConfigError::MissingSetting("bits"))? {
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => return Err(ConfigError::InvalidBits(other)),
        };
        let parity = match self
            .parity
            .as_deref()
            .ok_or(ConfigError::MissingSetting("parity"))?
        {
            "none" => Parity::None,
            "odd" => Parity::Odd,
            "even" => Parity::Even,
            other => return Err(ConfigError::InvalidParity(other.to_string())),
        };
        let flow_control = match (self.rts_cts, self.xon_xoff) {
            (true, true) => {
                tracing::warn!("both RTS/CTS and XON/XOFF enabled; using RTS/CTS");
                FlowControl::Hardware
            }
            (true, false) => FlowControl::Hardware,
            (false, true) => FlowControl::Software,
            (false, false) => FlowControl::None,
        };
        Ok(SerialSettings {
            port: port.to_string(),
            baud_rate,
            data_bits,
            parity,
            flow_control,
        })
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms).max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CounterRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyDatabaseConfig {
    #[serde(default)]
    pub raw_db: Option<PathBuf>,
    #[serde(default)]
    pub fivemin_avg: Option<PathBuf>,
    #[serde(default)]
    pub hourly_avg: Option<PathBuf>,
    #[serde(default)]
    pub total_consumed: Option<PathBuf>,
    #[serde(default)]
    pub current_consumption_id: Option<String>,
    #[serde(default)]
    pub current_production_id: Option<String>,
    #[serde(default)]
    pub other_raw_counters: Vec<String>,
    #[serde(default)]
    pub consumption: BTreeMap<String, CounterRef>,
    #[serde(default)]
    pub production: BTreeMap<String, CounterRef>,
    #[serde(default)]
    pub total_interval: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub org: Option<String>,
    pub bucket: Option<String>,
    pub measurement: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue: usize,
    pub timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            org: None,
            bucket: None,
            measurement: "smart_meter".to_string(),
            batch_size: 500,
            flush_interval_ms: 1_000,
            queue: 4_096,
            timeout_ms: 5_000,
        }
    }
}

impl InfluxConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}
