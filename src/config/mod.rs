//! Configuration management for mpflow.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::multipath::{FlowSpec, PathSpec, ReassemblyConfig, SchedulerConfig};
use crate::runtime::DEFAULT_EVENT_BUFFER;
use crate::types::{FlowId, FlowProtocol, PathId};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scenario run parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Sender configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Receiver configuration.
    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Flows to run.
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.simulation.event_buffer == 0 {
            return Err(Error::InvalidConfig("Event buffer must be non-zero".into()));
        }

        let mut ids = BTreeSet::new();
        for flow in &self.flows {
            if !ids.insert(flow.id) {
                return Err(Error::InvalidConfig(format!("Duplicate flow id {}", flow.id)));
            }
            flow.validate()?;
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        PathBuf::from("mpflow.toml")
    }

    /// Create example configuration.
    pub fn example() -> Self {
        let mut tcp = FlowSpec::new(FlowId::new(1), FlowProtocol::Tcp, 8_000_000.0)
            .with_path(
                PathSpec::new(PathId::new(0), 5_000_000.0).with_delay(Duration::from_millis(5)),
            )
            .with_path(
                PathSpec::new(PathId::new(1), 3_000_000.0)
                    .with_delay(Duration::from_millis(20))
                    .with_jitter(Duration::from_millis(2)),
            );
        tcp.max_segment_size = Some(1_446);

        let mut udp = FlowSpec::new(FlowId::new(2), FlowProtocol::Udp, 3_000_000.0)
            .with_packet_size(1_000)
            .with_path(PathSpec::new(PathId::new(0), 1_000_000.0))
            .with_path(PathSpec::new(PathId::new(1), 1_000_000.0).with_delay(Duration::from_millis(15)))
            .with_path(PathSpec::new(PathId::new(2), 1_000_000.0).with_delay(Duration::from_millis(30)));
        udp.src_port = 49_154;

        Self {
            flows: vec![tcp, udp],
            ..Default::default()
        }
    }
}

/// Scenario run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Base seed for every random stream.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Replication number; changes every stream without changing the seed.
    #[serde(default = "default_run")]
    pub run: u64,

    /// Application units submitted per flow.
    #[serde(default = "default_units_per_flow")]
    pub units_per_flow: u64,

    /// Fixed gap between application sends, instead of the flow's rate.
    #[serde(default, with = "humantime_serde")]
    pub send_interval: Option<Duration>,

    /// Capacity of the per-flow event channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_seed() -> u64 {
    1
}

fn default_run() -> u64 {
    1
}

fn default_units_per_flow() -> u64 {
    1_000
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            run: default_run(),
            units_per_flow: default_units_per_flow(),
            send_interval: None,
            event_buffer: default_event_buffer(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colors.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging on stderr. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color).with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
