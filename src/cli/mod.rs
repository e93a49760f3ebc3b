//! Command-line interface for the scenario runner.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::LoggingConfig;

/// mpflow - multipath flow scheduling and resequencing scenarios
#[derive(Parser, Debug)]
#[command(
    name = "mpflow",
    author,
    version,
    about = "Run multipath flow scenarios over simulated paths",
    long_about = r#"
mpflow splits each configured flow across several simulated paths with
weighted random path selection, tags every unit with a sequence number and
reassembles the stream in order at the receiver.

QUICK START:
  mpflow config --example > mpflow.toml
  mpflow inspect -c mpflow.toml
  mpflow run -c mpflow.toml --units 5000
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overriding `[logging]`
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (text or json), overriding `[logging]`
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Apply logging flags on top of the loaded `[logging]` section.
    pub fn apply_logging(&self, logging: &mut LoggingConfig) {
        if let Some(ref level) = self.log_level {
            logging.level.clone_from(level);
        }
        if let Some(ref format) = self.log_format {
            logging.format.clone_from(format);
        }
        if self.no_color {
            logging.color = false;
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every configured flow and print a summary
    Run(RunArgs),

    /// Show the values derived for each flow
    Inspect(InspectArgs),

    /// Print, write or check configuration
    Config(ConfigArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Arguments for `run`.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Override the random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the replication number
    #[arg(long)]
    pub run: Option<u64>,

    /// Override the number of units sent per flow
    #[arg(short, long)]
    pub units: Option<u64>,

    /// Fixed gap between sends (e.g. "500us"), instead of each flow's rate
    #[arg(long, value_parser = parse_duration)]
    pub send_interval: Option<Duration>,

    /// Only run these flow ids
    #[arg(long = "flow", value_delimiter = ',')]
    pub flows: Vec<u32>,
}

/// Arguments for `inspect`.
#[derive(Args, Debug, Default)]
pub struct InspectArgs {
    /// Only show these flow ids
    #[arg(long = "flow", value_delimiter = ',')]
    pub flows: Vec<u32>,
}

/// Arguments for `config`.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Print the example configuration
    #[arg(long)]
    pub example: bool,

    /// Write the configuration to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Only validate the loaded configuration
    #[arg(long)]
    pub check: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}
