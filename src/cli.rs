//! Command-line interface for procpulse.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for procpulse.
#[derive(Parser)]
#[command(name = "pulse", version, author)]
#[command(about = "Health, metrics and history for supervised processes", long_about = None)]
pub struct Cli {
    /// Path to the configuration file (defaults to `pulse.yaml`, then `procpulse.yaml`).
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for pulse.
#[derive(Subcommand)]
pub enum Commands {
    /// Show the reported status of one or all processes.
    Status {
        /// Process to show; every process in the status file when omitted.
        name: Option<String>,

        /// Run health checks and include restart statistics.
        #[arg(long)]
        health: bool,
    },

    /// Take one metrics snapshot.
    Metrics {
        /// Number of unmanaged processes to include (defaults to the configured limit).
        #[arg(long, value_name = "N")]
        external: Option<usize>,
    },

    /// Query recorded metrics history.
    History {
        /// Oldest unix timestamp to include.
        #[arg(long, value_name = "UNIX_SECONDS")]
        since: Option<f64>,

        /// Read every recorded sample instead of the default window.
        #[arg(long)]
        full: bool,

        /// Maximum number of samples to read.
        #[arg(long)]
        limit: Option<usize>,

        /// Keep the last sample of each bucket of this many seconds.
        #[arg(long, value_name = "SECONDS")]
        bucket: Option<u64>,

        /// Upper bound on returned points.
        #[arg(long)]
        max_points: Option<usize>,
    },

    /// Print a snapshot payload at a fixed interval until interrupted.
    Watch {
        /// Seconds between snapshots (clamped to 0.5-10).
        #[arg(long, value_name = "SECONDS")]
        interval: Option<f64>,

        /// Include health verdicts in the status section.
        #[arg(long)]
        health: bool,

        /// Append every snapshot to the history directory.
        #[arg(long)]
        record: bool,

        /// Exit after printing this many payloads.
        #[arg(long)]
        count: Option<usize>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
