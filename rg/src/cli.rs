//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// reqgate - admission control for outbound API requests
#[derive(Parser)]
#[command(
    name = "reqgate",
    about = "Client-side admission control for outbound API requests",
    version,
    after_help = "Logs are written to: ~/.local/share/reqgate/logs/reqgate.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Push a synthetic workload through the scheduler against a fake throttling backend
    Simulate {
        /// Number of requests to submit
        #[arg(short = 'n', long)]
        requests: Option<usize>,

        /// Simulated backend latency per call in milliseconds
        #[arg(short, long)]
        work_ms: Option<u64>,

        /// Chance (0-1) that the backend answers 429
        #[arg(short, long)]
        throttle_probability: Option<f64>,

        /// Spread requests over this many dedup keys
        #[arg(short = 'k', long)]
        distinct_keys: Option<usize>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config,
}

/// Output format for reports
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
