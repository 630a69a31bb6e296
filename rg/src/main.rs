//! reqgate - CLI entry point
//!
//! Drives the admission controller against a simulated backend and shows
//! the effective configuration.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::info;

use reqgate::cli::{Cli, Command, OutputFormat};
use reqgate::config::Config;
use reqgate::scheduler::{Scheduler, ThrottledObserver};
use reqgate::simulate::{SimulationReport, run_simulation};

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reqgate")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("reqgate.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Some(Command::Simulate {
            requests,
            work_ms,
            throttle_probability,
            distinct_keys,
            format,
        }) => {
            let mut config = config;
            if let Some(requests) = requests {
                config.simulation.requests = requests;
            }
            if let Some(work_ms) = work_ms {
                config.simulation.work_ms = work_ms;
            }
            if let Some(probability) = throttle_probability {
                config.simulation.throttle_probability = probability;
            }
            if let Some(keys) = distinct_keys {
                config.simulation.distinct_keys = keys;
            }
            cmd_simulate(&config, format).await
        }
        Some(Command::Config) => cmd_config(&config),
        None => {
            // Default: show the effective configuration
            cmd_config(&config)
        }
    }
}

/// Run the synthetic workload and print a report
async fn cmd_simulate(config: &Config, format: OutputFormat) -> Result<()> {
    config.validate()?;

    let scheduler = Scheduler::new(config.scheduler.clone());
    let observer = ThrottledObserver::new(|is_backing_off, remaining| {
        if is_backing_off {
            eprintln!(
                "{} pausing dispatch for {:.1}s",
                "Rate limited:".yellow().bold(),
                remaining.as_secs_f64()
            );
        }
    });
    scheduler.register_backoff_observer(Some(observer.into_observer()));

    let report = run_simulation(&scheduler, &config.simulation)
        .await
        .context("Simulation failed")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("{}", "Simulation Report".bold());
    println!("{}", "=".repeat(40));
    println!("Requests:        {}", report.requests);
    println!("Succeeded:       {}", report.succeeded.to_string().green());
    if report.failed > 0 {
        println!("Failed:          {}", report.failed.to_string().red());
    } else {
        println!("Failed:          {}", report.failed);
    }
    println!("Backend calls:   {}", report.backend_calls);
    println!("Throttled (429): {}", report.throttled_responses.to_string().yellow());
    println!("Elapsed:         {}ms", report.elapsed_ms);
    println!();

    let counters = &report.stats.counters;
    println!("{}", "Scheduler".bold());
    println!("{}", "=".repeat(40));
    println!("Dispatched:      {}", counters.dispatched);
    println!("Rate limited:    {}", counters.rate_limited);
    println!("Deduplicated:    {}", counters.deduplicated);
    println!("Peak queue:      {}", counters.peak_queue_depth);
    println!("Peak concurrent: {}", counters.peak_concurrent);
}

/// Print the effective configuration as YAML
fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
