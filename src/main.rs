// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use debrid_governor::{
    api::{ApiFailure, BatchRequest},
    config::{default_services, GovernorSettings},
    utils::setup_logging,
    GovernorError, RequestGovernor,
};
use log::info;
use rand::Rng;
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use tokio::time::{sleep, Instant};

#[derive(Parser)]
#[command(name = "debrid-governor", about = "Per-service throttling for debrid API calls")]
struct Cli {
    /// JSON settings file; environment (and .env) overrides are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the stock service table as JSON
    Defaults,
    /// Print the stats of a freshly configured governor
    Stats,
    /// Push synthetic requests through one service and report what happened
    Simulate {
        #[arg(long)]
        service: String,
        #[arg(long, default_value_t = 20)]
        requests: usize,
        /// Chance that any single attempt fails
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<GovernorSettings> {
    let settings = match path {
        Some(path) => GovernorSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => GovernorSettings::from_env(),
    };
    Ok(settings)
}

/// One synthetic attempt: sleeps for the latency, then maybe fails like a real API would
async fn synthetic_call(
    index: usize,
    failure_rate: f64,
    latency: Duration,
) -> Result<usize, ApiFailure> {
    sleep(latency).await;
    let (roll, kind): (f64, u8) = {
        let mut rng = rand::thread_rng();
        (rng.gen(), rng.gen_range(0..10))
    };
    if roll >= failure_rate {
        return Ok(index);
    }
    Err(match kind {
        0 => ApiFailure::status(400, "Bad Request"),
        1 | 2 => ApiFailure::status(429, "Too Many Requests").with_header("retry-after", "1"),
        3 => ApiFailure::network("connection reset by peer"),
        _ => ApiFailure::status(503, "Service Unavailable"),
    })
}

async fn simulate(
    governor: &RequestGovernor,
    service: &str,
    requests: usize,
    failure_rate: f64,
    latency: Duration,
) -> Result<()> {
    governor.stats(service)?;
    info!("🧪 Simulating {} requests against {}", requests, service);

    let batch: Vec<BatchRequest<usize>> = (0..requests)
        .map(|index| {
            BatchRequest::new(format!("sim-{:04}", index), move || {
                synthetic_call(index, failure_rate, latency)
            })
            .with_priority((index % 3) as i32)
        })
        .collect();

    let started = Instant::now();
    let outcomes = governor.submit_batch(service, batch).await;
    let elapsed = started.elapsed();

    let mut summary: BTreeMap<String, usize> = BTreeMap::new();
    for outcome in outcomes.values() {
        let label = match outcome {
            Ok(_) => "ok".to_string(),
            Err(GovernorError::Operation(failure)) => format!("{:?}", failure.kind()),
            Err(other) => other.to_string(),
        };
        *summary.entry(label).or_default() += 1;
    }

    println!("finished {} requests in {:?}", outcomes.len(), elapsed);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", serde_json::to_string_pretty(&governor.stats(service)?)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Defaults = cli.command {
        println!("{}", serde_json::to_string_pretty(&default_services())?);
        return Ok(());
    }

    let settings = load_settings(cli.config.as_ref())?;
    setup_logging(&settings.log_level).context("failed to initialize logging")?;
    settings.validate_and_log()?;
    let governor = RequestGovernor::from_settings(&settings)?;

    match cli.command {
        Command::Defaults => {}
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&governor.all_stats())?);
        }
        Command::Simulate {
            service,
            requests,
            failure_rate,
            latency_ms,
        } => {
            simulate(
                &governor,
                &service,
                requests,
                failure_rate.clamp(0.0, 1.0),
                Duration::from_millis(latency_ms),
            )
            .await?;
        }
    }
    Ok(())
}
