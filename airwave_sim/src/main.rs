//! Airwave DST Simulator CLI
//!
//! Run the distributed channel against its oracle across seeds and scenarios.

use airwave_core::AirwaveConfig;
use airwave_sim::scenarios::ScenarioId;
use airwave_sim::{ScenarioResult, ScenarioRunner};
use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Airwave Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "airwave-sim")]
#[command(about = "Run deterministic simulation tests for the Airwave channel", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of device ranks (the channel always runs on rank 0)
    #[arg(short, long, default_value = "4")]
    devices: u32,

    /// Endpoints each device rank hosts
    #[arg(short, long, default_value = "2")]
    endpoints_per_rank: u32,

    /// Scenario to run (two_devices, out_of_range, crowd, churn, model_swap, partition, mobility, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulated duration of each scenario in seconds
    #[arg(short = 'D', long, default_value = "1.0")]
    duration: f64,

    /// JSON file with channel configuration
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Tracing filter directive, overrides --verbose (e.g. "airwave_core=debug")
    #[arg(long)]
    log_filter: Option<String>,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn init_logging(args: &Args) {
    let default_directive = if args.verbose { "debug" } else { "info" };
    let filter = args
        .log_filter
        .as_deref()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    if !args.json {
        info!("Airwave DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {e}");
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return ExitCode::FAILURE;
            }
        }
    };

    let config = match args.config.as_deref().map(AirwaveConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let runner = ScenarioRunner::new(seed, args.devices)
            .with_endpoints_per_rank(args.endpoints_per_rank)
            .with_duration(args.duration)
            .with_config(config.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
                debug!(
                    transmissions = result.metrics.transmissions,
                    expected = result.metrics.expected_receptions,
                    observed = result.metrics.observed_receptions,
                    routed = result.metrics.messages_routed,
                    dropped = result.metrics.messages_dropped,
                    "  {} metrics",
                    scenario.name()
                );
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("Failed to encode summary: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed_count > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
