//! motesim CLI
//!
//! Runs headless kernel scenarios with deterministic stand-in motes.

use clap::Parser;
use motesim_core::{FaultPolicy, SimConfig, SimError};
use motesim_env::Platform;
use motesim_sim::{ScenarioId, ScenarioResult, ScenarioRunner, SharedFaultHandler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Headless sensor-network mote simulator
#[derive(Parser, Debug)]
#[command(name = "motesim")]
#[command(about = "Run headless mote simulation scenarios", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of motes
    #[arg(short, long, default_value = "8")]
    motes: usize,

    /// Mote platform (sky, micaz)
    #[arg(short, long, default_value = "sky")]
    platform: String,

    /// Scenario to run (boot_storm, log_flood, mote_churn, speed_limited, fault_injection, breakpoint, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Simulated duration in milliseconds
    #[arg(short, long, default_value = "2000")]
    duration_ms: u64,

    /// Simulated/real time ratio cap
    #[arg(long)]
    speed_limit: Option<f64>,

    /// JSON simulation config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Batch mode: a kernel fault terminates the process
    #[arg(long)]
    headless: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("motesim v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse::<ScenarioId>() {
            Ok(scenario) => vec![scenario],
            Err(e) => fail(&e),
        }
    };

    let platform: Platform = args.platform.parse().unwrap_or_else(|e: String| fail(&e));

    let mut config = match &args.config {
        Some(path) => SimConfig::from_json_file(path).unwrap_or_else(|e| fail(&e.to_string())),
        None => SimConfig::default(),
    };
    if args.headless {
        config.fault_policy = FaultPolicy::ExitProcess;
    }

    let seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let on_fault: SharedFaultHandler = Arc::new(|fault: &SimError| {
        error!(mote = ?fault.mote(), "Simulation fault: {}", fault);
        std::process::exit(1);
    });

    let runner = ScenarioRunner::new(seed, args.motes)
        .with_platform(platform)
        .with_duration_ms(args.duration_ms)
        .with_speed_limit(args.speed_limit)
        .with_config(config)
        .with_fault_handler(on_fault);

    let mut results: Vec<ScenarioResult> = Vec::new();
    for scenario in &scenarios {
        let result = runner.run(*scenario);

        if !args.json {
            if result.passed {
                info!(
                    "✓ {} (seed={}) PASSED at t={:.3}s in {}ms",
                    scenario.name(),
                    seed,
                    result.final_time_secs,
                    result.metrics.wall_clock_ms
                );
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        results.push(result);
    }

    let total = results.len();
    let failed = results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed,
            "failed": failed,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode results: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("All {} scenario runs passed", total);
        } else {
            error!("{}/{} scenario runs failed", failed, total);
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(2);
}
