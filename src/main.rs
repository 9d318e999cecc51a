//! AsyncMachine CLI Entry Point
//!
//! Runs YAML-defined scenarios on a machine and reports how each round
//! resumed.
//!
//! # Usage
//!
//! ```bash
//! # Run a scenario
//! asyncmachine scenario.yaml
//!
//! # Print the report as JSON
//! asyncmachine scenario.yaml --json
//!
//! # Show debug logging and a suspension chart
//! asyncmachine scenario.yaml --verbose --chart
//! ```

use std::env;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use asyncmachine::scenario::{load_scenario, run_scenario, ScenarioReport};
use asyncmachine::{APP_NAME, VERSION};

/// Default scenario file used when none is specified.
const DEFAULT_SCENARIO: &str = "scenario.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    scenario_path: String,
    json: bool,
    chart: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scenario_path: DEFAULT_SCENARIO.to_string(),
            json: false,
            chart: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Asynchronous Coordination Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: asyncmachine [OPTIONS] <SCENARIO_FILE>");
    println!();
    println!("Arguments:");
    println!("  <SCENARIO_FILE>     Path to scenario YAML file");
    println!();
    println!("Options:");
    println!("  --json              Print the report as JSON");
    println!("  --chart             Print a chart of suspension intervals");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  asyncmachine quorum.yaml");
    println!("  asyncmachine quorum.yaml --json");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--json" => config.json = true,
            "--chart" => config.chart = true,
            "--verbose" | "-v" => config.verbose = true,
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_index > 0 {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.scenario_path = arg.clone();
                positional_index += 1;
            }
        }
    }

    Ok(config)
}

/// Prints a human-readable report.
fn print_report(report: &ScenarioReport) {
    println!();
    for round in &report.rounds {
        let resumed_by = match round.resumed_by.as_str() {
            "timeout" => round.resumed_by.yellow(),
            _ => round.resumed_by.green(),
        };
        println!("Round '{}' (step {}) resumed by {}", round.name.bold(), round.step, resumed_by);
        if !round.completed.is_empty() {
            println!("  completed: {}", round.completed.join(", "));
        }
        if !round.cancelled.is_empty() {
            println!("  cancelled: {}", round.cancelled.join(", ").dimmed());
        }
        if let Some(ms) = round.suspended_ms {
            println!("  suspended: {} ms", ms);
        }
    }

    println!();
    println!(
        "Operations: {} issued, {} finalized, {} leaked",
        report.issued,
        report.finalized,
        report.leaked()
    );
    println!("Total time: {} ms", report.duration_ms);

    match &report.error {
        None => println!("{}", "Scenario completed successfully".green()),
        Some(e) => println!("{} {}", "Scenario failed:".red().bold(), e),
    }
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    if !config.json {
        print_banner();
    }

    let scenario = load_scenario(&config.scenario_path).map_err(|e| {
        error!("Failed to load scenario: {}", e);
        format!(
            "Could not load scenario from '{}': {}",
            config.scenario_path, e
        )
    })?;

    info!(
        "Scenario loaded: {} rounds, {} operations",
        scenario.rounds.len(),
        scenario.operation_count()
    );

    let report = run_scenario(&scenario)?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if config.chart && !config.json {
        print!("{}", report.chart);
    }

    Ok(report.succeeded)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
