//! quorum-sim
//!
//! Runs a quorum mesh scenario and prints every node's log and final state.
//!
//! Usage:
//!   quorum-sim [reference]            Run the built-in three-node scenario
//!   quorum-sim run <scenario.json>    Run a scenario script
//!
//! Options:
//!   --delivery <synchronous|queued|actors>
//!   --order <round_robin|seeded>
//!   --seed <N>
//!   --json                            Print the full report as JSON

use std::path::PathBuf;

use quorum_mesh::{Scenario, ScenarioReport, SimulationConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Reference,
    Run(PathBuf),
    Help,
}

#[derive(Debug)]
struct Args {
    command: Command,
    config: SimulationConfig,
    json: bool,
}

fn print_usage() {
    eprintln!("quorum-sim - Run quorum consensus scenarios");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  quorum-sim [reference]            Run the built-in three-node scenario");
    eprintln!("  quorum-sim run <scenario.json>    Run a scenario script");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --delivery <MODE>   synchronous | queued | actors");
    eprintln!("  --order <ORDER>     round_robin | seeded (queued delivery)");
    eprintln!("  --seed <N>          Seed for seeded order");
    eprintln!("  --json              Print the full report as JSON");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  QUORUM_DELIVERY, QUORUM_ORDER, QUORUM_SEED, QUORUM_MAX_STEPS,");
    eprintln!("  QUORUM_RECORD_EVENTS   Defaults for the options above");
    eprintln!("  RUST_LOG               Tracing filter");
}

fn parse_args<I>(args: I, mut config: SimulationConfig) -> Result<Args, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut command = Command::Reference;
    let mut json = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "reference" => command = Command::Reference,
            "run" => {
                let path = args.next().ok_or("run needs a scenario file")?;
                command = Command::Run(PathBuf::from(path));
            }
            "--delivery" => {
                let value = args.next().ok_or("--delivery needs a value")?;
                config.delivery = value.parse().map_err(|e| format!("{}", e))?;
            }
            "--order" => {
                let value = args.next().ok_or("--order needs a value")?;
                config.order = value.parse().map_err(|e| format!("{}", e))?;
            }
            "--seed" => {
                let value = args.next().ok_or("--seed needs a value")?;
                config.seed = value
                    .parse()
                    .map_err(|_| format!("invalid seed '{}'", value))?;
            }
            "--json" => json = true,
            "-h" | "--help" | "help" => command = Command::Help,
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    Ok(Args {
        command,
        config,
        json,
    })
}

fn print_report(report: &ScenarioReport<u64>) {
    for node in &report.nodes {
        println!();
        println!("--- Node {} log ---", node.id);
        for line in &node.log {
            println!("{}", line);
        }

        println!();
        println!("--- Node {} consensus state ---", node.id);
        match node.current_state {
            Some(state) => println!("{}", state),
            None => println!("(unset)"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorum_sim=info,quorum_mesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = SimulationConfig::from_env()?;
    let args = match parse_args(std::env::args().skip(1), config) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    let scenario = match &args.command {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Reference => Scenario::reference(),
        Command::Run(path) => Scenario::from_json_file(path)?,
    };

    tracing::info!(
        delivery = ?args.config.delivery,
        nodes = scenario.nodes.len(),
        steps = scenario.steps.len(),
        "Running scenario"
    );

    let report = scenario.run_async(&args.config).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}
