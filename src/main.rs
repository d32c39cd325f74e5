//! `nestegg` command line: serve the HTTP API or run a scenario locally.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nestegg::api::{
    CliMissingYears, ScenarioArgs, build_scenario, build_simulation_report, run_http_server,
};
use nestegg::core::{DEFAULT_SENSITIVITY_DELTAS, ScenarioError, run_sensitivity_by_name};

/// Monte Carlo retirement projections
#[derive(Parser)]
#[command(name = "nestegg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, env = "NESTEGG_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON API
    Serve {
        #[arg(long, env = "NESTEGG_HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        #[arg(long, env = "NESTEGG_PORT", default_value_t = 8080)]
        port: u16,
    },

    /// Run one scenario and print its report as JSON
    Simulate {
        #[command(flatten)]
        scenario: ScenarioArgs,

        #[arg(long, value_enum, default_value_t = CliMissingYears::Zero)]
        missing_years: CliMissingYears,

        /// Include every trial trajectory in the output
        #[arg(long)]
        full: bool,
    },

    /// Sweep one parameter and print success rates as JSON
    Sensitivity {
        #[command(flatten)]
        scenario: ScenarioArgs,

        /// expectedReturn, annualSpending or taxRate
        #[arg(long, default_value = "expectedReturn")]
        parameter: String,

        /// Relative changes, e.g. -0.2,-0.1,0,0.1,0.2
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        deltas: Vec<f64>,
    },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to encode output");
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &ScenarioError) -> ExitCode {
    eprintln!("Error: {err}");
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Serve { host, port } => {
            let addr = SocketAddr::new(host, port);
            info!(%addr, "starting server");
            if let Err(e) = run_http_server(addr).await {
                error!(error = %e, "server error");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Simulate {
            scenario,
            missing_years,
            full,
        } => {
            let report = build_scenario(&scenario)
                .and_then(|input| build_simulation_report(input, missing_years.into(), full));
            match report {
                Ok(report) => print_json(&report),
                Err(err) => report_error(&err),
            }
        }
        Commands::Sensitivity {
            scenario,
            parameter,
            deltas,
        } => {
            let deltas = if deltas.is_empty() {
                DEFAULT_SENSITIVITY_DELTAS.to_vec()
            } else {
                deltas
            };
            let points = build_scenario(&scenario)
                .and_then(|input| run_sensitivity_by_name(&input, &parameter, &deltas));
            match points {
                Ok(points) => print_json(&points),
                Err(err) => report_error(&err),
            }
        }
    }
}
