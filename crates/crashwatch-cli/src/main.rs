//! crashwatch command-line runner.
//!
//! Drives a database server binary through the crash-recovery and
//! isolation suite and writes a JSON report.
//!
//! # Quick Start
//!
//! ```bash
//! # List the scenarios
//! crashwatch list
//!
//! # Check that the configured server starts and answers
//! crashwatch probe --launch
//!
//! # Run the whole suite at small scale
//! crashwatch --smoke run
//!
//! # Run one scenario, or a SQL script with crash markers
//! crashwatch run --scenario write-write-conflict
//! crashwatch script ./recovery.sql
//! ```

mod commands;
mod style;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// crashwatch - crash-recovery and transaction-isolation testing for SQL servers.
#[derive(Parser)]
#[command(name = "crashwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file; replaces the layered project configuration.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Small data and short timeouts.
    #[arg(long, global = true)]
    smoke: bool,

    /// Debug logging (RUST_LOG still takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite, or selected scenarios, against the configured server.
    Run {
        /// Scenario to run (repeatable). Defaults to the configured set.
        #[arg(short, long = "scenario", value_name = "NAME")]
        scenarios: Vec<String>,

        /// Override the data-volume multiplier.
        #[arg(long)]
        scale: Option<f64>,

        /// Where to write the JSON report [default: <artifacts>/report.json].
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Run a SQL script; `crash` lines mark fault points.
    Script {
        /// Script file.
        path: PathBuf,

        /// Where to write the JSON report [default: <artifacts>/report.json].
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// List scenarios.
    List,

    /// Send one statement to a server and show the classified response.
    Probe {
        /// Server address [default: configured host and port].
        #[arg(short, long)]
        address: Option<String>,

        /// Statement to send.
        #[arg(short, long, default_value = "SELECT 1;")]
        statement: String,

        /// Launch the configured server first and stop it afterwards.
        #[arg(long)]
        launch: bool,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    style::set_no_color(cli.no_color);

    let options = commands::GlobalOptions {
        config: cli.config,
        smoke: cli.smoke,
    };

    match cli.command {
        Commands::Run {
            scenarios,
            scale,
            report,
        } => commands::run::run(&options, &scenarios, scale, report),
        Commands::Script { path, report } => commands::script::run(&options, &path, report),
        Commands::List => {
            commands::list::run();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Probe {
            address,
            statement,
            launch,
        } => commands::probe::run(&options, address.as_deref(), &statement, launch),
        Commands::Config => commands::config::run(&options),
    }
}
