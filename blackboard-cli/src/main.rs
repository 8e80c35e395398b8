//! # blackboard CLI
//!
//! Command-line interface for running and checking a blackboard.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "blackboard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used when absent)
    #[arg(long, env = "BLACKBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent sessions against an in-memory blackboard
    Simulate {
        /// Number of writer sessions
        #[arg(long, default_value_t = 4)]
        sessions: usize,

        /// Transactions per writer session
        #[arg(long, default_value_t = 50)]
        transactions: usize,

        /// Snapshot, restart and verify a resuming session afterwards
        #[arg(long)]
        restart: bool,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the default configuration as YAML
    Default,

    /// Load and validate a configuration file
    Check {
        /// Configuration file to check
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::WARN.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Simulate {
            sessions,
            transactions,
            restart,
            json,
        } => {
            let opts = commands::SimulateOptions {
                sessions,
                transactions,
                restart,
                json,
            };
            commands::simulate(cli.config.as_deref(), opts)
        }
        Commands::Config { command } => match command {
            ConfigCommands::Default => commands::print_default_config(),
            ConfigCommands::Check { path } => commands::check_config(&path),
        },
    }
}
