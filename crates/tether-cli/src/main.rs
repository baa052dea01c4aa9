//! Tether CLI - drive script threads with a simulated interpreter.

mod colors;
mod interpreter;
mod modes;
mod run;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_core::TableConfig;

use crate::modes::Mode;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Per-thread lifecycle coordinator for embedded script interpreters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a batch of requests on a thread table
    Run {
        /// Number of script threads (overrides configuration)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Number of requests to dispatch
        #[arg(short, long, default_value = "16")]
        requests: usize,

        /// Mode assigned to every thread
        #[arg(short, long, value_enum, default_value = "regular")]
        mode: Mode,

        /// Script run by worker threads
        #[arg(long, default_value = "/worker.php")]
        worker_script: String,

        /// Request path, repeatable; requests cycle through them
        #[arg(long = "path", default_value = "/index.php")]
        paths: Vec<String>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            threads,
            requests,
            mode,
            worker_script,
            paths,
            config,
            json,
        } => {
            let mut table_config = load_config(config.as_deref())?;
            if let Some(threads) = threads {
                table_config.num_threads = threads;
            }
            table_config.validate()?;

            let options = run::RunOptions {
                config: table_config,
                requests,
                mode,
                worker_script,
                paths,
                json,
            };
            run::execute(&options)?;
        }

        Commands::Config { config } => {
            let table_config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&table_config)?);
        }
    }

    Ok(())
}

/// Configuration file (or defaults), then `TETHER_*` environment overrides.
fn load_config(path: Option<&Path>) -> anyhow::Result<TableConfig> {
    let config = match path {
        Some(path) => TableConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TableConfig::default(),
    };
    Ok(config.with_overrides(|name| std::env::var(name).ok())?)
}
