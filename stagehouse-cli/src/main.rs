//! Stagehouse CLI: run, schedule, and inspect batch ETL pipelines.

mod commands;

use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Stagehouse: fetch, stage, load, and check batch datasets
#[derive(Parser, Debug)]
#[command(name = "stagehouse", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once for a logical date
    Run {
        /// Logical date (YYYY-MM-DD); defaults to the most recent scheduled interval
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Abort the run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline on its schedule until interrupted
    Schedule {
        /// Run the ticks that are due, then exit
        #[arg(long)]
        once: bool,

        /// Override the configured schedule expression
        #[arg(long)]
        schedule: Option<String>,

        /// Run every missed interval instead of only the latest
        #[arg(long)]
        catchup: bool,
    },
    /// Show the stages and their dependencies
    Graph,
    /// Print the table definitions the pipeline manages
    Ddl {
        #[arg(long, value_enum, default_value_t = DialectArg::Redshift)]
        dialect: DialectArg,
    },
    /// Inspect past runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DialectArg {
    Redshift,
    Sqlite,
}

#[derive(clap::Subcommand, Debug)]
enum RunsAction {
    /// List recorded runs, newest first
    List {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
    /// Show one run by id or id prefix
    Show {
        run_id: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "stagehouse", "stagehouse")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "stagehouse.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let ctx = commands::Context {
        workspace,
        config_path: cli.config,
    };
    match commands::handle_command(cli.command, &ctx).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}
