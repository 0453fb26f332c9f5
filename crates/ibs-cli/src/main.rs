use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ibs_sync::{
    build_sink, build_source, ensure_table, Ingest, LoaderConfig, Pipeline, SourceSelection,
};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ibs")]
#[command(about = "Load intraday bullish stock picks into a keyed store")]
struct Cli {
    /// Read settings from this dotenv file before the process environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and upsert one batch.
    Run {
        #[command(subcommand)]
        source: SourceCommand,
    },
    /// Fetch and normalize one batch, printing rows instead of writing them.
    Normalize {
        #[command(subcommand)]
        source: SourceCommand,
    },
    /// Create the target table when it is missing.
    Migrate {
        /// Print the DDL instead of executing it.
        #[arg(long)]
        print: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SourceCommand {
    /// Ask the language model for today's picks.
    Model,
    /// Pull picks from a JSON or CSV feed.
    Feed {
        #[arg(long, env = "DATA_API")]
        url: Option<String>,
    },
    /// Read picks from a local JSON or CSV file.
    File { path: PathBuf },
}

impl From<SourceCommand> for SourceSelection {
    fn from(cmd: SourceCommand) -> Self {
        match cmd {
            SourceCommand::Model => SourceSelection::Model,
            SourceCommand::Feed { url } => SourceSelection::Feed { url },
            SourceCommand::File { path } => SourceSelection::File(path),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("loading {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    init_tracing(cli.verbose);

    let config = LoaderConfig::from_env().context("reading configuration")?;

    match cli.command {
        Commands::Run { source } => run(&config, source.into()).await,
        Commands::Normalize { source } => normalize(&config, source.into()).await,
        Commands::Migrate { print } => {
            if print {
                println!("{};", ibs_storage::create_table_sql(&config.table));
            } else {
                let target = ensure_table(&config).await?;
                info!(%target, "target table ready");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &LoaderConfig, selection: SourceSelection) -> Result<ExitCode> {
    let source = build_source(&selection, config)?;
    let sink = build_sink(config).await?;
    let pipeline = Pipeline::from_config(config, sink);

    match pipeline.run(source.as_ref()).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            error!(stage = ?failure.error.stage(), error = %failure.error, "run failed");
            println!("{}", serde_json::to_string(&failure.summary)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn normalize(config: &LoaderConfig, selection: SourceSelection) -> Result<ExitCode> {
    let source = build_source(&selection, config)?;
    let outcome = Ingest::from_config(config).collect(source.as_ref()).await?;

    let report = json!({
        "source": outcome.source,
        "received_count": outcome.received,
        "normalized_count": outcome.normalized.rows.len(),
        "discarded_count": outcome.normalized.discarded,
        "duplicate_count": outcome.normalized.duplicates,
        "rows": outcome.normalized.rows,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}
