//! `threatlinectl`: runs the Threatline pipeline over files.

mod commands;
mod input;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use threatline_config::{ConfigLoad, ConfigLoader, StoreBackend};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::input::InputFormat;

#[derive(Parser, Debug)]
#[command(name = "threatlinectl", version)]
#[command(about = "Validate, store and score network-attack records")]
struct Cli {
    /// Settings file (TOML or JSON). Overrides THREATLINE_CONFIG_PATH.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read environment overrides from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a file through the pipeline and print the run summary as JSON.
    Ingest(IngestArgs),
    /// Load and validate settings, then check the record store.
    Check,
    /// Print the content identifier of every record without any I/O.
    CanonicalId(CanonicalIdArgs),
    /// Re-drive stored records that never reached SCORED or FAILED.
    Resume(ResumeArgs),
}

#[derive(Args, Debug)]
pub(crate) struct IngestArgs {
    /// Input file.
    #[arg(short, long)]
    input: PathBuf,

    /// Input format; inferred from the file extension when omitted.
    #[arg(long, value_enum)]
    format: Option<InputFormat>,

    /// Skip this many records from the start of the file; offsets stay
    /// absolute. Pass the previous run's acknowledged offset to continue
    /// after an interruption.
    #[arg(long, default_value_t = 0)]
    start_offset: u64,

    /// Store records without scoring them; `resume` scores them later.
    #[arg(long)]
    no_inference: bool,

    /// Record store backend (memory, postgres).
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Append telemetry events as JSON lines to this file.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Override pipeline.batch_size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override pipeline.max_concurrency.
    #[arg(long)]
    max_concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub(crate) struct CanonicalIdArgs {
    /// Input file.
    #[arg(short, long)]
    input: PathBuf,

    #[arg(long, value_enum)]
    format: Option<InputFormat>,
}

#[derive(Args, Debug)]
pub(crate) struct ResumeArgs {
    /// File with one record id per line.
    #[arg(long)]
    ids: PathBuf,

    #[arg(long)]
    store: Option<StoreBackend>,

    #[arg(long)]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,threatline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let require_inference = match &cli.command {
        Command::CanonicalId(_) => false,
        Command::Ingest(args) => !args.no_inference,
        Command::Check | Command::Resume(_) => true,
    };

    let mut loader = ConfigLoader::new().require_inference(require_inference);
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }

    match cli.command {
        Command::Ingest(args) => commands::ingest(load(&loader)?, args).await,
        Command::Check => commands::check(load(&loader)?).await,
        Command::CanonicalId(args) => commands::canonical_id(load(&loader)?, args).await,
        Command::Resume(args) => commands::resume(load(&loader)?, args).await,
    }
}

fn load(loader: &ConfigLoader) -> anyhow::Result<ConfigLoad> {
    use anyhow::Context;
    loader.load().context("failed to load settings")
}
