mod demo;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shuttle_core::ShuttleConfig;
use shuttle_core::domain::DescriptorValidator;

#[derive(Parser)]
#[command(name = "shuttle", version, about = "Run DAG workflows over a task queue")]
struct Cli {
    /// Path to a TOML config file (in-memory defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single-task workflow that greets someone
    Hello {
        #[arg(default_value = "world")]
        name: String,
        /// Fail the task this many times before it succeeds
        #[arg(long, default_value_t = 0)]
        fail_times: u32,
    },
    /// Split an array, print each slice, and join on a report task
    SplitSync {
        /// Number of items to split
        #[arg(long, default_value_t = 10)]
        items: usize,
        #[arg(long, default_value_t = 3)]
        slice_size: usize,
    },
    /// Validate a workflow descriptor (JSON file)
    Validate { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ShuttleConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ShuttleConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Hello { name, fail_times } => demo::hello(&config, name, fail_times).await,
        Commands::SplitSync { items, slice_size } => {
            demo::split_sync(&config, items, slice_size).await
        }
        Commands::Validate { path } => validate(&path),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let descriptor: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let validator = DescriptorValidator::new(&descriptor);
    if validator.is_valid() {
        info!(path = %path.display(), "descriptor is valid");
        println!("valid");
        return Ok(());
    }
    for message in validator.errors() {
        println!("- {message}");
    }
    anyhow::bail!("{} error(s) in {}", validator.errors().len(), path.display())
}
