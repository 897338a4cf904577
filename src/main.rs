//! Main module for the Awful RAG CLI application (arag).
//!
//! This module provides the main function and the implementations of the
//! subcommands. It handles command parsing, configuration loading, and
//! tracing initialization, then invokes the requested functionality.
//!
//! # Examples
//!
//! Initializing the application's configuration:
//!
//! ```sh
//! cargo run -- init
//! arag init
//! ```
//!
//! Serving, and asking a one-off question:
//!
//! ```sh
//! arag serve
//! arag ask "What does the warranty cover?"
//! RUST_LOG=awful_rag=debug arag search "warranty" -k 5
//! ```

use async_trait::async_trait;
use awful_rag::{
    api::OpenAiGenerator,
    commands::{Cli, Commands},
    config::{self, AwfulRagConfig},
    default_config_path,
    error::Result as RagResult,
    pipeline::{Frame, FrameKind, FrameSink, NO_RELEVANT_INFORMATION, Outcome, Pipeline, Query},
    search::build_search_provider,
    server,
    vector_store::{EmbeddingSnapshot, store_status_at},
};
use clap::Parser;
use once_cell::sync::OnceCell;
use std::{error::Error, fs, io::Write, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Main asynchronous function of the Awful RAG CLI application.
///
/// Parses command-line arguments, resolves and loads configuration, and
/// executes the requested command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command fails.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init => init(&config_path)?,
        Commands::Serve => server::serve(&load(&config_path)?).await?,
        Commands::Check => check(&load(&config_path)?)?,
        Commands::Search { query, k } => search(&load(&config_path)?, &query, k).await?,
        Commands::Ask { query } => ask(&load(&config_path)?, &query).await?,
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
fn load(path: &Path) -> Result<AwfulRagConfig, Box<dyn Error>> {
    if !path.exists() {
        warn!(
            "No config file at {}; using defaults (run `arag init` to create one)",
            path.display()
        );
        return Ok(AwfulRagConfig::default());
    }
    let path = path.to_str().ok_or("config path is not valid UTF-8")?;
    let config = config::load_config(path)?;
    debug!("Config loaded: {:?}", config);
    Ok(config)
}

/// Writes a config file containing every default. An existing file is left alone.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    if config_path.exists() {
        info!("Config file already exists: {}", config_path.display());
        return Ok(());
    }
    if let Some(dir) = config_path.parent() {
        info!("Creating config directory: {}", dir.display());
        fs::create_dir_all(dir)?;
    }

    info!("Creating config file: {}", config_path.display());
    let config_yaml = serde_yaml::to_string(&AwfulRagConfig::default())?;
    fs::write(config_path, config_yaml)?;
    Ok(())
}

fn check(config: &AwfulRagConfig) -> Result<(), Box<dyn Error>> {
    let status = store_status_at(&config.db_path)?;
    let snapshot = EmbeddingSnapshot::load(&config.db_path)?;

    println!("Store:       {}", config.db_path);
    println!("Populated:   {}", status.populated);
    println!("Rows:        {}", status.count);
    println!("Usable rows: {}", snapshot.len());
    match snapshot.dimension() {
        Some(dim) => println!("Dimension:   {dim}"),
        None => println!("Dimension:   n/a"),
    }
    if let Some(first) = snapshot.records().first() {
        let preview: String = first.chunk.chars().take(80).collect();
        println!("Sample:      #{} {}", first.id, preview.replace('\n', " "));
    }
    Ok(())
}

async fn search(
    config: &AwfulRagConfig,
    query: &str,
    k: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let provider = build_search_provider(config)?;
    let k = k.unwrap_or_else(|| provider.default_k());
    let results = provider.search(query, k).await?;

    if results.is_empty() {
        println!("{NO_RELEVANT_INFORMATION}");
    }
    for (rank, hit) in results.hits.iter().enumerate() {
        match hit.similarity {
            Some(score) => println!("{}. [{score:.4}] {}", rank + 1, hit.chunk),
            None => println!("{}. {}", rank + 1, hit.chunk),
        }
    }
    Ok(())
}

/// Prints pipeline frames: fragments and notices as paragraphs, the answer inline.
struct StdoutSink;

#[async_trait]
impl FrameSink for StdoutSink {
    async fn send_frame(&self, frame: Frame) -> RagResult<()> {
        let mut out = std::io::stdout().lock();
        match frame.kind {
            FrameKind::Increment => write!(out, "{}", frame.text)?,
            FrameKind::Separator => writeln!(out, "{}", frame.text)?,
            FrameKind::Fragment | FrameKind::Notice => writeln!(out, "{}\n", frame.text)?,
        }
        out.flush()?;
        Ok(())
    }
}

async fn ask(config: &AwfulRagConfig, query: &str) -> Result<(), Box<dyn Error>> {
    let search = build_search_provider(config)?;
    let generator = Arc::new(OpenAiGenerator::new(config));
    let pipeline = Pipeline::new(search, generator, config.chat_model.clone());

    let scope = CancellationToken::new();
    let on_interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = pipeline.run(&Query::new(query), &scope, &StdoutSink).await?;
    println!();
    debug!(?outcome, "Query finished");
    if let Outcome::Cancelled = outcome {
        info!("Interrupted");
    }
    Ok(())
}
