//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! Parsing command-line arguments:
//!
//! ```no_run
//! use clap::Parser;
//! use awful_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Serve => { /* start the server */ }
//!     Commands::Search { query, k } => println!("{query} (k = {k:?})"),
//!     _ => {}
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Path to the configuration file. Defaults to `config.yaml` in the
    /// platform config directory.
    #[arg(long, short = 'c', global = true, env = "AWFUL_RAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Run the HTTP and WebSocket server.
    #[clap(name = "serve", alias = "s")]
    Serve,

    /// Write a default configuration file.
    Init,

    /// Report on the embedding store: row count and vector dimension.
    Check,

    /// Run the configured search backend and print ranked fragments.
    Search {
        /// The text to search for.
        query: String,

        /// Number of fragments to return. Defaults to the backend's setting.
        #[arg(short = 'k', long = "top-k")]
        k: Option<usize>,
    },

    /// Answer one question through the full pipeline, streaming to stdout.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question to be asked.
        query: String,
    },
}
