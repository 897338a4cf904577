//! # Awful RAG (library root)
//!
//! This crate provides the plumbing for the **Awful RAG** server and its `arag`
//! CLI: answer questions over a document corpus by retrieving the most similar
//! stored fragments and grounding a chat model's answer in them.
//!
//! - Similarity and ranking (`similarity`).
//! - The embedding store and its in-memory snapshot (`vector_store`, `models`,
//!   `schema`).
//! - Query embeddings and search backends (`embedding`, `search`).
//! - Context assembly and the prompt template (`template`).
//! - Streaming answer generation (`api`).
//! - The per-query pipeline (`pipeline`).
//! - WebSocket sessions, the shared output queue, uploads and the HTTP server
//!   (`session`, `broadcast`, `ingest`, `server`).
//! - CLI parsing & configuration (`commands`, `config`), errors (`error`).
//!
//! ## Configuration discovery
//! Unless `--config` or `AWFUL_RAG_CONFIG` names a file, the CLI reads
//! `config.yaml` from the per-platform config directory, e.g.:
//!
//! - macOS: `~/Library/Application Support/com.awful-sec.arag/config.yaml`
//! - Linux (XDG): `~/.config/arag/config.yaml`
//! - Windows: `C:\Users\<you>\AppData\Roaming\awful-sec\arag\config\config.yaml`
//!
//! `arag init` writes a file with every default spelled out.
//!
//! ## Modules
//! - [`api`], [`broadcast`], [`commands`], [`config`], [`embedding`], [`error`],
//!   [`ingest`], [`models`], [`pipeline`], [`schema`], [`search`], [`server`],
//!   [`session`], [`similarity`], [`template`], [`vector_store`]

use directories::ProjectDirs;
use std::error::Error;
use std::path::PathBuf;

pub mod api;
pub mod broadcast;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod schema;
pub mod search;
pub mod server;
pub mod session;
pub mod similarity;
pub mod template;
pub mod vector_store;

/// Retrieves the configuration directory for the application.
///
/// Utilizes the `directories` crate to determine the appropriate configuration directory
/// based on the operating system's conventions.
///
/// # Errors
///
/// Returns an error if unable to determine the configuration directory.
pub fn config_dir() -> Result<PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "awful-sec", "arag")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// The config file used when none is given on the command line.
pub fn default_config_path() -> Result<PathBuf, Box<dyn Error>> {
    Ok(config_dir()?.join("config.yaml"))
}
