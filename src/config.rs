//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the `AwfulRagConfig` struct, which holds the configuration parameters,
//! and a `load_config` function to load the configuration from a YAML file.
//!
//! Every field has a default, so a config file only needs to name what it changes.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use awful_rag::config::{AwfulRagConfig, load_config};
//!
//! let config_file_path = "/path/to/config.yaml";
//! let config: AwfulRagConfig = load_config(config_file_path).unwrap();
//! println!("{:?}", config);
//! ```

use diesel::prelude::*;

use serde::{Deserialize, Serialize};
use std::{error::Error, fs, path::PathBuf, time::Duration};

use tracing::*;

use crate::error::{RagError, Result};

/// Represents the application's configuration.
///
/// This struct holds everything the server needs to start: where to listen,
/// where the embedding store lives, how to reach the embedding and chat
/// services, which search backend to use, and the session timings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct AwfulRagConfig {
    /// Address the HTTP server binds to.
    pub bind: String,

    /// Path of the SQLite embedding store.
    pub db_path: String,

    /// Staging directory for uploaded documents.
    pub upload_dir: PathBuf,

    /// Largest accepted multipart body, in bytes.
    pub max_upload_bytes: usize,

    /// The base URL of the OpenAI-compatible chat API.
    pub api_base: String,

    /// The API key used to authenticate chat requests.
    pub api_key: String,

    /// The name of the model used to generate answers.
    pub chat_model: String,

    // Upper bound on generated tokens per answer.
    pub num_predict: u32,

    /// Base URL of the embedding service.
    pub embedding_base: String,

    /// Embedding model name.
    pub embedding_model: String,

    pub search: SearchConfig,

    pub session: SessionConfig,

    pub ingest: IngestConfig,
}

/// Which search backend answers queries.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Score every row of the preloaded snapshot.
    #[default]
    InProcess,
    /// Shell out to an external search tool.
    Delegated,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub mode: SearchMode,

    /// Fragments returned per query by the in-process backend, and the count
    /// asked of the delegated tool when it only returns texts.
    pub top_k: usize,

    /// Program run for delegated search; the query and a result count are
    /// appended to `args`.
    pub program: String,

    pub args: Vec<String>,

    /// Candidates requested from the delegated tool before the local re-rank.
    pub first_stage_k: usize,

    /// Fragments kept after the local re-rank.
    pub final_k: usize,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle limit while waiting for the next inbound frame.
    pub read_timeout_secs: u64,

    /// Limit on a single outbound write.
    pub write_timeout_secs: u64,

    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,

    /// Queries a session holds while an earlier one is running. Further
    /// queries are dropped until the backlog drains.
    pub query_capacity: usize,

    /// Route pipeline output through the process-wide queue instead of the
    /// session's own. Any session may then deliver any session's output.
    pub broadcast: bool,

    pub broadcast_capacity: usize,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Program run once per uploaded file; the saved path is appended to `args`.
    pub program: String,

    pub args: Vec<String>,
}

impl Default for AwfulRagConfig {
    fn default() -> Self {
        let embedding_base = default_embedding_base();
        Self {
            bind: "0.0.0.0:5000".to_string(),
            db_path: "rag.db".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            max_upload_bytes: 20 << 20,
            api_base: format!("{embedding_base}/v1"),
            api_key: "ollama".to_string(),
            chat_model: "llama3.2".to_string(),
            num_predict: 2048,
            embedding_base,
            embedding_model: "nomic-embed-text".to_string(),
            search: SearchConfig::default(),
            session: SessionConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::InProcess,
            top_k: 3,
            program: "python".to_string(),
            args: vec!["processPDF.py".to_string(), "--search-go".to_string()],
            first_stage_k: 20,
            final_k: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 2 * 60 * 60,
            write_timeout_secs: 10,
            outbound_capacity: 64,
            query_capacity: 20,
            broadcast: false,
            broadcast_capacity: 20,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["process_pdf.py".to_string()],
        }
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// The embedding endpoint is discovered from `OLLAMA_HOST` when it is set.
/// The chat endpoint defaults to the same server.
fn default_embedding_base() -> String {
    ollama_base(std::env::var("OLLAMA_HOST").ok().as_deref())
}

fn ollama_base(host: Option<&str>) -> String {
    match host.map(str::trim) {
        Some(host) if !host.is_empty() => {
            let host = host.trim_end_matches('/');
            if host.starts_with("http://") || host.starts_with("https://") {
                host.to_string()
            } else {
                format!("http://{host}")
            }
        }
        _ => "http://localhost:11434".to_string(),
    }
}

/// Loads the application's configuration from a YAML file.
///
/// This function reads the file at the given path, parses it as YAML, and
/// constructs an `AwfulRagConfig` struct from it. Missing fields take their
/// defaults.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is not a valid
/// configuration.
pub fn load_config(file: &str) -> std::result::Result<AwfulRagConfig, Box<dyn Error>> {
    debug!("Loading config: {:?}", file);
    let content = fs::read_to_string(file)?;
    let config: AwfulRagConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Opens the SQLite store at `db_url`.
pub fn establish_connection(db_url: &str) -> Result<SqliteConnection> {
    SqliteConnection::establish(db_url)
        .map_err(|e| RagError::Store(format!("Error connecting to {db_url}: {e}")))
}
